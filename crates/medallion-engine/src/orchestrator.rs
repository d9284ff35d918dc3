//! Pipeline orchestrator: drives each dataset through Bronze, Silver and Gold.
//!
//! Datasets run independently. Within a dataset every stage runs under the
//! dataset lock, so each table has at most one in-flight writer from this
//! process; the storage compare-and-set catches any other writer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use medallion_state::StateBackend;
use medallion_types::batch::Batch;
use medallion_types::event::PipelineEvent;
use medallion_types::quality::{QualityOverview, QualityReport};
use medallion_types::record::{Record, Row};
use medallion_types::schema::SchemaId;
use medallion_types::state::{DatasetId, Layer, QuarantineRecord, RunStats, RunStatus, TableName};
use medallion_types::table::{CommitRequest, Operation, VersionId};
use medallion_types::value::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bronze::{BatchState, BronzeProcessor, PendingBatch, PreparedBatch};
use crate::checkpoint::{read_watermarks, Watermarks};
use crate::config::types::{DatasetConfig, PipelineConfig, ReferenceTable};
use crate::errors::{compute_backoff, StageError, StageFailure};
use crate::events::EventSink;
use crate::gold::GoldProcessor;
use crate::quality::QualityEngine;
use crate::quarantine::persist_quarantine_records;
use crate::result::{DatasetReport, StageOutput, StageResult, StageStatus};
use crate::schema_registry::SchemaRegistry;
use crate::silver::SilverProcessor;

/// One attempt of a stage, run on a blocking thread.
type StageOp = Arc<dyn Fn(&CancellationToken) -> Result<StageOutput, StageError> + Send + Sync>;

struct Attempted {
    result: Result<StageOutput, StageError>,
    attempts: u32,
    /// Run-history id of the last attempt, if one was started.
    run_id: Option<i64>,
}

struct DatasetSlot {
    config: Arc<DatasetConfig>,
    /// Batches awaiting Bronze, in submission order. Also serves as the
    /// dataset lock.
    queue: Mutex<VecDeque<PendingBatch>>,
}

/// Entry point for running pipeline stages.
///
/// Cheap to clone; clones share state, queues and the cancellation token.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    backend: Arc<dyn StateBackend>,
    registry: Arc<SchemaRegistry>,
    quality: Arc<QualityEngine>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
    datasets: Arc<HashMap<DatasetId, Arc<DatasetSlot>>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: Arc<PipelineConfig>,
        backend: Arc<dyn StateBackend>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let datasets = config
            .datasets
            .iter()
            .map(|d| {
                let slot = DatasetSlot {
                    config: Arc::new(d.clone()),
                    queue: Mutex::new(VecDeque::new()),
                };
                (d.name.clone(), Arc::new(slot))
            })
            .collect();
        Self {
            registry: Arc::new(SchemaRegistry::new(backend.clone())),
            quality: Arc::new(QualityEngine::new(&config.quality)),
            config,
            backend,
            events,
            cancel: CancellationToken::new(),
            datasets: Arc::new(datasets),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Token that cancels in-progress stages before their commit.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register the configured schemas and seed reference tables.
    ///
    /// Safe to call on every start: identical schemas and unchanged
    /// reference rows are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Schema`] when a schema is incompatible with
    /// the stored one, or a storage error.
    pub async fn initialize(&self) -> Result<Vec<SchemaId>, StageError> {
        let config = self.config.clone();
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<SchemaId>, StageError> {
            let mut ids = Vec::with_capacity(config.schemas.len());
            for schema in &config.schemas {
                ids.push(registry.register(schema.clone())?);
            }
            for reference in &config.references {
                seed_reference(backend.as_ref(), &registry, reference)?;
            }
            tracing::info!(
                pipeline = config.pipeline.as_str(),
                schemas = ids.len(),
                references = config.references.len(),
                "Orchestrator initialized"
            );
            Ok(ids)
        })
        .await
        .map_err(|e| StageError::Internal(format!("initialize task panicked: {e}")))?
    }

    fn slot(&self, dataset: &DatasetId) -> Result<Arc<DatasetSlot>, StageError> {
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| StageError::Invalid(format!("unknown dataset '{dataset}'")))
    }

    /// Queue a batch for the dataset's next Bronze run. Returns the queue
    /// length.
    ///
    /// A batch whose id is already queued is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Invalid`] for an unknown dataset.
    pub async fn submit(&self, dataset: &DatasetId, batch: Batch) -> Result<usize, StageError> {
        let slot = self.slot(dataset)?;
        let mut queue = slot.queue.lock().await;
        if queue.iter().any(|p| p.batch.batch_id == batch.batch_id) {
            tracing::warn!(
                dataset = dataset.as_str(),
                batch_id = batch.batch_id.as_str(),
                "Batch already queued, ignoring"
            );
            return Ok(queue.len());
        }
        tracing::info!(
            dataset = dataset.as_str(),
            batch_id = batch.batch_id.as_str(),
            records = batch.len(),
            "Batch submitted"
        );
        queue.push_back(PendingBatch::new(batch));
        Ok(queue.len())
    }

    /// Ids and lifecycle states of the batches still queued for Bronze.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Invalid`] for an unknown dataset.
    pub async fn pending_batches(
        &self,
        dataset: &DatasetId,
    ) -> Result<Vec<(String, BatchState)>, StageError> {
        let slot = self.slot(dataset)?;
        let queue = slot.queue.lock().await;
        Ok(queue
            .iter()
            .map(|p| (p.batch.batch_id.clone(), p.state()))
            .collect())
    }

    /// Stored watermarks and heads of every configured layer.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] for an unknown dataset or a storage failure.
    pub async fn watermarks(&self, dataset: &DatasetId) -> Result<Watermarks, StageError> {
        let slot = self.slot(dataset)?;
        self.read_watermarks(&slot.config).await
    }

    /// Latest stored quality report of every configured Bronze and Silver
    /// table, summarized.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Storage`] when a table history cannot be read.
    pub async fn quality_overview(&self) -> Result<QualityOverview, StageError> {
        let backend = self.backend.clone();
        let tables: Vec<TableName> = self
            .config
            .datasets
            .iter()
            .flat_map(|d| [d.table(Layer::Bronze), d.table(Layer::Silver)])
            .flatten()
            .cloned()
            .collect();
        tokio::task::spawn_blocking(move || -> Result<QualityOverview, StageError> {
            let mut reports = Vec::with_capacity(tables.len());
            for table in tables {
                let latest = backend
                    .history(&table)?
                    .into_iter()
                    .rev()
                    .find_map(|commit| commit.quality_report);
                if let Some(report) = latest {
                    reports.push((table, report));
                }
            }
            Ok(QualityOverview::from_reports(reports))
        })
        .await
        .map_err(|e| StageError::Internal(format!("quality_overview task panicked: {e}")))?
    }

    async fn read_watermarks(&self, dataset: &Arc<DatasetConfig>) -> Result<Watermarks, StageError> {
        let backend = self.backend.clone();
        let dataset = dataset.clone();
        tokio::task::spawn_blocking(move || read_watermarks(backend.as_ref(), &dataset))
            .await
            .map_err(|e| StageError::Internal(format!("read_watermarks task panicked: {e}")))?
            .map_err(StageError::from)
    }

    /// Run one stage of one dataset.
    ///
    /// Bronze commits every queued batch in order. Silver and Gold fold
    /// their upstream up to `as_of` (upstream head when `None`). Failures
    /// are reported in the result, never raised.
    pub async fn run_stage(
        &self,
        dataset: &DatasetId,
        stage: Layer,
        as_of: Option<VersionId>,
    ) -> StageResult {
        let started = Instant::now();
        let slot = match self.slot(dataset) {
            Ok(slot) => slot,
            Err(err) => {
                return StageResult::failed(
                    dataset.clone(),
                    stage,
                    StageStatus::Failed,
                    0,
                    err.to_string(),
                    started.elapsed(),
                )
            }
        };
        let mut queue = slot.queue.lock().await;
        self.run_stage_locked(&slot.config, &mut queue, stage, as_of)
            .await
    }

    async fn run_stage_locked(
        &self,
        dataset: &Arc<DatasetConfig>,
        queue: &mut VecDeque<PendingBatch>,
        stage: Layer,
        as_of: Option<VersionId>,
    ) -> StageResult {
        let started = Instant::now();
        if dataset.table(stage).is_none() {
            tracing::debug!(
                dataset = dataset.name.as_str(),
                stage = stage.as_str(),
                "Stage not configured, skipping"
            );
            return StageResult::skipped(dataset.name.clone(), stage);
        }
        if as_of == Some(0) {
            let err = StageError::Invalid("as_of version must be at least 1".into());
            return self.fail(dataset, stage, 0, err, started);
        }

        tracing::info!(
            dataset = dataset.name.as_str(),
            stage = stage.as_str(),
            as_of,
            "Starting stage"
        );
        match stage {
            Layer::Bronze => {
                if as_of.is_some() {
                    tracing::debug!(
                        dataset = dataset.name.as_str(),
                        "as_of does not apply to Bronze, ignoring"
                    );
                }
                self.run_bronze(dataset, queue, started).await
            }
            Layer::Silver | Layer::Gold => {
                let op = self.layer_op(dataset, stage, as_of);
                let attempted = self.run_with_retries(&dataset.name, stage, &op).await;
                match attempted.result {
                    Ok(mut output) => {
                        if let Some(run_id) = attempted.run_id {
                            self.persist_quarantine(
                                &dataset.name,
                                run_id,
                                std::mem::take(&mut output.quarantined),
                            )
                            .await;
                        }
                        if output.status == StageStatus::Committed {
                            self.emit_committed(dataset, stage, &output);
                            if let Some(report) = &output.quality_report {
                                self.emit_quality(dataset, stage, None, report);
                            }
                        }
                        self.complete(dataset, stage, &output, attempted.attempts, started)
                    }
                    Err(err) => self.fail(dataset, stage, attempted.attempts, err, started),
                }
            }
        }
    }

    fn layer_op(
        &self,
        dataset: &Arc<DatasetConfig>,
        stage: Layer,
        as_of: Option<VersionId>,
    ) -> StageOp {
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let quality = self.quality.clone();
        let dataset = dataset.clone();
        let partitions = self.config.resources.gold_partitions;
        Arc::new(move |cancel: &CancellationToken| match stage {
            Layer::Silver => {
                let silver = dataset.silver.as_ref().ok_or_else(|| {
                    StageError::Invalid(format!("dataset '{}' has no silver layer", dataset.name))
                })?;
                SilverProcessor::new(
                    backend.as_ref(),
                    &registry,
                    &quality,
                    &dataset.bronze.table,
                    silver,
                )
                .run(as_of, cancel)
            }
            Layer::Gold => {
                let (Some(silver), Some(gold)) = (dataset.silver.as_ref(), dataset.gold.as_ref())
                else {
                    return Err(StageError::Invalid(format!(
                        "dataset '{}' needs silver and gold layers for Gold",
                        dataset.name
                    )));
                };
                GoldProcessor::new(backend.as_ref(), &silver.table, gold, partitions)
                    .run(as_of, cancel)
            }
            Layer::Bronze => Err(StageError::Internal(
                "bronze runs from the batch queue".into(),
            )),
        })
    }

    async fn run_bronze(
        &self,
        dataset: &Arc<DatasetConfig>,
        queue: &mut VecDeque<PendingBatch>,
        started: Instant,
    ) -> StageResult {
        if queue.is_empty() {
            let backend = self.backend.clone();
            let table = dataset.bronze.table.clone();
            let op: StageOp = Arc::new(move |_cancel: &CancellationToken| {
                let head = backend.head_version(&table)?;
                Ok::<_, StageError>(StageOutput::no_change(head, None))
            });
            let attempted = self.run_with_retries(&dataset.name, Layer::Bronze, &op).await;
            return match attempted.result {
                Ok(output) => {
                    self.complete(dataset, Layer::Bronze, &output, attempted.attempts, started)
                }
                Err(err) => self.fail(dataset, Layer::Bronze, attempted.attempts, err, started),
            };
        }

        let mut totals = StageOutput::no_change(None, None);
        let mut attempts = 0u32;

        while let Some(pending) = queue.front_mut() {
            if pending.prepared().is_none() {
                if let Err(err) = self.validate_pending(dataset, pending).await {
                    return self.fail(dataset, Layer::Bronze, attempts.max(1), err, started);
                }
            }
            let Some(prepared) = pending.prepared().cloned() else {
                let err = StageError::Internal(format!(
                    "batch '{}' has no validation result",
                    pending.batch.batch_id
                ));
                return self.fail(dataset, Layer::Bronze, attempts.max(1), err, started);
            };
            let batch = Arc::new(pending.batch.clone());
            let prepared = Arc::new(prepared);

            let op = self.bronze_commit_op(dataset, batch.clone(), prepared.clone());
            let attempted = self.run_with_retries(&dataset.name, Layer::Bronze, &op).await;
            attempts = attempts.max(attempted.attempts);

            let mut output = match attempted.result {
                Ok(output) => output,
                Err(err) => {
                    if let Err(e) = pending.transition(BatchState::Failed) {
                        tracing::error!(error = %e, "Failed to mark batch as failed");
                    }
                    return self.fail(dataset, Layer::Bronze, attempts, err, started);
                }
            };
            if let Err(err) = pending.transition(BatchState::Committed) {
                return self.fail(dataset, Layer::Bronze, attempts, err, started);
            }
            queue.pop_front();

            if output.status == StageStatus::Committed {
                if let Some(run_id) = attempted.run_id {
                    self.persist_quarantine(
                        &dataset.name,
                        run_id,
                        std::mem::take(&mut output.quarantined),
                    )
                    .await;
                }
                self.emit_committed(dataset, Layer::Bronze, &output);
                self.emit_quality(
                    dataset,
                    Layer::Bronze,
                    Some(batch.batch_id.as_str()),
                    &prepared.report,
                );
                totals.status = StageStatus::Committed;
                totals.stats.records_read += output.stats.records_read;
                totals.stats.records_written += output.stats.records_written;
                totals.stats.records_quarantined += output.stats.records_quarantined;
            }
            totals.version_id = output.version_id.or(totals.version_id);
            totals.stats.version_id = totals.version_id;
            totals.batch_ids.extend(output.batch_ids);
        }

        self.complete(dataset, Layer::Bronze, &totals, attempts, started)
    }

    async fn validate_pending(
        &self,
        dataset: &Arc<DatasetConfig>,
        pending: &mut PendingBatch,
    ) -> Result<(), StageError> {
        pending.transition(BatchState::Validating)?;

        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let quality = self.quality.clone();
        let table = dataset.bronze.table.clone();
        let batch = pending.batch.clone();
        let key_columns = dataset
            .silver
            .as_ref()
            .map(|s| s.key_columns.clone())
            .unwrap_or_default();
        let validated = tokio::task::spawn_blocking(move || {
            BronzeProcessor::new(backend.as_ref(), &registry, &quality, &table)
                .with_key_columns(&key_columns)
                .validate(&batch)
        })
        .await
        .map_err(|e| StageError::Internal(format!("validate task panicked: {e}")))?;

        match validated {
            Ok(prepared) => pending.validated(prepared),
            Err(err) => {
                pending.transition(BatchState::Failed)?;
                Err(err.into())
            }
        }
    }

    fn bronze_commit_op(
        &self,
        dataset: &Arc<DatasetConfig>,
        batch: Arc<Batch>,
        prepared: Arc<PreparedBatch>,
    ) -> StageOp {
        let backend = self.backend.clone();
        let registry = self.registry.clone();
        let quality = self.quality.clone();
        let dataset = dataset.clone();
        Arc::new(move |cancel: &CancellationToken| {
            BronzeProcessor::new(
                backend.as_ref(),
                &registry,
                &quality,
                &dataset.bronze.table,
            )
            .commit(&batch, &prepared, cancel)
        })
    }

    /// Run `op` until it succeeds, fails for good or attempts run out.
    async fn run_with_retries(&self, dataset: &DatasetId, stage: Layer, op: &StageOp) -> Attempted {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let timeout = Duration::from_secs(self.config.resources.stage_timeout_seconds);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let (result, run_id) = self.attempt_once(dataset, stage, op, timeout).await;

            match result {
                Ok(output) => {
                    return Attempted {
                        result: Ok(output),
                        attempts: attempt,
                        run_id,
                    }
                }
                Err(ref err)
                    if err.is_retryable()
                        && attempt < max_attempts
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = compute_backoff(retry, attempt);
                    #[allow(clippy::cast_possible_truncation)]
                    // Safety: backoff is capped at backoff_max_ms, far below u64::MAX
                    let delay_ms = delay.as_millis() as u64;
                    tracing::warn!(
                        dataset = dataset.as_str(),
                        stage = stage.as_str(),
                        attempt,
                        max_attempts,
                        delay_ms,
                        error = %err,
                        "Retryable error, will retry"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => {}
                    }
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(
                            dataset = dataset.as_str(),
                            stage = stage.as_str(),
                            attempt,
                            max_attempts,
                            error = %err,
                            "Max attempts exhausted, failing stage"
                        );
                    } else {
                        tracing::error!(
                            dataset = dataset.as_str(),
                            stage = stage.as_str(),
                            error = %err,
                            "Non-retryable error, failing stage"
                        );
                    }
                    return Attempted {
                        result: Err(err),
                        attempts: attempt,
                        run_id,
                    };
                }
            }
        }
    }

    async fn attempt_once(
        &self,
        dataset: &DatasetId,
        stage: Layer,
        op: &StageOp,
        timeout: Duration,
    ) -> (Result<StageOutput, StageError>, Option<i64>) {
        if self.cancel.is_cancelled() {
            return (Err(StageError::Cancelled), None);
        }

        let backend = self.backend.clone();
        let run_dataset = dataset.clone();
        let run_id = match tokio::task::spawn_blocking(move || {
            backend.start_run(&run_dataset, stage)
        })
        .await
        {
            Ok(Ok(run_id)) => run_id,
            Ok(Err(e)) => return (Err(StageError::Storage(e)), None),
            Err(e) => {
                return (
                    Err(StageError::Internal(format!("start_run task panicked: {e}"))),
                    None,
                )
            }
        };

        let attempt_cancel = self.cancel.child_token();
        let task = {
            let op = op.clone();
            let cancel = attempt_cancel.clone();
            tokio::task::spawn_blocking(move || op(&cancel))
        };
        let result = match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StageError::Internal(format!(
                "{stage} stage task panicked: {join_err}"
            ))),
            Err(_) => {
                // The blocking attempt keeps running; stop it before it commits.
                attempt_cancel.cancel();
                Err(StageError::Timeout(timeout))
            }
        };

        self.complete_run(run_id, &result).await;
        (result, Some(run_id))
    }

    /// Best-effort run-history update.
    async fn complete_run(&self, run_id: i64, result: &Result<StageOutput, StageError>) {
        let (status, stats) = match result {
            Ok(output) => (RunStatus::Completed, output.stats.clone()),
            Err(err) => (
                if matches!(err, StageError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                },
                RunStats {
                    error_message: Some(err.to_string()),
                    ..RunStats::default()
                },
            ),
        };
        let backend = self.backend.clone();
        match tokio::task::spawn_blocking(move || backend.complete_run(run_id, status, &stats))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(run_id, error = %e, "Failed to record run completion");
            }
            Err(e) => tracing::warn!(run_id, "complete_run task panicked: {e}"),
        }
    }

    async fn persist_quarantine(
        &self,
        dataset: &DatasetId,
        run_id: i64,
        records: Vec<QuarantineRecord>,
    ) {
        if records.is_empty() {
            return;
        }
        let backend = self.backend.clone();
        let dataset = dataset.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            persist_quarantine_records(backend.as_ref(), &dataset, run_id, &records);
        })
        .await
        {
            tracing::error!("persist_quarantine_records task panicked: {e}");
        }
    }

    fn complete(
        &self,
        dataset: &DatasetConfig,
        stage: Layer,
        output: &StageOutput,
        attempts: u32,
        started: Instant,
    ) -> StageResult {
        let result =
            StageResult::from_output(dataset.name.clone(), stage, output, attempts, started.elapsed());
        tracing::info!(
            dataset = dataset.name.as_str(),
            stage = stage.as_str(),
            status = result.status.as_str(),
            version_id = result.version_id,
            attempts,
            records_read = result.records_read,
            records_written = result.records_written,
            records_quarantined = result.records_quarantined,
            duration_secs = result.duration_secs,
            "Stage completed"
        );
        self.events.emit(&PipelineEvent::StageCompleted {
            dataset: dataset.name.clone(),
            stage,
            version_id: output.version_id,
        });
        result
    }

    fn fail(
        &self,
        dataset: &DatasetConfig,
        stage: Layer,
        attempts: u32,
        err: StageError,
        started: Instant,
    ) -> StageResult {
        let status = if matches!(err, StageError::Cancelled) {
            StageStatus::Cancelled
        } else {
            StageStatus::Failed
        };
        let failure = StageFailure {
            dataset: dataset.name.clone(),
            stage,
            attempts,
            error: err,
        };
        tracing::error!(
            dataset = dataset.name.as_str(),
            stage = stage.as_str(),
            status = status.as_str(),
            error = %failure,
            "Stage failed"
        );
        self.events.emit(&PipelineEvent::StageFailed {
            dataset: dataset.name.clone(),
            stage,
            attempts,
            reason: failure.error.to_string(),
        });
        StageResult::failed(
            dataset.name.clone(),
            stage,
            status,
            attempts,
            failure.to_string(),
            started.elapsed(),
        )
    }

    fn emit_committed(&self, dataset: &DatasetConfig, stage: Layer, output: &StageOutput) {
        let (Some(table), Some(version_id)) = (dataset.table(stage), output.version_id) else {
            return;
        };
        self.events.emit(&PipelineEvent::BatchCommitted {
            dataset: dataset.name.clone(),
            table: table.clone(),
            layer: stage,
            version_id,
            batch_ids: output.batch_ids.clone(),
            row_count: output.stats.records_written,
        });
    }

    fn emit_quality(
        &self,
        dataset: &DatasetConfig,
        stage: Layer,
        batch_id: Option<&str>,
        report: &QualityReport,
    ) {
        if !report.below_threshold {
            return;
        }
        let Some(table) = dataset.table(stage) else {
            return;
        };
        tracing::warn!(
            dataset = dataset.name.as_str(),
            table = %table,
            batch_id,
            aggregate_score = report.aggregate_score,
            threshold = report.threshold,
            "Quality below threshold"
        );
        self.events.emit(&PipelineEvent::QualityBelowThreshold {
            dataset: dataset.name.clone(),
            table: table.clone(),
            batch_id: batch_id.map(ToString::to_string),
            aggregate_score: report.aggregate_score,
            threshold: report.threshold,
        });
    }

    /// Run Bronze, Silver and Gold in order, halting at the first stage
    /// that does not succeed.
    pub async fn run_dataset(&self, dataset: &DatasetId) -> DatasetReport {
        let mut report = DatasetReport::new(dataset.clone());
        let slot = match self.slot(dataset) {
            Ok(slot) => slot,
            Err(err) => {
                report.failed_stage = Some(Layer::Bronze);
                report.error = Some(err.to_string());
                return report;
            }
        };

        let mut queue = slot.queue.lock().await;
        for stage in Layer::ALL {
            let result = self.run_stage_locked(&slot.config, &mut queue, stage, None).await;
            let halted = !result.status.is_success();
            if halted {
                report.failed_stage = Some(stage);
                report.error.clone_from(&result.error);
            }
            report.stages.push(result);
            if halted {
                tracing::error!(
                    dataset = dataset.as_str(),
                    stage = stage.as_str(),
                    "Dataset pipeline halted"
                );
                break;
            }
        }
        drop(queue);

        match self.read_watermarks(&slot.config).await {
            Ok(marks) => {
                report.watermarks = marks.checkpoints;
                report.heads = marks.heads;
            }
            Err(e) => tracing::warn!(
                dataset = dataset.as_str(),
                error = %e,
                "Failed to read watermarks for report"
            ),
        }
        report
    }

    /// Run every dataset end to end, in parallel. Reports follow the
    /// configured dataset order.
    pub async fn run_all(&self) -> Vec<DatasetReport> {
        let names: Vec<DatasetId> = self.config.datasets.iter().map(|d| d.name.clone()).collect();
        let mut join_set = JoinSet::new();
        for (index, name) in names.iter().cloned().enumerate() {
            let this = self.clone();
            join_set.spawn(async move { (index, this.run_dataset(&name).await) });
        }

        let mut reports: Vec<Option<DatasetReport>> = names.iter().map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => reports[index] = Some(report),
                Err(join_err) => tracing::error!("Dataset task panicked: {join_err}"),
            }
        }

        reports
            .into_iter()
            .zip(names)
            .map(|(report, name)| {
                report.unwrap_or_else(|| {
                    let mut report = DatasetReport::new(name);
                    report.failed_stage = Some(Layer::Bronze);
                    report.error = Some("dataset task panicked".into());
                    report
                })
            })
            .collect()
    }
}

/// Commit `reference` rows as an Overwrite unless the head already holds
/// the same records.
fn seed_reference(
    backend: &dyn StateBackend,
    registry: &SchemaRegistry,
    reference: &ReferenceTable,
) -> Result<Option<VersionId>, StageError> {
    let schema = registry.resolve_optional(&reference.table)?;
    let rows: Vec<Row> = reference
        .rows
        .iter()
        .map(|raw| {
            let record = match &schema {
                Some(schema) => schema.validate_raw(raw).record,
                None => {
                    let mut record = Record::new();
                    record.extra = raw
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from_json_loose(v)))
                        .collect();
                    record
                }
            };
            Row::new(record)
        })
        .collect();

    let current = backend.read_table(&reference.table, None)?;
    let unchanged = current.version.is_some()
        && current
            .rows
            .iter()
            .map(|r| &r.record)
            .eq(rows.iter().map(|r| &r.record));
    if unchanged {
        tracing::debug!(table = %reference.table, "Reference table unchanged");
        return Ok(current.version);
    }

    let row_count = rows.len();
    let request = CommitRequest::new(Operation::Overwrite, current.version, rows)
        .with_batch_ids(vec![reference_batch_id(&reference.table)]);
    let commit = backend
        .commit(&reference.table, request)
        .map_err(|e| StageError::from_commit(reference.table.as_str(), e))?;
    tracing::info!(
        table = %reference.table,
        version_id = commit.version_id,
        rows = row_count,
        "Reference table seeded"
    );
    Ok(Some(commit.version_id))
}

fn reference_batch_id(table: &TableName) -> String {
    format!("reference:{table}")
}
