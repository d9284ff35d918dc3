//! Bronze layer: validate raw batches and append them with lineage.
//!
//! A batch moves `Received → Validating → {Quarantined | Accepted} →
//! Committed`. Validation runs exactly once; a failed commit is retried
//! from the prepared batch without re-validating. Offending records are
//! quarantined individually and committed alongside the clean ones, so no
//! input record is ever dropped.

use chrono::{SecondsFormat, Utc};
use medallion_state::StateBackend;
use medallion_types::batch::Batch;
use medallion_types::quality::QualityReport;
use medallion_types::record::{Lineage, Record, Row, RowQuality};
use medallion_types::state::{QuarantineRecord, RunStats, TableName};
use medallion_types::table::{CommitRequest, Operation};
use medallion_types::value::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::{SchemaError, StageError};
use crate::quality::QualityEngine;
use crate::quarantine::quarantine_record;
use crate::result::{StageOutput, StageStatus};
use crate::schema_registry::SchemaRegistry;

/// Lifecycle of one batch through Bronze.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Received,
    Validating,
    /// Validated; at least one record was quarantined.
    Quarantined,
    /// Validated; every record is clean.
    Accepted,
    Committed,
    /// Validation or commit failed for good. The batch stays queued.
    Failed,
}

impl BatchState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Validating => "VALIDATING",
            Self::Quarantined => "QUARANTINED",
            Self::Accepted => "ACCEPTED",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received | Self::Failed, Self::Validating)
                | (
                    Self::Validating,
                    Self::Quarantined | Self::Accepted | Self::Failed
                )
                | (
                    Self::Quarantined | Self::Accepted | Self::Failed,
                    Self::Committed | Self::Failed
                )
        )
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch queued for Bronze, with its validation result once computed.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub batch: Batch,
    state: BatchState,
    prepared: Option<PreparedBatch>,
}

impl PendingBatch {
    #[must_use]
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            state: BatchState::Received,
            prepared: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> BatchState {
        self.state
    }

    #[must_use]
    pub fn prepared(&self) -> Option<&PreparedBatch> {
        self.prepared.as_ref()
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Internal`] for a transition the lifecycle
    /// does not allow.
    pub fn transition(&mut self, next: BatchState) -> Result<(), StageError> {
        if !self.state.can_transition_to(next) {
            return Err(StageError::Internal(format!(
                "batch '{}' cannot move from {} to {next}",
                self.batch.batch_id, self.state
            )));
        }
        tracing::debug!(
            batch_id = self.batch.batch_id.as_str(),
            from = self.state.as_str(),
            to = next.as_str(),
            "Batch state transition"
        );
        self.state = next;
        Ok(())
    }

    /// Store the validation outcome and move to `Quarantined` or `Accepted`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Internal`] unless the batch is `Validating`.
    pub fn validated(&mut self, prepared: PreparedBatch) -> Result<(), StageError> {
        let next = if prepared.report.quarantined_count > 0 {
            BatchState::Quarantined
        } else {
            BatchState::Accepted
        };
        self.transition(next)?;
        self.prepared = Some(prepared);
        Ok(())
    }
}

/// Validated rows ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub rows: Vec<Row>,
    pub report: QualityReport,
    pub quarantined: Vec<QuarantineRecord>,
    pub schema_version: Option<u32>,
}

impl PreparedBatch {
    #[must_use]
    pub fn accepted_count(&self) -> u64 {
        self.report.record_count - self.report.quarantined_count
    }
}

pub struct BronzeProcessor<'a> {
    backend: &'a dyn StateBackend,
    registry: &'a SchemaRegistry,
    quality: &'a QualityEngine,
    table: &'a TableName,
    key_columns: &'a [String],
}

impl<'a> BronzeProcessor<'a> {
    #[must_use]
    pub fn new(
        backend: &'a dyn StateBackend,
        registry: &'a SchemaRegistry,
        quality: &'a QualityEngine,
        table: &'a TableName,
    ) -> Self {
        Self {
            backend,
            registry,
            quality,
            table,
            key_columns: &[],
        }
    }

    /// Business key used by the uniqueness dimension of the batch report.
    #[must_use]
    pub fn with_key_columns(mut self, key_columns: &'a [String]) -> Self {
        self.key_columns = key_columns;
        self
    }

    /// Validate and score every record of `batch`.
    ///
    /// The batch's own `schema_version` is used when set, otherwise the
    /// latest registered version. A table without any schema accepts
    /// records untyped, every field landing in the extra bucket.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the requested schema version is unknown.
    pub fn validate(&self, batch: &Batch) -> Result<PreparedBatch, SchemaError> {
        let schema = match batch.schema_version {
            Some(version) => Some(self.registry.resolve(self.table, Some(version))?),
            None => self.registry.resolve_optional(self.table)?,
        };
        let lineage = Lineage {
            batch_id: batch.batch_id.clone(),
            source_id: batch.source_id.clone(),
            ingestion_timestamp: batch.ingestion_timestamp,
        };
        let quarantined_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let mut rows = Vec::with_capacity(batch.records.len());
        let mut quarantined = Vec::new();
        for raw in &batch.records {
            let (record, quality, reasons) = match &schema {
                Some(schema) => {
                    let (validation, quality) = self.quality.score(raw, schema);
                    let reasons: Vec<String> =
                        validation.violations.iter().map(ToString::to_string).collect();
                    (validation.record, quality, reasons)
                }
                None => {
                    let mut record = Record::new();
                    record.extra = raw
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from_json_loose(v)))
                        .collect();
                    (record, RowQuality::clean(), Vec::new())
                }
            };

            let mut row = Row::new(record)
                .with_lineage(lineage.clone())
                .with_quality(quality);
            if row.is_quarantined() {
                row.raw = Some(raw.clone());
                quarantined.push(quarantine_record(
                    self.table,
                    &batch.batch_id,
                    &row,
                    &reasons,
                    &quarantined_at,
                ));
            }
            rows.push(row);
        }

        let report = self.quality.batch_report(&rows, self.key_columns);

        Ok(PreparedBatch {
            rows,
            report,
            quarantined,
            schema_version: schema.map(|s| s.definition().version),
        })
    }

    /// Append a validated batch as one atomic Bronze version.
    ///
    /// Re-committing a `batch_id` that is already in the table is a no-op
    /// returning the existing version.
    ///
    /// # Errors
    ///
    /// Returns [`StageError`] when the commit fails or the stage was
    /// cancelled first.
    pub fn commit(
        &self,
        batch: &Batch,
        prepared: &PreparedBatch,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageError> {
        if let Some(existing) = self.backend.find_batch(self.table, &batch.batch_id)? {
            tracing::info!(
                table = %self.table,
                batch_id = batch.batch_id.as_str(),
                version_id = existing,
                "Batch already committed, skipping"
            );
            let mut output = StageOutput::no_change(Some(existing), None);
            output.batch_ids = vec![batch.batch_id.clone()];
            return Ok(output);
        }

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        let head = self.backend.head_version(self.table)?;
        let request = CommitRequest::new(Operation::Append, head, prepared.rows.clone())
            .with_batch_ids(vec![batch.batch_id.clone()])
            .with_quality_report(prepared.report.clone())
            .with_details(serde_json::json!({
                "source_id": batch.source_id,
                "ingestion_timestamp": batch.ingestion_timestamp,
                "schema_version": prepared.schema_version,
            }));
        let commit = self
            .backend
            .commit(self.table, request)
            .map_err(|e| StageError::from_commit(self.table.as_str(), e))?;

        tracing::info!(
            table = %self.table,
            batch_id = batch.batch_id.as_str(),
            version_id = commit.version_id,
            records = prepared.report.record_count,
            quarantined = prepared.report.quarantined_count,
            aggregate_score = prepared.report.aggregate_score,
            "Bronze batch committed"
        );

        Ok(StageOutput {
            status: StageStatus::Committed,
            version_id: Some(commit.version_id),
            upstream_version: None,
            batch_ids: commit.input_batch_ids,
            stats: RunStats {
                records_read: prepared.report.record_count,
                records_written: prepared.accepted_count(),
                records_quarantined: prepared.report.quarantined_count,
                version_id: Some(commit.version_id),
                error_message: None,
            },
            quality_report: Some(prepared.report.clone()),
            quarantined: prepared.quarantined.clone(),
        })
    }
}
