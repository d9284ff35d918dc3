//! Integration tests for the full Bronze → Silver → Gold path.
//!
//! These tests drive the orchestrator against the retail fixture pipeline
//! and an in-memory state backend, checking what ends up in each table.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use medallion_engine::config::types::PipelineConfig;
use medallion_engine::config::{parser, validator};
use medallion_engine::gold::aggregate;
use medallion_engine::{
    ChannelEventSink, EventSink, MultiEventSink, Orchestrator, SchemaError, StageStatus,
    TracingEventSink,
};
use medallion_state::{SqliteStateBackend, StateBackend, StateError};
use medallion_types::batch::Batch;
use medallion_types::event::PipelineEvent;
use medallion_types::quality::QualityLevel;
use medallion_types::record::{QualityFlag, RawRecord, Row};
use medallion_types::schema::{ColumnSpec, SchemaDefinition};
use medallion_types::state::{
    Checkpoint, CheckpointKey, DatasetId, Layer, QuarantineRecord, RunRecord, RunStats,
    RunStatus, TableName,
};
use medallion_types::table::{CommitInfo, CommitRequest, TableChange, TableSnapshot, VersionId};
use medallion_types::value::{ColumnType, Value};
use serde_json::json;
use tokio::sync::mpsc;

fn fixture(relative: &str) -> PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures")
        .join(relative)
}

fn retail_config() -> Arc<PipelineConfig> {
    let config = parser::parse_pipeline(&fixture("pipelines/retail.yaml"))
        .expect("Failed to parse retail fixture");
    validator::validate_pipeline(&config).expect("Retail fixture should validate");
    Arc::new(config)
}

fn orders() -> DatasetId {
    DatasetId::new("orders")
}

fn customers() -> DatasetId {
    DatasetId::new("customers")
}

fn ts(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

fn raw(value: serde_json::Value) -> RawRecord {
    value.as_object().cloned().expect("record literal is an object")
}

fn order(id: Option<&str>, amount: serde_json::Value, country: &str, day: u32) -> RawRecord {
    raw(json!({
        "order_id": id,
        "customer_id": "c-1",
        "amount": amount,
        "country": country,
        "order_ts": format!("2024-05-{day:02}T07:30:00Z"),
    }))
}

async fn orchestrator(
    backend: Arc<dyn StateBackend>,
) -> (Orchestrator, mpsc::Receiver<PipelineEvent>) {
    let (sink, rx) = ChannelEventSink::channel(1024);
    let orchestrator = Orchestrator::new(retail_config(), backend, Arc::new(sink));
    orchestrator.initialize().await.expect("initialize");
    (orchestrator, rx)
}

fn in_memory() -> Arc<dyn StateBackend> {
    Arc::new(SqliteStateBackend::in_memory().expect("in-memory state"))
}

fn drain(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn find_by<'a>(rows: &'a [Row], column: &str, value: &str) -> &'a Row {
    rows.iter()
        .find(|r| r.get(column).and_then(Value::as_str) == Some(value))
        .unwrap_or_else(|| panic!("no row with {column} = {value}"))
}

/// The two batches shared by the Silver and Gold scenarios.
fn first_batch() -> Batch {
    Batch::new(
        "orders-b1",
        "pos",
        ts(1, 8),
        vec![
            order(Some("o-1"), json!(10.0), "united states", 1),
            order(Some("o-2"), json!(25.5), "germany", 1),
        ],
    )
}

fn second_batch() -> Batch {
    Batch::new(
        "orders-b2",
        "pos",
        ts(1, 9),
        vec![
            order(Some("o-1"), json!(12), " us ", 1),
            order(Some("o-3"), json!(7.25), "fr", 2),
        ],
    )
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

#[test]
fn test_parse_and_validate_retail_fixture() {
    let config = retail_config();
    assert_eq!(config.pipeline, "retail");
    assert_eq!(config.datasets.len(), 2);
    assert_eq!(config.schemas.len(), 2);
    assert_eq!(config.references[0].table.as_str(), "ref_regions");
    assert_eq!(config.retry.max_attempts, 3);

    let orders = config.dataset(&orders()).unwrap();
    assert_eq!(
        orders.table(Layer::Gold).map(TableName::as_str),
        Some("gold_daily_revenue")
    );
    let customers = config.dataset(&customers()).unwrap();
    assert!(customers.gold.is_none());
}

#[test]
fn test_invalid_fixture_reports_every_problem() {
    let config = parser::parse_pipeline(&fixture("pipelines/invalid_pipeline.yaml"))
        .expect("Invalid fixture still parses");
    let err = validator::validate_pipeline(&config).unwrap_err().to_string();
    assert!(err.contains("Unsupported pipeline version"), "got: {err}");
    assert!(err.contains("max_attempts"), "got: {err}");
    assert!(err.contains("gold requires a silver layer"), "got: {err}");
    assert!(err.contains("requires a column"), "got: {err}");
}

#[test]
fn test_batch_fixtures_deserialize() {
    for name in ["orders_b1.json", "orders_b2.json", "customers_b1.json"] {
        let content = std::fs::read_to_string(fixture(&format!("batches/{name}"))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        let batch: Batch = serde_json::from_value(value["batch"].clone()).unwrap();
        assert!(!batch.is_empty(), "{name} has no records");
        assert!(value["dataset"].is_string());
    }
}

// ---------------------------------------------------------------------------
// Bronze
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bronze_quarantines_null_keys_without_losing_records() {
    let backend = in_memory();
    let (orch, mut rx) = orchestrator(backend.clone()).await;

    let records = (0..100)
        .map(|i| {
            let id = format!("o-{i}");
            let country = if i % 2 == 0 { "united states" } else { "germany" };
            order(
                (i % 20 != 0).then_some(id.as_str()),
                json!(10.5),
                country,
                1,
            )
        })
        .collect();
    orch.submit(&orders(), Batch::new("bulk-1", "pos", ts(1, 8), records))
        .await
        .unwrap();

    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.status, StageStatus::Committed);
    assert_eq!(bronze.records_read, 100);
    assert_eq!(bronze.records_written, 95);
    assert_eq!(bronze.records_quarantined, 5);

    let history = backend.history(&TableName::new("bronze_orders")).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].row_count, 100, "quarantined rows stay in Bronze");
    let report = history[0].quality_report.as_ref().unwrap();
    assert!((report.aggregate_score - 0.975).abs() < 1e-9);
    assert_eq!(report.flagged(QualityFlag::NullViolation), 5);
    assert!(!report.below_threshold);

    let quarantine = backend.list_quarantine_records(&orders()).unwrap();
    assert_eq!(quarantine.len(), 5);
    assert!(quarantine.iter().all(|q| q.batch_id == "bulk-1"));

    let silver = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(silver.status, StageStatus::Committed);
    assert_eq!(silver.records_read, 100);
    assert_eq!(silver.records_written, 95);
    let snapshot = backend
        .read_table(&TableName::new("silver_orders"), None)
        .unwrap();
    assert_eq!(snapshot.rows.len(), 95);

    let names: Vec<&str> = drain(&mut rx).iter().map(PipelineEvent::name).collect();
    assert!(names.contains(&"batch_committed"));
    assert!(!names.contains(&"quality_below_threshold"));
}

#[tokio::test]
async fn test_low_quality_batch_is_flagged_not_rejected() {
    let backend = in_memory();
    let (orch, mut rx) = orchestrator(backend.clone()).await;

    let records = vec![
        order(Some("o-1"), json!(-5.0), "germany", 1),
        order(Some("o-2"), json!(-1.0), "germany", 1),
    ];
    orch.submit(&orders(), Batch::new("negatives", "pos", ts(1, 8), records))
        .await
        .unwrap();
    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.status, StageStatus::Committed);
    assert_eq!(bronze.records_written, 2);
    assert_eq!(bronze.records_quarantined, 0);

    let flagged = drain(&mut rx).into_iter().find_map(|event| match event {
        PipelineEvent::QualityBelowThreshold {
            aggregate_score,
            batch_id,
            ..
        } => Some((aggregate_score, batch_id)),
        _ => None,
    });
    let (score, batch_id) = flagged.expect("quality event");
    assert!((score - 0.8).abs() < 1e-9);
    assert_eq!(batch_id.as_deref(), Some("negatives"));
}

// ---------------------------------------------------------------------------
// Silver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_silver_last_write_wins_and_rerun_is_noop() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;
    let silver_table = TableName::new("silver_orders");

    orch.submit(&orders(), first_batch()).await.unwrap();
    orch.run_stage(&orders(), Layer::Bronze, None).await;
    let first = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(first.status, StageStatus::Committed);
    assert_eq!(first.records_written, 2);

    orch.submit(&orders(), second_batch()).await.unwrap();
    orch.run_stage(&orders(), Layer::Bronze, None).await;
    let second = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(second.status, StageStatus::Committed);
    assert_eq!(second.records_written, 2, "one insert plus one update");

    let history = backend.history(&silver_table).unwrap();
    let details = history.last().unwrap().details.clone().unwrap();
    assert_eq!(details["merge"]["updated"], 1);
    assert_eq!(details["merge"]["inserted"], 1);
    assert_eq!(details["bronze_after"], 1);
    assert_eq!(details["bronze_upto"], 2);

    let snapshot = backend.read_table(&silver_table, None).unwrap();
    assert_eq!(snapshot.rows.len(), 3);
    let o1 = find_by(&snapshot.rows, "order_id", "o-1");
    assert_eq!(o1.get("amount"), Some(&Value::Float(12.0)));
    assert_eq!(o1.get("country"), Some(&Value::Str("US".into())));
    assert_eq!(o1.lineage.as_ref().unwrap().batch_id, "orders-b2");

    // Nothing new in Bronze: no commit, watermark and head untouched.
    let before = orch.watermarks(&orders()).await.unwrap();
    let rerun = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(rerun.status, StageStatus::NoChange);
    assert_eq!(rerun.version_id, second.version_id);
    let after = orch.watermarks(&orders()).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(backend.history(&silver_table).unwrap().len(), history.len());
}

#[tokio::test]
async fn test_silver_enrichment_flags_missing_lookups() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;

    orch.submit(&orders(), first_batch()).await.unwrap();
    orch.submit(&orders(), second_batch()).await.unwrap();
    let report = orch.run_dataset(&orders()).await;
    assert!(report.succeeded(), "{:?}", report.error);

    let snapshot = backend
        .read_table(&TableName::new("silver_orders"), None)
        .unwrap();
    let us = find_by(&snapshot.rows, "order_id", "o-1");
    assert_eq!(us.get("region"), Some(&Value::Str("Americas".into())));
    let de = find_by(&snapshot.rows, "order_id", "o-2");
    assert_eq!(de.get("region"), Some(&Value::Str("Europe".into())));

    let fr = find_by(&snapshot.rows, "order_id", "o-3");
    assert_eq!(fr.get("country"), Some(&Value::Str("FR".into())));
    assert!(fr.enrichment.is_empty());
    let quality = fr.quality.as_ref().unwrap();
    assert!(quality.flags.contains(&QualityFlag::LookupMissing));
    assert!(!quality.quarantined, "a missing lookup never quarantines");
    assert!((quality.score - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn test_watermarks_only_move_forward() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;

    orch.submit(&orders(), first_batch()).await.unwrap();
    orch.submit(&orders(), second_batch()).await.unwrap();
    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.version_id, Some(2));

    let pinned = orch.run_stage(&orders(), Layer::Silver, Some(1)).await;
    assert_eq!(pinned.status, StageStatus::Committed);
    let marks = orch.watermarks(&orders()).await.unwrap();
    assert_eq!(marks.checkpoint(Layer::Silver), Some(1));
    assert!(marks.is_behind(Layer::Silver));

    // Re-pinning the folded version changes nothing.
    let again = orch.run_stage(&orders(), Layer::Silver, Some(1)).await;
    assert_eq!(again.status, StageStatus::NoChange);

    let caught_up = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(caught_up.status, StageStatus::Committed);
    let marks = orch.watermarks(&orders()).await.unwrap();
    assert_eq!(marks.checkpoint(Layer::Silver), Some(2));

    let stale = orch.run_stage(&orders(), Layer::Silver, Some(1)).await;
    assert_eq!(stale.status, StageStatus::NoChange);
    assert_eq!(
        orch.watermarks(&orders()).await.unwrap().checkpoint(Layer::Silver),
        Some(2)
    );
}

// ---------------------------------------------------------------------------
// Gold
// ---------------------------------------------------------------------------

async fn run_two_batches(backend: Arc<dyn StateBackend>) -> Orchestrator {
    let (orch, _rx) = orchestrator(backend).await;
    orch.submit(&orders(), first_batch()).await.unwrap();
    assert!(orch.run_dataset(&orders()).await.succeeded());
    orch.submit(&orders(), second_batch()).await.unwrap();
    assert!(orch.run_dataset(&orders()).await.succeeded());
    orch
}

#[tokio::test]
async fn test_gold_is_deterministic_across_backends() {
    let a = in_memory();
    let b = in_memory();
    run_two_batches(a.clone()).await;
    run_two_batches(b.clone()).await;

    let gold = TableName::new("gold_daily_revenue");
    let rows_a = a.read_table(&gold, None).unwrap().rows;
    let rows_b = b.read_table(&gold, None).unwrap().rows;
    assert_eq!(rows_a, rows_b);
    assert_eq!(rows_a.len(), 3);

    let us = find_by(&rows_a, "country", "US");
    assert_eq!(us.get("revenue"), Some(&Value::Float(12.0)));
    assert_eq!(us.get("orders"), Some(&Value::Int(1)));
    assert_eq!(us.get("period"), Some(&Value::Timestamp(ts(1, 0))));
    let fr = find_by(&rows_a, "country", "FR");
    assert_eq!(fr.get("period"), Some(&Value::Timestamp(ts(2, 0))));
}

#[tokio::test]
async fn test_incremental_gold_matches_full_recompute() {
    let backend = in_memory();
    let orch = run_two_batches(backend.clone()).await;
    let gold_table = TableName::new("gold_daily_revenue");

    let history = backend.history(&gold_table).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].details.as_ref().unwrap()["mode"], "full");
    assert_eq!(history[1].details.as_ref().unwrap()["mode"], "incremental");
    assert_eq!(history[1].input_batch_ids, vec!["silver_orders@2".to_string()]);

    let silver = backend
        .read_table(&TableName::new("silver_orders"), None)
        .unwrap();
    let rules = &orch.config().dataset(&orders()).unwrap().gold.as_ref().unwrap().rules;
    let full = aggregate(&silver.rows, rules, 1);
    let incremental = backend.read_table(&gold_table, None).unwrap().rows;
    assert_eq!(incremental, full);

    let marks = orch.watermarks(&orders()).await.unwrap();
    assert_eq!(marks.checkpoint(Layer::Gold), Some(2));
    assert!(!marks.is_behind(Layer::Gold));
}

#[tokio::test]
async fn test_gold_time_travel_reads_pinned_silver() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;
    orch.submit(&orders(), first_batch()).await.unwrap();
    orch.submit(&orders(), second_batch()).await.unwrap();
    orch.run_stage(&orders(), Layer::Bronze, None).await;
    orch.run_stage(&orders(), Layer::Silver, Some(1)).await;
    orch.run_stage(&orders(), Layer::Silver, None).await;

    let gold = orch.run_stage(&orders(), Layer::Gold, Some(1)).await;
    assert_eq!(gold.status, StageStatus::Committed);
    let rows = backend
        .read_table(&TableName::new("gold_daily_revenue"), None)
        .unwrap()
        .rows;
    let us = find_by(&rows, "country", "US");
    assert_eq!(us.get("revenue"), Some(&Value::Float(10.0)));
    assert!(rows
        .iter()
        .all(|r| r.get("country") != Some(&Value::Str("FR".into()))));
}

// ---------------------------------------------------------------------------
// Schema evolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_incompatible_schema_is_rejected_and_data_keeps_flowing() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;
    let table = TableName::new("bronze_orders");

    let retyped = SchemaDefinition::new(table.clone(), 2)
        .with_column("order_id", ColumnSpec::new(ColumnType::Integer).required())
        .with_column("customer_id", ColumnSpec::new(ColumnType::String))
        .with_column("amount", ColumnSpec::new(ColumnType::Float))
        .with_column("country", ColumnSpec::new(ColumnType::String))
        .with_column("order_ts", ColumnSpec::new(ColumnType::Timestamp));
    let err = orch.registry().register(retyped).unwrap_err();
    assert!(matches!(err, SchemaError::Incompatible { .. }));
    assert_eq!(backend.schema_versions(&table).unwrap().len(), 1);

    let mut additive = backend.schema_versions(&table).unwrap().remove(0);
    additive.version = 2;
    additive
        .columns
        .insert("channel".into(), ColumnSpec::new(ColumnType::String));
    orch.registry().register(additive).unwrap();

    orch.submit(&orders(), first_batch()).await.unwrap();
    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.status, StageStatus::Committed);
    let details = backend.history(&table).unwrap()[0].details.clone().unwrap();
    assert_eq!(details["schema_version"], 2);
}

// ---------------------------------------------------------------------------
// Failure isolation and retries
// ---------------------------------------------------------------------------

/// Sqlite backend whose commits to one table fail a set number of times,
/// and whose change reads from that table can stall.
struct FlakyBackend {
    inner: SqliteStateBackend,
    table: TableName,
    failures_left: AtomicU32,
    stalls_left: AtomicU32,
    stall: Duration,
}

impl FlakyBackend {
    fn new(table: &str, failures: u32) -> Self {
        Self {
            inner: SqliteStateBackend::in_memory().unwrap(),
            table: TableName::new(table),
            failures_left: AtomicU32::new(failures),
            stalls_left: AtomicU32::new(0),
            stall: Duration::ZERO,
        }
    }

    /// Reads of `table`'s changes block for `stall`, `stalls` times.
    fn stalling(table: &str, stalls: u32, stall: Duration) -> Self {
        Self {
            stalls_left: AtomicU32::new(stalls),
            stall,
            ..Self::new(table, 0)
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StateBackend for FlakyBackend {
    fn head_version(&self, table: &TableName) -> Result<Option<VersionId>, StateError> {
        self.inner.head_version(table)
    }

    fn commit(&self, table: &TableName, request: CommitRequest) -> Result<CommitInfo, StateError> {
        if table == &self.table && Self::take(&self.failures_left) {
            return Err(StateError::Unavailable(format!("{table} is offline")));
        }
        self.inner.commit(table, request)
    }

    fn read_table(
        &self,
        table: &TableName,
        version: Option<VersionId>,
    ) -> Result<TableSnapshot, StateError> {
        self.inner.read_table(table, version)
    }

    fn read_changes(
        &self,
        table: &TableName,
        after: Option<VersionId>,
        upto: Option<VersionId>,
    ) -> Result<Vec<TableChange>, StateError> {
        if table == &self.table && Self::take(&self.stalls_left) {
            std::thread::sleep(self.stall);
        }
        self.inner.read_changes(table, after, upto)
    }

    fn history(&self, table: &TableName) -> Result<Vec<CommitInfo>, StateError> {
        self.inner.history(table)
    }

    fn find_batch(&self, table: &TableName, batch_id: &str) -> Result<Option<VersionId>, StateError> {
        self.inner.find_batch(table, batch_id)
    }

    fn get_checkpoint(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, StateError> {
        self.inner.get_checkpoint(key)
    }

    fn advance_checkpoint(
        &self,
        key: &CheckpointKey,
        expected: Option<VersionId>,
        new: VersionId,
    ) -> Result<(), StateError> {
        self.inner.advance_checkpoint(key, expected, new)
    }

    fn schema_versions(&self, table: &TableName) -> Result<Vec<SchemaDefinition>, StateError> {
        self.inner.schema_versions(table)
    }

    fn insert_schema(
        &self,
        schema: &SchemaDefinition,
        expected_latest: Option<u32>,
    ) -> Result<(), StateError> {
        self.inner.insert_schema(schema, expected_latest)
    }

    fn start_run(&self, dataset: &DatasetId, layer: Layer) -> Result<i64, StateError> {
        self.inner.start_run(dataset, layer)
    }

    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> Result<(), StateError> {
        self.inner.complete_run(run_id, status, stats)
    }

    fn list_runs(&self, dataset: &DatasetId) -> Result<Vec<RunRecord>, StateError> {
        self.inner.list_runs(dataset)
    }

    fn insert_quarantine_records(
        &self,
        dataset: &DatasetId,
        run_id: i64,
        records: &[QuarantineRecord],
    ) -> Result<u64, StateError> {
        self.inner.insert_quarantine_records(dataset, run_id, records)
    }

    fn list_quarantine_records(
        &self,
        dataset: &DatasetId,
    ) -> Result<Vec<QuarantineRecord>, StateError> {
        self.inner.list_quarantine_records(dataset)
    }
}

#[tokio::test]
async fn test_failing_dataset_does_not_block_others() {
    let backend: Arc<dyn StateBackend> = Arc::new(FlakyBackend::new("silver_customers", u32::MAX));
    let (orch, mut rx) = orchestrator(backend.clone()).await;

    orch.submit(&orders(), first_batch()).await.unwrap();
    orch.submit(
        &customers(),
        Batch::new(
            "customers-b1",
            "crm",
            ts(1, 8),
            vec![raw(json!({"customer_id": "c-1", "email": "ada@example.com", "tier": "gold"}))],
        ),
    )
    .await
    .unwrap();

    let reports = orch.run_all().await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].dataset, orders());
    assert_eq!(reports[1].dataset, customers());

    let orders_report = &reports[0];
    assert!(orders_report.succeeded(), "{:?}", orders_report.error);
    assert_eq!(orders_report.heads[&Layer::Gold], Some(1));

    let customers_report = &reports[1];
    assert_eq!(customers_report.failed_stage, Some(Layer::Silver));
    assert_eq!(customers_report.stages.len(), 2, "Gold never ran");
    let silver = &customers_report.stages[1];
    assert_eq!(silver.status, StageStatus::Failed);
    assert_eq!(silver.attempts, 3);
    assert!(silver.error.as_deref().unwrap().contains("silver_customers"));
    assert_eq!(customers_report.heads[&Layer::Bronze], Some(1));
    assert_eq!(customers_report.watermarks[&Layer::Silver], None);

    let failed: Vec<PipelineEvent> = drain(&mut rx)
        .into_iter()
        .filter(|e| e.name() == "stage_failed")
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].dataset(), &customers());

    let runs = backend.list_runs(&customers()).unwrap();
    let silver_runs = runs.iter().filter(|r| r.layer == Layer::Silver).count();
    assert_eq!(silver_runs, 3);
}

#[tokio::test]
async fn test_transient_commit_failures_are_retried() {
    let backend: Arc<dyn StateBackend> = Arc::new(FlakyBackend::new("bronze_orders", 2));
    let (orch, _rx) = orchestrator(backend.clone()).await;

    orch.submit(&orders(), first_batch()).await.unwrap();
    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.status, StageStatus::Committed);
    assert_eq!(bronze.attempts, 3);
    assert_eq!(bronze.version_id, Some(1));
    assert!(orch.pending_batches(&orders()).await.unwrap().is_empty());

    let history = backend.history(&TableName::new("bronze_orders")).unwrap();
    assert_eq!(history.len(), 1, "failed attempts leave no partial version");
}

#[tokio::test]
async fn test_exhausted_bronze_keeps_batch_for_next_run() {
    let backend: Arc<dyn StateBackend> = Arc::new(FlakyBackend::new("bronze_orders", 3));
    let (orch, _rx) = orchestrator(backend.clone()).await;

    orch.submit(&orders(), first_batch()).await.unwrap();
    let failed = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(failed.status, StageStatus::Failed);
    assert_eq!(failed.attempts, 3);
    let pending = orch.pending_batches(&orders()).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].0, "orders-b1");

    let retried = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(retried.status, StageStatus::Committed);
    assert_eq!(retried.attempts, 1);
    assert!(orch.pending_batches(&orders()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sinks_can_be_combined() {
    let (channel, mut rx) = ChannelEventSink::channel(64);
    let sink = MultiEventSink::new(vec![
        Arc::new(channel) as Arc<dyn EventSink>,
        Arc::new(TracingEventSink),
    ]);
    let orch = Orchestrator::new(retail_config(), in_memory(), Arc::new(sink));
    orch.initialize().await.unwrap();
    orch.submit(&orders(), first_batch()).await.unwrap();
    assert!(orch.run_dataset(&orders()).await.succeeded());

    let completed = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, PipelineEvent::StageCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
}

fn with_timeout(seconds: u64, max_attempts: u32) -> Arc<PipelineConfig> {
    let mut config = (*retail_config()).clone();
    config.resources.stage_timeout_seconds = seconds;
    config.retry.max_attempts = max_attempts;
    Arc::new(config)
}

async fn stalled_orchestrator(stalls: u32, max_attempts: u32) -> (Orchestrator, Arc<dyn StateBackend>) {
    let backend: Arc<dyn StateBackend> = Arc::new(FlakyBackend::stalling(
        "bronze_orders",
        stalls,
        Duration::from_millis(1500),
    ));
    let (sink, _rx) = ChannelEventSink::channel(1024);
    let orch = Orchestrator::new(with_timeout(1, max_attempts), backend.clone(), Arc::new(sink));
    orch.initialize().await.unwrap();
    orch.submit(&orders(), first_batch()).await.unwrap();
    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.status, StageStatus::Committed);
    (orch, backend)
}

fn silver_runs(backend: &Arc<dyn StateBackend>) -> Vec<RunRecord> {
    backend
        .list_runs(&orders())
        .unwrap()
        .into_iter()
        .filter(|r| r.layer == Layer::Silver)
        .collect()
}

#[tokio::test]
async fn test_stalled_stage_times_out_and_retries() {
    let (orch, backend) = stalled_orchestrator(1, 3).await;
    let silver_table = TableName::new("silver_orders");

    let silver = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(silver.status, StageStatus::Committed);
    assert_eq!(silver.attempts, 2);
    assert_eq!(silver.version_id, Some(1));

    let runs = silver_runs(&backend);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].status, RunStatus::Failed);
    let message = runs[0].stats.error_message.as_deref().unwrap();
    assert!(message.contains("timed out"), "{message}");
    assert_eq!(runs[1].status, RunStatus::Completed);

    // The abandoned attempt wakes up after the retry has committed and must
    // not write a second version.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(backend.history(&silver_table).unwrap().len(), 1);
    assert_eq!(orch.watermarks(&orders()).await.unwrap().checkpoint(Layer::Silver), Some(1));
}

#[tokio::test]
async fn test_stage_that_keeps_timing_out_fails_without_writing() {
    let (orch, backend) = stalled_orchestrator(u32::MAX, 2).await;
    let silver_table = TableName::new("silver_orders");

    let silver = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(silver.status, StageStatus::Failed);
    assert_eq!(silver.attempts, 2);
    assert!(silver.error.as_deref().unwrap().contains("timed out"));

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(backend.head_version(&silver_table).unwrap(), None);
    assert_eq!(orch.watermarks(&orders()).await.unwrap().checkpoint(Layer::Silver), None);
    let runs = silver_runs(&backend);
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Failed));
}

// ---------------------------------------------------------------------------
// Quality dimensions, derived columns and the quarantine log
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_silver_rejections_land_in_quarantine_log() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;
    orch.registry()
        .register(
            SchemaDefinition::new("silver_orders", 1)
                .with_column("order_id", ColumnSpec::new(ColumnType::String).required())
                .with_column("customer_id", ColumnSpec::new(ColumnType::String).required()),
        )
        .unwrap();

    let mut anonymous = order(Some("o-2"), json!(3.0), "germany", 1);
    anonymous.insert("customer_id".into(), serde_json::Value::Null);
    orch.submit(
        &orders(),
        Batch::new(
            "mixed",
            "pos",
            ts(1, 8),
            vec![order(Some("o-1"), json!(10.0), "germany", 1), anonymous],
        ),
    )
    .await
    .unwrap();

    let bronze = orch.run_stage(&orders(), Layer::Bronze, None).await;
    assert_eq!(bronze.records_quarantined, 0, "customer_id is optional in Bronze");
    let silver = orch.run_stage(&orders(), Layer::Silver, None).await;
    assert_eq!(silver.status, StageStatus::Committed);
    assert_eq!(silver.records_written, 1);
    assert_eq!(silver.records_quarantined, 1);

    let logged = backend.list_quarantine_records(&orders()).unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].table, TableName::new("silver_orders"));
    assert_eq!(logged[0].batch_id, "mixed");
    assert!(logged[0].reason.contains("customer_id"), "{}", logged[0].reason);
}

#[tokio::test]
async fn test_reports_carry_dimensions_and_overview_summarizes_them() {
    let backend = in_memory();
    let (orch, _rx) = orchestrator(backend.clone()).await;

    let repeated = vec![
        order(Some("o-1"), json!(10.0), "germany", 1),
        order(Some("o-1"), json!(11.0), "germany", 1),
        order(Some("o-2"), json!(12.0), "germany", 1),
    ];
    orch.submit(&orders(), Batch::new("repeats", "pos", ts(1, 8), repeated))
        .await
        .unwrap();
    orch.submit(
        &customers(),
        Batch::new(
            "customers-b1",
            "crm",
            ts(1, 8),
            vec![raw(json!({"customer_id": "c-1", "email": "Ada@Example.com", "tier": "gold"}))],
        ),
    )
    .await
    .unwrap();
    for report in orch.run_all().await {
        assert!(report.succeeded(), "{:?}", report.error);
    }

    let bronze = backend.history(&TableName::new("bronze_orders")).unwrap();
    let report = bronze[0].quality_report.as_ref().unwrap();
    assert!((report.dimensions.uniqueness - 2.0 / 3.0).abs() < 1e-9);
    assert!((report.dimensions.completeness - 1.0).abs() < 1e-9);
    assert_eq!(report.level, QualityLevel::Good);
    assert!((report.aggregate_score - 1.0).abs() < 1e-9, "duplicates do not lower row scores");

    let customers_silver = backend
        .read_table(&TableName::new("silver_customers"), None)
        .unwrap();
    let ada = &customers_silver.rows[0];
    assert_eq!(ada.get("email_domain"), Some(&Value::Str("example.com".into())));
    assert_eq!(ada.get("segment"), Some(&Value::Str("gold@example.com".into())));

    let overview = orch.quality_overview().await.unwrap();
    assert_eq!(overview.tables.len(), 4);
    assert!(overview.tables.contains_key(&TableName::new("silver_customers")));
    assert!(!overview.tables.contains_key(&TableName::new("gold_daily_revenue")));
    assert_eq!(overview.distribution.values().sum::<u64>(), 4);
    assert!(overview.overall.unwrap() > 0.9);
}
