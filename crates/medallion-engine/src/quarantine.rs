//! Quarantine record persistence helpers.

use medallion_state::StateBackend;
use medallion_types::record::Row;
use medallion_types::state::{DatasetId, QuarantineRecord, TableName};

/// Build an inspectable quarantine entry for a rejected row.
///
/// The raw payload is kept when the row still carries it, otherwise the
/// typed record is stored.
#[must_use]
pub fn quarantine_record(
    table: &TableName,
    batch_id: &str,
    row: &Row,
    reasons: &[String],
    quarantined_at: &str,
) -> QuarantineRecord {
    let record_json = row.raw.as_ref().map_or_else(
        || serde_json::to_string(&row.record).unwrap_or_default(),
        |raw| serde_json::Value::Object(raw.clone()).to_string(),
    );
    QuarantineRecord {
        table: table.clone(),
        batch_id: batch_id.to_string(),
        record_json,
        reason: reasons.join("; "),
        quarantined_at: quarantined_at.to_string(),
    }
}

/// Best-effort copy of quarantined records into the state backend.
///
/// The rows also live in a committed version, so a failure here is logged
/// and never fails the stage.
pub(crate) fn persist_quarantine_records(
    state_backend: &dyn StateBackend,
    dataset: &DatasetId,
    run_id: i64,
    records: &[QuarantineRecord],
) {
    if records.is_empty() {
        return;
    }

    let quarantine_count = records.len();

    match state_backend.insert_quarantine_records(dataset, run_id, records) {
        Ok(inserted) => {
            tracing::info!(
                dataset = dataset.as_str(),
                quarantined_records = inserted,
                "Persisted quarantine records to state backend"
            );
        }
        Err(e) => {
            tracing::error!(
                dataset = dataset.as_str(),
                quarantine_count,
                error = %e,
                "Failed to persist quarantine records"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_state::SqliteStateBackend;
    use medallion_types::record::Record;
    use medallion_types::state::Layer;
    use serde_json::json;

    fn quarantined_row() -> Row {
        let mut row = Row::new(Record::new());
        row.raw = json!({"order_id": null, "amount": "n/a"}).as_object().cloned();
        row
    }

    #[test]
    fn record_keeps_raw_payload_and_reasons() {
        let record = quarantine_record(
            &TableName::new("bronze_orders"),
            "b-1",
            &quarantined_row(),
            &["order_id: required value is null".into(), "amount: bad".into()],
            "2024-05-01T00:00:00Z",
        );
        let raw: serde_json::Value = serde_json::from_str(&record.record_json).unwrap();
        assert_eq!(raw["amount"], "n/a");
        assert_eq!(record.reason, "order_id: required value is null; amount: bad");
    }

    #[test]
    fn persist_writes_records() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let dataset = DatasetId::new("orders");
        let run_id = backend.start_run(&dataset, Layer::Bronze).unwrap();
        let record = quarantine_record(
            &TableName::new("bronze_orders"),
            "b-1",
            &quarantined_row(),
            &["bad".into()],
            "2024-05-01T00:00:00Z",
        );
        persist_quarantine_records(&backend, &dataset, run_id, &[record]);
        assert_eq!(backend.list_quarantine_records(&dataset).unwrap().len(), 1);
    }

    #[test]
    fn persist_failure_is_swallowed() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let record = quarantine_record(
            &TableName::new("bronze_orders"),
            "b-1",
            &quarantined_row(),
            &["bad".into()],
            "2024-05-01T00:00:00Z",
        );
        // Unknown run id violates the run foreign key.
        let dataset = DatasetId::new("orders");
        persist_quarantine_records(&backend, &dataset, 999, &[record]);
        assert!(backend.list_quarantine_records(&dataset).unwrap().is_empty());
    }
}
