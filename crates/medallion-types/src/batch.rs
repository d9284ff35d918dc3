//! Ingestion batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RawRecord;

/// Immutable unit of ingested records.
///
/// `schema_version` pins the Bronze schema used for validation; when absent
/// the latest registered version applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub source_id: String,
    pub ingestion_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    pub records: Vec<RawRecord>,
}

impl Batch {
    #[must_use]
    pub fn new(
        batch_id: impl Into<String>,
        source_id: impl Into<String>,
        ingestion_timestamp: DateTime<Utc>,
        records: Vec<RawRecord>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            source_id: source_id.into(),
            ingestion_timestamp,
            schema_version: None,
            records,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
