//! Identifiers and orchestration state types.
//!
//! Shared by `StateBackend` implementations and the orchestrator so neither
//! depends on the other.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::table::VersionId;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Logical dataset identifier (one Bronze → Silver → Gold chain).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DatasetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for DatasetId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Versioned table name (e.g. `"bronze_orders"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for TableName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

/// Medallion layer. Each layer is also the name of the stage that writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Bronze, Layer::Silver, Layer::Gold];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bronze => "bronze",
            Self::Silver => "silver",
            Self::Gold => "gold",
        }
    }

    /// Layer this one reads from, if any.
    #[must_use]
    pub fn upstream(self) -> Option<Layer> {
        match self {
            Self::Bronze => None,
            Self::Silver => Some(Self::Bronze),
            Self::Gold => Some(Self::Silver),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown layer '{0}', expected bronze, silver or gold")]
pub struct ParseLayerError(String);

impl FromStr for Layer {
    type Err = ParseLayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bronze" => Ok(Self::Bronze),
            "silver" => Ok(Self::Silver),
            "gold" => Ok(Self::Gold),
            other => Err(ParseLayerError(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Identity of a checkpoint: the table being written and its layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub table: TableName,
    pub layer: Layer,
}

impl CheckpointKey {
    #[must_use]
    pub fn new(table: impl Into<TableName>, layer: Layer) -> Self {
        Self {
            table: table.into(),
            layer,
        }
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.layer, self.table)
    }
}

/// Persisted watermark: last upstream version folded into `key.table`.
///
/// `updated_at` is an ISO-8601 UTC string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub key: CheckpointKey,
    pub upstream_version: VersionId,
    pub updated_at: String,
}

/// Checkpoint move requested as part of a table commit.
///
/// `expected` is the upstream version the writer read before processing
/// (`None` when no checkpoint existed yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAdvance {
    pub key: CheckpointKey,
    pub expected: Option<VersionId>,
    pub new: VersionId,
}

// ---------------------------------------------------------------------------
// Run tracking
// ---------------------------------------------------------------------------

/// Terminal status of a stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate statistics for one stage attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub records_read: u64,
    pub records_written: u64,
    pub records_quarantined: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A run-history row as read back from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub dataset: DatasetId,
    pub layer: Layer,
    pub status: RunStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub stats: RunStats,
}

// ---------------------------------------------------------------------------
// Quarantine
// ---------------------------------------------------------------------------

/// Bronze record kept aside because it could not be typed or lacked a
/// required value. The same record is also committed to Bronze with its
/// raw payload, so this copy exists for inspection only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub table: TableName,
    pub batch_id: String,
    /// JSON-serialized raw record.
    pub record_json: String,
    /// Semicolon-separated violation messages.
    pub reason: String,
    /// ISO-8601 UTC time of quarantine.
    pub quarantined_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_id_display_and_as_str() {
        let id = DatasetId::new("orders");
        assert_eq!(id.as_str(), "orders");
        assert_eq!(id.to_string(), "orders");
    }

    #[test]
    fn table_name_from_str() {
        let t = TableName::from("silver_orders");
        assert_eq!(t.as_str(), "silver_orders");
    }

    #[test]
    fn layer_parse_and_upstream() {
        assert_eq!("Silver".parse::<Layer>(), Ok(Layer::Silver));
        assert!("platinum".parse::<Layer>().is_err());
        assert_eq!(Layer::Gold.upstream(), Some(Layer::Silver));
        assert_eq!(Layer::Bronze.upstream(), None);
    }

    #[test]
    fn layers_order_downstream() {
        assert!(Layer::Bronze < Layer::Silver);
        assert!(Layer::Silver < Layer::Gold);
    }

    #[test]
    fn run_status_roundtrips_through_storage_string() {
        for status in [
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Skipped,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn checkpoint_key_display() {
        let key = CheckpointKey::new("silver_orders", Layer::Silver);
        assert_eq!(key.to_string(), "silver/silver_orders");
    }

    #[test]
    fn run_stats_omits_empty_optionals() {
        let json = serde_json::to_value(RunStats::default()).unwrap();
        assert!(json.get("version_id").is_none());
        assert!(json.get("error_message").is_none());
    }
}
