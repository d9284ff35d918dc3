//! Versioned table commits and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quality::QualityReport;
use crate::record::Row;
use crate::state::{CheckpointAdvance, TableName};

/// Table version number. Starts at 1 and grows by exactly 1 per commit.
pub type VersionId = u64;

/// How a commit relates to the previous version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Rows are added to the previous version.
    Append,
    /// Rows are the full merged state.
    Merge,
    /// Rows replace the previous version entirely.
    Overwrite,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::Merge => "merge",
            Self::Overwrite => "overwrite",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "append" => Some(Self::Append),
            "merge" => Some(Self::Merge),
            "overwrite" => Some(Self::Overwrite),
            _ => None,
        }
    }

    /// Whether the commit carries a full snapshot rather than a delta.
    #[must_use]
    pub fn is_snapshot(self) -> bool {
        !matches!(self, Self::Append)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata of one committed table version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub table: TableName,
    pub version_id: VersionId,
    pub committed_at: DateTime<Utc>,
    pub operation: Operation,
    pub input_batch_ids: Vec<String>,
    pub row_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_report: Option<QualityReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Everything needed to append one version to a table atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRequest {
    pub operation: Operation,
    /// Head the writer read before processing; `None` for an empty table.
    pub expected_head: Option<VersionId>,
    pub input_batch_ids: Vec<String>,
    pub rows: Vec<Row>,
    pub quality_report: Option<QualityReport>,
    pub details: Option<serde_json::Value>,
    /// Watermark moved in the same transaction as the commit.
    pub checkpoint: Option<CheckpointAdvance>,
}

impl CommitRequest {
    #[must_use]
    pub fn new(operation: Operation, expected_head: Option<VersionId>, rows: Vec<Row>) -> Self {
        Self {
            operation,
            expected_head,
            input_batch_ids: Vec::new(),
            rows,
            quality_report: None,
            details: None,
            checkpoint: None,
        }
    }

    #[must_use]
    pub fn with_batch_ids(mut self, ids: Vec<String>) -> Self {
        self.input_batch_ids = ids;
        self
    }

    #[must_use]
    pub fn with_quality_report(mut self, report: QualityReport) -> Self {
        self.quality_report = Some(report);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn with_checkpoint(mut self, advance: CheckpointAdvance) -> Self {
        self.checkpoint = Some(advance);
        self
    }
}

/// Table contents as of one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table: TableName,
    /// `None` when the table has no commits.
    pub version: Option<VersionId>,
    pub rows: Vec<Row>,
}

/// One committed version with the rows it wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub commit: CommitInfo,
    pub rows: Vec<Row>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_parse_roundtrip() {
        for op in [Operation::Append, Operation::Merge, Operation::Overwrite] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn only_append_is_a_delta() {
        assert!(!Operation::Append.is_snapshot());
        assert!(Operation::Merge.is_snapshot());
        assert!(Operation::Overwrite.is_snapshot());
    }
}
