//! Stage and dataset outcome types.

use std::collections::BTreeMap;
use std::time::Duration;

use medallion_types::quality::QualityReport;
use medallion_types::state::{DatasetId, Layer, QuarantineRecord, RunStats};
use medallion_types::table::VersionId;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// A new table version was written.
    Committed,
    /// Upstream had nothing new, or the new data changed nothing.
    NoChange,
    /// The stage is not configured for the dataset.
    Skipped,
    Failed,
    Cancelled,
}

impl StageStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::NoChange => "no_change",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Committed | Self::NoChange | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one successful processor pass produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub status: StageStatus,
    /// Version written, or the unchanged head.
    pub version_id: Option<VersionId>,
    /// Upstream version folded in by this pass, if any.
    pub upstream_version: Option<VersionId>,
    pub batch_ids: Vec<String>,
    pub stats: RunStats,
    pub quality_report: Option<QualityReport>,
    /// Records this pass refused, for the quarantine log.
    pub quarantined: Vec<QuarantineRecord>,
}

impl StageOutput {
    #[must_use]
    pub fn no_change(version_id: Option<VersionId>, upstream_version: Option<VersionId>) -> Self {
        Self {
            status: StageStatus::NoChange,
            version_id,
            upstream_version,
            batch_ids: Vec::new(),
            stats: RunStats {
                version_id,
                ..RunStats::default()
            },
            quality_report: None,
            quarantined: Vec::new(),
        }
    }
}

/// Result of `run_stage`.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub dataset: DatasetId,
    pub stage: Layer,
    pub status: StageStatus,
    pub version_id: Option<VersionId>,
    pub attempts: u32,
    pub error: Option<String>,
    pub records_read: u64,
    pub records_written: u64,
    pub records_quarantined: u64,
    pub duration_secs: f64,
}

impl StageResult {
    #[must_use]
    pub fn skipped(dataset: DatasetId, stage: Layer) -> Self {
        Self {
            dataset,
            stage,
            status: StageStatus::Skipped,
            version_id: None,
            attempts: 0,
            error: None,
            records_read: 0,
            records_written: 0,
            records_quarantined: 0,
            duration_secs: 0.0,
        }
    }

    #[must_use]
    pub fn from_output(
        dataset: DatasetId,
        stage: Layer,
        output: &StageOutput,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            dataset,
            stage,
            status: output.status,
            version_id: output.version_id,
            attempts,
            error: None,
            records_read: output.stats.records_read,
            records_written: output.stats.records_written,
            records_quarantined: output.stats.records_quarantined,
            duration_secs: elapsed.as_secs_f64(),
        }
    }

    #[must_use]
    pub fn failed(
        dataset: DatasetId,
        stage: Layer,
        status: StageStatus,
        attempts: u32,
        error: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            dataset,
            stage,
            status,
            version_id: None,
            attempts,
            error: Some(error),
            records_read: 0,
            records_written: 0,
            records_quarantined: 0,
            duration_secs: elapsed.as_secs_f64(),
        }
    }
}

/// End-to-end outcome for one dataset.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset: DatasetId,
    pub stages: Vec<StageResult>,
    /// First stage that failed; later stages did not run.
    pub failed_stage: Option<Layer>,
    pub error: Option<String>,
    /// Last successful upstream version folded into each layer.
    pub watermarks: BTreeMap<Layer, Option<VersionId>>,
    /// Head version of each configured layer's table.
    pub heads: BTreeMap<Layer, Option<VersionId>>,
}

impl DatasetReport {
    #[must_use]
    pub fn new(dataset: DatasetId) -> Self {
        Self {
            dataset,
            stages: Vec::new(),
            failed_stage: None,
            error: None,
            watermarks: BTreeMap::new(),
            heads: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none()
    }
}
