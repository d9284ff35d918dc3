//! Structured events emitted to observability sinks.

use serde::{Deserialize, Serialize};

use crate::state::{DatasetId, Layer, TableName};
use crate::table::VersionId;

/// Fire-and-forget notification about pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    BatchCommitted {
        dataset: DatasetId,
        table: TableName,
        layer: Layer,
        version_id: VersionId,
        batch_ids: Vec<String>,
        row_count: u64,
    },
    QualityBelowThreshold {
        dataset: DatasetId,
        table: TableName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        aggregate_score: f64,
        threshold: f64,
    },
    StageFailed {
        dataset: DatasetId,
        stage: Layer,
        attempts: u32,
        reason: String,
    },
    StageCompleted {
        dataset: DatasetId,
        stage: Layer,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_id: Option<VersionId>,
    },
}

impl PipelineEvent {
    /// Event name as it appears on the wire.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::BatchCommitted { .. } => "batch_committed",
            Self::QualityBelowThreshold { .. } => "quality_below_threshold",
            Self::StageFailed { .. } => "stage_failed",
            Self::StageCompleted { .. } => "stage_completed",
        }
    }

    #[must_use]
    pub fn dataset(&self) -> &DatasetId {
        match self {
            Self::BatchCommitted { dataset, .. }
            | Self::QualityBelowThreshold { dataset, .. }
            | Self::StageFailed { dataset, .. }
            | Self::StageCompleted { dataset, .. } => dataset,
        }
    }
}
