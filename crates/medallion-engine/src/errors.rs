//! Stage error model and retry backoff policy helpers.

use std::time::Duration;

use medallion_state::StateError;
use medallion_types::schema::SchemaId;
use medallion_types::state::{DatasetId, Layer};

use crate::config::types::RetryConfig;

// ---------------------------------------------------------------------------
// SchemaError: registry failures
// ---------------------------------------------------------------------------

/// Failure to register or resolve a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The new version is not a compatible extension of the prior one.
    #[error("schema {schema} is incompatible: {}", reasons.join("; "))]
    Incompatible {
        schema: SchemaId,
        reasons: Vec<String>,
    },

    /// Another writer registered a version first.
    #[error("schema registration for '{table}' raced with another writer: {source}")]
    Conflict {
        table: String,
        #[source]
        source: StateError,
    },

    #[error("no schema registered for table '{table}'")]
    NotFound { table: String },

    #[error("table '{table}' has no schema version {version}")]
    VersionNotFound { table: String, version: u32 },

    #[error("column '{column}' has an invalid pattern: {source}")]
    InvalidPattern {
        column: String,
        #[source]
        source: regex::Error,
    },

    #[error("schema storage error: {0}")]
    Storage(#[from] StateError),
}

// ---------------------------------------------------------------------------
// MergeError: merge engine input errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("merge requires at least one key column")]
    NoKeyColumns,

    #[error("duplicate key column '{0}'")]
    DuplicateKeyColumn(String),
}

// ---------------------------------------------------------------------------
// StageError: categorised errors for retry decisions
// ---------------------------------------------------------------------------

/// Error raised by one attempt of a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Schema problems abort before any data moves.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    /// Another writer moved the target table while this stage was merging.
    #[error("merge conflict on '{table}': {reason}")]
    MergeConflict { table: String, reason: String },

    /// Writing the new table version failed.
    #[error("commit to '{table}' failed: {source}")]
    CommitFailure {
        table: String,
        #[source]
        source: StateError,
    },

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("stage cancelled before commit")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] StateError),

    /// The request cannot succeed as configured (unknown dataset, stage
    /// not configured, bad `as_of` version).
    #[error("invalid stage request: {0}")]
    Invalid(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl StageError {
    /// Map a commit failure, singling out lost compare-and-set races.
    #[must_use]
    pub fn from_commit(table: &str, source: StateError) -> Self {
        match source {
            StateError::VersionConflict { .. } | StateError::CheckpointConflict { .. } => {
                Self::MergeConflict {
                    table: table.to_string(),
                    reason: source.to_string(),
                }
            }
            other => Self::CommitFailure {
                table: table.to_string(),
                source: other,
            },
        }
    }

    /// Returns `true` if a fresh attempt of the stage may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MergeConflict { .. } | Self::CommitFailure { .. } | Self::Timeout(_) => true,
            Self::Storage(e) => e.is_transient(),
            Self::Schema(_)
            | Self::Merge(_)
            | Self::Cancelled
            | Self::Invalid(_)
            | Self::Internal(_) => false,
        }
    }
}

/// A stage that failed for good: retries exhausted or a non-retryable error.
///
/// Halts its dataset only.
#[derive(Debug, thiserror::Error)]
#[error("dataset '{dataset}' stage {stage} failed after {attempts} attempt(s): {error}")]
pub struct StageFailure {
    pub dataset: DatasetId,
    pub stage: Layer,
    pub attempts: u32,
    #[source]
    pub error: StageError,
}

/// Retry delay for the given attempt: `base * 2^(attempt-1)`, capped.
#[must_use]
pub fn compute_backoff(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = retry.backoff_base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(retry.backoff_max_ms))
}
