//! State backend error types.

use medallion_types::state::CheckpointKey;
use medallion_types::table::VersionId;

/// Errors produced by [`StateBackend`](crate::StateBackend) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure, tagged with the operation that hit it.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state backend lock poisoned")]
    LockPoisoned,

    /// Stored JSON could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data does not match what this version of the engine writes.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// Table head moved since the writer read it.
    #[error("version conflict on table '{table}': expected head {expected:?}, found {actual:?}")]
    VersionConflict {
        table: String,
        expected: Option<VersionId>,
        actual: Option<VersionId>,
    },

    /// Checkpoint moved since the writer read it.
    #[error("checkpoint conflict on {key}: expected {expected:?}, found {actual:?}")]
    CheckpointConflict {
        key: CheckpointKey,
        expected: Option<VersionId>,
        actual: Option<VersionId>,
    },

    /// Attempt to move a checkpoint backwards.
    #[error("checkpoint {key} cannot move back from {current} to {requested}")]
    CheckpointRegression {
        key: CheckpointKey,
        current: VersionId,
        requested: VersionId,
    },

    /// Time-travel read of a version that was never committed.
    #[error("table '{table}' has no version {version}")]
    VersionNotFound { table: String, version: VersionId },

    /// Schema registration raced with another writer.
    #[error("schema version conflict on '{table}': expected latest {expected:?}, found {actual:?}")]
    SchemaVersionConflict {
        table: String,
        expected: Option<u32>,
        actual: Option<u32>,
    },

    /// Backend temporarily unable to serve the request.
    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

impl StateError {
    /// Wrap a `SQLite` error without extra context.
    #[must_use]
    pub fn backend(source: rusqlite::Error) -> Self {
        Self::Backend {
            context: "sqlite",
            source,
        }
    }

    /// Wrap a `SQLite` error with the name of the failing operation.
    #[must_use]
    pub fn backend_context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::Backend { context, source }
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VersionConflict { .. }
            | Self::CheckpointConflict { .. }
            | Self::SchemaVersionConflict { .. }
            | Self::Unavailable(_) => true,
            Self::Backend { source, .. } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            Self::Io(_)
            | Self::LockPoisoned
            | Self::Serialization(_)
            | Self::Corrupt(_)
            | Self::CheckpointRegression { .. }
            | Self::VersionNotFound { .. } => false,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
