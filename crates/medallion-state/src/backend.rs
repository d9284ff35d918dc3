//! State backend trait definition.
//!
//! [`StateBackend`] is the storage substrate for the medallion engine:
//! versioned tables with atomic commits and time travel, per-(table, layer)
//! checkpoints, schema versions, run history and quarantine records. Model
//! types live in [`medallion_types`].

use medallion_types::schema::SchemaDefinition;
use medallion_types::state::{
    Checkpoint, CheckpointKey, DatasetId, Layer, QuarantineRecord, RunRecord, RunStats,
    RunStatus, TableName,
};
use medallion_types::table::{CommitInfo, CommitRequest, TableChange, TableSnapshot, VersionId};

use crate::error;

/// Storage contract for versioned tables and pipeline state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
/// Every method is blocking; async callers run them on a blocking thread.
pub trait StateBackend: Send + Sync {
    // -- tables ------------------------------------------------------------

    /// Current head version of `table`, `None` if it has never been written.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn head_version(&self, table: &TableName) -> error::Result<Option<VersionId>>;

    /// Append one version to `table` atomically.
    ///
    /// The head must still equal `request.expected_head`; if the request
    /// carries a checkpoint advance it is applied in the same transaction.
    /// Readers never observe a partially written commit.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionConflict`](crate::error::StateError::VersionConflict)
    /// when the head moved, checkpoint errors when the advance is rejected,
    /// or a storage error.
    fn commit(&self, table: &TableName, request: CommitRequest) -> error::Result<CommitInfo>;

    /// Read `table` as of `version` (head when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::VersionNotFound`](crate::error::StateError::VersionNotFound)
    /// for a version that was never committed, or a storage error.
    fn read_table(
        &self,
        table: &TableName,
        version: Option<VersionId>,
    ) -> error::Result<TableSnapshot>;

    /// Commits in `(after, upto]`, oldest first, each with the rows it wrote.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn read_changes(
        &self,
        table: &TableName,
        after: Option<VersionId>,
        upto: Option<VersionId>,
    ) -> error::Result<Vec<TableChange>>;

    /// Commit metadata for every version of `table`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn history(&self, table: &TableName) -> error::Result<Vec<CommitInfo>>;

    /// Version that committed `batch_id` into `table`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn find_batch(&self, table: &TableName, batch_id: &str) -> error::Result<Option<VersionId>>;

    // -- checkpoints -------------------------------------------------------

    /// Read the checkpoint for a (table, layer) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_checkpoint(&self, key: &CheckpointKey) -> error::Result<Option<Checkpoint>>;

    /// Compare-and-set the checkpoint from `expected` to `new`.
    ///
    /// When `expected` is `None` the checkpoint must not exist yet. A `new`
    /// value lower than the stored one is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::CheckpointConflict`](crate::error::StateError::CheckpointConflict),
    /// [`StateError::CheckpointRegression`](crate::error::StateError::CheckpointRegression)
    /// or a storage error.
    fn advance_checkpoint(
        &self,
        key: &CheckpointKey,
        expected: Option<VersionId>,
        new: VersionId,
    ) -> error::Result<()>;

    // -- schemas -----------------------------------------------------------

    /// Every registered version of a table's schema, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn schema_versions(&self, table: &TableName) -> error::Result<Vec<SchemaDefinition>>;

    /// Store a new schema version if the latest stored version still equals
    /// `expected_latest`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::SchemaVersionConflict`](crate::error::StateError::SchemaVersionConflict)
    /// when another writer got there first, or a storage error.
    fn insert_schema(
        &self,
        schema: &SchemaDefinition,
        expected_latest: Option<u32>,
    ) -> error::Result<()>;

    // -- runs --------------------------------------------------------------

    /// Begin a new stage run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, dataset: &DatasetId, layer: Layer) -> error::Result<i64>;

    /// Finalize a stage run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Run history for a dataset, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_runs(&self, dataset: &DatasetId) -> error::Result<Vec<RunRecord>>;

    // -- quarantine --------------------------------------------------------

    /// Persist quarantined records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_quarantine_records(
        &self,
        dataset: &DatasetId,
        run_id: i64,
        records: &[QuarantineRecord],
    ) -> error::Result<u64>;

    /// Quarantined records stored for a dataset, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_quarantine_records(&self, dataset: &DatasetId) -> error::Result<Vec<QuarantineRecord>>;
}
