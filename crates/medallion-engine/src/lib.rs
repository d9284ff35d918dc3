//! Layer processors and orchestration for the medallion engine.
//!
//! Raw batches land in Bronze with per-record quality flags, are
//! standardized and deduplicated into Silver, and aggregated into Gold.
//! Every layer is a versioned table in a [`medallion_state::StateBackend`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bronze;
pub mod checkpoint;
pub mod config;
pub mod derive;
pub mod errors;
pub mod events;
pub mod gold;
pub mod merge;
pub mod orchestrator;
pub mod quality;
pub(crate) mod quarantine;
pub mod resolve;
pub mod result;
pub mod schema_registry;
pub mod silver;

// Re-export public API for convenience
pub use errors::{MergeError, SchemaError, StageError, StageFailure};
pub use events::{ChannelEventSink, EventSink, MultiEventSink, TracingEventSink};
pub use merge::{merge, MergeResult, MergeStrategy};
pub use orchestrator::Orchestrator;
pub use resolve::create_state_backend;
pub use result::{DatasetReport, StageResult, StageStatus};
pub use schema_registry::SchemaRegistry;
