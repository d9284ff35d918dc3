//! Shared data model for the medallion layer-processing engine.
//!
//! Pure data types used by the storage substrate, the layer processors and
//! the CLI. No I/O lives here.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod event;
pub mod quality;
pub mod record;
pub mod schema;
pub mod state;
pub mod table;
pub mod value;
