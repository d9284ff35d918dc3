//! State backend creation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use medallion_state::{SqliteStateBackend, StateBackend};

use crate::config::types::{PipelineConfig, StateBackendKind};

/// Open the state backend named by `config.state`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or initialized.
pub fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let backend = if let Some(path) = &config.state.connection {
                SqliteStateBackend::open(Path::new(path))
                    .with_context(|| format!("Failed to open state DB at {path}"))?
            } else {
                tracing::debug!("No state connection configured, using in-memory state");
                SqliteStateBackend::in_memory().context("Failed to open in-memory state DB")?
            };
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

/// Whether the configured state backend can be opened.
pub fn check_state_backend(config: &PipelineConfig) -> bool {
    match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!("State backend: FAILED: {e:#}");
            false
        }
    }
}
