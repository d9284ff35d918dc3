//! Watermark lookups across a dataset's layers.

use std::collections::BTreeMap;

use medallion_state::{StateBackend, StateError};
use medallion_types::state::{CheckpointKey, Layer};
use medallion_types::table::VersionId;

use crate::config::types::DatasetConfig;

/// Stored watermark and current head of every configured layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Watermarks {
    /// Upstream version folded into each downstream layer.
    pub checkpoints: BTreeMap<Layer, Option<VersionId>>,
    pub heads: BTreeMap<Layer, Option<VersionId>>,
}

impl Watermarks {
    #[must_use]
    pub fn checkpoint(&self, layer: Layer) -> Option<VersionId> {
        self.checkpoints.get(&layer).copied().flatten()
    }

    #[must_use]
    pub fn head(&self, layer: Layer) -> Option<VersionId> {
        self.heads.get(&layer).copied().flatten()
    }

    /// Whether `layer` has upstream versions it has not folded in yet.
    #[must_use]
    pub fn is_behind(&self, layer: Layer) -> bool {
        let Some(upstream) = layer.upstream() else {
            return false;
        };
        match (self.head(upstream), self.checkpoint(layer)) {
            (Some(head), Some(done)) => head > done,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Read the stored watermark for `layer` of `dataset`, if the layer is
/// configured and has run.
///
/// # Errors
///
/// Returns [`StateError`] on storage failure.
pub fn read_watermark(
    backend: &dyn StateBackend,
    dataset: &DatasetConfig,
    layer: Layer,
) -> Result<Option<VersionId>, StateError> {
    let Some(table) = dataset.table(layer) else {
        return Ok(None);
    };
    if layer.upstream().is_none() {
        return Ok(None);
    }
    Ok(backend
        .get_checkpoint(&CheckpointKey::new(table.clone(), layer))?
        .map(|cp| cp.upstream_version))
}

/// Snapshot watermarks and heads for every configured layer of `dataset`.
///
/// # Errors
///
/// Returns [`StateError`] on storage failure.
pub fn read_watermarks(
    backend: &dyn StateBackend,
    dataset: &DatasetConfig,
) -> Result<Watermarks, StateError> {
    let mut out = Watermarks::default();
    for layer in Layer::ALL {
        let Some(table) = dataset.table(layer) else {
            continue;
        };
        out.heads.insert(layer, backend.head_version(table)?);
        if layer.upstream().is_some() {
            out.checkpoints
                .insert(layer, read_watermark(backend, dataset, layer)?);
        }
    }
    Ok(out)
}
