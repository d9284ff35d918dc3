pub mod check;
pub mod history;
pub mod run;
pub mod stage;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use medallion_engine::config::types::PipelineConfig;
use medallion_engine::config::{parser, validator};
use medallion_engine::{create_state_backend, Orchestrator, TracingEventSink};
use medallion_types::batch::Batch;
use medallion_types::state::DatasetId;
use serde::Deserialize;

/// On-disk batch file: the batch plus the dataset it belongs to.
#[derive(Debug, Deserialize)]
pub struct BatchFile {
    pub dataset: DatasetId,
    pub batch: Batch,
}

/// Parse and validate a pipeline, applying the `--state` override.
pub fn load_pipeline(pipeline_path: &Path, state: Option<&str>) -> Result<PipelineConfig> {
    let mut config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    validator::validate_pipeline(&config)?;
    if let Some(path) = state {
        config.state.connection = Some(path.to_string());
    }
    Ok(config)
}

/// Open the state backend and start an orchestrator that logs its events.
pub async fn start_orchestrator(config: PipelineConfig) -> Result<Orchestrator> {
    let backend = create_state_backend(&config)?;
    if config.state.connection.is_none() {
        tracing::warn!("No state path configured; results are discarded on exit");
    }
    let orchestrator = Orchestrator::new(Arc::new(config), backend, Arc::new(TracingEventSink));
    let schemas = orchestrator
        .initialize()
        .await
        .context("Failed to initialize pipeline")?;
    tracing::info!(
        pipeline = orchestrator.config().pipeline,
        schemas = schemas.len(),
        "Pipeline ready"
    );
    Ok(orchestrator)
}

pub fn read_batch_file(path: &Path) -> Result<BatchFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse batch file: {}", path.display()))
}

/// Queue every batch file on its dataset, in the order given.
pub async fn submit_batches(orchestrator: &Orchestrator, paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let file = read_batch_file(path)?;
        orchestrator
            .submit(&file.dataset, file.batch)
            .await
            .with_context(|| format!("Failed to submit {}", path.display()))?;
    }
    Ok(())
}

fn format_version(version: Option<u64>) -> String {
    version.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use medallion_engine::DatasetReport;

    fn fixture(relative: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .join("tests/fixtures")
            .join(relative)
    }

    #[test]
    fn state_flag_overrides_pipeline() {
        let config =
            load_pipeline(&fixture("pipelines/retail.yaml"), Some("/tmp/medallion.db")).unwrap();
        assert_eq!(config.state.connection.as_deref(), Some("/tmp/medallion.db"));
    }

    #[test]
    fn batch_file_names_its_dataset() {
        let file = read_batch_file(&fixture("batches/orders_b1.json")).unwrap();
        assert_eq!(file.dataset.as_str(), "orders");
        assert_eq!(file.batch.batch_id, "orders-b1");
        assert_eq!(file.batch.len(), 3);
    }

    #[tokio::test]
    async fn submitted_files_reach_bronze() {
        let config = load_pipeline(&fixture("pipelines/retail.yaml"), None).unwrap();
        let orchestrator = start_orchestrator(config).await.unwrap();
        submit_batches(
            &orchestrator,
            &[
                fixture("batches/orders_b1.json"),
                fixture("batches/orders_b2.json"),
                fixture("batches/customers_b1.json"),
            ],
        )
        .await
        .unwrap();

        let reports = orchestrator.run_all().await;
        assert!(reports.iter().all(DatasetReport::succeeded));
        let bronze = &reports[0].stages[0];
        assert_eq!(bronze.records_read, 5);
        assert_eq!(bronze.records_quarantined, 1);
    }
}
