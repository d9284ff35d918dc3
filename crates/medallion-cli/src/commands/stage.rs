use std::path::{Path, PathBuf};

use anyhow::Result;
use medallion_types::state::{DatasetId, Layer};

use super::format_version;

/// Execute the `stage` command: run one stage of one dataset.
pub async fn execute(
    pipeline_path: &Path,
    state: Option<&str>,
    dataset: &str,
    stage: Layer,
    as_of: Option<u64>,
    batches: &[PathBuf],
) -> Result<()> {
    let config = super::load_pipeline(pipeline_path, state)?;
    let dataset = DatasetId::new(dataset);
    if config.dataset(&dataset).is_none() {
        anyhow::bail!("Unknown dataset '{dataset}'");
    }
    let orchestrator = super::start_orchestrator(config).await?;
    super::submit_batches(&orchestrator, batches).await?;

    let result = orchestrator.run_stage(&dataset, stage, as_of).await;
    println!("Dataset '{}' stage {}:", result.dataset, result.stage);
    println!("  Status:          {}", result.status);
    println!("  Version:         {}", format_version(result.version_id));
    println!("  Records read:    {}", result.records_read);
    println!("  Records written: {}", result.records_written);
    println!("  Quarantined:     {}", result.records_quarantined);
    println!("  Attempts:        {}", result.attempts);
    println!("  Duration:        {:.2}s", result.duration_secs);

    match result.error {
        Some(error) if !result.status.is_success() => anyhow::bail!(error),
        _ => Ok(()),
    }
}
