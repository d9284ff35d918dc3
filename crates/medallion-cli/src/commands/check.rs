use std::path::Path;

use anyhow::Result;
use medallion_engine::resolve::check_state_backend;

/// Execute the `check` command: validate the pipeline, open its state and
/// register the declared schemas.
pub async fn execute(pipeline_path: &Path, state: Option<&str>) -> Result<()> {
    let config = super::load_pipeline(pipeline_path, state)?;
    println!("Pipeline structure: OK");
    println!("{:18} {}", "Datasets:", config.datasets.len());

    if !check_state_backend(&config) {
        println!("{:18} FAILED", "State backend:");
        anyhow::bail!("One or more checks failed");
    }
    println!("{:18} OK", "State backend:");

    let schema_count = config.schemas.len();
    match super::start_orchestrator(config).await {
        Ok(_) => println!("{:18} OK ({schema_count} registered)", "Schemas:"),
        Err(e) => {
            println!("{:18} FAILED", "Schemas:");
            println!("  {e:#}");
            anyhow::bail!("One or more checks failed");
        }
    }

    println!("\nAll checks passed.");
    Ok(())
}
