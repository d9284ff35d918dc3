use std::path::{Path, PathBuf};

use anyhow::Result;
use medallion_engine::DatasetReport;

use super::format_version;

/// Execute the `run` command: queue batches, then run every dataset.
pub async fn execute(pipeline_path: &Path, state: Option<&str>, batches: &[PathBuf]) -> Result<()> {
    let config = super::load_pipeline(pipeline_path, state)?;
    let orchestrator = super::start_orchestrator(config).await?;
    super::submit_batches(&orchestrator, batches).await?;

    let reports = orchestrator.run_all().await;
    for report in &reports {
        print_report(report);
    }

    let failed: Vec<&str> = reports
        .iter()
        .filter(|r| !r.succeeded())
        .map(|r| r.dataset.as_str())
        .collect();
    if failed.is_empty() {
        println!(
            "\nPipeline '{}' completed successfully.",
            orchestrator.config().pipeline
        );
        Ok(())
    } else {
        anyhow::bail!("Dataset(s) failed: {}", failed.join(", "))
    }
}

fn print_report(report: &DatasetReport) {
    println!("Dataset '{}':", report.dataset);
    for stage in &report.stages {
        println!(
            "  {:7} {:10} version={:>3} read={} written={} quarantined={} attempts={} ({:.2}s)",
            stage.stage.as_str(),
            stage.status.as_str(),
            format_version(stage.version_id),
            stage.records_read,
            stage.records_written,
            stage.records_quarantined,
            stage.attempts,
            stage.duration_secs,
        );
        if let Some(error) = &stage.error {
            println!("          {error}");
        }
    }
    for (layer, watermark) in &report.watermarks {
        println!("  {layer} watermark: {}", format_version(*watermark));
    }
}
