use std::path::Path;

use anyhow::Result;
use medallion_types::quality::QualityLevel;
use medallion_types::state::Layer;

use super::format_version;

/// Execute the `status` command: print heads and watermarks per dataset,
/// then the latest quality of each table.
pub async fn execute(pipeline_path: &Path, state: Option<&str>) -> Result<()> {
    let config = super::load_pipeline(pipeline_path, state)?;
    let orchestrator = super::start_orchestrator(config).await?;

    for dataset in &orchestrator.config().datasets {
        let marks = orchestrator.watermarks(&dataset.name).await?;
        println!("Dataset '{}':", dataset.name);
        for layer in Layer::ALL {
            let Some(table) = dataset.table(layer) else {
                continue;
            };
            let behind = if marks.is_behind(layer) { " (behind)" } else { "" };
            match layer.upstream() {
                Some(_) => println!(
                    "  {:7} {:24} head={:>3} watermark={}{behind}",
                    layer.as_str(),
                    table.as_str(),
                    format_version(marks.head(layer)),
                    format_version(marks.checkpoint(layer)),
                ),
                None => println!(
                    "  {:7} {:24} head={:>3}",
                    layer.as_str(),
                    table.as_str(),
                    format_version(marks.head(layer)),
                ),
            }
        }
    }

    let overview = orchestrator.quality_overview().await?;
    let Some(overall) = overview.overall else {
        return Ok(());
    };
    println!(
        "Quality: overall={overall:.3} ({})",
        QualityLevel::from_score(overall)
    );
    for (table, report) in &overview.tables {
        let d = &report.dimensions;
        println!(
            "  {:24} {:9} completeness={:.3} accuracy={:.3} consistency={:.3} validity={:.3} uniqueness={:.3}",
            table.as_str(),
            report.level.as_str(),
            d.completeness,
            d.accuracy,
            d.consistency,
            d.validity,
            d.uniqueness,
        );
    }
    let distribution: Vec<String> = overview
        .distribution
        .iter()
        .map(|(level, count)| format!("{level}={count}"))
        .collect();
    println!("  levels: {}", distribution.join(" "));
    Ok(())
}
