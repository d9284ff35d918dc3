use std::path::Path;

use anyhow::{Context, Result};
use medallion_engine::create_state_backend;
use medallion_state::StateBackend;
use medallion_types::state::TableName;

/// Execute the `history` command: list every committed version of a table.
pub fn execute(pipeline_path: &Path, state: Option<&str>, table: &str) -> Result<()> {
    let config = super::load_pipeline(pipeline_path, state)?;
    let backend = create_state_backend(&config)?;
    let table = TableName::new(table);
    let history = backend
        .history(&table)
        .with_context(|| format!("Failed to read history of '{table}'"))?;

    if history.is_empty() {
        println!("Table '{table}' has no versions.");
        return Ok(());
    }
    println!("Table '{table}':");
    for commit in &history {
        let score = commit
            .quality_report
            .as_ref()
            .map_or_else(String::new, |q| {
                let flag = if q.below_threshold { " (below threshold)" } else { "" };
                format!(" score={:.3} level={}{flag}", q.aggregate_score, q.level)
            });
        println!(
            "  v{:<4} {:9} rows={:<6} {} batches=[{}]{score}",
            commit.version_id,
            commit.operation.as_str(),
            commit.row_count,
            commit.committed_at.to_rfc3339(),
            commit.input_batch_ids.join(", "),
        );
    }
    Ok(())
}
