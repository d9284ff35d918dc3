mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use medallion_types::state::Layer;

#[derive(Parser)]
#[command(
    name = "medallion",
    version,
    about = "Bronze, Silver and Gold layer pipelines over versioned tables"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// State database path, overriding `state.connection` in the pipeline
    #[arg(long, global = true)]
    state: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate pipeline configuration and the state backend
    Check {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// Ingest batch files and run every dataset end to end
    Run {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        /// Batch JSON file (`{"dataset": ..., "batch": ...}`); repeatable
        #[arg(long = "batch")]
        batches: Vec<PathBuf>,
    },
    /// Run a single stage of one dataset
    Stage {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        #[arg(long)]
        dataset: String,
        /// bronze, silver or gold
        #[arg(long)]
        stage: Layer,
        /// Upstream version to read (latest when omitted)
        #[arg(long)]
        as_of: Option<u64>,
        /// Batch JSON file queued before a Bronze run; repeatable
        #[arg(long = "batch")]
        batches: Vec<PathBuf>,
    },
    /// Show watermarks and table heads for every dataset
    Status {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
    },
    /// List the committed versions of a table
    History {
        /// Path to pipeline YAML file
        pipeline: PathBuf,
        #[arg(long)]
        table: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);
    let state = cli.state.as_deref();

    match cli.command {
        Commands::Check { pipeline } => commands::check::execute(&pipeline, state).await,
        Commands::Run { pipeline, batches } => {
            commands::run::execute(&pipeline, state, &batches).await
        }
        Commands::Stage {
            pipeline,
            dataset,
            stage,
            as_of,
            batches,
        } => commands::stage::execute(&pipeline, state, &dataset, stage, as_of, &batches).await,
        Commands::Status { pipeline } => commands::status::execute(&pipeline, state).await,
        Commands::History { pipeline, table } => {
            commands::history::execute(&pipeline, state, &table)
        }
    }
}
