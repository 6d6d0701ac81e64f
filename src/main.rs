use clap::Parser;
use podcast_pipeline::{logging, RunMode};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "PODCAST_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Run a single pass over pending work and exit
    #[arg(long)]
    once: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    let mode = if args.once {
        RunMode::Once
    } else {
        RunMode::Continuous
    };
    podcast_pipeline::run(args.config.as_deref(), mode).await
}
