//! Dataflow-graph coordinator.
//!
//! Runs either the master process, which drives the graph executor, or a
//! synthetic worker that answers every request with generated metadata.
//!
//! # Usage
//!
//! ```bash
//! # Drive 10 steps of the graph described in cluster.toml
//! dtr-coordinator master --config cluster.toml --steps 10
//!
//! # Start worker 0 of the same deployment
//! dtr-coordinator worker --config cluster.toml --index 0
//! ```

mod master;
mod synthetic;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runtime_core::RuntimeConfig;

/// Dataflow-graph coordinator for distributed training
#[derive(Parser, Debug)]
#[command(name = "dtr-coordinator")]
#[command(about = "Control plane for dataflow-graph distributed training")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master: bind the stream and execute graph steps
    Master {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Number of steps to execute
        #[arg(long, default_value = "1")]
        steps: u64,
    },
    /// Run a synthetic worker for smoke-testing a deployment
    Worker {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Index of this worker
        #[arg(short, long)]
        index: usize,

        /// Samples each data source yields per epoch
        #[arg(long, default_value = "64")]
        samples_per_epoch: u64,
    },
}

fn load_config(path: &Path) -> runtime_core::Result<RuntimeConfig> {
    let config = RuntimeConfig::from_file(path)?.with_env_overrides();
    config.validate()?;
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Master { config, steps } => {
            let config = load_config(&config)?;
            master::run_master(config, steps).await?;
        }
        Command::Worker {
            config,
            index,
            samples_per_epoch,
        } => {
            let config = load_config(&config)?;
            synthetic::run_worker(config, index, samples_per_epoch).await?;
        }
    }

    Ok(())
}
