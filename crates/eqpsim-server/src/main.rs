//! EQP simulator binary.
//!
//! # Usage
//!
//! ```bash
//! eqpsim-server --config sim.yaml
//! eqpsim-server --config sim.yaml --log-level debug
//! ```

use std::path::PathBuf;

use clap::Parser;
use eqpsim_server::Simulator;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Manufacturing equipment protocol simulator
#[derive(Parser, Debug)]
#[command(name = "eqpsim-server")]
#[command(about = "Simulated equipment speaking a framed text protocol")]
#[command(version)]
struct Args {
    /// Path to the simulation configuration file (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("eqpsim starting");
    tracing::info!("loading configuration from {}", args.config.display());

    let simulator = Simulator::from_config_file(&args.config)?;
    simulator.run().await?;

    Ok(())
}
