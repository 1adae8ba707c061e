//! rpicam: stream the camera to one TCP client while taking scheduled snapshots

use clap::Parser;
use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rpicam::cli::Args;
use rpicam::{Config, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();

    // Load configuration: defaults < file < environment < flags
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let default_filter = if config.logging.debug {
        "rpicam=debug"
    } else {
        "rpicam=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("rpicam launching...");

    Supervisor::new(config).run().await?;

    info!("rpicam shutting down");
    Ok(())
}
