//! imageci - continuous integration for embedded OS images
//!
//! Listens for repository events, runs one containerized build per hardware
//! board under a bounded concurrency budget, keeps commit statuses current
//! and publishes successful groups as releases.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use imageci::config::Configuration;

mod cmd;

#[derive(Parser)]
#[command(name = "imageci")]
#[command(about = "CI daemon that builds embedded OS images across hardware boards")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "imageci.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Configuration::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    let log_level = if cli.debug {
        "debug"
    } else {
        config.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("imageci={}", log_level).into()),
        )
        .init();

    info!("starting imageci v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run(config).await {
        error!("daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
