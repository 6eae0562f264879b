//! xray-pilot - CLI entry point
//!
//! Loads the YAML configuration, wires the service together with the
//! in-memory store and the no-op tunnel engine, then runs until Ctrl-C.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use xray_pilot::engine::NoopEngine;
use xray_pilot::store::MemoryStore;
use xray_pilot::{Config, Pilot, VERSION};

#[derive(Parser, Debug)]
#[command(name = "xray-pilot")]
#[command(version = VERSION)]
#[command(about = "Proxy endpoint pool manager")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.is_file() {
        match Config::load_async(&args.config).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("xray_pilot={}", config.log_level).parse()?),
        )
        .init();

    info!("xray-pilot v{}", VERSION);
    info!("configuration: {}", args.config.display());

    if args.test {
        info!("configuration test passed");
        return Ok(());
    }

    let store = MemoryStore::handle();
    let engine = Arc::new(NoopEngine::new());
    let pilot = match Pilot::new(config, store, engine) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    pilot.start();

    tokio::signal::ctrl_c().await?;
    pilot.shutdown().await?;

    Ok(())
}
