mod agent;
mod config;
#[allow(dead_code)]
mod connections;
mod core;
mod daemon;
mod db;
#[allow(dead_code)]
mod events;
mod ingest;
#[allow(dead_code)]
mod outbox;
mod policy;
mod processor;
#[allow(dead_code)]
mod queue;
#[allow(dead_code)]
mod session;
#[allow(dead_code)]
mod timers;
#[allow(dead_code)]
mod traits;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Handle CLI arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("sessiond {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("sessiond {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: sessiond [OPTIONS]\n");
                println!("Options:");
                println!("  -c, --config <PATH>  Path to config.toml (default: ./config.toml)");
                println!("  -h, --help           Print help");
                println!("  -V, --version        Print version");
                return Ok(());
            }
            _ => {}
        }
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Missing config is not an error: every section has defaults.
    let config = if config_path.exists() {
        config::AppConfig::load(&config_path)?
    } else {
        tracing::info!(
            "No config at {}, starting with defaults",
            config_path.display()
        );
        config::AppConfig::default()
    };

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::core::run(config, Arc::new(agent::EchoAgent)))
}
