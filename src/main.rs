// src/main.rs

//! The main entry point for the flomd lock manager daemon.

use anyhow::Result;
use flomd::config::Config;
use flomd::server;
use std::env;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("flomd version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. A missing file means defaults.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.to_string())
        .unwrap_or_else(|| "flomd.toml".to_string());

    let mut config = match Config::from_file_or_default(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Override the unicast port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        if let Some(port_str) = args.get(port_index + 1) {
            match port_str.parse::<u16>() {
                Ok(port) => config.unicast_port = port,
                Err(_) => {
                    eprintln!("Invalid port number: {port_str}");
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        }
    }

    // Get initial log level from env var or config.
    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    info!("Starting flomd {}", VERSION);

    // SIGHUP re-reads `log_level` from the config file.
    let mut sighup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while sighup.recv().await.is_some() {
            match Config::from_file_or_default(&config_path) {
                Ok(fresh) => match reload_handle.reload(EnvFilter::new(&fresh.log_level)) {
                    Ok(()) => info!("Log level reloaded: {}", fresh.log_level),
                    Err(e) => warn!("Failed to reload log level: {}", e),
                },
                Err(e) => warn!("Ignoring SIGHUP, configuration is invalid: {:#}", e),
            }
        }
    });

    if let Err(e) = server::run(config).await {
        error!("Daemon runtime error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
