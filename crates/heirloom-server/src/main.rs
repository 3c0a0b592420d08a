//! Heirloom Server: headless daemon for vault release monitoring
//!
//! Runs the release sweeper, the notification outbox and the HTTP API in one
//! process. Designed for Docker / server deployment.
//!
//! # Usage
//!
//! ```bash
//! heirloom-server --config /path/to/heirloom-server.toml
//! heirloom-server --once      # Run one sweep and outbox drain, then exit
//! heirloom-server --validate  # Validate config and exit
//! ```

mod config;
mod daemon;
mod http;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::watch;

fn main() -> Result<()> {
    // lettre's rustls transport needs a process-wide CryptoProvider
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/heirloom-server.toml");
    let mut one_shot = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--once" => {
                one_shot = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("heirloom-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut server_config = config::ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    server_config.apply_env_overrides();
    server_config
        .validate()
        .context("Configuration validation failed")?;

    std::env::set_var("RUST_LOG", &server_config.server.log_level);
    env_logger::init();

    if validate_only {
        println!("✅ Configuration is valid.");
        println!("  Database:       {}", server_config.database_path().display());
        println!("  Listen:         {}", server_config.server.listen_addr);
        println!(
            "  Sweep interval: {} secs",
            server_config.engine.sweep_interval_secs
        );
        println!("  Reminder days:  {:?}", server_config.engine.reminder_days);
        println!(
            "  Email notify:   {}",
            server_config.notifications.email.is_some()
        );
        println!(
            "  Contacts:       {}",
            server_config.notifications.contacts.len()
        );
        return Ok(());
    }

    if one_shot {
        log::info!("Running single sweep…");
        daemon::run_once(&server_config)?;
        log::info!("Done.");
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let result = rt.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(daemon::forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));
        daemon::run(server_config, shutdown_rx).await
    });

    if let Err(e) = result {
        log::error!("Server error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Heirloom Server: headless vault release daemon

USAGE:
    heirloom-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/heirloom-server.toml)
    --once                Run a single sweep and outbox drain, then exit
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    HEIRLOOM_DATA_DIR         Data directory path
    HEIRLOOM_DATABASE         Database file name inside the data directory
    HEIRLOOM_LOG_LEVEL        Log level (error/warn/info/debug/trace)
    HEIRLOOM_LISTEN_ADDR      HTTP listen address (host:port)
    HEIRLOOM_SWEEP_INTERVAL   Sweep interval in seconds
    HEIRLOOM_BATCH_SIZE       Vaults loaded per sweep batch
    HEIRLOOM_TOKEN_SALT       Secret mixed into legacy token hashes
    HEIRLOOM_SMTP_PASSWORD    SMTP password

EXAMPLES:
    # Run as daemon with config file
    heirloom-server --config /path/to/config.toml

    # Single sweep (useful for cron jobs)
    heirloom-server --config config.toml --once

    # Validate configuration
    heirloom-server --config config.toml --validate
"#
    );
}
