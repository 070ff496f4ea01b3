//! Warden - Main entry point
//!
//! Runs as the supervisor by default and re-executes itself with `--worker`
//! for the jailed serving process.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use warden_config::validate::validate_deployment;
use warden_config::Config;
use warden_server::{logging, supervisor, worker};

/// Warden - HTTPS static file server with automatic certificates
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Run as the jailed worker (started by the supervisor)
    #[arg(long = "worker", hide = true)]
    worker: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Test {
        /// Configuration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Test { config }) => test_config(config.as_deref().or(cli.config.as_deref())),
        None if cli.worker => run_worker(cli.config.as_deref()),
        None => run_supervisor(cli.config.as_deref()),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("warden: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = match config_path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => Config::default_embedded().context("Failed to load embedded configuration")?,
    };
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Test configuration file and exit
fn test_config(config_path: Option<&Path>) -> Result<i32> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    match config_path {
        Some(path) => info!("Testing configuration file: {}", path.display()),
        None => info!("Testing embedded default configuration"),
    }
    let config = load_config(config_path)?;
    logging::report_notices(&config);

    let result = validate_deployment(&config);
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    for err in &result.errors {
        error!("{}", err);
    }

    info!("Configuration test summary:");
    info!("  - {} ACME domain(s)", config.certificates.acme_domains.len());
    info!(
        "  - {} self-signed domain(s)",
        config.certificates.self_signed_domains.len()
    );
    info!("  - web root {}", config.files.web_root.display());

    if !result.is_valid() {
        return Ok(1);
    }

    println!(
        "warden: configuration file {} test is successful",
        config_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(embedded)".to_string())
    );
    Ok(0)
}

fn run_supervisor(config_path: Option<&Path>) -> Result<i32> {
    let config = load_config(config_path)?;
    logging::init(&config.logging);
    logging::report_notices(&config);

    match config_path {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("No configuration specified, using embedded default configuration"),
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let result = runtime.block_on(supervisor::run(&config, config_path));
    runtime.shutdown_background();
    result
}

fn run_worker(config_path: Option<&Path>) -> Result<i32> {
    // The worker builds its own runtime once privileges are dropped
    worker::run(load_config(config_path)?)
}
