//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the hub
//! - `config show|get|path` -- inspect configuration
//! - `status` -- query a running instance's health endpoint
//! - `version` -- print version info

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::Method;
use serde_json::Value;

use crate::config;
use crate::metrics::{METRICS, RETRIES_COUNTER};
use crate::xhttp::{http_transactor, retry_transactor, HttpRequest, RetryOptions};

/// WRP device hub.
#[derive(Parser, Debug)]
#[command(
    name = "wrphub",
    version = env!("CARGO_PKG_VERSION"),
    about = "WebSocket hub for WRP devices"
)]
pub struct Cli {
    /// Config file path (default: ./wrphub.json5).
    #[arg(long = "config", global = true, env = "WRPHUB_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn resolved_config_path(&self) -> PathBuf {
        self.config_path
            .clone()
            .unwrap_or_else(config::get_config_path)
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the hub (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Query a running instance for health information.
    Status {
        /// Base URL of the running instance.
        #[arg(long, default_value = "http://127.0.0.1:6100")]
        url: String,
    },

    /// Print version information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the fully loaded configuration as JSON.
    Show,

    /// Print a specific configuration value by dot-notation path.
    Get {
        /// Dot-notation key (e.g. "device.maxDevices").
        key: String,
    },

    /// Print the resolved configuration file path.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

fn loaded_config_value(path: &std::path::Path) -> Result<Value, Box<dyn std::error::Error>> {
    let cfg = config::load_config_from(path)?;
    Ok(serde_json::to_value(cfg)?)
}

/// Run the `config show` subcommand.
pub fn handle_config_show(path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let value = loaded_config_value(path)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run the `config get <key>` subcommand.
pub fn handle_config_get(
    path: &std::path::Path,
    key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let value = loaded_config_value(path)?;
    match get_value_at_path(&value, key) {
        Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
        None => {
            eprintln!("Key not found: {}", key);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path(path: &std::path::Path) {
    println!("{}", path.display());
}

/// Run the `status` subcommand.
///
/// Connect and timeout failures are retried `retries` times.
pub async fn handle_status(base_url: &str, retries: i32) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;
    let options = RetryOptions::new(retries).with_counter(METRICS.register_counter(
        RETRIES_COUNTER,
        "Outbound HTTP requests retried",
    ));
    let transactor = retry_transactor(options, http_transactor(client));

    let response = match transactor(HttpRequest::new(Method::GET, url)).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to wrphub at {}", base_url);
            eprintln!("  Error: {}", e);
            std::process::exit(1);
        }
    };
    if !(200..300).contains(&response.status) {
        eprintln!("Health endpoint returned HTTP {}", response.status);
        std::process::exit(1);
    }

    let body: Value = serde_json::from_slice(&response.body)?;
    println!("wrphub status");
    println!("=============");
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  Status:   {}", status);
    }
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:  {}", version);
    }
    if let Some(devices) = body.get("devices").and_then(|v| v.as_u64()) {
        println!("  Devices:  {}", devices);
    }
    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("wrphub {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

fn get_value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|part| !part.is_empty())
        .try_fold(root, |node, part| node.get(part))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
