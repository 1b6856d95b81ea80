use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use wrphub::cli::{self, Cli, Command, ConfigCommand};
use wrphub::config;
use wrphub::device::{event, Manager, ManagerOptions};
use wrphub::logging::{self, LogConfig};
use wrphub::metrics::METRICS;
use wrphub::server::{run_server_with_config, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config_path = cli.resolved_config_path();

    match cli.command {
        // No subcommand or explicit `start` both launch the hub.
        None | Some(Command::Start) => run_hub(&config_path).await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show(&config_path)?,
                ConfigCommand::Get { key } => cli::handle_config_get(&config_path, &key)?,
                ConfigCommand::Path => cli::handle_config_path(&config_path),
            }
            Ok(())
        }

        Some(Command::Status { url }) => {
            let retries = config::load_config_from(&config_path)
                .map(|cfg| cfg.retry.retries)
                .unwrap_or(1);
            cli::handle_status(&url, retries).await
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_hub(config_path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config::load_config_from(config_path)?;
    logging::init_logging(LogConfig::from_section(&cfg.logging))?;
    info!(target: "config", path = %config_path.display(), "configuration loaded");

    let options = ManagerOptions::from_config(&cfg.device).with_listener(event::log_listener());
    let manager = Manager::new(options, &METRICS);
    let server_config = ServerConfig::from_config(&cfg, manager, Arc::clone(&METRICS))?;

    let handle = run_server_with_config(server_config).await?;
    info!(target: "hub", address = %handle.local_addr(), "wrphub started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "hub", "failed to listen for shutdown signal: {}", e);
    }
    info!(target: "hub", "shutdown signal received");
    handle.shutdown().await;
    Ok(())
}
