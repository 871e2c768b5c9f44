//! Main application entry point for the beacon rendezvous hub.
//!
//! Parses the CLI, loads configuration, initializes logging and runs the hub
//! until a termination signal triggers the coordinated shutdown drain.

mod cli;
mod config;
mod signals;

use beacon_server::Server;
use cli::CliArgs;
use config::{AppConfig, LoggingSettings};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_level = config.level.as_str();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if json_format || config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_ids(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    info!("🔧 Logging initialized with level: {}", log_level);
    Ok(())
}

async fn run(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    // CLI overrides take precedence over the file.
    if let Some(bind_address) = args.bind_address {
        config.hub.bind_address = bind_address;
    }
    if let Some(config_dir) = args.config_dir {
        config.hub.config_directory = config_dir.to_string_lossy().to_string();
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }

    if let Err(e) = config.validate() {
        return Err(format!("Configuration validation failed: {e}").into());
    }

    setup_logging(&config.logging, args.json_logs)?;

    info!("🌟 Beacon Hub v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "📂 Config: {} | Extension store: {}",
        args.config_path.display(),
        config.hub.config_directory
    );
    info!("⏱️ Heartbeat interval: {}s", config.hub.heartbeat_interval);

    let server = Arc::new(Server::new(config.to_server_settings()?));

    let server_handle = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("❌ Server error: {e}");
                std::process::exit(1);
            }
        })
    };

    info!("🛑 Press Ctrl+C to gracefully shutdown");
    signals::wait_for_shutdown_signal().await?;

    info!("🛑 Shutdown signal received, initiating graceful shutdown...");
    server.shutdown();
    server_handle.await?;

    info!("👋 Beacon Hub shutdown complete");
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    if let Err(e) = run(args).await {
        eprintln!("❌ Failed to start: {e}");
        std::process::exit(1);
    }
}
