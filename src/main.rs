// =============================================================================
// Orca Watch — Main Entry Point
// =============================================================================
//
// Reads configuration from the environment (plus optional JSON overlay),
// initialises structured logging, and hands control to the supervisor.
//
// Exit codes: 0 clean shutdown, 1 fatal init failure, 2 unrecoverable shard
// exhaustion under the shutdown policy.
// =============================================================================

use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use orca_watch::config::MonitorConfig;
use orca_watch::supervisor;

fn init_logging(log_file: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return;
    }

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            error!(path = log_file, error = %e, "log file unavailable, logging to stdout");
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    // Optional JSON overlay next to the env configuration.
    let config_path = std::env::var("MONITOR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("monitor_config.json"));

    let config = match MonitorConfig::load(Some(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            // Logging may not be up yet; write the cause to both.
            eprintln!("fatal: configuration rejected: {e:#}");
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("info"))
                .init();
            error!(error = %e, "configuration rejected");
            std::process::exit(supervisor::exit_code::INIT_FAILURE);
        }
    };

    init_logging(&config.log_file);

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              Orca Watch — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");
    info!(
        venues = ?config.venues,
        markets = %config.markets,
        metrics_port = config.metrics_port,
        "configuration loaded"
    );

    let code = supervisor::run(config).await;
    std::process::exit(code);
}
