//! relay-server: transport relay.
//!
//! Accepts TCP connections from the edge, reads a one-line routing header
//! (`<proto>@<host>$<port>\r`) and either relays the stream to the named TCP
//! destination or carries multiplexed UDP flows over it.

mod config;
mod gateway;
mod mux;
mod server;

use clap::Parser;
use config::ServerConfig;
use server::RelayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// relay-server — TCP and UDP-over-TCP transport relay
#[derive(Parser, Debug)]
#[command(name = "relay-server", version, about = "TCP and UDP-over-TCP transport relay")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    bind: Option<String>,

    /// Config file path
    #[arg(short, long, default_value = "~/.relay/config.toml")]
    config: String,

    /// Idle timeout in seconds for headers, tunnels and flows
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Verbose logging (same as --log-level debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let server_config =
        match ServerConfig::load(Some(&config_path), cli.bind.as_deref(), cli.idle_timeout) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, "failed to load config");
                std::process::exit(1);
            }
        };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %server_config.bind,
        idle_timeout = server_config.idle_timeout.as_secs(),
        "starting relay-server"
    );

    let relay = match RelayServer::new(server_config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    let stats = relay.stats().snapshot();
    let tunnels = relay.registry().tunnel_count().await;
    let flows = relay.registry().flow_count().await;
    info!(
        accepted = stats.accepted,
        blocked_sources = stats.blocked_sources,
        blocked_destinations = stats.blocked_destinations,
        rejected_headers = stats.rejected_headers,
        dial_failures = stats.dial_failures,
        active = stats.active_connections,
        tunnels,
        flows,
        "relay-server stopped"
    );
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
