//! c2mux-server: multiplexed agent control plane.
//!
//! Loads configuration, starts maintenance and logs every server event until
//! a shutdown signal arrives. Transports attach connections through
//! [`C2Server::accept`].

use c2mux_server::{C2Server, Overrides, ServerConfig};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// c2mux-server: multiplexed agent control plane
#[derive(Parser, Debug)]
#[command(name = "c2mux-server", version, about = "Multiplexed agent control plane")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.c2mux/server.toml")]
    config: String,

    /// Default RPC timeout in seconds
    #[arg(long)]
    rpc_timeout: Option<u64>,

    /// Outbound queue size per connection
    #[arg(long)]
    send_queue: Option<usize>,

    /// Maximum outstanding calls per connection
    #[arg(long)]
    max_pending_calls: Option<usize>,

    /// Seconds between maintenance sweeps
    #[arg(long)]
    gc_interval: Option<u64>,

    /// Seconds before an unanswered beacon task is reported lost
    #[arg(long)]
    beacon_task_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting c2mux-server");

    let overrides = Overrides {
        rpc_timeout_secs: cli.rpc_timeout,
        send_queue_capacity: cli.send_queue,
        max_pending_calls: cli.max_pending_calls,
        gc_interval_secs: cli.gc_interval,
        beacon_task_timeout_secs: cli.beacon_task_timeout,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = Arc::new(C2Server::new(server_config));
    for (msg_type, name) in server.handlers().list() {
        info!(msg_type = %msg_type, code = msg_type.0, handler = %name, "handler registered");
    }

    // Event log
    server.events().subscribe(|event| match serde_json::to_string(&event) {
        Ok(json) => info!(kind = event.kind(), event = %json, "server event"),
        Err(e) => warn!(kind = event.kind(), error = %e, "could not serialize event"),
    });

    let maintenance = {
        let server = server.clone();
        tokio::spawn(async move { server.run_maintenance().await })
    };

    info!("c2mux-server ready");
    shutdown_signal().await;
    info!("received shutdown signal");

    let closed = server.shutdown().await;
    if let Err(e) = maintenance.await {
        warn!(error = %e, "maintenance task ended abnormally");
    }
    info!(closed, "c2mux-server stopped");
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
                warn!(error = %e, "failed to install SIGTERM handler, waiting for Ctrl+C only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
