//! # tether-server
//!
//! Standalone server binary with a small `system` module, useful for smoke
//! testing clients against a live endpoint.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tether_core::protocol::HubMessage;
use tether_core::{RichValue, RpcError};
use tether_server::config;
use tether_server::rpc::{Args, Dispatcher, Module, Reply, context};
use tether_server::{HubClient, TetherServer};

/// tether RPC server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "tether RPC server")]
struct Cli {
    /// JSON settings file, merged over defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,

    /// Disable the Prometheus recorder.
    #[arg(long)]
    no_metrics: bool,
}

/// Echoes every hub message back to its sender.
struct EchoClient;

#[async_trait]
impl HubClient for EchoClient {
    async fn on_message(&self, message: HubMessage) -> Option<RichValue> {
        Some(message.payload)
    }
}

fn system_module() -> Result<Module> {
    let module = Module::builder("system")
        .operation("getTime", |_args: Args| async {
            Ok::<_, RpcError>(Reply::value(chrono::Utc::now()))
        })
        .operation("getWhoami", |_args: Args| async {
            let principal = context::current_principal();
            Reply::json(&principal.map(|p| p.view()))
        })
        .operation("getTicks", |args: Args| async move {
            let count: u64 = args.opt(0)?.unwrap_or(5);
            let interval_ms: u64 = args.opt(1)?.unwrap_or(1000);
            let ticks = async_stream::stream! {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                for n in 0..count {
                    let _ = interval.tick().await;
                    yield Ok::<_, RpcError>(RichValue::from(n));
                }
            };
            Ok::<_, RpcError>(Reply::generator(ticks))
        })
        .operation("postEcho", |args: Args| async move {
            Ok::<_, RpcError>(Reply::value(args.into_vec()))
        })
        .build()?;
    Ok(module)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        tether_core::logging::init_json_subscriber(&cli.log_level);
    } else {
        tether_core::logging::init_subscriber(&cli.log_level);
    }

    let mut settings = config::load_config(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    settings.validate().context("invalid settings")?;

    let dispatcher = Dispatcher::new().with_module(system_module()?)?;
    let mut server = TetherServer::new(settings, dispatcher);
    if !cli.no_metrics {
        match tether_server::metrics::install_recorder() {
            Ok(handle) => server = server.with_metrics(handle),
            Err(e) => tracing::warn!(error = %e, "metrics recorder unavailable"),
        }
    }
    server.hub().register_client("echo", std::sync::Arc::new(EchoClient));

    let handle = server.start().await.context("failed to bind")?;
    tracing::info!(url = %handle.base_url(), "tether server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");
    handle.stop().await.context("server task failed")?;
    Ok(())
}
