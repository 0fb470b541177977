//! AuthGate - login-gated reverse proxy that supervises its backend.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use authgate::config::{GatewayArgs, LogFormat};
use authgate::server::Gateway;
use clap::Parser;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                ctrl_c_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    token.cancel();
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
            }
        });
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = GatewayArgs::parse();
    init_tracing(args.log_format);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        listen = %config.server.listen,
        backend = %config.backend.authority(),
        program = %config.backend.command.first().map(String::as_str).unwrap_or_default(),
        users = config.credentials.len(),
        "AuthGate starting"
    );

    let gateway = match Gateway::start(config).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "Failed to start gateway");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());
    gateway.serve(shutdown).await;

    ExitCode::SUCCESS
}
