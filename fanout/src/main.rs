mod config;
mod http;
mod logging;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_sfu::{Sfu, TelemetryFanout, TracingTelemetry};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::http::AppState;
use crate::metrics::SfuMetrics;

#[derive(Parser, Debug)]
#[command(name = "fanout")]
#[command(about = "Fanout selective forwarding unit", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "FANOUT_CONFIG")]
    config: Option<String>,

    /// HTTP listen address, overrides the configuration
    #[arg(long, env = "FANOUT_HTTP_ADDR")]
    http_addr: Option<String>,

    /// UDP media bind address, overrides the configuration
    #[arg(long, env = "FANOUT_MEDIA_ADDR")]
    media_addr: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(addr) = args.media_addr {
        config.sfu.transport.bind_addr = addr;
    }

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Fanout starting...");

    // 4. Start the forwarding engine
    let metrics = Arc::new(SfuMetrics::new().context("Failed to register metrics")?);
    let telemetry = TelemetryFanout::new()
        .with(Arc::new(TracingTelemetry))
        .with(metrics.clone());
    let cancel = CancellationToken::new();
    let sfu = Sfu::start(config.sfu.clone(), Arc::new(telemetry), cancel.clone()).await?;
    info!(media_addr = %sfu.local_addr(), "Media engine started");

    // 5. Log subscription status changes for the signaling side
    let event_task = {
        let mut events = sfu.registry().subscribe_events();
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            metrics.observe_subscription_event(&event);
                            info!(
                                subscription_id = %event.subscription_id,
                                status = ?event.status,
                                layer = ?event.layer,
                                "Subscription status changed"
                            );
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Subscription event listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    };

    // 6. Serve the HTTP API
    let listener = tokio::net::TcpListener::bind(&config.server.http_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP address {}", config.server.http_addr))?;
    info!(http_addr = %config.server.http_addr, "HTTP server listening");

    let app = http::router(
        AppState {
            sfu: sfu.clone(),
            metrics,
        },
        Duration::from_secs(config.server.request_timeout_secs),
    );
    let graceful = {
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => {
                    info!("Shutdown signal received, starting graceful shutdown...");
                }
                () = cancel.cancelled() => {}
            }
        }
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(graceful).await {
        error!("HTTP server error: {}", e);
    }

    // 7. Tear everything down
    sfu.shutdown().await;
    cancel.cancel();
    let _ = event_task.await;
    info!("Fanout stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
