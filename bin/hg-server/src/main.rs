//! HookGuard Webhook Gateway
//!
//! Receives provider webhooks, verifies and screens them, and hands verified
//! events to the downstream handler through the coordinator's worker pools.
//! Serves the monitoring API and observer WebSocket on the API port, and
//! Prometheus metrics on a separate port.
//!
//! ## Environment
//!
//! - `HOOKGUARD_CONFIG` - path to the TOML configuration (or `--config`)
//! - `HOOKGUARD_API_PORT` - API listener port (default 8080)
//! - `HOOKGUARD_METRICS_PORT` - metrics listener port (default 9090)
//! - `HOOKGUARD_LOG_FORMAT` - `json` for structured output
//! - `RUST_LOG` - tracing filter

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::{net::TcpListener, signal};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use hg_api::{create_router, AppState};
use hg_broadcast::RealtimeBroadcastHub;
use hg_common::logging::{init_tracing, LogFormat};
use hg_common::{AuditSink, SystemClock, TracingAuditSink};
use hg_config::ConfigStore;
use hg_coordinator::{
    Collaborators, EventHandler, HttpEventHandler, LifecycleConfig, LifecycleManager, LoggingEventHandler,
    WebhookCoordinator,
};
use hg_guard::ReplayAndRateGuard;
use hg_health::ServiceHealthRegistry;
use hg_verify::SignatureVerifier;

#[derive(Debug, Parser)]
#[command(name = "hg-server", about = "HookGuard webhook gateway")]
struct Args {
    /// Gateway configuration file
    #[arg(long, env = "HOOKGUARD_CONFIG", default_value = "hookguard.toml")]
    config: PathBuf,

    #[arg(long, env = "HOOKGUARD_API_PORT", default_value_t = 8080)]
    api_port: u16,

    #[arg(long, env = "HOOKGUARD_METRICS_PORT", default_value_t = 9090)]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    init_tracing(LogFormat::from_env());
    info!("Starting HookGuard gateway");

    // 1. Metrics recorder, installed before anything emits counters
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;

    // 2. Configuration
    let config = Arc::new(
        ConfigStore::from_file(&args.config)
            .with_context(|| format!("failed to load configuration from {}", args.config.display()))?,
    );
    let settings = config.current();

    // 3. Shared store, audit, health, hub
    let clock = SystemClock::shared();
    let store = hg_store::connect(&settings.store, clock.clone())
        .await
        .context("failed to connect shared store")?;
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let health = Arc::new(
        ServiceHealthRegistry::new(config.clone(), audit.clone(), clock.clone()).with_snapshot_store(store.clone()),
    );
    let hub = Arc::new(RealtimeBroadcastHub::new(settings.broadcast.clone(), clock.clone()));

    // 4. Verification and screening
    let verifier = Arc::new(SignatureVerifier::new(config.clone(), clock.clone()));
    let guard = Arc::new(ReplayAndRateGuard::new(store.clone(), audit.clone(), clock.clone()));

    // 5. Downstream handler
    let handler: Arc<dyn EventHandler> = match settings.coordinator.downstream_url.as_deref() {
        Some(url) => {
            info!(url = %url, "Forwarding verified events downstream");
            let forwarder = HttpEventHandler::new(url, settings.coordinator.handler_timeout())
                .context("failed to build downstream handler")?;
            Arc::new(forwarder)
        }
        None => {
            info!("No downstream URL configured - verified events are logged only");
            Arc::new(LoggingEventHandler)
        }
    };

    // 6. Coordinator and lifecycle tasks
    let coordinator = WebhookCoordinator::new(Collaborators {
        config: config.clone(),
        verifier,
        guard,
        health,
        hub,
        handler,
        audit: audit.clone(),
        store: store.clone(),
        clock,
    });
    let lifecycle = LifecycleManager::start(coordinator.clone(), store, audit, LifecycleConfig::default());

    // 7. API server
    let app = create_router(AppState::new(coordinator.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let api_addr = format!("0.0.0.0:{}", args.api_port);
    let api_listener = TcpListener::bind(&api_addr).await?;
    info!(port = args.api_port, providers = settings.providers.len(), "API server listening");

    let api_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(api_listener, app.into_make_service_with_connect_info::<SocketAddr>()).await {
            error!(error = %e, "API server failed");
        }
    });

    // 8. Metrics server
    let metrics_app = Router::new().route("/metrics", get(move || render_metrics(metrics_handle.clone())));

    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = TcpListener::bind(&metrics_addr).await?;
    info!(port = args.metrics_port, "Metrics server listening");

    let metrics_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
            error!(error = %e, "Metrics server failed");
        }
    });

    info!("HookGuard gateway started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    // Stop background tasks, then drain intake and in-flight work
    lifecycle.shutdown();
    coordinator.shutdown().await;

    api_task.abort();
    metrics_task.abort();

    info!("HookGuard gateway shutdown complete");
    Ok(())
}

async fn render_metrics(handle: PrometheusHandle) -> String {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
