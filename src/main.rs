use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod handlers;
mod metrics;
mod middleware;
mod server;

use config::Config;
use handlers::proxy::Upstream;
use metrics::{Aggregator, PathNormalizer, ProcessSource, Registry};

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    pub config: Config,

    /// Request aggregate. The hook records into it and the metrics endpoint reads it.
    pub metrics: Arc<Aggregator>,

    /// Every exportable source, the aggregate included.
    pub registry: Arc<Registry>,

    /// Target service plus the pooled client used to reach it.
    pub upstream: Upstream,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.validate()?;

    init_tracing(&config.log_level);

    // ── 1. Upstream ──────────────────────────────────────────────
    let upstream = Upstream::new(&config.proxy_host, config.proxy_port, config.upstream_timeout)?;

    // ── 2. Metrics: aggregate + registry ─────────────────────────
    let metrics = Arc::new(Aggregator::with_normalizer(
        PathNormalizer::with_static_segments(&config.static_segments),
    ));
    let registry = Arc::new(Registry::new());
    registry.register(metrics.clone());
    registry.register(Arc::new(ProcessSource::new()));

    // ── 3. Shared state + router ─────────────────────────────────
    let listen_port = config.listen_port;
    let state = Arc::new(AppState {
        config,
        metrics,
        registry,
        upstream,
    });
    let app = server::create_router(state.clone());

    // ── 4. Bind & serve ──────────────────────────────────────────
    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "metrics sidecar listening");
    info!(target_url = state.upstream.target(), "proxying requests");
    info!(endpoint = %state.config.health_endpoint, "health endpoint");
    info!(
        endpoint = %state.config.metrics_endpoint,
        stream = %state.config.metrics_stream_endpoint(),
        sources = ?state.registry.source_names(),
        "metrics endpoint"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server exited with error")?;

    let snapshot = state.metrics.snapshot();
    info!(
        total_requests = snapshot.total_requests,
        request_rate = snapshot.request_rate(),
        "metrics sidecar stopped"
    );
    if snapshot.latency.has_data() {
        info!(
            p50_ms = snapshot.latency.p50,
            p99_ms = snapshot.latency.p99,
            max_ms = snapshot.latency.max,
            "final latency"
        );
    }
    Ok(())
}

/// `RUST_LOG` wins; otherwise `--log-level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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

    info!("shutdown signal received, draining connections");
}
