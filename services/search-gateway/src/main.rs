//! Search Gateway
//!
//! Single-binary Rust service that:
//! 1. Loads upstream API keys for Tavily and Brave from the key store
//! 2. Listens for tool calls from downstream clients
//! 3. Admits each call against a per-client rate limit and the credit cache
//! 4. Forwards it upstream, rotating keys on auth, quota and server failures

mod config;
mod error;
mod metrics;
mod rate_limit;
mod tools;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::SecretCipher;
use key_pool::{
    CreditPool, FailurePool, RotatingBraveClient, RotatingTavilyClient, ServerSettings,
    TavilyUsageSource,
};
use key_store::{Database, KeyStore, MemoryKeyStore, MemorySettingsStore, ProviderKind, SettingsStore};
use metrics_exporter_prometheus::PrometheusHandle;
use provider::QueuedRateGate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::rate_limit::FixedWindowRateLimiter;
use crate::tools::Gateway;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tools/{tool}", post(tool_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

struct Stores {
    tavily: Arc<dyn KeyStore>,
    brave: Arc<dyn KeyStore>,
    settings: Arc<dyn SettingsStore>,
}

/// Open SQLite at `database.url`, or in-process stores for `"memory"`.
async fn open_stores(config: &Config) -> Result<Stores> {
    if config.database.url == "memory" {
        warn!("using in-memory key store; keys and settings are lost on exit");
        return Ok(Stores {
            tavily: Arc::new(MemoryKeyStore::new()),
            brave: Arc::new(MemoryKeyStore::new()),
            settings: Arc::new(MemorySettingsStore::new()),
        });
    }

    let db = Database::open(&config.database.url, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", config.database.url))?;
    Ok(Stores {
        tavily: Arc::new(db.key_store(ProviderKind::Tavily)),
        brave: Arc::new(db.key_store(ProviderKind::Brave)),
        settings: Arc::new(db.settings_store()),
    })
}

/// Wire pools and rotating clients from configuration.
fn build_gateway(config: &Config, cipher: Arc<SecretCipher>, stores: Stores) -> Gateway {
    let http = reqwest::Client::new();

    let settings = Arc::new(ServerSettings::new(
        stores.settings,
        Duration::from_millis(config.settings.refresh_ms),
        config.fallback_strategy(),
        config.fallback_search_source_mode(),
    ));

    let usage_source = Arc::new(TavilyUsageSource::new(
        http.clone(),
        config.tavily.base_url.clone(),
        config.usage_options(),
    ));
    let credit_pool = Arc::new(CreditPool::new(
        stores.tavily,
        cipher.clone(),
        usage_source,
        config.credit_policy(),
        settings.clone(),
    ));
    let mut tavily = RotatingTavilyClient::new(
        credit_pool,
        http.clone(),
        config.tavily.base_url.clone(),
        Duration::from_millis(config.tavily.timeout_ms),
        config.tavily.max_retries,
    );
    if let Some(ms) = config.tavily.min_interval_ms {
        tavily = tavily.with_gate(Arc::new(QueuedRateGate::new(Duration::from_millis(ms))));
    }

    let brave = config.brave.enabled.then(|| {
        let gate = Arc::new(QueuedRateGate::new(config.brave_min_interval()));
        let pool = Arc::new(FailurePool::new(stores.brave, cipher, settings.clone()));
        Arc::new(RotatingBraveClient::new(
            pool,
            http,
            config.brave.base_url.clone(),
            gate,
            Duration::from_millis(config.brave.timeout_ms),
            config.brave.max_retries,
        ))
    });

    Gateway {
        tavily: Arc::new(tavily),
        brave,
        settings,
        limiter: FixedWindowRateLimiter::new(
            config.client_rate_limit.max_requests,
            config.client_rate_limit.window_ms,
        ),
        brave_overflow: config.brave.overflow,
        brave_max_wait: config.brave_max_wait(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting search-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let Some(key) = config.encryption_key.as_ref() else {
        anyhow::bail!("KEY_ENCRYPTION_SECRET is required to decrypt upstream keys");
    };
    let cipher = Arc::new(SecretCipher::new(key.expose()).context("invalid encryption key")?);

    info!(
        listen_addr = %config.server.listen_addr,
        tavily_base_url = %config.tavily.base_url,
        brave_enabled = config.brave.enabled,
        brave_min_interval_ms = config.brave_min_interval().as_millis() as u64,
        brave_overflow = ?config.brave.overflow,
        "configuration loaded"
    );

    let stores = open_stores(&config).await?;
    let gateway = Arc::new(build_gateway(&config, cipher, stores));

    let app_state = AppState {
        gateway,
        prometheus: prometheus_handle,
        started_at: Instant::now(),
    };
    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires: the server is
    // told to drain, then the drain races the timeout.
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Worst of the pool statuses.
fn overall_status(statuses: &[&str]) -> &'static str {
    if statuses.contains(&"unhealthy") {
        "unhealthy"
    } else if statuses.contains(&"degraded") {
        "degraded"
    } else {
        "healthy"
    }
}

/// Health endpoint: pool health for both providers plus the active settings.
/// Returns 503 when the Tavily pool has no usable key.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let gateway = &state.gateway;

    let tavily = match gateway.tavily.pool().health().await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "tavily pool health check failed");
            serde_json::json!({ "status": "unhealthy", "error": "key store unavailable" })
        }
    };
    let brave = match &gateway.brave {
        Some(client) => match client.pool().health().await {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, "brave pool health check failed");
                serde_json::json!({ "status": "degraded", "error": "key store unavailable" })
            }
        },
        None => serde_json::json!({ "status": "disabled" }),
    };

    let tavily_status = tavily["status"].as_str().unwrap_or("unhealthy");
    let brave_status = match brave["status"].as_str() {
        // Brave is optional; without it search falls back to Tavily.
        Some("unhealthy") => "degraded",
        Some("disabled") | None => "healthy",
        Some(other) => other,
    };
    let status = overall_status(&[tavily_status, brave_status]);
    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "uptime_seconds": uptime,
        "selection_strategy": gateway.settings.selection_strategy().await.as_str(),
        "search_source_mode": gateway.settings.search_source_mode().await.as_str(),
        "tavily": tavily,
        "brave": brave,
    });

    (
        code,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Run one tool call. The body is the tool's JSON arguments.
async fn tool_handler(
    State(state): State<AppState>,
    Path(tool): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let span = tracing::info_span!("tool_call", request_id = %request_id, tool = %tool);

    let mut response = match state
        .gateway
        .handle(&tool, &headers, &body)
        .instrument(span)
        .await
    {
        Ok(value) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            value.to_string(),
        )
            .into_response(),
        Err(e) => e.into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
