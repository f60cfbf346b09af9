use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{debug, info, warn};

mod api;
mod classify;
mod config;
mod error;
mod forward;
mod pipeline;
mod pool;
mod route;
mod session;
mod sink;
mod tokens;

pub use config::Config;
pub use error::GatewayError;
pub use route::Gateway;

/// Poll period of the config hot-reload watcher.
const CONFIG_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Period of the idle-session sweep.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_relay=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("LLM_RELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/llm-relay/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        listen_port = config.gateway.listen_port,
        profiles = config.profiles.len(),
        providers = config.providers.len(),
        strategy = %config.gateway.strategy,
        "llm-relay starting"
    );

    let session_ttl = Duration::from_secs(config.gateway.session_ttl_secs);
    let listen_port = config.gateway.listen_port;

    let gateway = Arc::new(Gateway::new(Arc::new(config), config_path));

    // Background tasks: config hot-reload and idle-session sweep.
    tokio::spawn(config_watcher(Arc::clone(&gateway)));
    tokio::spawn(session_sweeper(Arc::clone(&gateway), session_ttl));

    let addr: SocketAddr = format!("0.0.0.0:{listen_port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = route::app(Arc::clone(&gateway))
        .layer(trace_layer)
        .layer(tower_http::cors::CorsLayer::permissive());

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `llm-relay --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("LLM_RELAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection — no inotify/kqueue
/// dependencies. Parse failures are logged and ignored; the running config is
/// unchanged.
async fn config_watcher(gateway: Arc<Gateway>) {
    let path = gateway.config_path.clone();

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(CONFIG_WATCH_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match gateway.reload_from_disk() {
            Ok(()) => {
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}

/// Background task: drops sessions idle past the TTL.
async fn session_sweeper(gateway: Arc<Gateway>, ttl: Duration) {
    let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    interval.tick().await;

    loop {
        interval.tick().await;
        let removed = gateway.sessions.sweep(ttl);
        if removed > 0 {
            debug!(removed, "swept idle sessions");
        }
    }
}
