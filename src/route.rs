//! Request routing — the brain of llm-relay.
//!
//! Every routable path has the shape `/<profile>/<session>/<upstream-path…>`:
//! the first segment names a profile (an ordered provider list), the second
//! identifies the client session, and the rest is forwarded to the chosen
//! provider verbatim. Admin endpoints (`/api/v1/…`, `/healthz`) sit in the
//! axum route table and therefore match before the profile parse, which runs
//! as the fallback handler for every other method+path.
//!
//! [`Gateway`] is the shared application state: the atomically-swappable
//! config snapshot, the pipeline cache, the session cache, the forward engine,
//! and the usage sink. Handlers receive it via [`axum::extract::State`].

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Instant,
};

use axum::{
    extract::{Request, State},
    http::header,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    api,
    config::{Config, ProviderConfig, TempProfileStore, WireFormat, TEMP_PROFILE_PREFIX},
    error::GatewayError,
    forward::{ForwardEngine, ForwardRequest},
    pipeline::PipelineCache,
    session::SessionCache,
    sink::{MemorySink, UsageSink},
};

/// Maximum inbound body size the relay will buffer (32 MiB).
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Header carrying the client's project directory, when the tooling sends it.
const PROJECT_PATH_HEADER: &str = "x-project-path";

/// Parsed view of an inbound routing path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub profile: String,
    pub session: String,
    /// Path tail with its leading `/`; empty when the path had exactly two
    /// segments.
    pub remainder: String,
}

impl RouteInfo {
    /// Split `/<profile>/<session>/<remainder…>` into its three parts.
    ///
    /// Fewer than two segments, an empty segment, or a profile outside
    /// `[A-Za-z0-9_-]+` is an `invalid_path` error.
    pub fn parse(path: &str) -> Result<Self, GatewayError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        let mut parts = trimmed.splitn(3, '/');

        let profile = parts.next().unwrap_or_default();
        if profile.is_empty() {
            return Err(GatewayError::InvalidPath(
                "expected /<profile>/<session>/<path>, got an empty profile segment".into(),
            ));
        }
        if !is_valid_profile_segment(profile) {
            return Err(GatewayError::InvalidPath(format!(
                "profile segment `{profile}` must match [A-Za-z0-9_-]+"
            )));
        }

        let session = parts.next().unwrap_or_default();
        if session.is_empty() {
            return Err(GatewayError::InvalidPath(
                "expected /<profile>/<session>/<path>, got fewer than two segments".into(),
            ));
        }

        let remainder = parts
            .next()
            .map(|rest| format!("/{rest}"))
            .unwrap_or_default();

        Ok(Self {
            profile: profile.to_string(),
            session: session.to_string(),
            remainder,
        })
    }

    /// Session-cache key — a 1-to-1 function of (profile, session).
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.profile, self.session)
    }

    /// Reconstruct the original path.
    pub fn rebuild(&self) -> String {
        format!("/{}/{}{}", self.profile, self.session, self.remainder)
    }
}

/// True iff `name` addresses the volatile temp-profile store.
pub fn is_temp_profile(name: &str) -> bool {
    name.starts_with(TEMP_PROFILE_PREFIX)
}

fn is_valid_profile_segment(segment: &str) -> bool {
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Shared application state — owns every long-lived service.
pub struct Gateway {
    /// Atomically-swappable live config; the lock is held only for the
    /// duration of `Arc::clone`, so it never blocks request handling.
    config_lock: RwLock<Arc<Config>>,
    /// Path to the config file on disk — used by the hot-reload task.
    pub config_path: PathBuf,
    pub temp_profiles: TempProfileStore,
    pipelines: PipelineCache,
    pub sessions: Arc<SessionCache>,
    /// Concrete sink handle, kept for the admin API's aggregate views.
    pub sink: Arc<MemorySink>,
    sink_shared: Arc<dyn UsageSink>,
    engine: ForwardEngine,
    /// Start time — uptime for the daemon status endpoint.
    pub started_at: Instant,
}

impl Gateway {
    pub fn new(config: Arc<Config>, config_path: PathBuf) -> Self {
        let sink = Arc::new(MemorySink::new(config.gateway.sink_capacity));
        let sink_shared: Arc<dyn UsageSink> = Arc::clone(&sink) as Arc<dyn UsageSink>;
        let sessions = Arc::new(SessionCache::new(config.gateway.session_capacity));
        let engine = ForwardEngine::new(Arc::clone(&sessions), Arc::clone(&sink_shared));
        Self {
            config_lock: RwLock::new(config),
            config_path,
            temp_profiles: TempProfileStore::new(),
            pipelines: PipelineCache::new(),
            sessions,
            sink,
            sink_shared,
            engine,
            started_at: Instant::now(),
        }
    }

    /// Snapshot of the current live config. In-flight requests keep whichever
    /// snapshot they captured at dispatch time.
    pub fn config(&self) -> Arc<Config> {
        self.config_lock
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Atomically swap the live config and invalidate cached pipelines so
    /// pools are rebuilt (with fresh health state) from the new snapshot.
    pub fn replace_config(&self, new: Arc<Config>) {
        *self.config_lock.write().expect("config lock poisoned") = new;
        self.pipelines.invalidate();
    }

    /// Re-read the config file and swap it in. Parse failures leave the
    /// running config untouched.
    pub fn reload_from_disk(&self) -> anyhow::Result<()> {
        let config = Config::load(&self.config_path)?;
        self.replace_config(Arc::new(config));
        Ok(())
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Resolve a profile name to its provider configs and wire format.
    ///
    /// `_tmp_` names resolve only through the temp-profile store; everything
    /// else through the config snapshot.
    fn resolve_profile(
        &self,
        name: &str,
        config: &Config,
    ) -> Result<(Vec<(String, ProviderConfig)>, WireFormat), GatewayError> {
        let (provider_names, format) = if is_temp_profile(name) {
            let profile = self
                .temp_profiles
                .get(name)
                .ok_or_else(|| GatewayError::TempProfileNotFound(name.to_string()))?;
            (profile.providers, profile.format)
        } else {
            let profile = config
                .profile(name)
                .ok_or_else(|| GatewayError::ProfileNotFound(name.to_string()))?;
            (profile.providers.clone(), profile.format)
        };

        let providers: Vec<(String, ProviderConfig)> = provider_names
            .iter()
            .filter_map(|provider| match config.providers.get(provider) {
                Some(cfg) => Some((provider.clone(), cfg.clone())),
                None => {
                    tracing::warn!(profile = name, provider = %provider, "profile references unknown provider");
                    None
                }
            })
            .collect();

        if providers.is_empty() {
            return Err(GatewayError::NoProviders(name.to_string()));
        }
        Ok((providers, format))
    }
}

/// Build the complete axum application: health + admin routes first, the
/// profile dispatch as the fallback, panic containment outermost.
pub fn app(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(api::health::healthz))
        .merge(api::admin::router())
        .fallback(dispatch)
        .with_state(gateway)
        .layer(middleware::from_fn(api::request_id::request_id_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
}

/// A panic inside a handler or the forward path becomes a 500 with the
/// uniform error shape; it never tears down the listener.
fn panic_response(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        axum::Json(serde_json::json!({
            "error": { "type": "internal", "message": "internal gateway error" }
        })),
    )
        .into_response()
}

/// Fallback handler: every non-admin request lands here and is proxied.
pub async fn dispatch(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    match handle_proxy(&gateway, request).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

#[tracing::instrument(skip_all, fields(profile = tracing::field::Empty, session = tracing::field::Empty))]
async fn handle_proxy(
    gateway: &Gateway,
    request: Request,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();

    let route = RouteInfo::parse(parts.uri.path())?;
    let span = tracing::Span::current();
    span.record("profile", route.profile.as_str());
    span.record("session", route.session.as_str());

    let config = gateway.config();
    let (providers, format) = gateway.resolve_profile(&route.profile, &config)?;

    let client_type = header_value(&parts.headers, header::USER_AGENT.as_str());
    let project_path = header_value(&parts.headers, PROJECT_PATH_HEADER);
    let session_key = route.cache_key();
    gateway
        .sessions
        .register(&session_key, &route.profile, client_type, project_path);

    let pool = gateway.pipelines.get_or_create(
        &route.profile,
        format,
        &providers,
        &gateway.sink_shared,
    );

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to read request body: {e}")))?;

    gateway
        .engine
        .forward(
            &pool,
            &config,
            ForwardRequest {
                method: parts.method,
                headers: parts.headers,
                remainder: &route.remainder,
                query: parts.uri.query(),
                body,
                session_key: &session_key,
                profile: &route.profile,
            },
        )
        .await
}

fn header_value(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}
