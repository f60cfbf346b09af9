//! The forward engine: one request in, one upstream response streamed back.
//!
//! [`ForwardEngine::forward`] walks the strategy-ordered provider list and
//! attempts each in turn. An attempt rewrites the body's `model` field for the
//! classified scenario, replaces auth headers with the provider's credentials,
//! and dispatches with a shared 10-minute-timeout client. Transport errors and
//! `429`/`5xx` statuses are failover-eligible — the provider is marked failed
//! and the next one is tried. Every other status, including non-429 `4xx`, is
//! terminal and reaches the client verbatim.
//!
//! Responses with a `text/event-stream` content type are proxied chunk by
//! chunk so SSE events reach the client as they are produced; other bodies are
//! bulk-copied. Either way the usage block is extracted afterwards to update
//! the session cache and the usage sink — never blocking or failing the
//! response itself.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value;

use crate::{
    classify::{classify, session_key_from_metadata, Scenario},
    config::Config,
    error::GatewayError,
    pool::{Provider, UpstreamPool},
    session::SessionCache,
    sink::{UsageRecord, UsageSink},
    tokens::TokenCounter,
};

/// Overall per-attempt timeout — generous enough for the slowest streaming
/// completion.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Usage events land near the edges of a stream; collection stops at this cap
/// so a multi-gigabyte stream cannot balloon memory.
const SSE_USAGE_COLLECT_CAP: usize = 1024 * 1024;

/// Headers never copied from the inbound request: connection management is
/// per-hop, and auth plus framing are rewritten by the engine.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "connection",
    "proxy-authorization",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers never copied from the upstream response: hyper reframes the body.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["connection", "transfer-encoding", "content-length"];

/// Everything the dispatch path hands the engine for one request.
pub struct ForwardRequest<'a> {
    pub method: Method,
    pub headers: HeaderMap,
    /// Upstream path tail, with its leading `/` (may be empty).
    pub remainder: &'a str,
    /// Raw query string, forwarded verbatim.
    pub query: Option<&'a str>,
    pub body: Bytes,
    /// URL-derived `profile:session` cache key.
    pub session_key: &'a str,
    pub profile: &'a str,
}

/// Shared forwarding machinery — one instance serves every profile.
pub struct ForwardEngine {
    client: reqwest::Client,
    sessions: Arc<SessionCache>,
    sink: Arc<dyn UsageSink>,
    counter: TokenCounter,
}

impl ForwardEngine {
    pub fn new(sessions: Arc<SessionCache>, sink: Arc<dyn UsageSink>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .expect("failed to build upstream HTTP client");
        Self {
            client,
            sessions,
            sink,
            counter: TokenCounter::new(),
        }
    }

    /// Try each provider in strategy order until one answers terminally.
    pub async fn forward(
        &self,
        pool: &UpstreamPool,
        config: &Config,
        request: ForwardRequest<'_>,
    ) -> Result<Response<Body>, GatewayError> {
        let parsed: Option<Value> = serde_json::from_slice(&request.body).ok();

        // Prefer the session handle the client embedded in the body; fall
        // back to the URL-derived key so accounting never goes dark.
        let session_key = parsed
            .as_ref()
            .and_then(|body| session_key_from_metadata(body, request.profile))
            .unwrap_or_else(|| request.session_key.to_string());

        let scenario = parsed
            .as_ref()
            .map(|body| {
                classify(
                    body,
                    Some(&session_key),
                    &self.sessions,
                    &self.counter,
                    config.gateway.long_context_threshold,
                )
            })
            .unwrap_or_default();

        let candidates = pool.ordered(config.gateway.strategy, scenario, &config.pricing);

        for provider in &candidates {
            if !provider.is_healthy() {
                tracing::debug!(provider = %provider.name, "skipping unhealthy provider");
                continue;
            }

            let model = provider.effective_model(scenario).map(str::to_owned);
            let body = match &model {
                Some(model) => inject_model(&request.body, model),
                None => request.body.clone(),
            };

            let url = join_url(provider.base_url.as_str(), request.remainder, request.query);
            let headers = outbound_headers(&request.headers, provider.token(), body.len());

            tracing::debug!(
                provider = %provider.name,
                scenario = %scenario,
                model = model.as_deref().unwrap_or("<client>"),
                %url,
                "attempting upstream"
            );

            let started = Instant::now();
            let result = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers)
                .body(body)
                .send()
                .await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match result {
                Err(e) => {
                    tracing::warn!(provider = %provider.name, error = %e, "transport error — failing over");
                    provider.mark_failure();
                    self.sink
                        .record_metric(&provider.name, latency_ms, 0, true, false);
                }
                Ok(response) => {
                    let status = response.status();
                    if is_failover_status(status) {
                        tracing::warn!(
                            provider = %provider.name,
                            status = status.as_u16(),
                            "failover-eligible upstream status"
                        );
                        provider.mark_failure();
                        self.sink.record_metric(
                            &provider.name,
                            latency_ms,
                            status.as_u16(),
                            true,
                            status == StatusCode::TOO_MANY_REQUESTS,
                        );
                        // Dropping the response closes its body.
                        continue;
                    }

                    provider.mark_success();
                    self.sink.record_metric(
                        &provider.name,
                        latency_ms,
                        status.as_u16(),
                        !status.is_success(),
                        false,
                    );
                    return Ok(self
                        .relay_response(response, provider, model, session_key, latency_ms, config)
                        .await);
                }
            }
        }

        Err(GatewayError::AllProvidersFailed)
    }

    /// Stream a terminal upstream response back to the client, accounting for
    /// usage once the body completes.
    async fn relay_response(
        &self,
        response: reqwest::Response,
        provider: &Provider,
        model: Option<String>,
        session_key: String,
        latency_ms: u64,
        config: &Config,
    ) -> Response<Body> {
        let status = response.status();
        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            if SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        let accountant = Accountant {
            sessions: Arc::clone(&self.sessions),
            sink: Arc::clone(&self.sink),
            pricing: config.pricing.clone(),
            session_key,
            provider: provider.name.clone(),
            model,
            latency_ms,
        };

        if is_sse {
            // Tee the stream through a bounded collector; account once the
            // final chunk has been forwarded. A client disconnect drops the
            // stream — and with it the upstream body — without accounting.
            let collector = Arc::new(Mutex::new(Vec::with_capacity(8 * 1024)));
            let tee = Arc::clone(&collector);
            let chunks = response.bytes_stream().inspect_ok(move |chunk| {
                if let Ok(mut buf) = tee.lock() {
                    let room = SSE_USAGE_COLLECT_CAP.saturating_sub(buf.len());
                    if room > 0 {
                        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
                    }
                }
            });
            let finish = futures_util::stream::once(async move {
                let collected = collector
                    .lock()
                    .map(|mut buf| std::mem::take(&mut *buf))
                    .unwrap_or_default();
                if let Some((input, output)) = extract_sse_usage(&collected) {
                    accountant.account(input, output);
                }
                Ok::<Bytes, reqwest::Error>(Bytes::new())
            });

            builder
                .body(Body::from_stream(chunks.chain(finish)))
                .unwrap_or_else(|_| bad_gateway_body())
        } else {
            match response.bytes().await {
                Ok(bytes) => {
                    if let Some((input, output)) = serde_json::from_slice::<Value>(&bytes)
                        .ok()
                        .as_ref()
                        .and_then(extract_json_usage)
                    {
                        accountant.account(input, output);
                    }
                    builder
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| bad_gateway_body())
                }
                Err(e) => {
                    tracing::warn!(provider = %accountant.provider, error = %e, "upstream body read failed");
                    GatewayError::Upstream(e.to_string()).into_response()
                }
            }
        }
    }
}

/// Post-response accounting bundle — owns everything needed after the body
/// finishes streaming.
struct Accountant {
    sessions: Arc<SessionCache>,
    sink: Arc<dyn UsageSink>,
    pricing: HashMap<String, crate::config::ModelPricing>,
    session_key: String,
    provider: String,
    model: Option<String>,
    latency_ms: u64,
}

impl Accountant {
    fn account(&self, input_tokens: u64, output_tokens: u64) {
        let cost_usd = self
            .model
            .as_deref()
            .and_then(|m| self.pricing.get(m))
            .map(|p| {
                input_tokens as f64 * p.input / 1_000_000.0
                    + output_tokens as f64 * p.output / 1_000_000.0
            })
            .unwrap_or(0.0);

        self.sessions
            .add_turn(&self.session_key, input_tokens, output_tokens, cost_usd);

        if let Some(warning) = self.sessions.context_warning(&self.session_key, None) {
            tracing::warn!(session = %self.session_key, "{warning}");
        }

        let state = self.sessions.get(&self.session_key);
        self.sink.record_usage(UsageRecord {
            timestamp: chrono::Utc::now(),
            session: self.session_key.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            input_tokens,
            output_tokens,
            cost_usd,
            latency_ms: self.latency_ms,
            project_path: state.as_ref().and_then(|s| s.project_path.clone()),
            client_type: state.as_ref().and_then(|s| s.client_type.clone()),
        });
    }
}

/// 429 and every 5xx fail over; everything else is terminal.
fn is_failover_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Rewrite the body's `model` field. Non-JSON and non-object bodies pass
/// through untouched; other keys survive canonical re-serialization.
pub(crate) fn inject_model(body: &[u8], model: &str) -> Bytes {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut map)) => {
            map.insert("model".to_string(), Value::String(model.to_string()));
            match serde_json::to_vec(&Value::Object(map)) {
                Ok(rewritten) => Bytes::from(rewritten),
                Err(_) => Bytes::copy_from_slice(body),
            }
        }
        _ => Bytes::copy_from_slice(body),
    }
}

/// Join the provider base URL and the forwarded path with exactly one slash,
/// reattaching the verbatim query string.
pub(crate) fn join_url(base: &str, remainder: &str, query: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let path = remainder.trim_start_matches('/');
    let mut url = if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    };
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Copy inbound headers minus per-hop and auth concerns, then stamp the
/// provider's credentials and the rewritten body length.
pub(crate) fn outbound_headers(
    inbound: &HeaderMap,
    token: Option<&str>,
    body_len: usize,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 3);
    for (name, value) in inbound {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(token) = token {
        match HeaderValue::from_str(token) {
            Ok(value) => {
                headers.insert("x-api-key", value);
            }
            Err(_) => tracing::warn!("provider token contains invalid header characters"),
        }
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(header::AUTHORIZATION, value);
        }
    }

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len as u64));
    headers
}

/// Usage from a buffered JSON response body. Accepts both Anthropic
/// (`input_tokens`/`output_tokens`) and OpenAI (`prompt_tokens`/
/// `completion_tokens`) field names.
fn extract_json_usage(body: &Value) -> Option<(u64, u64)> {
    let usage = body.get("usage")?;
    let input = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_u64);
    let output = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_u64);
    match (input, output) {
        (None, None) => None,
        (input, output) => Some((input.unwrap_or(0), output.unwrap_or(0))),
    }
}

/// Usage from collected SSE bytes. Anthropic streams report input tokens in
/// `message_start` and final output tokens in `message_delta`; taking the
/// maximum seen per field covers both, plus OpenAI-style final usage chunks.
fn extract_sse_usage(collected: &[u8]) -> Option<(u64, u64)> {
    let text = String::from_utf8_lossy(collected);
    let mut input: Option<u64> = None;
    let mut output: Option<u64> = None;

    for line in text.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
            continue;
        };
        let usages = [
            event.get("usage"),
            event.get("message").and_then(|m| m.get("usage")),
        ];
        for usage in usages.into_iter().flatten() {
            for field in ["input_tokens", "prompt_tokens"] {
                if let Some(n) = usage.get(field).and_then(Value::as_u64) {
                    input = Some(input.map_or(n, |prev| prev.max(n)));
                }
            }
            for field in ["output_tokens", "completion_tokens"] {
                if let Some(n) = usage.get(field).and_then(Value::as_u64) {
                    output = Some(output.map_or(n, |prev| prev.max(n)));
                }
            }
        }
    }

    match (input, output) {
        (None, None) => None,
        (input, output) => Some((input.unwrap_or(0), output.unwrap_or(0))),
    }
}

fn bad_gateway_body() -> Response<Body> {
    let mut response = Response::new(Body::from(
        serde_json::json!({
            "error": { "type": "upstream_error", "message": "failed to relay upstream response" }
        })
        .to_string(),
    ));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
