//! Daemon introspection and temp-profile management.
//!
//! These routes live on the same listener as the proxy path but sit in the
//! axum route table, so they match before the profile-path fallback. Secrets
//! never appear in any response — provider views show the env var name, not
//! its resolved value.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    config::TempProfile,
    error::GatewayError,
    route::Gateway,
};

/// Routes mounted ahead of the proxy fallback.
pub fn router() -> Router<Arc<Gateway>> {
    Router::new()
        .route("/api/v1/daemon/status", get(daemon_status))
        .route("/api/v1/daemon/sessions", get(daemon_sessions))
        .route("/api/v1/daemon/reload", post(daemon_reload))
        .route("/api/v1/profiles/temp", post(temp_create))
        .route(
            "/api/v1/profiles/temp/{id}",
            get(temp_get).delete(temp_delete),
        )
}

/// GET /api/v1/daemon/status — uptime, config shape, and sink aggregates.
async fn daemon_status(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let config = gateway.config();
    let totals = gateway.sink.totals();

    let budgets: Vec<Value> = config
        .budgets
        .iter()
        .map(|(period, budget)| {
            let spent = gateway.sink.cost_since(period.window());
            json!({
                "period": period.to_string(),
                "limit_usd": budget.limit_usd,
                "spent_usd": spent,
                "action": budget.action,
                "exceeded": spent >= budget.limit_usd,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "uptime_secs": gateway.started_at.elapsed().as_secs(),
        "strategy": config.gateway.strategy.to_string(),
        "profiles": config.profiles.len(),
        "temp_profiles": gateway.temp_profiles.len(),
        "providers": config.providers.len(),
        "active_pipelines": gateway.pipeline_count(),
        "sessions": gateway.sessions.len(),
        "requests": {
            "total": totals.total_requests,
            "input_tokens": totals.total_input_tokens,
            "output_tokens": totals.total_output_tokens,
            "cost_usd": totals.total_cost_usd,
            "avg_latency_ms": totals.avg_latency_ms,
        },
        "budgets": budgets,
    }))
}

/// GET /api/v1/daemon/sessions — per-session insights.
async fn daemon_sessions(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    let sessions: Vec<Value> = gateway
        .sessions
        .insights()
        .into_iter()
        .map(|(key, insight)| {
            let warning = gateway.sessions.context_warning(&key, None);
            json!({
                "session": key,
                "profile": insight.profile,
                "client_type": insight.client_type,
                "project_path": insight.project_path,
                "input_tokens": insight.input_tokens,
                "output_tokens": insight.output_tokens,
                "total_cost_usd": insight.total_cost_usd,
                "turn_count": insight.turn_count,
                "avg_output_tokens_per_turn": insight.avg_output_tokens_per_turn,
                "avg_cost_per_turn_usd": insight.avg_cost_per_turn_usd,
                "elapsed_secs": insight.elapsed_secs,
                "context_warning": warning,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions }))
}

/// POST /api/v1/daemon/reload — re-read the config file and swap it in.
async fn daemon_reload(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<Value>, GatewayError> {
    gateway.reload_from_disk()?;
    tracing::info!(path = %gateway.config_path.display(), "config reloaded via admin API");
    Ok(Json(json!({ "status": "reloaded" })))
}

/// POST /api/v1/profiles/temp — create a volatile profile, returning its id.
async fn temp_create(
    State(gateway): State<Arc<Gateway>>,
    Json(profile): Json<TempProfile>,
) -> impl IntoResponse {
    let id = gateway.temp_profiles.create(profile);
    tracing::info!(%id, "temp profile created");
    (StatusCode::CREATED, Json(json!({ "id": id })))
}

/// GET /api/v1/profiles/temp/{id}
async fn temp_get(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let profile = gateway
        .temp_profiles
        .get(&id)
        .ok_or(GatewayError::TempProfileNotFound(id.clone()))?;
    Ok(Json(json!({ "id": id, "profile": profile })))
}

/// DELETE /api/v1/profiles/temp/{id}
async fn temp_delete(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    gateway
        .temp_profiles
        .remove(&id)
        .ok_or(GatewayError::TempProfileNotFound(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::route::app;

    fn gateway() -> Arc<Gateway> {
        Arc::new(Gateway::new(
            Arc::new(Config::default()),
            PathBuf::from("/nonexistent.toml"),
        ))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_routed_before_the_profile_parse() {
        let response = app(gateway())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn daemon_status_reports_shape_and_uptime() {
        let gw = gateway();
        gw.sessions.register("default:a", "default", None, None);

        let response = app(gw)
            .oneshot(Request::get("/api/v1/daemon/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["strategy"], "failover");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["active_pipelines"], 0);
    }

    #[tokio::test]
    async fn daemon_sessions_lists_registered_sessions() {
        let gw = gateway();
        gw.sessions
            .register("work:abc", "work", Some("claude-cli".into()), None);
        gw.sessions.add_turn("work:abc", 1_000, 50, 0.01);

        let response = app(gw)
            .oneshot(Request::get("/api/v1/daemon/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;

        let sessions = body["sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["session"], "work:abc");
        assert_eq!(sessions[0]["profile"], "work");
        assert_eq!(sessions[0]["input_tokens"], 1_000);
        assert_eq!(sessions[0]["turn_count"], 1);
    }

    #[tokio::test]
    async fn reload_with_missing_file_reports_internal_error() {
        let response = app(gateway())
            .oneshot(
                Request::post("/api/v1/daemon/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"]["type"], "internal");
    }

    #[tokio::test]
    async fn temp_profile_create_get_delete_lifecycle() {
        let gw = gateway();
        let application = app(Arc::clone(&gw));

        // Create
        let response = application
            .clone()
            .oneshot(
                Request::post("/api/v1/profiles/temp")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"providers":["main"],"format":"anthropic"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("_tmp_"));

        // Get
        let response = application
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/profiles/temp/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["profile"]["providers"][0], "main");

        // Delete
        let response = application
            .clone()
            .oneshot(
                Request::delete(format!("/api/v1/profiles/temp/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Gone
        let response = application
            .oneshot(
                Request::get(format!("/api/v1/profiles/temp/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await["error"]["type"],
            "temp_profile_not_found"
        );
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let response = app(gateway())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn caller_supplied_request_id_is_echoed() {
        let response = app(gateway())
            .oneshot(
                Request::get("/healthz")
                    .header("x-request-id", "trace-me-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "trace-me-42"
        );
    }
}
