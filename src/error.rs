//! Unified HTTP error type for the relay's request handlers.
//!
//! [`GatewayError`] enumerates every client-visible failure the relay can
//! produce on its own behalf. Each variant maps to a stable snake_case kind
//! and an HTTP status, and converts into the uniform wire shape
//!
//! ```json
//! { "error": { "type": "<kind>", "message": "<human>" } }
//! ```
//!
//! via [`IntoResponse`], so every handler that can fail returns
//! `Result<T, GatewayError>` and propagates with `?` — no manual `map_err`,
//! no boilerplate.
//!
//! Upstream non-2xx responses are deliberately *not* represented here: a
//! terminal upstream error is passed through to the client verbatim, body and
//! all. The `upstream_error` kind only appears when the relay accepted an
//! upstream response but could not relay its body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Client-visible gateway failure.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed routing path — not `/<profile>/<session>/<rest>`.
    #[error("{0}")]
    InvalidPath(String),

    /// The named profile is absent from the active config snapshot.
    #[error("profile `{0}` is not configured")]
    ProfileNotFound(String),

    /// The profile resolved but its provider list is empty.
    #[error("profile `{0}` has no providers")]
    NoProviders(String),

    /// A `_tmp_` profile name missed the temporary-profile store.
    #[error("temporary profile `{0}` does not exist")]
    TempProfileNotFound(String),

    /// Every provider in the pool failed with a failover-eligible error.
    #[error("all providers failed for this request")]
    AllProvidersFailed,

    /// An upstream response was accepted but its body could not be relayed.
    #[error("upstream response could not be read: {0}")]
    Upstream(String),

    /// Anything else — surfaced as a 500 without leaking internals.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    /// Stable machine-readable kind, part of the wire contract.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPath(_) => "invalid_path",
            Self::ProfileNotFound(_) => "profile_not_found",
            Self::NoProviders(_) => "no_providers",
            Self::TempProfileNotFound(_) => "temp_profile_not_found",
            Self::AllProvidersFailed => "all_providers_failed",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::ProfileNotFound(_) | Self::NoProviders(_) | Self::TempProfileNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::AllProvidersFailed | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        tracing::warn!(kind = self.kind(), error = %self, "request failed");
        (
            self.status(),
            Json(json!({ "error": { "type": self.kind(), "message": self.to_string() } })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_snake_case_and_stable() {
        let cases: Vec<(GatewayError, &str, StatusCode)> = vec![
            (
                GatewayError::InvalidPath("bad".into()),
                "invalid_path",
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::ProfileNotFound("p".into()),
                "profile_not_found",
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::NoProviders("p".into()),
                "no_providers",
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::TempProfileNotFound("_tmp_x".into()),
                "temp_profile_not_found",
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::AllProvidersFailed,
                "all_providers_failed",
                StatusCode::BAD_GATEWAY,
            ),
            (
                GatewayError::Upstream("eof".into()),
                "upstream_error",
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, kind, status) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.status(), status);
        }
    }

    #[tokio::test]
    async fn response_body_matches_wire_shape() {
        let resp = GatewayError::ProfileNotFound("work".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "profile_not_found");
        assert!(body["error"]["message"].as_str().unwrap().contains("work"));
    }
}
