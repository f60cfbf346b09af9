//! Request scenario classification.
//!
//! Every request is classified into exactly one [`Scenario`], which decides
//! which upstream model a provider injects into the forwarded body. Predicates
//! are checked in a fixed priority order — the first match wins:
//!
//! 1. **web_search** — any `tools[]` entry whose `type` starts with `web_search`
//! 2. **think** — `thinking` is `true` or `{ "type": "enabled", … }`
//! 3. **image** — any message carries a content block of `type: "image"`
//! 4. **long_context** — the request's token count meets the threshold, or the
//!    session-continuation rule fires (see [`is_long_context`])
//! 5. **background** — the `model` field names a Claude Haiku variant
//! 6. **default** — everything else
//!
//! The long-context check is the only stateful one: it consults the
//! [`SessionCache`] so that a conversation that crossed the threshold once
//! keeps its long-context model even after the client compacts the transcript
//! down below the threshold.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{session::SessionCache, tokens::TokenCounter};

/// Default long-context threshold in tokens, overridable via config.
pub const DEFAULT_LONG_CONTEXT_THRESHOLD: usize = 32_000;

/// A drop below this fraction of the previous turn's input suggests the user
/// cleared the conversation rather than compacted it.
const CONTEXT_CLEAR_RATIO: f64 = 0.20;

/// Floor for the continuation rule: below this many tokens a small request is
/// never treated as the continuation of a long conversation, and above it a
/// shrunken request still inherits long-context treatment.
const CONTINUATION_MIN_TOKENS: usize = 5_000;

/// Prefix of the session handle clients embed in `metadata.user_id`.
const METADATA_SESSION_PREFIX: &str = "user_session_";

/// Request classification — selects the per-provider model override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    #[default]
    Default,
    LongContext,
    Think,
    Image,
    WebSearch,
    Background,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Default => "default",
            Self::LongContext => "long_context",
            Self::Think => "think",
            Self::Image => "image",
            Self::WebSearch => "web_search",
            Self::Background => "background",
        })
    }
}

/// Classify a parsed request body. `session_key` enables the continuation
/// rule; pass `None` for stateless classification.
pub fn classify(
    body: &Value,
    session_key: Option<&str>,
    sessions: &SessionCache,
    counter: &TokenCounter,
    threshold: usize,
) -> Scenario {
    if has_web_search_tool(body) {
        return Scenario::WebSearch;
    }
    if thinking_enabled(body) {
        return Scenario::Think;
    }
    if has_image_block(body) {
        return Scenario::Image;
    }
    if is_long_context(body, session_key, sessions, counter, threshold) {
        return Scenario::LongContext;
    }
    if is_background_model(body) {
        return Scenario::Background;
    }
    Scenario::Default
}

/// Extract the session key clients embed in `metadata.user_id`.
///
/// The documented format is `user_session_<id>`; anything else is treated as
/// no session. The returned key is scoped to the profile so two profiles never
/// share token accounting for the same client-side id.
pub fn session_key_from_metadata(body: &Value, profile: &str) -> Option<String> {
    body.get("metadata")?
        .get("user_id")?
        .as_str()?
        .strip_prefix(METADATA_SESSION_PREFIX)
        .filter(|id| !id.is_empty())
        .map(|id| format!("{profile}:{id}"))
}

fn has_web_search_tool(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools.iter().any(|t| {
                t.get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|ty| ty.starts_with("web_search"))
            })
        })
        .unwrap_or(false)
}

fn thinking_enabled(body: &Value) -> bool {
    match body.get("thinking") {
        Some(Value::Bool(enabled)) => *enabled,
        Some(Value::Object(obj)) => obj.get("type").and_then(Value::as_str) == Some("enabled"),
        _ => false,
    }
}

fn has_image_block(body: &Value) -> bool {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages.iter().any(|msg| {
                msg.get("content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .any(|b| b.get("type").and_then(Value::as_str) == Some("image"))
                    })
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn is_background_model(body: &Value) -> bool {
    body.get("model")
        .and_then(Value::as_str)
        .map(|m| {
            let lower = m.to_lowercase();
            lower.contains("claude") && lower.contains("haiku")
        })
        .unwrap_or(false)
}

/// Long-context decision with the session-continuation rule.
///
/// With a prior input count `L` on record and a current count `C`:
/// - `C < 0.20 × L` and `C < 5 000` — the user evidently started over; the
///   cached session state is cleared and `C` alone decides.
/// - `L > threshold` and `C > 5 000` — the conversation already went long and
///   was compacted; keep classifying it long so the model stays consistent.
fn is_long_context(
    body: &Value,
    session_key: Option<&str>,
    sessions: &SessionCache,
    counter: &TokenCounter,
    threshold: usize,
) -> bool {
    let current = counter.count_request(body);

    if let Some(key) = session_key {
        if let Some(prior) = sessions.get(key) {
            let prior_input = prior.input_tokens as usize;
            if prior_input > 0 {
                let cleared = (current as f64) < CONTEXT_CLEAR_RATIO * prior_input as f64
                    && current < CONTINUATION_MIN_TOKENS;
                if cleared {
                    tracing::debug!(session = key, "context reset detected — clearing session state");
                    sessions.clear(key);
                } else if prior_input > threshold && current > CONTINUATION_MIN_TOKENS {
                    return true;
                }
            }
        }
    }

    current >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> TokenCounter {
        TokenCounter::new()
    }

    fn sessions() -> SessionCache {
        SessionCache::new(16)
    }

    fn classify_stateless(body: &Value) -> Scenario {
        classify(body, None, &sessions(), &counter(), DEFAULT_LONG_CONTEXT_THRESHOLD)
    }

    // -----------------------------------------------------------------------
    // Individual predicates
    // -----------------------------------------------------------------------

    #[test]
    fn web_search_tool_type_prefix_matches() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "tools": [{ "type": "web_search_20250305", "name": "web_search" }],
            "messages": [{ "role": "user", "content": "look this up" }],
        });
        assert_eq!(classify_stateless(&body), Scenario::WebSearch);
    }

    #[test]
    fn plain_function_tools_do_not_classify_as_web_search() {
        let body = json!({
            "tools": [{ "type": "custom", "name": "calculator" }],
            "messages": [{ "role": "user", "content": "2+2" }],
        });
        assert_eq!(classify_stateless(&body), Scenario::Default);
    }

    #[test]
    fn thinking_boolean_true_classifies_as_think() {
        let body = json!({ "thinking": true, "messages": [] });
        assert_eq!(classify_stateless(&body), Scenario::Think);
    }

    #[test]
    fn thinking_enabled_object_classifies_as_think() {
        let body = json!({
            "thinking": { "type": "enabled", "budget_tokens": 2048 },
            "messages": [],
        });
        assert_eq!(classify_stateless(&body), Scenario::Think);
    }

    #[test]
    fn thinking_disabled_object_is_not_think() {
        let body = json!({ "thinking": { "type": "disabled" }, "messages": [] });
        assert_eq!(classify_stateless(&body), Scenario::Default);
    }

    #[test]
    fn image_content_block_classifies_as_image() {
        let body = json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "what is in this picture?" },
                    { "type": "image", "source": { "type": "base64", "data": "aGk=" } },
                ],
            }],
        });
        assert_eq!(classify_stateless(&body), Scenario::Image);
    }

    #[test]
    fn haiku_model_classifies_as_background() {
        let body = json!({
            "model": "claude-haiku-4-5-20251001",
            "messages": [{ "role": "user", "content": "summarize" }],
        });
        assert_eq!(classify_stateless(&body), Scenario::Background);
    }

    #[test]
    fn background_match_is_case_insensitive() {
        let body = json!({ "model": "Claude-HAIKU-x", "messages": [] });
        assert_eq!(classify_stateless(&body), Scenario::Background);
    }

    #[test]
    fn long_body_classifies_as_long_context() {
        // ~40k tokens of text comfortably clears the 32k default threshold.
        let text = "lorem ipsum dolor sit amet ".repeat(30_000);
        let body = json!({ "messages": [{ "role": "user", "content": text }] });
        assert_eq!(classify_stateless(&body), Scenario::LongContext);
    }

    // -----------------------------------------------------------------------
    // Priority order
    // -----------------------------------------------------------------------

    #[test]
    fn web_search_wins_over_think_and_image() {
        let body = json!({
            "thinking": true,
            "tools": [{ "type": "web_search_20250305" }],
            "messages": [{
                "role": "user",
                "content": [{ "type": "image", "source": {} }],
            }],
        });
        assert_eq!(classify_stateless(&body), Scenario::WebSearch);
    }

    #[test]
    fn think_wins_over_image_and_background() {
        let body = json!({
            "model": "claude-haiku-4-5",
            "thinking": { "type": "enabled" },
            "messages": [{
                "role": "user",
                "content": [{ "type": "image", "source": {} }],
            }],
        });
        assert_eq!(classify_stateless(&body), Scenario::Think);
    }

    #[test]
    fn long_context_wins_over_background() {
        let text = "a very long conversation transcript ".repeat(25_000);
        let body = json!({
            "model": "claude-haiku-4-5",
            "messages": [{ "role": "user", "content": text }],
        });
        assert_eq!(classify_stateless(&body), Scenario::LongContext);
    }

    // -----------------------------------------------------------------------
    // Session-continuation rule
    // -----------------------------------------------------------------------

    fn small_body() -> Value {
        // Roughly 6k tokens — above the continuation floor, below the threshold.
        let text = "continuing the conversation where we left off ".repeat(800);
        json!({ "messages": [{ "role": "user", "content": text }] })
    }

    #[test]
    fn compacted_continuation_of_long_session_stays_long_context() {
        let cache = sessions();
        let key = "default:abc";
        cache.register(key, "default", None, None);
        cache.add_turn(key, 80_000, 500, 0.1);

        let got = classify(&small_body(), Some(key), &cache, &counter(), 32_000);
        assert_eq!(got, Scenario::LongContext);
    }

    #[test]
    fn tiny_request_after_long_session_clears_state() {
        let cache = sessions();
        let key = "default:abc";
        cache.register(key, "default", None, None);
        cache.add_turn(key, 80_000, 500, 0.1);

        let body = json!({ "messages": [{ "role": "user", "content": "hi again" }] });
        let got = classify(&body, Some(key), &cache, &counter(), 32_000);
        assert_eq!(got, Scenario::Default);
        assert!(cache.get(key).is_none(), "session state must be cleared");
    }

    #[test]
    fn continuation_rule_ignored_without_session_key() {
        let got = classify(&small_body(), None, &sessions(), &counter(), 32_000);
        assert_eq!(got, Scenario::Default);
    }

    #[test]
    fn short_prior_session_does_not_trigger_continuation() {
        let cache = sessions();
        let key = "default:short";
        cache.register(key, "default", None, None);
        cache.add_turn(key, 10_000, 100, 0.01);

        let got = classify(&small_body(), Some(key), &cache, &counter(), 32_000);
        assert_eq!(got, Scenario::Default);
    }

    // -----------------------------------------------------------------------
    // Session key extraction
    // -----------------------------------------------------------------------

    #[test]
    fn metadata_session_key_parses_documented_format() {
        let body = json!({ "metadata": { "user_id": "user_session_deadbeef" } });
        assert_eq!(
            session_key_from_metadata(&body, "work").as_deref(),
            Some("work:deadbeef")
        );
    }

    #[test]
    fn metadata_session_key_rejects_other_formats() {
        for user_id in ["deadbeef", "session_deadbeef", "user_session_", ""] {
            let body = json!({ "metadata": { "user_id": user_id } });
            assert_eq!(session_key_from_metadata(&body, "work"), None, "{user_id:?}");
        }
        assert_eq!(session_key_from_metadata(&json!({}), "work"), None);
    }

    #[test]
    fn scenario_deserializes_from_snake_case() {
        let s: Scenario = serde_json::from_str("\"long_context\"").unwrap();
        assert_eq!(s, Scenario::LongContext);
        let s: Scenario = serde_json::from_str("\"web_search\"").unwrap();
        assert_eq!(s, Scenario::WebSearch);
    }
}
