//! Request token counting for long-context classification.
//!
//! Counts are produced with the cl100k_base BPE vocabulary via `tiktoken-rs`.
//! The encoder is built once per process (it is expensive to construct) and
//! shared. When construction fails the counter degrades to a bytes/3 estimate
//! — only long-context classification depends on counts, and that check
//! tolerates coarse numbers.
//!
//! The traversal mirrors what providers bill for: message content (plain
//! strings and text/tool-result blocks, plus a structural estimate for
//! tool-use inputs), the `system` prompt, and tool definitions including their
//! JSON schemas.

use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;

/// Flat estimate for JSON scalars (numbers, booleans, null).
const SCALAR_TOKEN_ESTIMATE: usize = 5;

/// Rough characters-per-token ratio for mixed scripts, used without an encoder.
const FALLBACK_BYTES_PER_TOKEN: usize = 3;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn shared_encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "BPE encoder unavailable — falling back to byte estimate");
                None
            }
        })
        .as_ref()
}

/// Shared token counter. Cheap to construct — the encoder behind it is
/// process-global.
#[derive(Clone, Copy)]
pub struct TokenCounter {
    bpe: Option<&'static CoreBPE>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        Self {
            bpe: shared_encoder(),
        }
    }

    /// A counter that always uses the byte estimate. Test hook.
    #[cfg(test)]
    pub(crate) fn without_encoder() -> Self {
        Self { bpe: None }
    }

    /// Token count of a plain string.
    pub fn count_text(&self, text: &str) -> usize {
        match self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len() / FALLBACK_BYTES_PER_TOKEN,
        }
    }

    /// Total input-token estimate for a messages-API request body.
    pub fn count_request(&self, body: &Value) -> usize {
        let mut total = 0;

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            for message in messages {
                if let Some(content) = message.get("content") {
                    total += self.count_message_content(content);
                }
            }
        }

        if let Some(system) = body.get("system") {
            total += self.count_message_content(system);
        }

        if let Some(tools) = body.get("tools").and_then(Value::as_array) {
            for tool in tools {
                if let Some(name) = tool.get("name").and_then(Value::as_str) {
                    total += self.count_text(name);
                }
                if let Some(desc) = tool.get("description").and_then(Value::as_str) {
                    total += self.count_text(desc);
                }
                if let Some(schema) = tool.get("input_schema") {
                    total += self.estimate_json(schema);
                }
            }
        }

        total
    }

    /// Count a `content` value: either a plain string or an array of typed
    /// blocks. Non-text blocks contribute their structured payloads only.
    fn count_message_content(&self, content: &Value) -> usize {
        match content {
            Value::String(text) => self.count_text(text),
            Value::Array(blocks) => blocks.iter().map(|b| self.count_content_block(b)).sum(),
            _ => 0,
        }
    }

    fn count_content_block(&self, block: &Value) -> usize {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => block
                .get("text")
                .and_then(Value::as_str)
                .map(|t| self.count_text(t))
                .unwrap_or(0),
            Some("tool_result") => block
                .get("content")
                .map(|c| self.count_message_content(c))
                .unwrap_or(0),
            Some("tool_use") => block
                .get("input")
                .map(|input| self.estimate_json(input))
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Structural token estimate for an arbitrary JSON value.
    ///
    /// Strings are encoded; objects cost 2 for braces plus 2 per key for
    /// delimiters; arrays cost 2 plus 1 per element; scalars are a flat 5.
    pub(crate) fn estimate_json(&self, value: &Value) -> usize {
        match value {
            Value::String(s) => self.count_text(s),
            Value::Object(map) => {
                2 + map
                    .iter()
                    .map(|(key, val)| self.count_text(key) + self.estimate_json(val) + 2)
                    .sum::<usize>()
            }
            Value::Array(items) => {
                2 + items
                    .iter()
                    .map(|item| self.estimate_json(item) + 1)
                    .sum::<usize>()
            }
            _ => SCALAR_TOKEN_ESTIMATE,
        }
    }
}
