//! Shape-aware content and usage extraction for the provider payloads the
//! gateway sees: Chat-Completions SSE deltas, Responses-API output arrays,
//! and the non-streaming fallbacks of both.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::chunk::StreamChunk;

/// Token usage as streamed (or returned) by providers. Some providers emit
/// usage in an intermediate chunk; the last record seen wins.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Pull a usage record out of a parsed SSE payload, if present.
pub fn scan_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    serde_json::from_value(usage.clone()).ok()
}

/// The `choices[0].delta.content` fragment of a Chat-Completions SSE payload.
pub fn chat_delta_content(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

/// Concatenate every delta-content fragment in a session buffer, skipping
/// error chunks and the `[DONE]` sentinel.
pub fn buffered_content(chunks: &[Arc<StreamChunk>]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        if chunk.is_error || chunk.is_final {
            continue;
        }
        if let Some(value) = chunk.data_json()
            && let Some(fragment) = chat_delta_content(&value)
        {
            out.push_str(fragment);
        }
    }
    out
}

/// Responses-API shape: walk `output[]` for `message` items and concatenate
/// the `text` of their `output_text` content parts.
pub fn responses_output_text(body: &Value) -> Option<String> {
    let output = body.get("output")?.as_array()?;
    let mut text = String::new();
    let mut found = false;
    for item in output {
        if item.get("type").and_then(Value::as_str) != Some("message") {
            continue;
        }
        let Some(parts) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in parts {
            if part.get("type").and_then(Value::as_str) == Some("output_text")
                && let Some(t) = part.get("text").and_then(Value::as_str)
            {
                text.push_str(t);
                found = true;
            }
        }
    }
    found.then_some(text)
}

/// Extract the final content of a completed response body: Responses format
/// first, then the Chat-Completions message and delta shapes.
pub fn completion_content(body: &Value) -> Option<String> {
    if let Some(text) = responses_output_text(body) {
        return Some(text);
    }
    let first_choice = body.get("choices")?.get(0)?;
    if let Some(content) = first_choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
    {
        return Some(content.to_string());
    }
    first_choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
