//! Builds and opens the follow-up upstream request after a round of tool
//! execution, so the model can continue the same assistant message.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::router::ResolvedEndpoint;
use crate::tools::executor::ToolResult;
use crate::tools::AssembledToolCall;

/// Maximum time to wait for continuation response headers.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Rebuild the upstream body: original request params, with the
/// conversation extended by the assistant's tool calls and one tool-role
/// message per result.
pub fn build_continuation_body(
    original: &Value,
    calls: &[AssembledToolCall],
    results: &[ToolResult],
    tool_definitions: Option<Vec<Value>>,
) -> Value {
    let mut body = original.clone();
    let mut messages = body
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if let Some(obj) = body.as_object_mut() {
        obj.remove("messages");
        obj.remove("stream");
        obj.remove("tools");
    }

    messages.push(json!({
        "role": "assistant",
        "content": Value::Null,
        "tool_calls": calls
            .iter()
            .map(AssembledToolCall::to_message_fragment)
            .collect::<Vec<_>>(),
    }));
    for result in results {
        messages.push(json!({
            "role": "tool",
            "tool_call_id": result.tool_call_id,
            "content": result.content,
        }));
    }

    body["messages"] = Value::Array(messages);
    body["stream"] = Value::Bool(true);
    if let Some(defs) = tool_definitions
        && !defs.is_empty()
    {
        body["tools"] = Value::Array(defs);
    }
    body
}

/// The chat-completions URL for an endpoint base, appending the path only
/// when it isn't already present.
pub fn chat_completions_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

/// Open the continuation stream against the same endpoint. A non-200
/// response carries the provider body into the error.
pub async fn open_continuation(
    client: &reqwest::Client,
    endpoint: &ResolvedEndpoint,
    body: &Value,
) -> Result<reqwest::Response, GatewayError> {
    let url = chat_completions_url(&endpoint.base_url);
    let send = client
        .post(&url)
        .bearer_auth(&endpoint.credential)
        .header("Content-Type", "application/json")
        .json(body)
        .send();

    let response = tokio::time::timeout(HEADERS_TIMEOUT, send)
        .await
        .map_err(|_| GatewayError::Timeout(HEADERS_TIMEOUT.as_millis() as u64))??;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let excerpt: String = text.chars().take(500).collect();
        return Err(GatewayError::UpstreamUnavailable {
            provider: endpoint.provider.clone(),
            message: format!("continuation failed with {status}: {excerpt}"),
        });
    }
    Ok(response)
}
