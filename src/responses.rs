//! Chat-Completions → Responses-API request translation and background
//! launch. Background generations return a `resp_`-prefixed id that the
//! polling workers track to completion.

use std::time::Duration;

use futures_util::StreamExt;
use eventsource_stream::Eventsource;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::router::ResolvedEndpoint;

/// Provider response ids carry this literal prefix.
pub const RESPONSE_ID_PREFIX: &str = "resp_";

/// Maximum time to wait for launch response headers.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Internal fields never forwarded upstream.
const INTERNAL_FIELDS: &[&str] = &["chatId", "messageId", "encrypt"];

/// Sampling params the Responses API rejects.
const UNSUPPORTED_SAMPLING: &[&str] = &[
    "temperature",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "n",
];

/// Translate a Chat-Completions-shaped body into a background Responses-API
/// request: strip internal and unsupported fields, rename `messages` →
/// `input` and the token/reasoning fields, force `store` + `background`.
pub fn translate_to_responses(body: &Value, previous_response_id: Option<&str>) -> Value {
    let mut out = body.clone();
    let Some(obj) = out.as_object_mut() else {
        return out;
    };

    for field in INTERNAL_FIELDS {
        obj.remove(*field);
    }
    obj.remove("stream");
    obj.remove("stream_options");
    for field in UNSUPPORTED_SAMPLING {
        obj.remove(*field);
    }

    if let Some(messages) = obj.remove("messages") {
        obj.insert("input".to_string(), messages);
    }
    if let Some(effort) = obj.remove("reasoning_effort") {
        obj.insert("reasoning".to_string(), json!({ "effort": effort }));
    }
    let max_tokens = obj
        .remove("max_completion_tokens")
        .or_else(|| obj.remove("max_tokens"));
    if let Some(max) = max_tokens {
        obj.insert("max_output_tokens".to_string(), max);
    }

    obj.insert("store".to_string(), Value::Bool(true));
    obj.insert("background".to_string(), Value::Bool(true));
    if let Some(prev) = previous_response_id {
        obj.insert("previous_response_id".to_string(), prev.into());
    }
    if !obj.contains_key("reasoning") {
        obj.insert("reasoning".to_string(), json!({ "effort": "high" }));
    }
    out
}

/// Pull a `resp_`-prefixed id out of one SSE data payload (with or without
/// the `data: ` prefix).
pub fn extract_response_id(payload: &str) -> Option<String> {
    let data = payload.strip_prefix("data: ").unwrap_or(payload);
    let value: Value = serde_json::from_str(data).ok()?;
    let id = value.get("id")?.as_str()?;
    id.starts_with(RESPONSE_ID_PREFIX).then(|| id.to_string())
}

/// The `POST /v1/responses` URL for an endpoint base.
pub fn responses_base_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/responses") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/responses")
    } else {
        format!("{base}/v1/responses")
    }
}

/// The `GET /v1/responses/{id}` URL for an endpoint base.
pub fn responses_poll_url(base_url: &str, response_id: &str) -> String {
    format!("{}/{response_id}", responses_base_url(base_url))
}

/// Launch a background generation and return its response id. Providers
/// answer either with an SSE stream (id in the first data chunk) or a plain
/// JSON body.
pub async fn launch_background(
    client: &reqwest::Client,
    endpoint: &ResolvedEndpoint,
    body: &Value,
) -> Result<String, GatewayError> {
    let url = responses_base_url(&endpoint.base_url);
    let send = client
        .post(&url)
        .bearer_auth(&endpoint.credential)
        .header("Content-Type", "application/json")
        .json(body)
        .send();

    let response = tokio::time::timeout(LAUNCH_TIMEOUT, send)
        .await
        .map_err(|_| GatewayError::Timeout(LAUNCH_TIMEOUT.as_millis() as u64))??;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let excerpt: String = text.chars().take(500).collect();
        return Err(GatewayError::UpstreamUnavailable {
            provider: endpoint.provider.clone(),
            message: format!("background launch failed with {status}: {excerpt}"),
        });
    }

    let is_sse = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    if is_sse {
        let mut stream = response.bytes_stream().eventsource();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ev) => {
                    if ev.data == "[DONE]" {
                        break;
                    }
                    if let Some(id) = extract_response_id(&ev.data) {
                        return Ok(id);
                    }
                }
                Err(e) => {
                    return Err(GatewayError::UpstreamProtocol {
                        provider: endpoint.provider.clone(),
                        message: format!("launch stream error: {e}"),
                    })
                }
            }
        }
        return Err(GatewayError::UpstreamProtocol {
            provider: endpoint.provider.clone(),
            message: "launch stream carried no response id".to_string(),
        });
    }

    let value: Value = response.json().await?;
    match value.get("id").and_then(Value::as_str) {
        Some(id) if id.starts_with(RESPONSE_ID_PREFIX) => Ok(id.to_string()),
        Some(id) => Err(GatewayError::UpstreamProtocol {
            provider: endpoint.provider.clone(),
            message: format!("launch returned malformed response id: {id}"),
        }),
        None => Err(GatewayError::UpstreamProtocol {
            provider: endpoint.provider.clone(),
            message: "launch response missing 'id'".to_string(),
        }),
    }
}
