//! The chat-completions entry point: route the model, open the upstream,
//! attach (or join) the stream session, and forward its chunks as SSE.
//! Responses-flavored endpoints take the background path instead.

use std::convert::Infallible;
use std::time::{Duration, SystemTime};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::http::{header_value, ApiError, AppState};
use crate::persist::{
    epoch_millis, EncryptionPreference, GenerationState, StoredMessage,
};
use crate::poller::PollingJob;
use crate::responses;
use crate::router::{ApiFlavor, ResolvedEndpoint};
use crate::stream::session::UpstreamOrigin;
use crate::stream::subscriber::{
    SubscribeOptions, Subscription, DEFAULT_SUBSCRIBER_BUFFER,
};
use crate::tools::continuation;

/// Maximum time to wait for upstream response headers.
const UPSTREAM_HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

struct RequestIds {
    user_id: String,
    chat_id: String,
    message_id: String,
    model: String,
    encryption: EncryptionPreference,
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| bad_request("model is required"))?
        .to_string();
    let has_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .is_some_and(|m| !m.is_empty());
    if !has_messages {
        return Err(bad_request("messages must be a non-empty array"));
    }
    let user_id = header_value(&headers, "x-user-id")
        .ok_or_else(|| bad_request("missing x-user-id header"))?;
    let platform = header_value(&headers, "x-platform").unwrap_or_default();
    let chat_id = body
        .get("chatId")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| bad_request("chatId is required"))?
        .to_string();
    let message_id = body
        .get("messageId")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let encryption = match body.get("encrypt").and_then(Value::as_bool) {
        Some(true) => EncryptionPreference::Require,
        Some(false) => EncryptionPreference::Forbid,
        None => EncryptionPreference::Unspecified,
    };

    let endpoint = state.router.route(&model, &platform)?;
    let ids = RequestIds {
        user_id,
        chat_id,
        message_id,
        model,
        encryption,
    };

    match endpoint.api_flavor {
        ApiFlavor::Responses => background(state, endpoint, body, ids).await,
        ApiFlavor::ChatCompletions => streaming(state, endpoint, body, ids).await,
    }
}

async fn streaming(
    state: AppState,
    endpoint: ResolvedEndpoint,
    body: Value,
    ids: RequestIds,
) -> Result<Response, ApiError> {
    let (session, created) = state
        .manager
        .get_or_create(&ids.chat_id, &ids.message_id)
        .await;

    // subscribe before attaching so the creator misses nothing; joiners of
    // an existing session replay from the start
    let buffer = body
        .get("bufferSize")
        .and_then(Value::as_u64)
        .map(|b| b as usize)
        .unwrap_or(DEFAULT_SUBSCRIBER_BUFFER);
    let subscription = session
        .subscribe(SubscribeOptions {
            replay_from_start: !created,
            buffer_size: buffer,
        })
        .await;

    if created {
        let upstream_body = rewrite_for_upstream(&body, &state, &endpoint);
        let url = continuation::chat_completions_url(&endpoint.base_url);
        let send = state
            .client
            .post(&url)
            .bearer_auth(&endpoint.credential)
            .header("Content-Type", "application/json")
            .json(&upstream_body)
            .send();

        let response = match tokio::time::timeout(UPSTREAM_HEADERS_TIMEOUT, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp,
            Ok(Ok(resp)) => {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                let excerpt: String = text.chars().take(500).collect();
                let err = GatewayError::UpstreamUnavailable {
                    provider: endpoint.provider.clone(),
                    message: format!("{status}: {excerpt}"),
                };
                session.fail(&err.user_message()).await;
                return Err(err.into());
            }
            Ok(Err(e)) => {
                session.fail("failed to reach provider").await;
                return Err(GatewayError::from(e).into());
            }
            Err(_) => {
                session.fail("provider connection timed out").await;
                return Err(GatewayError::Timeout(
                    UPSTREAM_HEADERS_TIMEOUT.as_millis() as u64,
                )
                .into());
            }
        };

        let origin = UpstreamOrigin {
            endpoint: endpoint.clone(),
            model: ids.model.clone(),
            request_body: upstream_body,
        };
        let tools = state
            .tools
            .supports_tools()
            .then(|| state.tools.clone());
        session
            .attach_upstream(response, origin, tools, state.client.clone())
            .await;

        // persistence hook: the owning handler queues the completed message
        let manager = state.manager.clone();
        let watched = session.clone();
        let user_id = ids.user_id.clone();
        let encryption = ids.encryption;
        tokio::spawn(async move {
            watched.wait_completed().await;
            if let Err(e) = manager.save_completed(&watched, &user_id, encryption).await {
                tracing::error!(
                    chat_id = %watched.chat_id,
                    message_id = %watched.message_id,
                    "completed message enqueue failed: {e}"
                );
            }
        });
    } else {
        tracing::debug!(
            chat_id = %ids.chat_id,
            message_id = %ids.message_id,
            "joined existing stream session"
        );
    }

    Ok(sse_response(subscription))
}

/// Strip gateway-internal fields and pin the upstream model and streaming
/// options.
fn rewrite_for_upstream(body: &Value, state: &AppState, endpoint: &ResolvedEndpoint) -> Value {
    let mut out = body.clone();
    if let Some(obj) = out.as_object_mut() {
        obj.remove("chatId");
        obj.remove("messageId");
        obj.remove("encrypt");
        obj.remove("bufferSize");
        obj.insert("model".to_string(), endpoint.upstream_model.clone().into());
        obj.insert("stream".to_string(), Value::Bool(true));
        if !obj.contains_key("stream_options") {
            obj.insert(
                "stream_options".to_string(),
                json!({ "include_usage": true }),
            );
        }
        if state.tools.supports_tools() && !obj.contains_key("tools") {
            obj.insert("tools".to_string(), Value::Array(state.tools.definitions()));
        }
    }
    out
}

fn sse_response(subscription: Subscription) -> Response {
    let events = stream::unfold(subscription, |mut sub| async move {
        let chunk = sub.next().await?;
        let data = chunk
            .payload
            .strip_prefix("data: ")
            .unwrap_or(&chunk.payload)
            .to_string();
        Some((Ok::<Event, Infallible>(Event::default().data(data)), sub))
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// Background path: translate, launch, record the response id, seed the
/// `thinking` message, and hand the id to the polling supervisor. The client
/// gets a short acknowledgement stream.
async fn background(
    state: AppState,
    endpoint: ResolvedEndpoint,
    body: Value,
    ids: RequestIds,
) -> Result<Response, ApiError> {
    let previous = match state
        .store
        .get_chat_last_response_id(&ids.user_id, &ids.chat_id)
        .await
    {
        Ok(prev) => prev,
        Err(e) => {
            tracing::warn!(chat_id = %ids.chat_id, "previous response id lookup failed: {e}");
            None
        }
    };

    let mut translated = responses::translate_to_responses(&body, previous.as_deref());
    translated["model"] = endpoint.upstream_model.clone().into();

    let response_id =
        responses::launch_background(&state.client, &endpoint, &translated).await?;

    // record for future continuations; the client owns chat creation
    let now = epoch_millis(SystemTime::now());
    match state
        .store
        .update_chat(
            &ids.user_id,
            &ids.chat_id,
            json!({ "lastResponseId": response_id, "updatedAt": now }),
        )
        .await
    {
        Ok(()) | Err(GatewayError::NotFound(_)) => {}
        Err(e) => tracing::warn!(chat_id = %ids.chat_id, "lastResponseId write failed: {e}"),
    }

    // seed the assistant message so polling state updates have a document
    state
        .writer
        .store_async(StoredMessage {
            user_id: ids.user_id.clone(),
            chat_id: ids.chat_id.clone(),
            message_id: ids.message_id.clone(),
            is_from_user: false,
            content: String::new(),
            encryption: ids.encryption,
            stopped_by: None,
            stop_reason: None,
            model: Some(ids.model.clone()),
            generation_state: GenerationState::Thinking,
            generation_started_at: Some(SystemTime::now()),
            generation_completed_at: None,
        })
        .await?;

    let job = PollingJob::new(
        response_id.clone(),
        ids.user_id,
        ids.chat_id.clone(),
        ids.message_id.clone(),
        ids.model,
        ids.encryption,
    )?;
    state.poller.spawn(job, endpoint);

    let ack = json!({
        "responseId": response_id,
        "status": "thinking",
        "chatId": ids.chat_id,
        "messageId": ids.message_id,
    });
    let events = stream::iter([
        Ok::<Event, Infallible>(Event::default().data(ack.to_string())),
        Ok(Event::default().data("[DONE]")),
    ]);
    Ok(Sse::new(events).into_response())
}

fn bad_request(msg: &str) -> ApiError {
    ApiError(GatewayError::BadRequest(msg.to_string()))
}
