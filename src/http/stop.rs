use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::cancel::CancelOutcome;
use crate::error::GatewayError;
use crate::http::{header_value, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(alias = "chatId")]
    pub chat_id: String,
    #[serde(alias = "messageId")]
    pub message_id: String,
}

/// Stop a generation. Delegates to distributed cancel so a request landing
/// on any instance can stop a stream owned by another. 404 when no instance
/// owns the session.
pub async fn stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StopRequest>,
) -> Result<Json<CancelOutcome>, ApiError> {
    let user_id = header_value(&headers, "x-user-id").ok_or_else(|| {
        ApiError(GatewayError::BadRequest("missing x-user-id header".to_string()))
    })?;

    let outcome = state
        .cancel
        .request_cancel(&req.chat_id, &req.message_id, &user_id, "user_cancelled")
        .await;

    if !outcome.found {
        return Err(ApiError(GatewayError::NotFound(format!(
            "no active stream for {}:{}",
            req.chat_id, req.message_id
        ))));
    }
    Ok(Json(outcome))
}
