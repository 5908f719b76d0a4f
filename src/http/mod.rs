pub mod chat;
pub mod models;
pub mod stop;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::cancel::CancelService;
use crate::error::GatewayError;
use crate::persist::store::DocumentStore;
use crate::persist::MessageWriter;
use crate::poller::PollerSupervisor;
use crate::router::ModelRouter;
use crate::stream::manager::StreamManager;
use crate::tools::executor::ToolExecutor;

/// Long-lived services, composed at program start and threaded by reference.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub manager: Arc<StreamManager>,
    pub writer: Arc<MessageWriter>,
    pub poller: Arc<PollerSupervisor>,
    pub cancel: Arc<CancelService>,
    pub tools: Arc<ToolExecutor>,
    pub store: Arc<dyn DocumentStore>,
    pub client: reqwest::Client,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::completions))
        .route("/v1/chat/stop", post(stop::stop))
        .route("/v1/models", get(models::list))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Shared upstream HTTP client.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(4)
        .build()
        .expect("failed to build HTTP client")
}

pub(crate) fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

/// Boundary error wrapper. Upstream failures carry the provider body into
/// the response; everything else is sanitized.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = match &self.0 {
            GatewayError::UpstreamUnavailable { message, .. }
            | GatewayError::UpstreamProtocol { message, .. } => message.clone(),
            e => e.user_message(),
        };
        (status, Json(json!({ "error": { "message": message } }))).into_response()
    }
}
