use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::http::AppState;

/// Configured models with their aliases and providers.
pub async fn list(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": state.router.list_models() }))
}
