//! Liveness handler.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};

use crate::error::ApiError;
use crate::http::bearer;
use crate::state::HubState;

/// Liveness endpoint. Answers only callers holding a known bootstrap token,
/// so agents can use it to test a credential.
pub async fn healthz(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    state.authorize(bearer(&headers)).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}
