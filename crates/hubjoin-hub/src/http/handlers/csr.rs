//! Certificate signing request handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use tracing::info;

use hubjoin_core::{CsrStatus, CsrSubmission, CsrSubmitted, RequestId};

use crate::error::ApiError;
use crate::http::bearer;
use crate::state::HubState;

/// Optional body of a deny call.
#[derive(Debug, Default, Deserialize)]
pub struct DenyRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Submit a CSR with a bootstrap token.
pub async fn submit_csr(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Json(submission): Json<CsrSubmission>,
) -> Result<Json<CsrSubmitted>, ApiError> {
    state.authorize(bearer(&headers)).await?;
    state.submit(submission).await.map(Json)
}

/// Look up a CSR.
pub async fn csr_status(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CsrStatus>, ApiError> {
    state.authorize(bearer(&headers)).await?;
    state.status(&RequestId::new(id)).await.map(Json)
}

/// Approve a pending CSR. Operator only.
pub async fn approve_csr(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CsrStatus>, ApiError> {
    state.authorize_admin(bearer(&headers))?;
    info!(request_id = %id, "Operator approval");
    state.approve(&RequestId::new(id)).await.map(Json)
}

/// Deny a pending CSR. Operator only.
pub async fn deny_csr(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CsrStatus>, ApiError> {
    state.authorize_admin(bearer(&headers))?;

    let request: DenyRequest = if body.is_empty() {
        DenyRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    info!(request_id = %id, "Operator denial");
    state.deny(&RequestId::new(id), request.reason).await.map(Json)
}
