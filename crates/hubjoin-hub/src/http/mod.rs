//! HTTP server for the hub.
//!
//! Provides endpoints for:
//! - Liveness with bootstrap credentials (`/healthz`)
//! - CSR submission and status (`/apis/certificates/v1/csr`)
//! - Operator decisions (`/apis/certificates/v1/csr/:id/approve|deny`)

use std::sync::Arc;

use axum::{
    http::{header, HeaderMap},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::HubState;

mod handlers;

/// CSR collection path.
pub const CSR_PATH: &str = "/apis/certificates/v1/csr";

/// Create the HTTP router.
pub fn create_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(CSR_PATH, post(handlers::submit_csr))
        .route(&format!("{}/:id", CSR_PATH), get(handlers::csr_status))
        .route(&format!("{}/:id/approve", CSR_PATH), post(handlers::approve_csr))
        .route(&format!("{}/:id/deny", CSR_PATH), post(handlers::deny_csr))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer token from the `Authorization` header, if any.
pub(crate) fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use hubjoin_core::{CsrState, CsrStatus, CsrSubmitted};
    use tokio::net::TcpListener;

    use crate::state::tests::{hub, submission, ADMIN, TOKEN};

    async fn spawn(state: Arc<HubState>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(crate::serve(listener, state, std::future::pending()));
        format!("http://{}", addr)
    }

    #[test]
    fn test_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer(&headers), Some("abc"));
    }

    #[tokio::test]
    async fn test_healthz_requires_known_token() {
        let base = spawn(hub(false)).await;
        let client = reqwest::Client::new();

        let anonymous = client.get(format!("{}/healthz", base)).send().await.unwrap();
        assert_eq!(anonymous.status(), 401);

        let wrong = client
            .get(format!("{}/healthz", base))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), 401);

        let ok = client
            .get(format!("{}/healthz", base))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        let body: serde_json::Value = ok.json().await.unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_operator_approval() {
        let base = spawn(hub(false)).await;
        let client = reqwest::Client::new();

        let submitted: CsrSubmitted = client
            .post(format!("{}{}", base, CSR_PATH))
            .bearer_auth(TOKEN)
            .json(&submission("cluster1", "agent"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(submitted.state, CsrState::Pending);

        let status_url = format!("{}{}/{}", base, CSR_PATH, submitted.request_id);
        let approve_url = format!("{}/approve", status_url);

        // Bootstrap tokens cannot approve.
        let denied = client
            .post(&approve_url)
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 403);

        let approved = client
            .post(&approve_url)
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap();
        assert_eq!(approved.status(), 200);

        let status: CsrStatus = client
            .get(&status_url)
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.state, CsrState::Approved);
        assert!(status.certificate_pem.is_some());
    }

    #[tokio::test]
    async fn test_deny_with_reason_and_unknown_id() {
        let state = hub(false);
        let submitted = state.submit(submission("cluster1", "agent")).await.unwrap();
        let base = spawn(state).await;
        let client = reqwest::Client::new();

        let status: CsrStatus = client
            .post(format!("{}{}/{}/deny", base, CSR_PATH, submitted.request_id))
            .bearer_auth(ADMIN)
            .json(&serde_json::json!({ "reason": "not on the allow list" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.state, CsrState::Denied);
        assert_eq!(status.message.as_deref(), Some("not on the allow list"));

        let missing = client
            .get(format!("{}{}/nope", base, CSR_PATH))
            .bearer_auth(TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn test_malformed_csr_is_bad_request() {
        let base = spawn(hub(true)).await;
        let mut sub = submission("cluster1", "agent");
        sub.csr_pem = "not a csr".to_string();

        let response = reqwest::Client::new()
            .post(format!("{}{}", base, CSR_PATH))
            .bearer_auth(TOKEN)
            .json(&sub)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
    }
}
