//! HTTP client for the hub API.
//!
//! Provides:
//! - the liveness probe (`GET /healthz`) used by the fallback engine
//! - CSR submission and status lookups (`/apis/certificates/v1/csr`)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use hubjoin_core::{
    BootstrapCredential, CsrStatus, CsrSubmission, CsrSubmitted, HubEndpoint, ProbeErrorKind,
    RequestId,
};

use crate::ca::CaCache;
use crate::csr::CsrApi;
use crate::probe::{ConnectionProbe, ProbeResult};

/// Liveness path.
pub const HEALTHZ_PATH: &str = "/healthz";

/// CSR collection path.
pub const CSR_PATH: &str = "/apis/certificates/v1/csr";

/// Errors returned by hub calls.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid hub endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("hub unreachable: {0}")]
    Unreachable(String),

    #[error("hub request timed out")]
    Timeout,

    #[error("hub rejected credentials (HTTP {0})")]
    Unauthorized(u16),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("hub returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode hub response: {0}")]
    Decode(String),
}

impl HubError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HubError::Unreachable(_) | HubError::Timeout => true,
            HubError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Probe failure classification for this error.
    pub fn probe_kind(&self) -> ProbeErrorKind {
        match self {
            HubError::InvalidEndpoint(_) => ProbeErrorKind::MalformedCredential,
            HubError::Timeout => ProbeErrorKind::Timeout,
            HubError::Unauthorized(_) => ProbeErrorKind::AuthRejected,
            _ => ProbeErrorKind::Unreachable,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HubError::Timeout
        } else if e.is_builder() {
            HubError::InvalidEndpoint(e.to_string())
        } else if e.is_decode() {
            HubError::Decode(e.to_string())
        } else {
            HubError::Unreachable(e.to_string())
        }
    }
}

/// Hub client speaking HTTP+JSON with a candidate's connection material.
#[derive(Debug, Clone)]
pub struct HttpHubClient {
    ca: Arc<CaCache>,
    request_timeout: Duration,
}

impl HttpHubClient {
    /// Create a client trusting the process CA bundle in addition to each
    /// kubeconfig's own CA.
    pub fn new(ca: Arc<CaCache>) -> Self {
        Self {
            ca,
            request_timeout: Duration::from_secs(30),
        }
    }

    fn client_for(&self, endpoint: &HubEndpoint, timeout: Duration) -> Result<Client, HubError> {
        let invalid = |e: reqwest::Error| HubError::InvalidEndpoint(e.to_string());

        let mut builder = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .connect_timeout(timeout);

        if let Some(ca_pem) = &endpoint.ca_pem {
            for cert in Certificate::from_pem_bundle(ca_pem).map_err(invalid)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        let bundle = self
            .ca
            .get()
            .map_err(|e| HubError::InvalidEndpoint(e.to_string()))?;
        if let Some(bundle) = bundle {
            let certificate = Certificate::from_pem(bundle.pem.as_bytes()).map_err(invalid)?;
            builder = builder.add_root_certificate(certificate);
        }

        if let Some(identity) = &endpoint.client_identity_pem {
            builder = builder.identity(Identity::from_pem(identity).map_err(invalid)?);
        }

        if endpoint.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder.build().map_err(invalid)
    }

    fn url(endpoint: &HubEndpoint, path: &str) -> String {
        format!("{}{}", endpoint.server.trim_end_matches('/'), path)
    }

    fn authorize(
        endpoint: &HubEndpoint,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match &endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Call `GET /healthz` with the endpoint's credentials.
    pub async fn healthz(&self, endpoint: &HubEndpoint, timeout: Duration) -> Result<(), HubError> {
        let client = self.client_for(endpoint, timeout)?;
        let request = Self::authorize(endpoint, client.get(Self::url(endpoint, HEALTHZ_PATH)));
        let response = request.send().await.map_err(HubError::from_reqwest)?;
        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HubError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HubError::Unauthorized(status.as_u16()),
        StatusCode::NOT_FOUND => HubError::NotFound(body),
        _ => HubError::Status {
            status: status.as_u16(),
            body,
        },
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, HubError> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| HubError::Decode(e.to_string()))
}

#[async_trait]
impl ConnectionProbe for HttpHubClient {
    async fn attempt(&self, credential: &BootstrapCredential, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let result = self.healthz(&credential.endpoint, timeout).await;
        let latency = start.elapsed();

        match result {
            Ok(()) => {
                debug!(
                    source = %credential.source_ref,
                    latency_ms = latency.as_millis() as u64,
                    "Hub reachable"
                );
                ProbeResult::success(latency)
            }
            Err(e) => ProbeResult::failure(e.probe_kind(), latency, e.to_string()),
        }
    }
}

#[async_trait]
impl CsrApi for HttpHubClient {
    async fn submit(
        &self,
        credential: &BootstrapCredential,
        submission: &CsrSubmission,
    ) -> Result<CsrSubmitted, HubError> {
        let endpoint = &credential.endpoint;
        let client = self.client_for(endpoint, self.request_timeout)?;
        let request = Self::authorize(endpoint, client.post(Self::url(endpoint, CSR_PATH)));
        let response = request
            .json(submission)
            .send()
            .await
            .map_err(HubError::from_reqwest)?;
        decode(response).await
    }

    async fn status(
        &self,
        credential: &BootstrapCredential,
        request_id: &RequestId,
    ) -> Result<CsrStatus, HubError> {
        let endpoint = &credential.endpoint;
        let client = self.client_for(endpoint, self.request_timeout)?;
        let path = format!("{}/{}", CSR_PATH, request_id);
        let request = Self::authorize(endpoint, client.get(Self::url(endpoint, &path)));
        let response = request.send().await.map_err(HubError::from_reqwest)?;
        decode(response).await
    }
}
