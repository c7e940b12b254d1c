//! Certificate signing request lifecycle.
//!
//! Once the fallback engine has selected a bootstrap credential, the agent
//! submits a CSR through it and waits for the hub's decision. An approved
//! request becomes the durable credential; a denied or expired one sends the
//! engine on to the next candidate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hubjoin_core::{
    AgentIdentity, BootstrapCredential, CertificateRequest, CsrState, CsrStatus, CsrSubmission,
    CsrSubmitted, RequestId,
};

use crate::config::AgentConfig;
use crate::durable::{DurableCredential, DurableRecord, DurableStore};
use crate::error::AgentError;
use crate::events::{Machine, TransitionLog};
use crate::hub::HubError;
use crate::pki::{self, AgentCertRequest};
use crate::retry::{Backoff, ConflictRetry, RetryConfig};

/// Label for the state before submission.
const NOT_STARTED: &str = "NotStarted";

/// Hub calls needed by the lifecycle.
#[async_trait]
pub trait CsrApi: Send + Sync {
    /// Submit a CSR using the bootstrap credential's material.
    async fn submit(
        &self,
        credential: &BootstrapCredential,
        submission: &CsrSubmission,
    ) -> Result<CsrSubmitted, HubError>;

    /// Look up a previously submitted request.
    async fn status(
        &self,
        credential: &BootstrapCredential,
        request_id: &RequestId,
    ) -> Result<CsrStatus, HubError>;
}

#[async_trait]
impl<T: CsrApi + ?Sized> CsrApi for Arc<T> {
    async fn submit(
        &self,
        credential: &BootstrapCredential,
        submission: &CsrSubmission,
    ) -> Result<CsrSubmitted, HubError> {
        (**self).submit(credential, submission).await
    }

    async fn status(
        &self,
        credential: &BootstrapCredential,
        request_id: &RequestId,
    ) -> Result<CsrStatus, HubError> {
        (**self).status(credential, request_id).await
    }
}

/// Lifecycle timing.
#[derive(Debug, Clone)]
pub struct CsrSettings {
    /// Delay between status polls while pending.
    pub poll_interval: Duration,
    /// How long a request may take from submission to decision.
    pub timeout: Duration,
    /// Backoff for transient hub errors.
    pub retry: RetryConfig,
    /// Bounds for installing the durable credential.
    pub install: ConflictRetry,
}

impl CsrSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            poll_interval: config.csr_poll_interval(),
            timeout: config.hub_connection_timeout(),
            retry: RetryConfig::default(),
            install: ConflictRetry::default(),
        }
    }
}

/// Why a request did not produce a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrRejection {
    /// Hub-assigned id, if the submission got that far.
    pub request_id: Option<RequestId>,
    /// `Denied` or `Expired`.
    pub state: CsrState,
    pub reason: String,
}

impl CsrRejection {
    /// Whether the hub itself denied a request it accepted.
    ///
    /// A refused or failed submission carries no request id and is not a
    /// decision about the identity.
    pub fn is_denial(&self) -> bool {
        self.state == CsrState::Denied && self.request_id.is_some()
    }
}

/// Result of a lifecycle run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrOutcome {
    /// The durable credential is installed.
    Ready(Arc<DurableRecord>),
    /// The hub turned the request down; fall back to the next candidate.
    Rejected(CsrRejection),
}

enum Call<T> {
    Done(Result<T, HubError>),
    DeadlineReached,
}

/// Submits a CSR and follows it to a decision.
pub struct CsrLifecycle<A> {
    api: A,
    settings: CsrSettings,
    identity: AgentIdentity,
    durable: DurableStore,
    log: TransitionLog,
}

impl<A: CsrApi> CsrLifecycle<A> {
    pub fn new(
        api: A,
        settings: CsrSettings,
        identity: AgentIdentity,
        durable: DurableStore,
        log: TransitionLog,
    ) -> Self {
        Self {
            api,
            settings,
            identity,
            durable,
            log,
        }
    }

    /// Run one request through `credential`.
    ///
    /// The request is submitted once. Transient hub errors are retried with
    /// backoff until the lifecycle timeout, which turns a pending request
    /// into `Expired`.
    pub async fn run(
        &self,
        credential: &BootstrapCredential,
        cancel: &CancellationToken,
    ) -> Result<CsrOutcome, AgentError> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut backoff = Backoff::new(&self.settings.retry);

        let cert_request = AgentCertRequest::generate(&self.identity)?;
        let submission = CsrSubmission {
            csr_pem: cert_request.csr_pem().to_string(),
            cluster_name: self.identity.cluster_name.clone(),
            agent_name: self.identity.agent_name.clone(),
            source_ref: credential.source_ref.to_string(),
        };

        let submitted = loop {
            let call = self
                .call(deadline, cancel, self.api.submit(credential, &submission))
                .await?;
            match call {
                Call::Done(Ok(submitted)) => break submitted,
                Call::Done(Err(e)) if e.is_transient() => {
                    warn!(
                        source = %credential.source_ref,
                        error = %e,
                        "CSR submission failed, retrying"
                    );
                    if !self.wait(backoff.next_delay(), deadline, cancel).await? {
                        return Ok(self.not_submitted(
                            credential,
                            CsrState::Expired,
                            "hub unavailable until timeout",
                        ));
                    }
                }
                Call::Done(Err(e)) => {
                    return Ok(self.not_submitted(credential, CsrState::Denied, &e.to_string()));
                }
                Call::DeadlineReached => {
                    return Ok(self.not_submitted(
                        credential,
                        CsrState::Expired,
                        "submission timed out",
                    ));
                }
            }
        };

        let mut request = CertificateRequest::new(
            submitted.request_id.clone(),
            self.identity.clone(),
            credential.source_ref.clone(),
        );
        self.log.record(
            Machine::Csr,
            &request.request_id,
            NOT_STARTED,
            CsrState::Pending,
            format!("submitted via {}", credential.source_ref),
        );

        loop {
            let call = self
                .call(deadline, cancel, self.api.status(credential, &request.request_id))
                .await?;

            let delay = match call {
                Call::Done(Ok(status)) => {
                    backoff.reset();
                    match status.state {
                        CsrState::Pending => {}
                        CsrState::Approved => match status.certificate_pem {
                            Some(certificate_pem) => {
                                return self
                                    .install(
                                        &mut request,
                                        credential,
                                        &cert_request,
                                        certificate_pem,
                                        status.ca_pem,
                                    )
                                    .await;
                            }
                            None => debug!(
                                request_id = %request.request_id,
                                "Approved, waiting for certificate"
                            ),
                        },
                        state @ (CsrState::Denied | CsrState::Expired) => {
                            let reason = status.message.unwrap_or_else(|| {
                                format!("request {}", state.to_string().to_lowercase())
                            });
                            return self.rejected(&mut request, state, reason);
                        }
                    }
                    self.settings.poll_interval
                }
                Call::Done(Err(HubError::NotFound(_))) => {
                    return self.rejected(
                        &mut request,
                        CsrState::Expired,
                        "request no longer known to hub".to_string(),
                    );
                }
                Call::Done(Err(e)) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(
                        request_id = %request.request_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "CSR status check failed"
                    );
                    delay
                }
                Call::Done(Err(e)) => {
                    return self.rejected(
                        &mut request,
                        CsrState::Expired,
                        format!("status unavailable: {}", e),
                    );
                }
                Call::DeadlineReached => {
                    return self.rejected(&mut request, CsrState::Expired, self.timeout_reason());
                }
            };

            if !self.wait(delay, deadline, cancel).await? {
                return self.rejected(&mut request, CsrState::Expired, self.timeout_reason());
            }
        }
    }

    /// Run one hub call bounded by the deadline and the shutdown signal.
    async fn call<T>(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
        fut: impl Future<Output = Result<T, HubError>>,
    ) -> Result<Call<T>, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = timeout_at(deadline, fut) => Ok(match result {
                Ok(result) => Call::Done(result),
                Err(_) => Call::DeadlineReached,
            }),
        }
    }

    /// Sleep up to `delay`, never past `deadline`.
    ///
    /// Returns `false` when the deadline has been reached.
    async fn wait(
        &self,
        delay: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<bool, AgentError> {
        let until = (Instant::now() + delay).min(deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            _ = tokio::time::sleep_until(until) => {}
        }
        Ok(Instant::now() < deadline)
    }

    fn timeout_reason(&self) -> String {
        format!("no decision within {}s", self.settings.timeout.as_secs())
    }

    fn not_submitted(
        &self,
        credential: &BootstrapCredential,
        state: CsrState,
        reason: &str,
    ) -> CsrOutcome {
        self.log.record(Machine::Csr, &credential.source_ref, NOT_STARTED, state, reason);
        CsrOutcome::Rejected(CsrRejection {
            request_id: None,
            state,
            reason: reason.to_string(),
        })
    }

    fn rejected(
        &self,
        request: &mut CertificateRequest,
        state: CsrState,
        reason: String,
    ) -> Result<CsrOutcome, AgentError> {
        let from = request.state();
        request.advance(state)?;
        self.log.record(Machine::Csr, &request.request_id, from, state, reason.clone());
        info!(
            request_id = %request.request_id,
            source = %request.source_ref,
            state = %state,
            reason = %reason,
            "Certificate request rejected"
        );
        Ok(CsrOutcome::Rejected(CsrRejection {
            request_id: Some(request.request_id.clone()),
            state,
            reason,
        }))
    }

    async fn install(
        &self,
        request: &mut CertificateRequest,
        credential: &BootstrapCredential,
        cert_request: &AgentCertRequest,
        certificate_pem: String,
        ca_pem: Option<String>,
    ) -> Result<CsrOutcome, AgentError> {
        let info = pki::inspect(&certificate_pem)?;

        let from = request.state();
        request.advance(CsrState::Approved)?;
        self.log.record(
            Machine::Csr,
            &request.request_id,
            from,
            CsrState::Approved,
            format!("certificate issued, valid until {}", info.not_after),
        );

        let durable = DurableCredential {
            server: credential.endpoint.server.clone(),
            cluster_name: self.identity.cluster_name.clone(),
            agent_name: self.identity.agent_name.clone(),
            certificate_pem,
            private_key_pem: cert_request.private_key_pem().to_string(),
            ca_pem,
            source_ref: credential.source_ref.clone(),
            request_id: request.request_id.clone(),
            issued_at: Utc::now(),
            expires_at: info.not_after,
        };

        let record = self.durable.install(durable, &self.settings.install).await?;
        Ok(CsrOutcome::Ready(record))
    }
}
