//! Shared hub state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use hubjoin_core::{
    AgentIdentity, CertificateRequest, CsrState, CsrStatus, CsrSubmission, CsrSubmitted,
    RequestId, SecretRef,
};

use crate::ca::CertificateAuthority;
use crate::config::HubConfig;
use crate::error::ApiError;
use crate::token::{hash_token, BootstrapToken};

/// A submitted CSR and what the hub decided about it.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request: CertificateRequest,
    pub csr_pem: String,
    pub certificate_pem: Option<String>,
    pub message: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Shared hub state.
pub struct HubState {
    /// Bootstrap tokens indexed by token hash.
    pub tokens: RwLock<HashMap<String, BootstrapToken>>,

    /// Certificate requests indexed by id.
    pub requests: RwLock<HashMap<RequestId, RequestRecord>>,

    /// Certificate authority for signing agent CSRs.
    pub ca: CertificateAuthority,

    admin_token_hash: Option<String>,
    auto_approve: bool,
    csr_ttl: Duration,
    retention: Duration,
}

impl HubState {
    /// Create a new HubState wrapped in Arc.
    pub fn new(ca: CertificateAuthority, config: &HubConfig) -> Arc<Self> {
        let tokens = config
            .token_hashes
            .iter()
            .map(|hash| (hash.clone(), BootstrapToken::new(hash.clone())))
            .collect();

        Arc::new(Self {
            tokens: RwLock::new(tokens),
            requests: RwLock::new(HashMap::new()),
            ca,
            admin_token_hash: config.admin_token_hash.clone(),
            auto_approve: config.auto_approve,
            csr_ttl: Duration::seconds(config.csr_ttl_secs as i64),
            retention: Duration::seconds(config.retention_secs as i64),
        })
    }

    /// Register an additional bootstrap token.
    pub async fn add_token(&self, token: BootstrapToken) {
        self.tokens
            .write()
            .await
            .insert(token.token_hash.clone(), token);
    }

    /// Check a bearer token against the known bootstrap tokens.
    pub async fn authorize(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let token = bearer.ok_or(ApiError::Unauthorized)?;
        let token_hash = hash_token(token);

        match self.tokens.read().await.get(&token_hash) {
            Some(known) if known.is_valid_at(Utc::now()) => Ok(()),
            Some(_) => {
                warn!(token_hash = %token_hash, "Expired bootstrap token");
                Err(ApiError::Unauthorized)
            }
            None => {
                warn!("Unknown bootstrap token attempted");
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Check a bearer token against the operator token.
    pub fn authorize_admin(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let token = bearer.ok_or(ApiError::Unauthorized)?;
        match &self.admin_token_hash {
            Some(expected) if *expected == hash_token(token) => Ok(()),
            _ => Err(ApiError::Forbidden),
        }
    }

    /// Record a CSR, signing it right away when auto-approve is on.
    pub async fn submit(&self, submission: CsrSubmission) -> Result<CsrSubmitted, ApiError> {
        let subject = self.ca.inspect_csr(&submission.csr_pem)?;
        let claimed = AgentIdentity::new(&submission.cluster_name, &submission.agent_name);
        if subject != claimed {
            return Err(ApiError::BadRequest(format!(
                "CSR subject {} does not match {}",
                subject, claimed
            )));
        }

        let source_ref = match submission.source_ref.split_once('/') {
            Some((namespace, name)) => SecretRef::new(namespace, name),
            None => SecretRef::new("", submission.source_ref.as_str()),
        };

        let request_id = RequestId::generate();
        let mut record = RequestRecord {
            request: CertificateRequest::new(request_id.clone(), subject, source_ref),
            csr_pem: submission.csr_pem,
            certificate_pem: None,
            message: None,
            decided_at: None,
        };

        info!(
            request_id = %request_id,
            subject = %record.request.subject,
            source = %record.request.source_ref,
            "CSR submitted"
        );

        if self.auto_approve {
            self.sign(&mut record, "auto-approved")?;
        }

        let state = record.request.state();
        let mut requests = self.requests.write().await;
        self.prune(&mut requests, Utc::now());
        requests.insert(request_id.clone(), record);

        Ok(CsrSubmitted { request_id, state })
    }

    /// Current status of a request.
    pub async fn status(&self, request_id: &RequestId) -> Result<CsrStatus, ApiError> {
        self.status_at(request_id, Utc::now()).await
    }

    pub(crate) async fn status_at(
        &self,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) -> Result<CsrStatus, ApiError> {
        let mut requests = self.requests.write().await;
        let record = requests
            .get_mut(request_id)
            .ok_or_else(|| ApiError::NotFound(request_id.to_string()))?;

        if record.request.state() == CsrState::Pending
            && now - record.request.submitted_at > self.csr_ttl
        {
            transition(
                record,
                CsrState::Expired,
                "no decision before the request TTL",
                now,
            )?;
        }

        Ok(self.status_of(record))
    }

    /// Approve a pending request and issue its certificate.
    pub async fn approve(&self, request_id: &RequestId) -> Result<CsrStatus, ApiError> {
        let mut requests = self.requests.write().await;
        let record = requests
            .get_mut(request_id)
            .ok_or_else(|| ApiError::NotFound(request_id.to_string()))?;

        self.sign(record, "approved by operator")?;
        Ok(self.status_of(record))
    }

    /// Deny a pending request.
    pub async fn deny(
        &self,
        request_id: &RequestId,
        reason: Option<String>,
    ) -> Result<CsrStatus, ApiError> {
        let mut requests = self.requests.write().await;
        let record = requests
            .get_mut(request_id)
            .ok_or_else(|| ApiError::NotFound(request_id.to_string()))?;

        let reason = reason.unwrap_or_else(|| "denied by operator".to_string());
        transition(record, CsrState::Denied, &reason, Utc::now())?;
        Ok(self.status_of(record))
    }

    fn sign(&self, record: &mut RequestRecord, reason: &str) -> Result<(), ApiError> {
        if record.request.state() != CsrState::Pending {
            return Err(conflict(record));
        }

        let signed = self.ca.sign_csr(&record.csr_pem)?;
        info!(
            request_id = %record.request.request_id,
            subject = %signed.identity,
            expires_at = %signed.expires_at,
            "Agent certificate issued"
        );

        record.certificate_pem = Some(signed.cert_pem);
        transition(record, CsrState::Approved, reason, Utc::now())
    }

    #[cfg(test)]
    pub(crate) async fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let mut requests = self.requests.write().await;
        self.prune(&mut requests, now)
    }

    /// Drop decided requests older than the retention window.
    ///
    /// A pending request past its TTL counts as decided at the moment it
    /// expired. Returns how many records were removed.
    fn prune(
        &self,
        requests: &mut HashMap<RequestId, RequestRecord>,
        now: DateTime<Utc>,
    ) -> usize {
        let before = requests.len();
        requests.retain(|_, record| {
            let decided_at = match record.decided_at {
                Some(at) => at,
                None => record.request.submitted_at + self.csr_ttl,
            };
            now - decided_at <= self.retention
        });

        let removed = before - requests.len();
        if removed > 0 {
            debug!(removed, remaining = requests.len(), "Pruned decided CSR records");
        }
        removed
    }

    fn status_of(&self, record: &RequestRecord) -> CsrStatus {
        let state = record.request.state();
        CsrStatus {
            request_id: record.request.request_id.clone(),
            state,
            certificate_pem: record.certificate_pem.clone(),
            ca_pem: (state == CsrState::Approved).then(|| self.ca.ca_cert_pem().to_string()),
            message: record.message.clone(),
        }
    }
}

fn transition(
    record: &mut RequestRecord,
    to: CsrState,
    reason: &str,
    at: DateTime<Utc>,
) -> Result<(), ApiError> {
    let from = record.request.state();
    if from != CsrState::Pending {
        return Err(conflict(record));
    }
    record
        .request
        .advance(to)
        .map_err(|e| ApiError::Conflict(e.to_string()))?;
    record.message = Some(reason.to_string());
    record.decided_at = Some(at);

    info!(
        request_id = %record.request.request_id,
        from = %from,
        to = %to,
        reason,
        "CSR state changed"
    );
    Ok(())
}

fn conflict(record: &RequestRecord) -> ApiError {
    ApiError::Conflict(format!(
        "certificate request {} is already {}",
        record.request.request_id,
        record.request.state()
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ca::tests::csr;

    pub(crate) const TOKEN: &str = "bootstrap-token";
    pub(crate) const ADMIN: &str = "operator-token";

    pub(crate) fn hub(auto_approve: bool) -> Arc<HubState> {
        let config = HubConfig {
            auto_approve,
            csr_ttl_secs: 60,
            retention_secs: 300,
            token_hashes: vec![hash_token(TOKEN)],
            admin_token_hash: Some(hash_token(ADMIN)),
            ..Default::default()
        };
        let ca = CertificateAuthority::generate("Test Hub CA", 30).unwrap();
        HubState::new(ca, &config)
    }

    pub(crate) fn submission(cluster: &str, agent: &str) -> CsrSubmission {
        let (csr_pem, _) = csr(&AgentIdentity::new(cluster, agent).common_name());
        CsrSubmission {
            csr_pem,
            cluster_name: cluster.to_string(),
            agent_name: agent.to_string(),
            source_ref: "agent/bootstrap-hub-kubeconfig".to_string(),
        }
    }

    #[tokio::test]
    async fn test_authorize() {
        let hub = hub(false);
        assert!(hub.authorize(Some(TOKEN)).await.is_ok());
        assert!(matches!(hub.authorize(Some("wrong")).await, Err(ApiError::Unauthorized)));
        assert!(matches!(hub.authorize(None).await, Err(ApiError::Unauthorized)));

        assert!(hub.authorize_admin(Some(ADMIN)).is_ok());
        assert!(matches!(hub.authorize_admin(Some(TOKEN)), Err(ApiError::Forbidden)));
    }

    #[tokio::test]
    async fn test_pending_then_approved() {
        let hub = hub(false);
        let submitted = hub.submit(submission("cluster1", "agent")).await.unwrap();
        assert_eq!(submitted.state, CsrState::Pending);

        let status = hub.status(&submitted.request_id).await.unwrap();
        assert_eq!(status.state, CsrState::Pending);
        assert!(status.certificate_pem.is_none());

        let status = hub.approve(&submitted.request_id).await.unwrap();
        assert_eq!(status.state, CsrState::Approved);
        assert!(status.certificate_pem.is_some());
        assert_eq!(status.ca_pem.as_deref(), Some(hub.ca.ca_cert_pem()));
    }

    #[tokio::test]
    async fn test_auto_approve_signs_on_submit() {
        let hub = hub(true);
        let submitted = hub.submit(submission("cluster1", "agent")).await.unwrap();
        assert_eq!(submitted.state, CsrState::Approved);

        let status = hub.status(&submitted.request_id).await.unwrap();
        assert!(status.certificate_pem.is_some());
    }

    #[tokio::test]
    async fn test_deny_is_final() {
        let hub = hub(false);
        let submitted = hub.submit(submission("cluster1", "agent")).await.unwrap();

        let status = hub
            .deny(&submitted.request_id, Some("unknown cluster".to_string()))
            .await
            .unwrap();
        assert_eq!(status.state, CsrState::Denied);
        assert_eq!(status.message.as_deref(), Some("unknown cluster"));

        assert!(matches!(
            hub.approve(&submitted.request_id).await,
            Err(ApiError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_past_ttl_reads_expired() {
        let hub = hub(false);
        let submitted = hub.submit(submission("cluster1", "agent")).await.unwrap();

        let later = Utc::now() + Duration::seconds(120);
        let status = hub.status_at(&submitted.request_id, later).await.unwrap();
        assert_eq!(status.state, CsrState::Expired);

        // Stays expired, and can no longer be approved.
        let status = hub.status(&submitted.request_id).await.unwrap();
        assert_eq!(status.state, CsrState::Expired);
        assert!(hub.approve(&submitted.request_id).await.is_err());
    }

    #[tokio::test]
    async fn test_decided_requests_are_pruned_after_retention() {
        let hub = hub(false);
        let denied = hub.submit(submission("cluster1", "agent")).await.unwrap();
        hub.deny(&denied.request_id, None).await.unwrap();
        let pending = hub.submit(submission("cluster1", "agent")).await.unwrap();

        // Inside the retention window nothing goes.
        assert_eq!(hub.prune_at(Utc::now() + Duration::seconds(200)).await, 0);
        assert!(hub.status(&denied.request_id).await.is_ok());

        // The denial is past retention; the pending request only expired at 60s.
        assert_eq!(hub.prune_at(Utc::now() + Duration::seconds(320)).await, 1);
        assert!(matches!(
            hub.status(&denied.request_id).await,
            Err(ApiError::NotFound(_))
        ));
        assert!(hub.requests.read().await.contains_key(&pending.request_id));

        assert_eq!(hub.prune_at(Utc::now() + Duration::seconds(400)).await, 1);
        assert!(hub.requests.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_prunes_stale_records() {
        let hub = hub(true);
        let old = hub.submit(submission("cluster1", "agent")).await.unwrap();
        hub.requests
            .write()
            .await
            .get_mut(&old.request_id)
            .unwrap()
            .decided_at = Some(Utc::now() - Duration::seconds(600));

        let fresh = hub.submit(submission("cluster1", "agent")).await.unwrap();
        let requests = hub.requests.read().await;
        assert!(!requests.contains_key(&old.request_id));
        assert!(requests.contains_key(&fresh.request_id));
    }

    #[tokio::test]
    async fn test_subject_must_match_claim() {
        let hub = hub(false);
        let mut sub = submission("cluster1", "agent");
        sub.cluster_name = "cluster2".to_string();
        assert!(matches!(hub.submit(sub).await, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let hub = hub(false);
        assert!(matches!(
            hub.status(&RequestId::new("nope")).await,
            Err(ApiError::NotFound(_))
        ));
    }
}
