//! Certificate request types and the JSON shapes exchanged with the hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentIdentity, CoreError, CsrState, RequestId, SecretRef};

/// Request body for CSR submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrSubmission {
    /// Certificate Signing Request (PEM encoded).
    pub csr_pem: String,

    /// Cluster the agent registers.
    pub cluster_name: String,

    /// Agent instance name.
    pub agent_name: String,

    /// Bootstrap secret the agent reached the hub with.
    pub source_ref: String,
}

/// Response body for CSR submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrSubmitted {
    pub request_id: RequestId,
    pub state: CsrState,
}

/// Response body for a CSR status lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrStatus {
    pub request_id: RequestId,
    pub state: CsrState,

    /// Issued certificate (PEM encoded), once approved and signed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_pem: Option<String>,

    /// Hub CA certificate (PEM encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,

    /// Human readable reason for the current state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A certificate request as tracked by its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct CertificateRequest {
    /// Identifier assigned by the hub.
    pub request_id: RequestId,

    /// Identity asserted by the request.
    pub subject: AgentIdentity,

    /// Bootstrap secret used to reach the hub.
    pub source_ref: SecretRef,

    /// When the request was submitted.
    pub submitted_at: DateTime<Utc>,

    state: CsrState,
}

impl CertificateRequest {
    /// Create a new pending request.
    pub fn new(request_id: RequestId, subject: AgentIdentity, source_ref: SecretRef) -> Self {
        Self {
            request_id,
            subject,
            source_ref,
            submitted_at: Utc::now(),
            state: CsrState::Pending,
        }
    }

    /// Current state.
    pub fn state(&self) -> CsrState {
        self.state
    }

    /// Move to a new state. Terminal states never change.
    ///
    /// Returns `Ok(true)` when the state actually changed.
    pub fn advance(&mut self, to: CsrState) -> Result<bool, CoreError> {
        if self.state == to {
            return Ok(false);
        }
        if self.state.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CertificateRequest {
        CertificateRequest::new(
            RequestId::new("req-1"),
            AgentIdentity::new("cluster1", "agent"),
            SecretRef::new("agent", "bootstrap"),
        )
    }

    #[test]
    fn test_pending_to_approved() {
        let mut req = request();
        assert_eq!(req.state(), CsrState::Pending);
        assert!(req.advance(CsrState::Approved).unwrap());
        assert_eq!(req.state(), CsrState::Approved);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut req = request();
        req.advance(CsrState::Denied).unwrap();
        assert!(req.advance(CsrState::Approved).is_err());
        assert!(!req.advance(CsrState::Denied).unwrap());
    }

    #[test]
    fn test_status_wire_format() {
        let status = CsrStatus {
            request_id: RequestId::new("req-1"),
            state: CsrState::Pending,
            certificate_pem: None,
            ca_pem: None,
            message: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["state"], "PENDING");
        assert!(json.get("certificatePem").is_none());
    }
}
