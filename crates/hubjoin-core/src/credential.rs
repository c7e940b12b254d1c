//! Bootstrap credential types.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{CoreError, CredentialState, HubEndpoint, ProbeErrorKind, SecretRef};

/// A candidate bootstrap credential.
///
/// The connection material (`data`, `endpoint`) is shared and never edited
/// after load. Only the bookkeeping fields change as the fallback engine
/// works through a session.
#[derive(Debug, Clone)]
pub struct BootstrapCredential {
    /// Priority rank, lower is tried first.
    pub priority: i32,

    /// Position of the source in the configuration, used to break ties.
    pub declaration_index: usize,

    /// Secret the material was read from.
    pub source_ref: SecretRef,

    /// Raw kubeconfig bytes as read from the source.
    pub data: Arc<[u8]>,

    /// SHA-256 digest (hex) of `data`.
    pub digest: String,

    /// Endpoint resolved from `data`.
    pub endpoint: Arc<HubEndpoint>,

    state: CredentialState,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<ProbeErrorKind>,
    evicted: bool,
}

impl BootstrapCredential {
    /// Create a new, untried credential.
    pub fn new(
        priority: i32,
        declaration_index: usize,
        source_ref: SecretRef,
        data: Arc<[u8]>,
        digest: impl Into<String>,
        endpoint: HubEndpoint,
    ) -> Self {
        Self {
            priority,
            declaration_index,
            source_ref,
            data,
            digest: digest.into(),
            endpoint: Arc::new(endpoint),
            state: CredentialState::Untried,
            failed_at: None,
            last_error: None,
            evicted: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> CredentialState {
        self.state
    }

    /// When the last failure was recorded.
    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    /// Classification of the last probe failure, if any.
    pub fn last_error(&self) -> Option<ProbeErrorKind> {
        self.last_error
    }

    /// Whether the source disappeared and the credential is out for good.
    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Untried -> Probing.
    pub fn begin_probe(&mut self) -> Result<(), CoreError> {
        self.transition(CredentialState::Untried, CredentialState::Probing)
    }

    /// Probing -> Selected.
    pub fn select(&mut self) -> Result<(), CoreError> {
        self.transition(CredentialState::Probing, CredentialState::Selected)
    }

    /// Probing -> Failed.
    pub fn fail(&mut self, kind: ProbeErrorKind, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(CredentialState::Probing, CredentialState::Failed)?;
        self.failed_at = Some(at);
        self.last_error = Some(kind);
        Ok(())
    }

    /// Probing -> Untried, used when an attempt is abandoned on shutdown.
    pub fn abandon_probe(&mut self) -> Result<(), CoreError> {
        self.transition(CredentialState::Probing, CredentialState::Untried)
    }

    /// Selected -> Failed, used when the hub rejects the identity obtained
    /// through this credential.
    pub fn reject(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        self.transition(CredentialState::Selected, CredentialState::Failed)?;
        self.failed_at = Some(at);
        Ok(())
    }

    /// Untried -> Skipped.
    pub fn skip(&mut self) -> Result<(), CoreError> {
        self.transition(CredentialState::Untried, CredentialState::Skipped)
    }

    /// Force the credential to Failed because its source vanished.
    ///
    /// A selected credential is left alone; it is already in use.
    pub fn evict(&mut self, at: DateTime<Utc>) -> bool {
        if self.evicted || self.state == CredentialState::Selected {
            return false;
        }
        self.state = CredentialState::Failed;
        self.failed_at = Some(at);
        self.evicted = true;
        true
    }

    fn transition(&mut self, from: CredentialState, to: CredentialState) -> Result<(), CoreError> {
        if self.state != from {
            return Err(CoreError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}
