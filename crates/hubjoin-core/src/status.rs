//! Status enums for bootstrap credentials, probes and certificate requests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a bootstrap credential within a fallback session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialState {
    /// Not attempted yet in this session.
    #[default]
    Untried,
    /// A probe is in flight.
    Probing,
    /// The last probe failed, or the source disappeared.
    Failed,
    /// Excluded from consideration without probing.
    Skipped,
    /// Proved viable; the session committed to it.
    Selected,
}

impl CredentialState {
    /// Returns true if the engine may still probe a credential in this state.
    pub fn is_probeable(&self) -> bool {
        matches!(self, Self::Untried)
    }
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Untried => "Untried",
            Self::Probing => "Probing",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
            Self::Selected => "Selected",
        };
        f.write_str(s)
    }
}

/// Classification of a failed connection probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeErrorKind {
    /// The hub could not be reached (DNS, dial, TLS, 5xx).
    Unreachable,
    /// The hub answered but refused the credential.
    AuthRejected,
    /// The attempt did not finish within its time budget.
    Timeout,
    /// The credential material itself is unusable.
    MalformedCredential,
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unreachable => "Unreachable",
            Self::AuthRejected => "AuthRejected",
            Self::Timeout => "Timeout",
            Self::MalformedCredential => "MalformedCredential",
        };
        f.write_str(s)
    }
}

/// State of a certificate signing request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CsrState {
    /// Submitted, awaiting a decision.
    #[default]
    Pending,
    /// Approved; a certificate is (or will shortly be) issued.
    Approved,
    /// Denied by the hub.
    Denied,
    /// No decision was reached in time.
    Expired,
}

impl CsrState {
    /// Returns true if the request can no longer change state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for CsrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Denied => "Denied",
            Self::Expired => "Expired",
        };
        f.write_str(s)
    }
}
