//! Agent error types.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use hubjoin_core::CoreError;

use crate::ca::CaError;
use crate::durable::DurableError;
use crate::pki::PkiError;

/// Configuration errors. Fatal at startup: no session is started.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("clusterName must not be empty")]
    EmptyClusterName,

    #[error("agentName must not be empty")]
    EmptyAgentName,

    #[error("bootstrap type LocalSecrets requires localSecretsConfig")]
    MissingLocalSecrets,

    #[error("localSecretsConfig needs at least {min} kubeConfigSecrets, got {found}")]
    TooFewSecrets { found: usize, min: usize },

    #[error("kubeConfigSecret '{0}' is declared more than once")]
    DuplicateSecret(String),

    #[error("skipFailedBootstrapKubeConfigSeconds must be at least {min}, got {value}")]
    SkipTooShort { value: u64, min: u64 },

    #[error("hubConnectionTimeoutSeconds must be at least {min}, got {value}")]
    TimeoutTooShort { value: u64, min: u64 },

    #[error("no bootstrap credential sources configured")]
    EmptyCandidateSet,

    #[error("none of the {0} bootstrap credential sources could be loaded")]
    NoUsableSources(usize),
}

/// Why a fallback session ended without a selected credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFailureReason {
    /// Every candidate was tried (or excluded) and none worked.
    Exhausted,
    /// The hub connection timeout elapsed.
    DeadlineExceeded,
}

/// Summary of a failed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFailure {
    pub reason: SessionFailureReason,
    /// Number of probes attempted in the session.
    pub attempted: usize,
    /// Number of candidates left untried.
    pub untried: usize,
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.reason {
            SessionFailureReason::Exhausted => "all candidates exhausted",
            SessionFailureReason::DeadlineExceeded => "hub connection timeout elapsed",
        };
        write!(
            f,
            "{} ({} attempted, {} untried)",
            reason, self.attempted, self.untried
        )
    }
}

/// Errors surfaced by the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("bootstrap session failed: {0}")]
    SessionFailed(SessionFailure),

    #[error("durable credential store error: {0}")]
    Durable(#[from] DurableError),

    #[error("hub CA bundle error: {0}")]
    Ca(#[from] CaError),

    #[error("certificate error: {0}")]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("shutdown requested")]
    Cancelled,
}
