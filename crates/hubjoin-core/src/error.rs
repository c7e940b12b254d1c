//! Core domain errors.

use thiserror::Error;

/// Core domain errors for hubjoin.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Kubeconfig could not be parsed or resolved to a hub endpoint.
    #[error("Malformed kubeconfig: {0}")]
    MalformedKubeconfig(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
