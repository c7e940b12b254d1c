//! hubjoin Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Filesystem layout
//! - Runtime specifics
//!
//! All types here describe bootstrap credentials, certificate requests and
//! the states they move through while an agent joins its hub.

pub mod credential;
pub mod csr;
pub mod error;
pub mod ids;
pub mod kubeconfig;
pub mod status;

// Re-export commonly used types
pub use credential::BootstrapCredential;
pub use csr::{CertificateRequest, CsrStatus, CsrSubmission, CsrSubmitted};
pub use error::CoreError;
pub use ids::{AgentIdentity, RequestId, SecretRef};
pub use kubeconfig::{HubEndpoint, Kubeconfig};
pub use status::{CredentialState, CsrState, ProbeErrorKind};
