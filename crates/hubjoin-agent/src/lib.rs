//! hubjoin Agent Library
//!
//! Obtains a durable hub credential for a managed cluster: picks a working
//! bootstrap kubeconfig from a prioritized list, submits a certificate
//! signing request through it and installs the issued certificate.

pub mod agent;
pub mod ca;
pub mod config;
pub mod csr;
pub mod denied;
pub mod durable;
pub mod error;
pub mod events;
pub mod fallback;
pub mod hub;
pub mod pki;
pub mod probe;
pub mod retry;
pub mod secrets;
pub mod store;

pub use agent::{Agent, AgentOutcome};
pub use ca::{CaBundle, CaCache};
pub use config::AgentConfig;
pub use csr::{CsrApi, CsrLifecycle, CsrOutcome};
pub use durable::{DurableCredential, DurableRecord, DurableStore};
pub use error::{AgentError, ConfigError};
pub use events::{Transition, TransitionLog};
pub use fallback::{EngineSettings, FallbackEngine, FallbackSession};
pub use hub::{HttpHubClient, HubError};
pub use probe::{ConnectionProbe, ProbeResult};
pub use secrets::{DirSecretSource, SecretSource};
pub use store::CredentialStore;
