//! Connection probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use hubjoin_core::{BootstrapCredential, ProbeErrorKind};

/// Outcome of a single connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency: Duration,
    pub error_kind: Option<ProbeErrorKind>,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn success(latency: Duration) -> Self {
        Self {
            ok: true,
            latency,
            error_kind: None,
            message: None,
        }
    }

    pub fn failure(kind: ProbeErrorKind, latency: Duration, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency,
            error_kind: Some(kind),
            message: Some(message.into()),
        }
    }
}

/// Opens a connection to the hub with a candidate's material.
///
/// Implementations must not touch the candidate's bookkeeping and must
/// honour `timeout` on their own. Callers still bound every attempt
/// externally, so an implementation that overruns is cut off and reported
/// as [`ProbeErrorKind::Timeout`].
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn attempt(&self, credential: &BootstrapCredential, timeout: Duration) -> ProbeResult;
}

#[async_trait]
impl<T: ConnectionProbe + ?Sized> ConnectionProbe for Arc<T> {
    async fn attempt(&self, credential: &BootstrapCredential, timeout: Duration) -> ProbeResult {
        (**self).attempt(credential, timeout).await
    }
}
