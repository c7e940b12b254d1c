//! Process-scoped hub CA bundle.
//!
//! The bundle is read from disk on first use and kept for the lifetime of
//! the process. Components that need it share one [`CaCache`] by `Arc`.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::info;

use crate::pki;

/// Errors that can occur while loading the CA bundle.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to read CA bundle '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CA bundle '{path}': {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// A parsed CA certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaBundle {
    /// CA certificate (PEM).
    pub pem: String,

    /// Subject distinguished name, as rendered by x509-parser.
    pub subject: String,
}

impl CaBundle {
    /// Parse a PEM CA certificate.
    pub fn from_pem(pem: impl Into<String>) -> Result<Self, pki::PkiError> {
        let pem = pem.into();
        let info = pki::inspect(&pem)?;
        Ok(Self {
            pem,
            subject: info.subject,
        })
    }
}

/// Lazily loaded, never reloaded CA bundle.
#[derive(Debug, Default)]
pub struct CaCache {
    path: Option<PathBuf>,
    bundle: OnceLock<Option<Arc<CaBundle>>>,
}

impl CaCache {
    /// Cache backed by an optional CA file. `None` means no CA is configured.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            bundle: OnceLock::new(),
        }
    }

    /// The cached bundle, loading it on the first call.
    ///
    /// A failed load is not cached, so the next call tries again. Once a
    /// value is in place it is returned unchanged.
    pub fn get(&self) -> Result<Option<Arc<CaBundle>>, CaError> {
        if let Some(bundle) = self.bundle.get() {
            return Ok(bundle.clone());
        }

        let loaded = match &self.path {
            Some(path) => {
                let pem = std::fs::read_to_string(path).map_err(|source| CaError::Read {
                    path: path.clone(),
                    source,
                })?;
                let bundle = CaBundle::from_pem(pem).map_err(|e| CaError::Parse {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                info!(path = %path.display(), subject = %bundle.subject, "Loaded hub CA bundle");
                Some(Arc::new(bundle))
            }
            None => None,
        };

        // A concurrent first read may have won the race; its value stands
        let _ = self.bundle.set(loaded);
        Ok(self.bundle.get().cloned().flatten())
    }
}
