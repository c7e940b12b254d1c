//! Read access to secret-like records.
//!
//! Reads hand out shared `Arc<Secret>` views. Callers that need to change a
//! secret must clone it into an owned value first; the shared view is never
//! mutated in place.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use hubjoin_core::SecretRef;

/// Errors that can occur while reading a secret.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(SecretRef),

    #[error("failed to read secret {source_ref}: {source}")]
    Io {
        source_ref: SecretRef,
        #[source]
        source: io::Error,
    },
}

/// A secret: a named bag of binary values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub source_ref: SecretRef,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl Secret {
    /// Look up one key.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }
}

/// Source of secret records.
pub trait SecretSource: Send + Sync {
    /// Read the current version of a secret.
    fn get(&self, source_ref: &SecretRef) -> Result<Arc<Secret>, SecretError>;
}

impl<T: SecretSource + ?Sized> SecretSource for Arc<T> {
    fn get(&self, source_ref: &SecretRef) -> Result<Arc<Secret>, SecretError> {
        (**self).get(source_ref)
    }
}

/// Secrets mounted on disk as `<root>/<namespace>/<name>/<key>`.
///
/// Hidden entries (the `..data` style symlinks a kubelet mount creates) are
/// ignored.
#[derive(Debug, Clone)]
pub struct DirSecretSource {
    root: PathBuf,
}

impl DirSecretSource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SecretSource for DirSecretSource {
    fn get(&self, source_ref: &SecretRef) -> Result<Arc<Secret>, SecretError> {
        let dir = self.root.join(&source_ref.namespace).join(&source_ref.name);
        let io_err = |source: io::Error| SecretError::Io {
            source_ref: source_ref.clone(),
            source,
        };

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound(source_ref.clone()))
            }
            Err(e) => return Err(io_err(e)),
        };

        let mut data = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let key = entry.file_name().to_string_lossy().into_owned();
            if key.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            data.insert(key, std::fs::read(&path).map_err(io_err)?);
        }

        debug!(secret = %source_ref, keys = data.len(), "Read secret");
        Ok(Arc::new(Secret {
            source_ref: source_ref.clone(),
            data,
        }))
    }
}
