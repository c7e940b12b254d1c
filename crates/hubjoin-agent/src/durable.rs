//! Durable hub credential storage.
//!
//! The credential issued after CSR approval is kept as a single JSON document
//! carrying a resource version. Writes replace the document atomically
//! (temp file + rename) and only succeed against the version they were based
//! on.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use hubjoin_core::{AgentIdentity, RequestId, SecretRef};

use crate::ca::CaBundle;
use crate::pki;
use crate::retry::{update_with_refresh, Conflict, ConflictRetry};

/// File name of the durable credential under the data directory.
pub const CREDENTIAL_FILE: &str = "hub-credential.json";

/// Certificates expiring within this margin are treated as expired.
pub const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Errors that can occur while reading or writing the durable credential.
#[derive(Debug, Error)]
pub enum DurableError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode credential: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("resource version conflict: expected {expected:?}, found {found:?}")]
    Conflict {
        expected: Option<u64>,
        found: Option<u64>,
    },
}

impl Conflict for DurableError {
    fn is_conflict(&self) -> bool {
        matches!(self, DurableError::Conflict { .. })
    }
}

/// Long-lived identity credential issued by the hub.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableCredential {
    /// Hub server URL the credential is valid for.
    pub server: String,

    pub cluster_name: String,
    pub agent_name: String,

    /// Issued client certificate (PEM).
    pub certificate_pem: String,

    /// Private key generated by the agent (PEM).
    pub private_key_pem: String,

    /// Hub CA certificate (PEM), when the hub returned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_pem: Option<String>,

    /// Bootstrap secret that produced this credential.
    pub source_ref: SecretRef,

    /// CSR the certificate was issued for.
    pub request_id: RequestId,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for DurableCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCredential")
            .field("server", &self.server)
            .field("cluster_name", &self.cluster_name)
            .field("agent_name", &self.agent_name)
            .field("private_key_pem", &"<redacted>")
            .field("source_ref", &self.source_ref)
            .field("request_id", &self.request_id)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl DurableCredential {
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::new(self.cluster_name.clone(), self.agent_name.clone())
    }

    /// Check that the credential can still be used by `identity`.
    ///
    /// The certificate must parse, must not expire within the skew margin,
    /// must carry the identity's common name and, if a CA is known, must be
    /// issued by it.
    pub fn validate(
        &self,
        identity: &AgentIdentity,
        ca: Option<&CaBundle>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let info = pki::inspect(&self.certificate_pem).map_err(|e| e.to_string())?;

        if info.not_after - Duration::minutes(EXPIRY_SKEW_MINUTES) <= now {
            return Err(format!("certificate expired at {}", info.not_after));
        }

        let expected_cn = identity.common_name();
        if info.common_name.as_deref() != Some(expected_cn.as_str()) {
            return Err(format!(
                "certificate is for '{}', expected '{}'",
                info.common_name.unwrap_or_default(),
                expected_cn
            ));
        }

        if let Some(ca) = ca {
            if info.issuer != ca.subject {
                return Err(format!(
                    "certificate issued by '{}', expected '{}'",
                    info.issuer, ca.subject
                ));
            }
        }

        Ok(())
    }
}

/// A stored credential and its resource version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableRecord {
    pub resource_version: u64,
    pub credential: DurableCredential,
}

/// File-backed durable credential store.
#[derive(Debug, Clone)]
pub struct DurableStore {
    path: PathBuf,
}

impl DurableStore {
    /// Store under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(CREDENTIAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current record, if any.
    pub fn get(&self) -> Result<Option<Arc<DurableRecord>>, DurableError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(DurableError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let record = serde_json::from_slice(&raw).map_err(|source| DurableError::Decode {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(Arc::new(record)))
    }

    /// Replace the stored credential.
    ///
    /// `expected_version` is the version the caller read (`None` when there
    /// was no record). A mismatch fails with [`DurableError::Conflict`].
    pub fn replace(
        &self,
        expected_version: Option<u64>,
        credential: DurableCredential,
    ) -> Result<Arc<DurableRecord>, DurableError> {
        let found = self.get()?.map(|r| r.resource_version);
        if found != expected_version {
            return Err(DurableError::Conflict {
                expected: expected_version,
                found,
            });
        }

        let record = DurableRecord {
            resource_version: found.map_or(1, |v| v + 1),
            credential,
        };
        let encoded = serde_json::to_vec_pretty(&record).map_err(DurableError::Encode)?;
        write_atomic(&self.path, &encoded)?;

        debug!(
            path = %self.path.display(),
            version = record.resource_version,
            "Wrote durable credential"
        );
        Ok(Arc::new(record))
    }

    /// Install `credential`, re-reading the current version before every
    /// attempt and retrying on conflict.
    pub async fn install(
        &self,
        credential: DurableCredential,
        policy: &ConflictRetry,
    ) -> Result<Arc<DurableRecord>, DurableError> {
        let record = update_with_refresh(
            policy,
            "install durable credential",
            || async move { self.get().map(|r| r.map(|r| r.resource_version)) },
            |version| {
                let credential = credential.clone();
                async move { self.replace(version, credential) }
            },
        )
        .await?;

        info!(
            path = %self.path.display(),
            version = record.resource_version,
            expires_at = %record.credential.expires_at,
            "Installed durable hub credential"
        );
        Ok(record)
    }

    /// The stored credential if it is still valid for `identity`.
    ///
    /// Unreadable or invalid records are reported and treated as absent.
    pub fn load_valid(
        &self,
        identity: &AgentIdentity,
        ca: Option<&CaBundle>,
    ) -> Option<Arc<DurableRecord>> {
        let record = match self.get() {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable durable credential");
                return None;
            }
        };

        match record.credential.validate(identity, ca, Utc::now()) {
            Ok(()) => Some(record),
            Err(reason) => {
                info!(
                    path = %self.path.display(),
                    reason = %reason,
                    "Durable credential not usable"
                );
                None
            }
        }
    }
}

/// Write `data` to a sibling temp file and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<(), DurableError> {
    let io_err = |source: io::Error| DurableError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, data).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}
