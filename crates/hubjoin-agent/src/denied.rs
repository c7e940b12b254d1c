//! Persistent record of bootstrap credentials the hub has denied.
//!
//! Entries are keyed by source and content digest, so a denied secret is
//! skipped in later sessions until its content changes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use hubjoin_core::{BootstrapCredential, CredentialState, RequestId, SecretRef};

use crate::durable::{write_atomic, DurableError};
use crate::events::{Machine, TransitionLog};

/// File name of the ledger under the data directory.
pub const DENIED_FILE: &str = "denied.json";

/// One denied credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedEntry {
    pub source_ref: SecretRef,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub denied_at: DateTime<Utc>,
}

/// File-backed denied-credential ledger.
#[derive(Debug)]
pub struct DeniedLedger {
    path: PathBuf,
    entries: Vec<DeniedEntry>,
}

impl DeniedLedger {
    /// Load the ledger under `data_dir`; a missing file is an empty ledger.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self, DurableError> {
        let path = data_dir.as_ref().join(DENIED_FILE);
        let entries = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|source| DurableError::Decode {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(DurableError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[DeniedEntry] {
        &self.entries
    }

    /// Whether `candidate`'s current content has been denied before.
    pub fn contains(&self, candidate: &BootstrapCredential) -> bool {
        self.entries
            .iter()
            .any(|e| e.source_ref == candidate.source_ref && e.digest == candidate.digest)
    }

    /// Mark every untried candidate found in the ledger as skipped.
    pub fn apply(&self, candidates: &mut [BootstrapCredential], log: &TransitionLog) -> usize {
        let mut skipped = 0;
        for candidate in candidates.iter_mut() {
            if candidate.state() != CredentialState::Untried || !self.contains(candidate) {
                continue;
            }
            if candidate.skip().is_ok() {
                skipped += 1;
                log.record(
                    Machine::Fallback,
                    &candidate.source_ref,
                    CredentialState::Untried,
                    CredentialState::Skipped,
                    "previously denied by hub",
                );
            }
        }
        skipped
    }

    /// Add `candidate` to the ledger and persist it.
    pub fn record(
        &mut self,
        candidate: &BootstrapCredential,
        request_id: Option<RequestId>,
    ) -> Result<(), DurableError> {
        if self.contains(candidate) {
            return Ok(());
        }
        // Older content of the same secret no longer matters
        self.entries.retain(|e| e.source_ref != candidate.source_ref);
        self.entries.push(DeniedEntry {
            source_ref: candidate.source_ref.clone(),
            digest: candidate.digest.clone(),
            request_id,
            denied_at: Utc::now(),
        });

        let encoded = serde_json::to_vec_pretty(&self.entries).map_err(DurableError::Encode)?;
        write_atomic(&self.path, &encoded)?;

        info!(
            source = %candidate.source_ref,
            entries = self.entries.len(),
            "Recorded denied bootstrap credential"
        );
        Ok(())
    }
}
