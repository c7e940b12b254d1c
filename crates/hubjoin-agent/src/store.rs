//! Candidate bootstrap credentials.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use hubjoin_core::{BootstrapCredential, CredentialState, HubEndpoint, Kubeconfig, SecretRef};

use crate::error::ConfigError;
use crate::events::{Machine, TransitionLog};
use crate::secrets::{SecretError, SecretSource};

/// Secret key holding the kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// A configured credential source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub source_ref: SecretRef,
    pub priority: i32,
}

impl SourceSpec {
    pub fn new(source_ref: SecretRef, priority: i32) -> Self {
        Self {
            source_ref,
            priority,
        }
    }
}

/// Loads candidate bootstrap credentials from a secret source.
pub struct CredentialStore<S> {
    source: S,
    specs: Vec<SourceSpec>,
}

impl<S: SecretSource> CredentialStore<S> {
    /// Create a store over `specs`, which are kept in declaration order.
    pub fn new(source: S, specs: Vec<SourceSpec>) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::EmptyCandidateSet);
        }
        Ok(Self { source, specs })
    }

    /// Configured sources in declaration order.
    pub fn specs(&self) -> &[SourceSpec] {
        &self.specs
    }

    /// Read every source into a fresh, priority-ordered candidate list.
    ///
    /// Sources that cannot be read or parsed are left out with a warning.
    /// Equal priorities keep declaration order.
    pub fn load(&self) -> Result<Vec<BootstrapCredential>, ConfigError> {
        let mut candidates = Vec::with_capacity(self.specs.len());

        for (index, spec) in self.specs.iter().enumerate() {
            match self.read(&spec.source_ref) {
                Ok((data, endpoint)) => {
                    let digest = digest(&data);
                    candidates.push(BootstrapCredential::new(
                        spec.priority,
                        index,
                        spec.source_ref.clone(),
                        data,
                        digest,
                        endpoint,
                    ));
                }
                Err(reason) => {
                    warn!(
                        source = %spec.source_ref,
                        priority = spec.priority,
                        reason = %reason,
                        "Bootstrap credential source unusable, leaving it out"
                    );
                }
            }
        }

        if candidates.is_empty() {
            return Err(ConfigError::NoUsableSources(self.specs.len()));
        }

        // Stable: ties stay in declaration order
        candidates.sort_by_key(|c| c.priority);

        info!(
            loaded = candidates.len(),
            configured = self.specs.len(),
            "Loaded bootstrap credentials"
        );
        Ok(candidates)
    }

    /// Re-check sources without touching in-flight state.
    ///
    /// A candidate whose source has vanished or no longer parses is failed
    /// permanently. Returns the number of candidates evicted.
    pub fn refresh(&self, candidates: &mut [BootstrapCredential], log: &TransitionLog) -> usize {
        let mut evicted = 0;
        for candidate in candidates.iter_mut() {
            if candidate.is_evicted() {
                continue;
            }

            let reason = match self.read(&candidate.source_ref) {
                Ok((data, _)) => {
                    if digest(&data) != candidate.digest {
                        info!(
                            source = %candidate.source_ref,
                            "Bootstrap credential changed, picked up next session"
                        );
                    }
                    continue;
                }
                Err(reason) => reason,
            };

            let from = candidate.state();
            if candidate.evict(Utc::now()) {
                evicted += 1;
                log.record(
                    Machine::Fallback,
                    &candidate.source_ref,
                    from,
                    CredentialState::Failed,
                    format!("source evicted: {}", reason),
                );
            }
        }
        evicted
    }

    fn read(&self, source_ref: &SecretRef) -> Result<(Arc<[u8]>, HubEndpoint), String> {
        let secret = self.source.get(source_ref).map_err(|e| match e {
            SecretError::NotFound(_) => "secret not found".to_string(),
            other => other.to_string(),
        })?;

        let raw = secret
            .get(KUBECONFIG_KEY)
            .ok_or_else(|| format!("secret has no '{}' key", KUBECONFIG_KEY))?;

        let endpoint = Kubeconfig::parse(raw)
            .and_then(|k| k.resolve())
            .map_err(|e| e.to_string())?;

        Ok((Arc::from(raw), endpoint))
    }
}

/// SHA-256 hex digest of raw credential material.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::{BTreeMap, HashMap};
    use std::sync::RwLock;

    use crate::secrets::Secret;

    /// In-memory secret source.
    #[derive(Default)]
    pub(crate) struct MemorySecrets {
        secrets: RwLock<HashMap<SecretRef, Arc<Secret>>>,
    }

    impl MemorySecrets {
        pub(crate) fn put(&self, r: &SecretRef, kubeconfig: &str) {
            let mut data = BTreeMap::new();
            data.insert(KUBECONFIG_KEY.to_string(), kubeconfig.as_bytes().to_vec());
            self.secrets.write().unwrap().insert(
                r.clone(),
                Arc::new(Secret {
                    source_ref: r.clone(),
                    data,
                }),
            );
        }

        pub(crate) fn remove(&self, r: &SecretRef) {
            self.secrets.write().unwrap().remove(r);
        }
    }

    impl SecretSource for MemorySecrets {
        fn get(&self, source_ref: &SecretRef) -> Result<Arc<Secret>, SecretError> {
            self.secrets
                .read()
                .unwrap()
                .get(source_ref)
                .cloned()
                .ok_or_else(|| SecretError::NotFound(source_ref.clone()))
        }
    }

    pub(crate) fn kubeconfig(server: &str) -> String {
        Kubeconfig::for_token(server, "token", None).to_yaml().unwrap()
    }

    fn spec(name: &str, priority: i32) -> SourceSpec {
        SourceSpec::new(SecretRef::new("agent", name), priority)
    }

    fn names(candidates: &[BootstrapCredential]) -> Vec<&str> {
        candidates.iter().map(|c| c.source_ref.name.as_str()).collect()
    }

    #[test]
    fn test_load_sorts_by_priority_stable_on_ties() {
        let secrets = Arc::new(MemorySecrets::default());
        for name in ["a", "b", "c", "d"] {
            secrets.put(&SecretRef::new("agent", name), &kubeconfig("http://hub"));
        }

        let store = CredentialStore::new(
            secrets,
            vec![spec("a", 2), spec("b", 1), spec("c", 2), spec("d", 1)],
        )
        .unwrap();

        let candidates = store.load().unwrap();
        assert_eq!(names(&candidates), vec!["b", "d", "a", "c"]);
        assert!(candidates
            .iter()
            .all(|c| c.state() == CredentialState::Untried));
    }

    #[test]
    fn test_load_skips_unusable_sources() {
        let secrets = Arc::new(MemorySecrets::default());
        secrets.put(&SecretRef::new("agent", "good"), &kubeconfig("http://hub"));
        secrets.put(&SecretRef::new("agent", "garbage"), "clusters: [");

        let store = CredentialStore::new(
            secrets,
            vec![spec("missing", 0), spec("garbage", 1), spec("good", 2)],
        )
        .unwrap();

        let candidates = store.load().unwrap();
        assert_eq!(names(&candidates), vec!["good"]);
        assert_eq!(candidates[0].declaration_index, 2);
    }

    #[test]
    fn test_load_fails_when_nothing_usable() {
        let secrets = Arc::new(MemorySecrets::default());
        let store = CredentialStore::new(secrets, vec![spec("a", 0), spec("b", 1)]).unwrap();
        assert!(matches!(store.load(), Err(ConfigError::NoUsableSources(2))));
    }

    #[test]
    fn test_empty_spec_list_rejected() {
        let secrets = Arc::new(MemorySecrets::default());
        assert!(matches!(
            CredentialStore::new(secrets, Vec::new()),
            Err(ConfigError::EmptyCandidateSet)
        ));
    }

    #[test]
    fn test_refresh_evicts_vanished_sources_and_keeps_state() {
        let secrets = Arc::new(MemorySecrets::default());
        let a = SecretRef::new("agent", "a");
        let b = SecretRef::new("agent", "b");
        secrets.put(&a, &kubeconfig("http://hub-a"));
        secrets.put(&b, &kubeconfig("http://hub-b"));

        let store =
            CredentialStore::new(secrets.clone(), vec![spec("a", 0), spec("b", 1)]).unwrap();
        let mut candidates = store.load().unwrap();
        candidates[0].begin_probe().unwrap();
        candidates[0]
            .fail(hubjoin_core::ProbeErrorKind::Unreachable, Utc::now())
            .unwrap();

        secrets.remove(&b);
        let (log, mut rx) = TransitionLog::with_channel();
        assert_eq!(store.refresh(&mut candidates, &log), 1);

        assert_eq!(candidates[0].state(), CredentialState::Failed);
        assert!(!candidates[0].is_evicted());
        assert_eq!(candidates[1].state(), CredentialState::Failed);
        assert!(candidates[1].is_evicted());

        let t = rx.try_recv().unwrap();
        assert_eq!(t.subject, "agent/b");
        assert_eq!(t.from, "Untried");

        // Evicted candidates stay evicted even if the source comes back
        secrets.put(&b, &kubeconfig("http://hub-b"));
        assert_eq!(store.refresh(&mut candidates, &log), 0);
        assert!(candidates[1].is_evicted());
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest(b"abc"), digest(b"abc"));
        assert_ne!(digest(b"abc"), digest(b"abd"));
        assert_eq!(digest(b"abc").len(), 64);
    }
}
