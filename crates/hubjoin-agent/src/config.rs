//! Agent configuration.
//!
//! Loaded from a YAML file (camelCase keys) and then overridden by command
//! line flags. `validate` enforces the documented minimums.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use hubjoin_core::{AgentIdentity, SecretRef};

use crate::error::ConfigError;
use crate::store::SourceSpec;

/// Minimum number of secrets for the LocalSecrets bootstrap type.
pub const MIN_LOCAL_SECRETS: usize = 2;
/// Lower bound for `skipFailedBootstrapKubeConfigSeconds`.
pub const MIN_SKIP_FAILED_SECONDS: u64 = 60;
/// Lower bound for `hubConnectionTimeoutSeconds`.
pub const MIN_HUB_CONNECTION_TIMEOUT_SECONDS: u64 = 180;

/// Where bootstrap kubeconfigs come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapType {
    /// A single bootstrap kubeconfig secret.
    #[default]
    None,
    /// A prioritized list of local secrets.
    LocalSecrets,
}

/// Whether a denied credential is remembered beyond its session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeniedCredentialPolicy {
    /// Skipped for the rest of the session only.
    #[default]
    Session,
    /// Recorded on disk and skipped until the secret content changes.
    Persistent,
}

/// One bootstrap kubeconfig secret with its explicit priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigSecret {
    pub name: String,

    /// Defaults to the agent namespace.
    #[serde(default)]
    pub namespace: Option<String>,

    /// Lower is tried first. Equal priorities keep declaration order.
    pub priority: i32,
}

/// Settings for the LocalSecrets bootstrap type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalSecretsConfig {
    pub kube_config_secrets: Vec<KubeConfigSecret>,
    pub skip_failed_bootstrap_kube_config_seconds: u64,
    pub hub_connection_timeout_seconds: u64,
}

impl Default for LocalSecretsConfig {
    fn default() -> Self {
        Self {
            kube_config_secrets: Vec::new(),
            skip_failed_bootstrap_kube_config_seconds: 180,
            hub_connection_timeout_seconds: 600,
        }
    }
}

/// Bootstrap kubeconfig selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BootstrapConfig {
    #[serde(rename = "type")]
    pub kind: BootstrapType,

    /// Secret used when `type` is `None`.
    pub bootstrap_kube_config_secret: String,

    pub local_secrets_config: Option<LocalSecretsConfig>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            kind: BootstrapType::None,
            bootstrap_kube_config_secret: "bootstrap-hub-kubeconfig".to_string(),
            local_secrets_config: None,
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    /// Name of the managed cluster.
    pub cluster_name: String,

    /// Name of this agent instance.
    pub agent_name: String,

    /// Namespace secrets are looked up in unless they name their own.
    pub namespace: String,

    /// Root of the mounted secrets tree (`<root>/<namespace>/<name>/<key>`).
    pub secrets_dir: PathBuf,

    /// Where the durable credential and denial ledger are kept.
    pub data_dir: PathBuf,

    /// Extra hub CA bundle trusted in addition to kubeconfig CAs.
    pub hub_ca_file: Option<PathBuf>,

    pub bootstrap: BootstrapConfig,

    pub denied_credential_policy: DeniedCredentialPolicy,

    /// Cool-down between failed sessions (seconds).
    pub session_backoff_seconds: u64,

    /// Give up after this many failed sessions (0 = never).
    pub max_sessions: u32,

    /// How often a pending certificate request is polled (seconds).
    pub csr_poll_interval_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            agent_name: "hubjoin-agent".to_string(),
            namespace: "hubjoin-agent".to_string(),
            secrets_dir: PathBuf::from("/var/run/secrets/hubjoin"),
            data_dir: PathBuf::from("/var/lib/hubjoin"),
            hub_ca_file: None,
            bootstrap: BootstrapConfig::default(),
            denied_credential_policy: DeniedCredentialPolicy::Session,
            session_backoff_seconds: 30,
            max_sessions: 0,
            csr_poll_interval_seconds: 5,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_slice(&raw)?)
    }

    /// Check the documented minimums.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::EmptyClusterName);
        }
        if self.agent_name.trim().is_empty() {
            return Err(ConfigError::EmptyAgentName);
        }

        if self.bootstrap.kind == BootstrapType::LocalSecrets {
            let local = self
                .bootstrap
                .local_secrets_config
                .as_ref()
                .ok_or(ConfigError::MissingLocalSecrets)?;

            if local.kube_config_secrets.len() < MIN_LOCAL_SECRETS {
                return Err(ConfigError::TooFewSecrets {
                    found: local.kube_config_secrets.len(),
                    min: MIN_LOCAL_SECRETS,
                });
            }

            let mut seen = HashSet::new();
            for secret in &local.kube_config_secrets {
                let r = self.secret_ref(secret);
                if !seen.insert(r.clone()) {
                    return Err(ConfigError::DuplicateSecret(r.to_string()));
                }
            }
        }

        let local = self.timeouts();
        if local.skip_failed_bootstrap_kube_config_seconds < MIN_SKIP_FAILED_SECONDS {
            return Err(ConfigError::SkipTooShort {
                value: local.skip_failed_bootstrap_kube_config_seconds,
                min: MIN_SKIP_FAILED_SECONDS,
            });
        }
        if local.hub_connection_timeout_seconds < MIN_HUB_CONNECTION_TIMEOUT_SECONDS {
            return Err(ConfigError::TimeoutTooShort {
                value: local.hub_connection_timeout_seconds,
                min: MIN_HUB_CONNECTION_TIMEOUT_SECONDS,
            });
        }

        Ok(())
    }

    /// The identity asserted to the hub.
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity::new(self.cluster_name.clone(), self.agent_name.clone())
    }

    /// Per-candidate probe budget.
    pub fn skip_after(&self) -> Duration {
        Duration::from_secs(self.timeouts().skip_failed_bootstrap_kube_config_seconds)
    }

    /// Overall hub connection budget for a session.
    pub fn hub_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts().hub_connection_timeout_seconds)
    }

    /// Cool-down between failed sessions.
    pub fn session_backoff(&self) -> Duration {
        Duration::from_secs(self.session_backoff_seconds)
    }

    /// Poll interval for pending certificate requests.
    pub fn csr_poll_interval(&self) -> Duration {
        Duration::from_secs(self.csr_poll_interval_seconds.max(1))
    }

    /// Configured sources, in declaration order.
    pub fn sources(&self) -> Vec<SourceSpec> {
        match (&self.bootstrap.kind, &self.bootstrap.local_secrets_config) {
            (BootstrapType::LocalSecrets, Some(local)) => local
                .kube_config_secrets
                .iter()
                .map(|s| SourceSpec::new(self.secret_ref(s), s.priority))
                .collect(),
            _ => vec![SourceSpec::new(
                SecretRef::new(
                    self.namespace.clone(),
                    self.bootstrap.bootstrap_kube_config_secret.clone(),
                ),
                0,
            )],
        }
    }

    fn secret_ref(&self, secret: &KubeConfigSecret) -> SecretRef {
        SecretRef::new(
            secret
                .namespace
                .clone()
                .unwrap_or_else(|| self.namespace.clone()),
            secret.name.clone(),
        )
    }

    /// Timeout settings; the None type uses the LocalSecrets defaults.
    fn timeouts(&self) -> LocalSecretsConfig {
        match (&self.bootstrap.kind, &self.bootstrap.local_secrets_config) {
            (BootstrapType::LocalSecrets, Some(local)) => local.clone(),
            _ => LocalSecretsConfig::default(),
        }
    }
}
