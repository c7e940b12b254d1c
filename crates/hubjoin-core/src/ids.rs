//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reference to a secret-like record holding bootstrap material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    /// Namespace the secret lives in.
    pub namespace: String,

    /// Secret name.
    pub name: String,
}

impl SecretRef {
    /// Create a new SecretRef.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identifier assigned by the hub to a certificate request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Create a new RequestId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random RequestId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Prefix every agent certificate common name carries.
pub const COMMON_NAME_PREFIX: &str = "hubjoin";

/// The cluster/agent identity an agent asserts to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Name of the managed cluster.
    pub cluster_name: String,

    /// Name of this agent instance.
    pub agent_name: String,
}

impl AgentIdentity {
    /// Create a new AgentIdentity.
    pub fn new(cluster_name: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            agent_name: agent_name.into(),
        }
    }

    /// Common name used in the certificate subject.
    pub fn common_name(&self) -> String {
        format!(
            "{}:{}:{}",
            COMMON_NAME_PREFIX, self.cluster_name, self.agent_name
        )
    }

    /// Parse an identity back out of a certificate common name.
    pub fn from_common_name(cn: &str) -> Option<Self> {
        let mut parts = cn.splitn(3, ':');
        if parts.next()? != COMMON_NAME_PREFIX {
            return None;
        }
        let cluster = parts.next()?;
        let agent = parts.next()?;
        if cluster.is_empty() || agent.is_empty() || agent.contains(':') {
            return None;
        }
        Some(Self::new(cluster, agent))
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_name, self.agent_name)
    }
}
