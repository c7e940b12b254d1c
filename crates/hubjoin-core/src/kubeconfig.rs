//! Minimal kubeconfig model.
//!
//! Only the fields needed to reach a hub are modelled: the cluster server and
//! its CA, and either a bearer token or a client certificate for the user.
//! Unknown fields are ignored on parse.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// A kubeconfig document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default)]
    pub clusters: Vec<NamedCluster>,

    #[serde(default)]
    pub contexts: Vec<NamedContext>,

    #[serde(default)]
    pub users: Vec<NamedUser>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

/// Everything needed to open a connection to the hub, resolved from a
/// kubeconfig's current context.
#[derive(Clone, PartialEq)]
pub struct HubEndpoint {
    /// Hub API server URL.
    pub server: String,

    /// PEM CA bundle from `certificate-authority-data`.
    pub ca_pem: Option<Vec<u8>>,

    /// Bearer token.
    pub token: Option<String>,

    /// Client certificate followed by its private key, PEM encoded.
    pub client_identity_pem: Option<Vec<u8>>,

    /// Skip server certificate verification.
    pub insecure_skip_tls_verify: bool,
}

impl fmt::Debug for HubEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubEndpoint")
            .field("server", &self.server)
            .field("ca_pem", &self.ca_pem.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field(
                "client_identity_pem",
                &self.client_identity_pem.as_ref().map(|_| "<redacted>"),
            )
            .field("insecure_skip_tls_verify", &self.insecure_skip_tls_verify)
            .finish()
    }
}

impl Kubeconfig {
    /// Parse a kubeconfig from raw YAML (or JSON) bytes.
    pub fn parse(data: &[u8]) -> Result<Self, CoreError> {
        serde_yaml::from_slice(data).map_err(|e| CoreError::MalformedKubeconfig(e.to_string()))
    }

    /// Build a single-context kubeconfig authenticating with a bearer token.
    pub fn for_token(
        server: impl Into<String>,
        token: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Self {
        Self {
            api_version: Some("v1".to_string()),
            kind: Some("Config".to_string()),
            clusters: vec![NamedCluster {
                name: "hub".to_string(),
                cluster: ClusterEntry {
                    server: server.into(),
                    certificate_authority_data: ca_pem.map(|pem| STANDARD.encode(pem)),
                    insecure_skip_tls_verify: false,
                },
            }],
            contexts: vec![NamedContext {
                name: "bootstrap".to_string(),
                context: ContextEntry {
                    cluster: "hub".to_string(),
                    user: "bootstrap".to_string(),
                },
            }],
            users: vec![NamedUser {
                name: "bootstrap".to_string(),
                user: UserEntry {
                    token: Some(token.into()),
                    ..Default::default()
                },
            }],
            current_context: Some("bootstrap".to_string()),
        }
    }

    /// Serialize to YAML.
    pub fn to_yaml(&self) -> Result<String, CoreError> {
        serde_yaml::to_string(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    /// Resolve the current context into a hub endpoint.
    ///
    /// Without `current-context`, a document with exactly one context (or,
    /// lacking contexts, exactly one cluster and one user) is used as is.
    pub fn resolve(&self) -> Result<HubEndpoint, CoreError> {
        let (cluster_name, user_name) = self.active_pair()?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .map(|c| &c.cluster)
            .ok_or_else(|| malformed(format!("cluster '{}' not found", cluster_name)))?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == user_name)
            .map(|u| &u.user)
            .ok_or_else(|| malformed(format!("user '{}' not found", user_name)))?;

        let server = cluster.server.trim();
        if !(server.starts_with("https://") || server.starts_with("http://")) {
            return Err(malformed(format!("server '{}' is not an http(s) URL", server)));
        }

        let ca_pem = cluster
            .certificate_authority_data
            .as_deref()
            .map(|data| decode(data, "certificate-authority-data"))
            .transpose()?;

        let client_identity_pem = match (&user.client_certificate_data, &user.client_key_data) {
            (Some(cert), Some(key)) => {
                let mut pem = decode(cert, "client-certificate-data")?;
                pem.push(b'\n');
                pem.extend(decode(key, "client-key-data")?);
                Some(pem)
            }
            (None, None) => None,
            _ => {
                return Err(malformed(
                    "client-certificate-data and client-key-data must be set together",
                ))
            }
        };

        let token = user.token.clone().filter(|t| !t.trim().is_empty());
        if token.is_none() && client_identity_pem.is_none() {
            return Err(malformed(format!("user '{}' has no credentials", user_name)));
        }

        Ok(HubEndpoint {
            server: server.trim_end_matches('/').to_string(),
            ca_pem,
            token,
            client_identity_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
        })
    }

    fn active_pair(&self) -> Result<(&str, &str), CoreError> {
        if let Some(current) = &self.current_context {
            let ctx = self
                .contexts
                .iter()
                .find(|c| &c.name == current)
                .ok_or_else(|| malformed(format!("current-context '{}' not found", current)))?;
            return Ok((ctx.context.cluster.as_str(), ctx.context.user.as_str()));
        }

        match (self.contexts.as_slice(), self.clusters.as_slice(), self.users.as_slice()) {
            ([ctx], _, _) => Ok((ctx.context.cluster.as_str(), ctx.context.user.as_str())),
            ([], [cluster], [user]) => Ok((cluster.name.as_str(), user.name.as_str())),
            _ => Err(malformed("no current-context and the active context is ambiguous")),
        }
    }
}

fn decode(data: &str, field: &str) -> Result<Vec<u8>, CoreError> {
    STANDARD
        .decode(data.trim())
        .map_err(|e| malformed(format!("{} is not valid base64: {}", field, e)))
}

fn malformed(msg: impl Into<String>) -> CoreError {
    CoreError::MalformedKubeconfig(msg.into())
}
