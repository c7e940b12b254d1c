//! Hub configuration.

use std::path::PathBuf;

/// Reference hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// HTTP bind address.
    pub bind_addr: String,

    /// CA certificate file. A CA is generated in memory when unset.
    pub ca_cert_path: Option<PathBuf>,

    /// CA private key file.
    pub ca_key_path: Option<PathBuf>,

    /// Sign CSRs as soon as they are submitted.
    pub auto_approve: bool,

    /// Pending requests older than this read as expired (seconds).
    pub csr_ttl_secs: u64,

    /// Decided requests are forgotten after this long (seconds).
    pub retention_secs: u64,

    /// Validity of issued agent certificates (days).
    pub cert_validity_days: u32,

    /// SHA-256 hashes of accepted bootstrap tokens.
    pub token_hashes: Vec<String>,

    /// SHA-256 hash of the operator token allowed to approve or deny.
    pub admin_token_hash: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".to_string(),
            ca_cert_path: None,
            ca_key_path: None,
            auto_approve: false,
            csr_ttl_secs: 3600,
            retention_secs: 86400,
            cert_validity_days: 365,
            token_hashes: Vec::new(),
            admin_token_hash: None,
        }
    }
}
