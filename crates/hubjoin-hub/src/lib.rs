//! hubjoin Reference Hub Library
//!
//! A small hub answering the agent's liveness and CSR calls, for local
//! development and end-to-end tests.

pub mod ca;
pub mod config;
pub mod error;
pub mod http;
pub mod state;
pub mod token;

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

pub use ca::{CaError, CertificateAuthority, SignedCertificate};
pub use config::HubConfig;
pub use error::{ApiError, ErrorResponse};
pub use http::create_router;
pub use state::HubState;
pub use token::{generate_bootstrap_token, hash_token, BootstrapToken};

/// Common name of a CA generated at startup.
pub const GENERATED_CA_NAME: &str = "hubjoin Hub CA";

/// Load the configured CA, or generate one when neither path is set.
pub fn load_ca(config: &HubConfig) -> Result<CertificateAuthority, CaError> {
    match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert), Some(key)) => {
            let ca = CertificateAuthority::from_files(cert, key, config.cert_validity_days)?;
            info!(
                ca_cert = %cert.display(),
                validity_days = config.cert_validity_days,
                "Certificate Authority loaded"
            );
            Ok(ca)
        }
        (None, None) => {
            let ca = CertificateAuthority::generate(GENERATED_CA_NAME, config.cert_validity_days)?;
            info!(
                validity_days = config.cert_validity_days,
                "Generated in-memory Certificate Authority"
            );
            Ok(ca)
        }
        _ => Err(CaError::IncompletePaths),
    }
}

/// Serve the hub API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: Arc<HubState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let router = create_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_generates_ca_without_paths() {
        let ca = load_ca(&HubConfig::default()).unwrap();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_rejects_half_configured_ca() {
        let cert_only = HubConfig {
            ca_cert_path: Some(PathBuf::from("/etc/hubjoin/ca.crt")),
            ..Default::default()
        };
        assert!(matches!(load_ca(&cert_only), Err(CaError::IncompletePaths)));

        let key_only = HubConfig {
            ca_key_path: Some(PathBuf::from("/etc/hubjoin/ca.key")),
            ..Default::default()
        };
        assert!(matches!(load_ca(&key_only), Err(CaError::IncompletePaths)));
    }
}
