//! Pinned TLS client configuration
//!
//! The connection trusts only the roots from the configured bundle, never the
//! platform store, and presents no client certificate.

use super::CredentialError;
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

/// Shared rustls configuration for every connection attempt
#[derive(Clone)]
pub struct TransportConfig {
    client_config: Arc<ClientConfig>,
    pinned_roots: usize,
}

impl TransportConfig {
    /// Build a client configuration trusting exactly the certificates in `root_ca_bundle`
    pub fn build(root_ca_bundle: &[u8]) -> Result<Self, CredentialError> {
        let mut reader = BufReader::new(root_ca_bundle);
        let mut roots = RootCertStore::empty();
        let mut rejected = Vec::new();

        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| CredentialError::CertificateParse(e.to_string()))?;
            if let Err(e) = roots.add(cert) {
                rejected.push(e.to_string());
            }
        }

        if roots.is_empty() {
            let reason = if rejected.is_empty() {
                "no PEM certificates found".to_string()
            } else {
                format!("every certificate was rejected: {}", rejected.join("; "))
            };
            return Err(CredentialError::CertificateParse(reason));
        }

        let pinned_roots = roots.len();

        // Default protocol versions are TLS 1.2 and TLS 1.3
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(client_config),
            pinned_roots,
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.client_config)
    }

    /// Number of root certificates in the trust store
    pub fn pinned_roots(&self) -> usize {
        self.pinned_roots
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("pinned_roots", &self.pinned_roots)
            .finish_non_exhaustive()
    }
}
