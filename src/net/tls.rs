//! TLS client configuration for probing.
//!
//! Probed edges are not trusted peers: only their liveness and behavior
//! matter, so the chain and host name are never validated. The handshake
//! signature checks still run through rustls' defaults.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{Certificate, ClientConfig, Error as TlsError, ServerName};
use tokio_rustls::TlsConnector;

use super::socket::SocketError;

/// Accepts any server certificate chain for any name.
pub struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Client config with certificate validation disabled.
pub fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Shared connector built once per pool and cloned per handshake.
pub fn insecure_connector() -> TlsConnector {
    TlsConnector::from(Arc::new(insecure_client_config()))
}

/// Parse the SNI host presented during the handshake.
pub fn server_name(host: &str) -> Result<ServerName, SocketError> {
    ServerName::try_from(host)
        .map_err(|e| SocketError::Handshake(format!("invalid server name '{host}': {e}")))
}
