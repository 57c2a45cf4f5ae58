//! rustls setup for PostgreSQL connections.
//!
//! Used by the PostgreSQL backend and the PostgreSQL checkpoint store.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{ReconcileError, Result};

/// PostgreSQL `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Plain TCP.
    #[default]
    Disable,
    /// Encrypted, server certificate not verified.
    Require,
    /// Encrypted, certificate verified against the web PKI roots.
    VerifyCa,
    /// Encrypted, certificate and hostname verified.
    VerifyFull,
}

impl SslMode {
    pub fn requires_tls(self) -> bool {
        self != SslMode::Disable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::Require => "require",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SslMode {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(ReconcileError::Config(format!(
                "unknown ssl_mode '{}' (expected disable, require, verify-ca or verify-full)",
                other
            ))),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// rustls client configuration for `mode`.
pub fn client_config(mode: SslMode) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ReconcileError::Config(format!("TLS setup failed: {}", e)))?;

    match mode {
        SslMode::Disable => Err(ReconcileError::Config(
            "ssl_mode=disable has no TLS configuration".into(),
        )),
        SslMode::Require => {
            warn!("ssl_mode=require: server certificate is NOT verified");
            Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider())))
                .with_no_client_auth())
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            // rustls always checks the hostname, so verify-ca behaves as verify-full
            debug!("ssl_mode={}: verifying server certificate", mode);
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(builder.with_root_certificates(roots).with_no_client_auth())
        }
    }
}

/// TLS connector for tokio-postgres, or `None` when TLS is disabled.
pub fn make_connector(mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    if !mode.requires_tls() {
        return Ok(None);
    }
    Ok(Some(MakeRustlsConnect::new(client_config(mode)?)))
}

/// Verifier for `ssl_mode=require`: signatures are still checked, the
/// certificate chain is not.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssl_mode() {
        assert_eq!("".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("VERIFY-FULL".parse::<SslMode>().unwrap(), SslMode::VerifyFull);
        assert!("prefer".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_from_yaml() {
        let mode: SslMode = serde_yaml::from_str("verify-ca").unwrap();
        assert_eq!(mode, SslMode::VerifyCa);
    }

    #[test]
    fn test_connector_only_when_tls_enabled() {
        assert!(make_connector(SslMode::Disable).unwrap().is_none());
        assert!(make_connector(SslMode::Require).unwrap().is_some());
        assert!(make_connector(SslMode::VerifyFull).unwrap().is_some());
    }
}
