//! Host identity and host-key pinning.
//!
//! The server proves who it is with an X.509 certificate. Clients do not
//! use a CA: they pin the SHA-256 fingerprint of the certificate, the way
//! an SSH client pins a host key in `known_hosts`.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{TransportError, TransportResult};

/// The server's certificate chain and private key.
pub struct HostIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl HostIdentity {
    /// Generate an ephemeral self-signed identity valid for `names`.
    pub fn generate(names: &[String]) -> TransportResult<Self> {
        let certified = rcgen::generate_simple_self_signed(names.to_vec())
            .map_err(|e| TransportError::Configuration(format!("generate host identity: {e}")))?;
        let identity = Self {
            cert_chain: vec![certified.cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into(),
        };
        info!(fingerprint = %identity.fingerprint(), "generated ephemeral host identity");
        Ok(identity)
    }

    /// Load an identity from PEM-encoded certificate chain and key.
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> TransportResult<Self> {
        let cert_chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Configuration(format!("parse host certificate: {e}")))?;
        if cert_chain.is_empty() {
            return Err(TransportError::Configuration(
                "no certificate found in host certificate PEM".into(),
            ));
        }
        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| TransportError::Configuration(format!("parse host key: {e}")))?
            .ok_or_else(|| TransportError::Configuration("no private key found in host key PEM".into()))?;
        Ok(Self { cert_chain, key })
    }

    /// Load an identity from PEM files on disk.
    pub fn load(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let cert_pem = std::fs::read(cert_path).map_err(|e| {
            TransportError::Configuration(format!("read {}: {e}", cert_path.display()))
        })?;
        let key_pem = std::fs::read(key_path).map_err(|e| {
            TransportError::Configuration(format!("read {}: {e}", key_path.display()))
        })?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Hex SHA-256 of the leaf certificate; what clients pin.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_chain[0])
    }

    pub(crate) fn server_config(&self) -> TransportResult<Arc<rustls::ServerConfig>> {
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Configuration(format!("tls protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(|e| TransportError::Configuration(format!("host identity: {e}")))?;
        Ok(Arc::new(config))
    }
}

impl Clone for HostIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &[u8]) -> String {
    hex::encode(Sha256::digest(cert))
}

/// How a client decides whether to trust the server's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept only a certificate with this hex SHA-256 fingerprint.
    Pinned(String),
    /// Accept any certificate. Only for tests and local tooling.
    InsecureAcceptAny,
}

impl HostKeyPolicy {
    pub(crate) fn client_config(&self) -> TransportResult<Arc<rustls::ClientConfig>> {
        let provider = provider();
        let expected = match self {
            Self::Pinned(fp) => Some(fp.to_ascii_lowercase()),
            Self::InsecureAcceptAny => None,
        };
        let verifier = FingerprintVerifier {
            expected,
            provider: Arc::clone(&provider),
        };
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Configuration(format!("tls protocol versions: {e}")))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        Ok(Arc::new(config))
    }
}

fn provider() -> Arc<CryptoProvider> {
    rustls::crypto::ring::default_provider().into()
}

/// Checks the leaf fingerprint instead of a CA chain; handshake
/// signatures are still verified so the server must hold the key.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Option<String>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.expected {
            Some(expected) if fingerprint(end_entity) != *expected => Err(
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure),
            ),
            _ => Ok(ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> Vec<String> {
        vec!["localhost".to_string()]
    }

    #[test]
    fn generated_identity_builds_server_config() {
        let identity = HostIdentity::generate(&localhost()).unwrap();
        assert!(identity.server_config().is_ok());
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn pem_identity_round_trips_through_files() {
        let certified = rcgen::generate_simple_self_signed(localhost()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("host.crt");
        let key_path = dir.path().join("host.key");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let identity = HostIdentity::load(&cert_path, &key_path).unwrap();
        assert_eq!(identity.fingerprint(), fingerprint(certified.cert.der()));
        assert!(identity.server_config().is_ok());
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        let certified = rcgen::generate_simple_self_signed(localhost()).unwrap();
        let err = HostIdentity::from_pem(certified.cert.pem().as_bytes(), b"").unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn empty_certificate_is_a_configuration_error() {
        let err = HostIdentity::from_pem(b"", b"").unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
    }

    #[test]
    fn pinned_verifier_compares_fingerprints() {
        let identity = HostIdentity::generate(&localhost()).unwrap();
        let leaf = identity.cert_chain[0].clone();
        let name = ServerName::try_from("localhost").unwrap();

        let good = FingerprintVerifier {
            expected: Some(identity.fingerprint()),
            provider: provider(),
        };
        assert!(good.verify_server_cert(&leaf, &[], &name, &[], UnixTime::now()).is_ok());

        let bad = FingerprintVerifier {
            expected: Some("00".repeat(32)),
            provider: provider(),
        };
        assert!(bad.verify_server_cert(&leaf, &[], &name, &[], UnixTime::now()).is_err());
    }
}
