//! TLS identity material and the rustls configurations built from it.
//!
//! Every punchdrop endpoint presents a certificate, and every endpoint
//! demands one from its peer.  Names are never checked.  The rendezvous
//! service is identified by the SHA-256 fingerprint of its certificate when
//! one is configured ([`pinned_client_config`]); peers are self-signed and
//! only reachable through the service, so their certificates are accepted
//! as presented ([`client_config`]).  Handshake signatures are always
//! verified, which proves the remote end holds the private key of the
//! certificate it presents.

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use sha2::{Digest, Sha256};

/// Raw DER-encoded certificate and private key material.
///
/// Produced by [`generate_self_signed_cert`] or loaded from the application
/// directory, and consumed by [`client_config`] / [`server_config`].
#[derive(Clone)]
pub struct CertKeyPair {
    pub cert_der: Vec<u8>,
    pub private_key_pkcs8_der: Vec<u8>,
}

impl CertKeyPair {
    #[must_use]
    pub fn certificate(&self) -> CertificateDer<'static> {
        CertificateDer::from(self.cert_der.clone())
    }

    #[must_use]
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key_pkcs8_der.clone()))
    }

    /// SHA-256 fingerprint of the certificate, in hex.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_der)
    }
}

/// SHA-256 fingerprint of a DER certificate, in hex.
#[must_use]
pub fn fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Generates a self-signed certificate for the given `subjects`.
///
/// # Errors
///
/// Returns an error if certificate generation fails.
pub fn generate_self_signed_cert(subjects: &[&str]) -> Result<CertKeyPair> {
    let subjects: Vec<String> = subjects.iter().map(|&s| s.to_string()).collect();

    let certified_key = rcgen::generate_simple_self_signed(subjects)
        .context("failed to generate self-signed certificate")?;

    Ok(CertKeyPair {
        cert_der: certified_key.cert.der().to_vec(),
        private_key_pkcs8_der: certified_key.key_pair.serialize_der(),
    })
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds a TLS 1.3 client config presenting `identity` and accepting any
/// server certificate whose handshake signature checks out.
///
/// # Errors
///
/// Returns an error if the key material is rejected by rustls.
pub fn client_config(identity: &CertKeyPair, alpn: &[u8]) -> Result<rustls::ClientConfig> {
    build_client_config(identity, alpn, None)
}

/// Like [`client_config`], but the server certificate must have the SHA-256
/// `fingerprint` (hex, any case).
///
/// # Errors
///
/// Returns an error if the key material is rejected by rustls.
pub fn pinned_client_config(
    identity: &CertKeyPair,
    alpn: &[u8],
    fingerprint: &str,
) -> Result<rustls::ClientConfig> {
    build_client_config(identity, alpn, Some(fingerprint.to_ascii_lowercase()))
}

fn build_client_config(
    identity: &CertKeyPair,
    alpn: &[u8],
    pinned: Option<String>,
) -> Result<rustls::ClientConfig> {
    let provider = provider();
    let verifier = ServerCert {
        pinned,
        algorithms: provider.signature_verification_algorithms,
    };

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![identity.certificate()], identity.private_key())
        .context("failed to build rustls client config")?;

    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(config)
}

/// Builds a TLS 1.3 server config presenting `identity` and requiring a
/// client certificate.
///
/// # Errors
///
/// Returns an error if the key material is rejected by rustls.
pub fn server_config(identity: &CertKeyPair, alpn: &[u8]) -> Result<rustls::ServerConfig> {
    let provider = provider();
    let verifier = AnyClientCert {
        algorithms: provider.signature_verification_algorithms,
    };

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(vec![identity.certificate()], identity.private_key())
        .context("failed to build rustls server config")?;

    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(config)
}

/// Accepts the pinned certificate, or any certificate when nothing is pinned.
#[derive(Debug)]
struct ServerCert {
    pinned: Option<String>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for ServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match &self.pinned {
            Some(expected) if *expected != fingerprint(end_entity) => Err(
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[derive(Debug)]
struct AnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
