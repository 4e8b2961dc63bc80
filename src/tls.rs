//! TLS key fingerprints and certificate pinning
//!
//! A key fingerprint is the SHA-256 over the certificate's full DER-encoded
//! SubjectPublicKeyInfo, matching how the enclave binds its key into the
//! attestation report data. All TLS connections the verifier opens run
//! through one [`EnclaveCertVerifier`] whose [`CertPolicy`] decides how much
//! the handshake must prove: the probe that reads an enclave's key uses
//! `WebPki` (or `AnyCert` in insecure mode), and the post-verification
//! transport uses `Pinned`, so every reconnect re-proves the fingerprint and
//! can never silently promote a different certificate.

use std::sync::Arc;

use der::{Decode, Encode};
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::error::{Error, Result};

/// SHA-256 fingerprint of a certificate's SubjectPublicKeyInfo (DER).
pub fn cert_pubkey_fingerprint(cert_der: &[u8]) -> Result<String> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| Error::Tls(format!("failed to parse certificate: {e}")))?;

    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::Tls(format!("failed to encode SPKI: {e}")))?;

    Ok(hex::encode(Sha256::digest(spki_der)))
}

/// How strictly a TLS handshake is judged.
#[derive(Debug, Clone)]
pub enum CertPolicy {
    /// Standard web-PKI chain validation
    WebPki,
    /// Accept any certificate; used by the insecure key probe, where the
    /// attestation binding still covers whatever key is read
    AnyCert,
    /// Web-PKI chain validation plus a SubjectPublicKeyInfo fingerprint pin
    Pinned(String),
}

/// Certificate verifier for every connection the verifier opens, from the
/// initial key probe to the pinned transport.
#[derive(Debug)]
pub struct EnclaveCertVerifier {
    policy: CertPolicy,
    webpki: Arc<rustls::client::WebPkiServerVerifier>,
}

impl EnclaveCertVerifier {
    pub fn new(policy: CertPolicy) -> Result<Self> {
        // reqwest may pull in a second rustls crypto provider; claim the
        // process default before any verifier construction needs it
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let webpki = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::Tls(format!("failed to build verifier: {e}")))?;

        Ok(Self { policy, webpki })
    }

    /// Client config routing all certificate decisions through this policy.
    pub fn into_client_config(self) -> rustls::ClientConfig {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(self))
            .with_no_client_auth()
    }
}

impl rustls::client::danger::ServerCertVerifier for EnclaveCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let assertion = rustls::client::danger::ServerCertVerified::assertion();

        match &self.policy {
            CertPolicy::AnyCert => Ok(assertion),
            CertPolicy::WebPki => {
                self.webpki.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                )?;
                Ok(assertion)
            }
            CertPolicy::Pinned(expected) => {
                self.webpki.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                )?;

                let actual = cert_pubkey_fingerprint(end_entity.as_ref()).map_err(|e| {
                    rustls::Error::General(format!("fingerprint computation failed: {e}"))
                })?;
                if actual != *expected {
                    return Err(rustls::Error::General(format!(
                        "certificate fingerprint mismatch: expected {expected}, got {actual}"
                    )));
                }
                Ok(assertion)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

/// Dial `host` (defaulting to port 443) and return the leaf certificate's
/// public key fingerprint. With `insecure` the handshake runs under
/// [`CertPolicy::AnyCert`] instead of web-PKI validation.
pub async fn tls_public_key(host: &str, insecure: bool) -> Result<String> {
    use rustls::pki_types::ServerName;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    let addr = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:443")
    };
    let server_name_str = addr.split(':').next().unwrap_or(host).to_string();

    let policy = if insecure {
        CertPolicy::AnyCert
    } else {
        CertPolicy::WebPki
    };
    let config = EnclaveCertVerifier::new(policy)?.into_client_config();

    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| Error::Tls(format!("failed to connect to {addr}: {e}")))?;

    let connector = TlsConnector::from(Arc::new(config));
    let server_name: ServerName<'_> = server_name_str
        .try_into()
        .map_err(|_| Error::Tls("invalid server name".into()))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::Tls(format!("TLS handshake failed: {e}")))?;

    let (_, conn) = tls_stream.get_ref();
    let certs = conn.peer_certificates().ok_or(Error::NoPeerCertificates)?;
    let leaf = certs.first().ok_or(Error::NoPeerCertificates)?;

    cert_pubkey_fingerprint(leaf.as_ref())
}

/// Build a reqwest client that only completes handshakes with the pinned
/// certificate. The pin is enforced on every connection, not once at
/// connect.
pub fn create_pinned_client(pinned_fingerprint: &str) -> Result<reqwest::Client> {
    let config = EnclaveCertVerifier::new(CertPolicy::Pinned(pinned_fingerprint.to_string()))?
        .into_client_config();

    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()
        .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_policies_construct() {
        for policy in [
            CertPolicy::WebPki,
            CertPolicy::AnyCert,
            CertPolicy::Pinned("ab".repeat(32)),
        ] {
            assert!(EnclaveCertVerifier::new(policy).is_ok());
        }
    }

    #[test]
    fn test_pinned_policy_keeps_fingerprint() {
        let fp = "2b70a37cba08a1b15fddb7ba71dec4cb6b91e79c4566c51a7e4c5fb64fd8d8aa";
        let verifier = EnclaveCertVerifier::new(CertPolicy::Pinned(fp.into())).unwrap();
        match &verifier.policy {
            CertPolicy::Pinned(pinned) => assert_eq!(pinned, fp),
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn test_fingerprint_rejects_garbage() {
        assert!(cert_pubkey_fingerprint(&[0u8; 16]).is_err());
    }
}
