//! Attestation document handling and platform verification
//!
//! An enclave serves its attestation document at
//! `/.well-known/tinfoil-attestation` as `{"format": <predicate>, "body":
//! <base64>}`. The body is the raw platform quote, gzip-compressed for v2
//! formats. Verification dispatches on the predicate type to the SEV-SNP or
//! TDX verifier and yields the enclave [`Verification`]: the measurement
//! registers plus the TLS/HPKE key material bound in the report data.

pub mod cert;
pub mod collateral;
pub mod hardware;
pub mod sev;
pub mod tdx;
pub mod types;

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use hardware::{verify_hardware, HardwareMeasurement};
pub use types::{Measurement, MeasurementError, PredicateType, Verification};

const ATTESTATION_ENDPOINT: &str = "/.well-known/tinfoil-attestation";

/// Transport envelope for a platform attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub format: PredicateType,
    /// Base64-encoded quote, gzip-compressed for v2 formats
    pub body: String,
}

impl Document {
    /// Create a new attestation document from a format and raw quote bytes,
    /// compressing and encoding the body.
    pub fn new(format: PredicateType, body: &[u8]) -> Result<Self> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(body)?;
        let compressed = gz.finish()?;

        Ok(Self {
            format,
            body: base64::engine::general_purpose::STANDARD.encode(compressed),
        })
    }

    /// SHA-256 over the concatenated format and body strings. This is the
    /// value bound into the enclave certificate's `hatt` SANs.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.format.as_str().as_bytes());
        hasher.update(self.body.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify the document against its hardware trust root using the default
    /// embedded collateral, returning the inner measurements and keys.
    pub async fn verify(&self) -> Result<Verification> {
        QuoteVerifier::new()?.verify(self).await
    }

    /// Read an attestation document from a JSON file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read(path)?;
        Ok(serde_json::from_slice(&contents)?)
    }
}

/// Platform verifier dispatching on the document's predicate type.
///
/// Holds the SEV-SNP and TDX verifiers so the collateral providers and clock
/// can be injected once and reused across verification passes.
pub struct QuoteVerifier {
    sev: sev::SevVerifier,
    tdx: tdx::TdxVerifier,
}

impl QuoteVerifier {
    /// Verifier backed by the embedded collateral and the system clock.
    pub fn new() -> Result<Self> {
        Ok(Self {
            sev: sev::SevVerifier::new()?,
            tdx: tdx::TdxVerifier::new()?,
        })
    }

    pub fn with_verifiers(sev: sev::SevVerifier, tdx: tdx::TdxVerifier) -> Self {
        Self { sev, tdx }
    }

    pub async fn verify(&self, doc: &Document) -> Result<Verification> {
        match doc.format {
            PredicateType::SevGuestV1 => self.sev.verify_v1(&doc.body).await,
            PredicateType::SevGuestV2 => self.sev.verify_v2(&doc.body).await,
            PredicateType::TdxGuestV1 => self.tdx.verify_v1(&doc.body),
            PredicateType::TdxGuestV2 => self.tdx.verify_v2(&doc.body),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Verify an attestation document in JSON form and return the inner
/// measurements.
pub async fn verify_attestation_json(json: &[u8]) -> Result<Verification> {
    let doc: Document = serde_json::from_slice(json)?;
    doc.verify().await
}

/// Fetch the attestation document from an enclave hostname.
pub async fn fetch(host: &str) -> Result<Document> {
    let url = format!("https://{host}{ATTESTATION_ENDPOINT}");

    let response = reqwest::get(&url).await?;
    if !response.status().is_success() {
        return Err(Error::Network(format!(
            "attestation fetch returned {}",
            response.status()
        )));
    }

    Ok(response.json().await?)
}

/// Decode an attestation body: base64, then gzip when the format is
/// compressed.
pub(crate) fn decode_body(body: &str, compressed: bool) -> Result<Vec<u8>> {
    let raw = base64::engine::general_purpose::STANDARD.decode(body)?;

    if !compressed {
        return Ok(raw);
    }

    let mut decoder = GzDecoder::new(&raw[..]);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Decode(format!("gzip decompress failed: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_roundtrip() {
        let body = b"attestation report bytes";
        let doc = Document::new(PredicateType::SevGuestV2, body).unwrap();

        let decoded = decode_body(&doc.body, true).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_document_hash_stable() {
        let doc = Document {
            format: PredicateType::SevGuestV2,
            body: "H4sIdGVzdA==".into(),
        };
        // SHA-256 of "https://tinfoil.sh/predicate/sev-snp-guest/v2H4sIdGVzdA=="
        let expected = "ab4a95dbc8f8bdb92d14abb1ee8e2033e4598be08482a248c53b952e4e6db40b";
        assert_eq!(doc.hash(), expected);
        assert_eq!(doc.hash(), doc.hash());
    }

    #[test]
    fn test_document_json_roundtrip() {
        let doc = Document::new(PredicateType::TdxGuestV2, b"quote").unwrap();
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn test_decode_body_uncompressed() {
        let body = base64::engine::general_purpose::STANDARD.encode(b"raw report");
        assert_eq!(decode_body(&body, false).unwrap(), b"raw report");
    }

    #[tokio::test]
    async fn test_unsupported_format() {
        let doc = Document {
            format: PredicateType::HardwareMeasurementsV1,
            body: String::new(),
        };
        assert!(matches!(
            doc.verify().await,
            Err(Error::UnsupportedFormat(_))
        ));
    }
}
