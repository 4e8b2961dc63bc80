//! Error types for the verifier

use thiserror::Error;

use crate::attestation::types::MeasurementError;

/// Verification pass stage, used to prefix errors surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchDigest,
    VerifyCode,
    VerifyEnclave,
    VerifyHardware,
    ValidateTls,
    Measurements,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::FetchDigest => "fetchDigest",
            Stage::VerifyCode => "verifyCode",
            Stage::VerifyEnclave => "verifyEnclave",
            Stage::VerifyHardware => "verifyHardware",
            Stage::ValidateTls => "validateTLS",
            Stage::Measurements => "measurements",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("unsupported attestation format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to parse quote: {0}")]
    QuoteParse(String),

    #[error("quote signature verification failed: {0}")]
    QuoteSignature(String),

    #[error("quote policy violation: {0}")]
    QuotePolicy(String),

    #[error("MRSEAM not in the accepted list: {0}")]
    UnexpectedMrSeam(String),

    #[error("collateral missing: {0}")]
    CollateralMissing(String),

    #[error("bundle verification failed: {0}")]
    BundleVerify(String),

    #[error("unsupported predicate type: {0}")]
    UnsupportedPredicate(String),

    #[error("invalid multi-platform predicate: {0}")]
    InvalidMultiplatformPredicate(String),

    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    #[error("no peer certificates")]
    NoPeerCertificates,

    #[error("certificate fingerprint mismatch: expected {expected}, got {actual}")]
    CertMismatch { expected: String, actual: String },

    #[error("no TLS connection")]
    NoTls,

    #[error("certificate not valid for domain {domain}")]
    CertDomainMismatch { domain: String },

    #[error("certificate SANs do not contain {0}")]
    CertSanMissing(String),

    #[error("HPKE key mismatch: certificate has {actual}, expected {expected}")]
    HpkeMismatch { expected: String, actual: String },

    #[error("attestation hash mismatch: certificate has {actual}, computed {computed}")]
    AttestationHashMismatch { computed: String, actual: String },

    #[error("no matching hardware platform found")]
    HardwareNoMatch,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("client not verified - call verify() first")]
    NotVerified,

    #[error("{stage}: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the verification stage it occurred in.
    pub fn stage(stage: Stage, source: Error) -> Self {
        Error::Stage {
            stage,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_prefix() {
        let err = Error::stage(Stage::FetchDigest, Error::Network("timeout".into()));
        assert_eq!(err.to_string(), "fetchDigest: network error: timeout");
    }

    #[test]
    fn test_measurement_error_passthrough() {
        let err: Error = MeasurementError::FormatMismatch.into();
        assert_eq!(err.to_string(), MeasurementError::FormatMismatch.to_string());
    }
}
