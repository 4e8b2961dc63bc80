//! Secure client: full verification pass and TLS-pinned transport
//!
//! One verification pass establishes the enclave's ground truth: the code
//! provenance from Sigstore, the hardware attestation from the enclave, the
//! hardware platform allow-list for TDX, and the binding between the TLS
//! endpoint and the attested key. After verification all requests go through
//! a client that pins the enclave's certificate fingerprint.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::attestation::{self, HardwareMeasurement, Measurement, Verification};
use crate::error::{Error, Result, Stage};
use crate::github;
use crate::sigstore;
use crate::tls;
use crate::util::{Fetcher, HttpFetcher};

/// The verified "known good" state of an enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruth {
    /// Enclave hostname the verification ran against
    pub enclave: String,

    /// TLS public key fingerprint the transport pins
    pub public_key: String,

    /// HPKE public key bound in the report data, empty for v1 attestations
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hpke_public_key: String,

    /// Release digest the code measurement was attested for
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,

    /// Matched hardware platform (`<platform>@<digest>`), TDX only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_platform: Option<String>,

    pub code_measurement: Measurement,
    pub enclave_measurement: Measurement,

    /// Stable fingerprints of both measurements for the enclave's platform;
    /// equal on every successful verification
    pub code_fingerprint: String,
    pub enclave_fingerprint: String,
}

/// HTTP response from the pinned transport
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub body: Vec<u8>,
}

/// Client that verifies an enclave before talking to it
pub struct SecureClient {
    enclave: String,
    repo: String,

    /// Pinned code measurement; skips the release/provenance fetch
    code_measurement: Option<Measurement>,
    /// Pinned hardware allow-list for TDX enclaves
    hardware_measurements: Option<Vec<HardwareMeasurement>>,

    insecure_tls: bool,

    ground_truth: Option<GroundTruth>,
    pinned_client: Option<reqwest::Client>,
    fetcher: Arc<dyn Fetcher>,
}

impl SecureClient {
    /// Client for an enclave attested by the given repo's releases.
    pub fn new(enclave: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            enclave: enclave.into(),
            repo: repo.into(),
            code_measurement: None,
            hardware_measurements: None,
            insecure_tls: false,
            ground_truth: None,
            pinned_client: None,
            fetcher: Arc::new(HttpFetcher::new()),
        }
    }

    /// Pinned-measurement client: the expected code measurement (and, for
    /// TDX, the hardware allow-list) is injected instead of fetched.
    pub fn with_measurement(
        enclave: impl Into<String>,
        code_measurement: Measurement,
        hardware_measurements: Option<Vec<HardwareMeasurement>>,
    ) -> Self {
        Self {
            enclave: enclave.into(),
            repo: String::new(),
            code_measurement: Some(code_measurement),
            hardware_measurements,
            insecure_tls: false,
            ground_truth: None,
            pinned_client: None,
            fetcher: Arc::new(HttpFetcher::new()),
        }
    }

    /// Skip web-PKI validation when reading the enclave's TLS key. The
    /// attestation binding still covers the fingerprint.
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn enclave(&self) -> &str {
        &self.enclave
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn is_verified(&self) -> bool {
        self.ground_truth.is_some()
    }

    /// The last verified enclave state.
    pub fn ground_truth(&self) -> Option<&GroundTruth> {
        self.ground_truth.as_ref()
    }

    /// The ground truth serialized to JSON.
    pub fn ground_truth_json(&self) -> Result<String> {
        let ground_truth = self.ground_truth.as_ref().ok_or(Error::NotVerified)?;
        Ok(serde_json::to_string(ground_truth)?)
    }

    /// Run the full verification pass and store the resulting ground truth.
    ///
    /// The code-provenance side and the enclave attestation fetch are
    /// independent and run concurrently.
    pub async fn verify(&mut self) -> Result<&GroundTruth> {
        let code_side = self.fetch_code_measurement();
        let enclave_side = async {
            attestation::fetch(&self.enclave)
                .await
                .map_err(|e| Error::stage(Stage::VerifyEnclave, e))
        };

        let ((digest, code_measurement, sigstore_client), enclave_doc) =
            tokio::try_join!(code_side, enclave_side)?;

        let enclave_verification = enclave_doc
            .verify()
            .await
            .map_err(|e| Error::stage(Stage::VerifyEnclave, e))?;

        // TDX platform registers are matched against the hardware allow-list
        let matched_hardware = if enclave_doc.format.is_tdx() {
            let measurements = self
                .hardware_list(sigstore_client.as_ref())
                .await
                .map_err(|e| Error::stage(Stage::VerifyHardware, e))?;
            let matched =
                attestation::verify_hardware(&measurements, &enclave_verification.measurement)
                    .map_err(|e| Error::stage(Stage::VerifyHardware, e))?;
            Some(matched.clone())
        } else {
            None
        };

        self.validate_tls_binding(&enclave_verification)
            .await
            .map_err(|e| Error::stage(Stage::ValidateTls, e))?;

        code_measurement
            .equals(&enclave_verification.measurement)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;

        let code_fingerprint = code_measurement
            .fingerprint(matched_hardware.as_ref(), enclave_doc.format)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;
        let enclave_fingerprint = enclave_verification
            .measurement
            .fingerprint(matched_hardware.as_ref(), enclave_doc.format)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;

        let pinned = tls::create_pinned_client(&enclave_verification.tls_public_key_fp)?;
        self.pinned_client = Some(pinned);

        self.ground_truth = Some(GroundTruth {
            enclave: self.enclave.clone(),
            public_key: enclave_verification.tls_public_key_fp,
            hpke_public_key: enclave_verification.hpke_public_key,
            digest,
            hardware_platform: matched_hardware.map(|m| m.id),
            code_measurement,
            enclave_measurement: enclave_verification.measurement,
            code_fingerprint,
            enclave_fingerprint,
        });

        Ok(self
            .ground_truth
            .as_ref()
            .ok_or(Error::NotVerified)?)
    }

    /// Resolve the expected code measurement: injected in pinned mode, or
    /// fetched from the repo's latest release and its provenance bundle.
    async fn fetch_code_measurement(
        &self,
    ) -> Result<(String, Measurement, Option<sigstore::Client>)> {
        if let Some(pinned) = &self.code_measurement {
            return Ok((String::new(), pinned.clone(), None));
        }

        let digest = github::fetch_latest_digest(self.fetcher.as_ref(), &self.repo)
            .await
            .map_err(|e| Error::stage(Stage::FetchDigest, e))?;

        let bundle = github::fetch_attestation_bundle(self.fetcher.as_ref(), &self.repo, &digest)
            .await
            .map_err(|e| Error::stage(Stage::VerifyCode, e))?;

        let client = sigstore::Client::new()
            .await
            .map_err(|e| Error::stage(Stage::VerifyCode, e))?;
        let measurement = client
            .verify_attestation(&bundle, &digest, &self.repo)
            .map_err(|e| Error::stage(Stage::VerifyCode, e))?;

        Ok((digest, measurement, Some(client)))
    }

    /// Hardware allow-list: injected in pinned mode, fetched through the
    /// provenance pipeline otherwise.
    async fn hardware_list(
        &self,
        sigstore_client: Option<&sigstore::Client>,
    ) -> Result<Vec<HardwareMeasurement>> {
        if let Some(list) = &self.hardware_measurements {
            return Ok(list.clone());
        }
        match sigstore_client {
            Some(client) => client.latest_hardware_measurements().await,
            None => {
                let client = sigstore::Client::new().await?;
                client.latest_hardware_measurements().await
            }
        }
    }

    /// Check that the live TLS endpoint presents the attested public key.
    #[cfg(not(target_arch = "wasm32"))]
    async fn validate_tls_binding(&self, verification: &Verification) -> Result<()> {
        let actual = tls::tls_public_key(&self.enclave, self.insecure_tls).await?;
        if actual != verification.tls_public_key_fp {
            return Err(Error::CertMismatch {
                expected: verification.tls_public_key_fp.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Raw TLS metadata is unavailable in WASM runtimes; the binding check is
    /// skipped loudly. The key fingerprint is still bound to the
    /// hardware-signed quote, so enclave identity holds.
    #[cfg(target_arch = "wasm32")]
    async fn validate_tls_binding(&self, _verification: &Verification) -> Result<()> {
        tracing::warn!(
            enclave = %self.enclave,
            "TLS certificate validation is disabled on this target"
        );
        Ok(())
    }

    /// HTTP client pinned to the verified enclave certificate, verifying
    /// first if needed.
    pub async fn http_client(&mut self) -> Result<&reqwest::Client> {
        if self.ground_truth.is_none() {
            self.verify().await?;
        }
        self.pinned_client.as_ref().ok_or(Error::NotVerified)
    }

    async fn request(
        &mut self,
        method: reqwest::Method,
        url: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        // Relative paths address the verified enclave
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://{}{}", self.enclave, url)
        };

        let client = self.http_client().await?.clone();
        let mut request = client.request(method, &url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        Ok(Response {
            status_code: response.status().as_u16(),
            body: response.bytes().await?.to_vec(),
        })
    }

    /// Make an HTTP GET request through the pinned transport.
    pub async fn get(&mut self, url: &str, headers: &[(&str, &str)]) -> Result<Response> {
        self.request(reqwest::Method::GET, url, headers, None).await
    }

    /// Make an HTTP POST request through the pinned transport.
    pub async fn post(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
        body: Vec<u8>,
    ) -> Result<Response> {
        self.request(reqwest::Method::POST, url, headers, Some(body))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::PredicateType;

    #[test]
    fn test_client_creation() {
        let client = SecureClient::new("inference.tinfoil.sh", "tinfoilsh/confidential-model");
        assert_eq!(client.enclave(), "inference.tinfoil.sh");
        assert_eq!(client.repo(), "tinfoilsh/confidential-model");
        assert!(!client.is_verified());
    }

    #[test]
    fn test_ground_truth_json_requires_verification() {
        let client = SecureClient::new("inference.tinfoil.sh", "tinfoilsh/confidential-model");
        assert!(matches!(
            client.ground_truth_json(),
            Err(Error::NotVerified)
        ));
    }

    #[test]
    fn test_ground_truth_json_roundtrip() {
        let measurement = Measurement {
            type_: PredicateType::SnpTdxMultiPlatformV1,
            registers: vec!["snp".into(), "r1".into(), "r2".into()],
        };
        let enclave_measurement = Measurement {
            type_: PredicateType::TdxGuestV2,
            registers: vec!["m".into(), "r0".into(), "r1".into(), "r2".into(), "r3".into()],
        };
        let ground_truth = GroundTruth {
            enclave: "enclave.example.com".into(),
            public_key: "aa".repeat(32),
            hpke_public_key: "bb".repeat(32),
            digest: "cc".repeat(32),
            hardware_platform: Some("hw1@digest".into()),
            code_measurement: measurement,
            enclave_measurement,
            code_fingerprint: "dd".repeat(32),
            enclave_fingerprint: "dd".repeat(32),
        };

        let json = serde_json::to_string(&ground_truth).unwrap();
        let back: GroundTruth = serde_json::from_str(&json).unwrap();

        assert_eq!(back.enclave, ground_truth.enclave);
        assert_eq!(back.public_key, ground_truth.public_key);
        assert_eq!(back.hpke_public_key, ground_truth.hpke_public_key);
        assert_eq!(back.digest, ground_truth.digest);
        assert_eq!(back.hardware_platform, ground_truth.hardware_platform);
        assert_eq!(back.code_measurement, ground_truth.code_measurement);
        assert_eq!(back.enclave_measurement, ground_truth.enclave_measurement);
        assert_eq!(back.code_fingerprint, ground_truth.code_fingerprint);
        assert_eq!(back.enclave_fingerprint, ground_truth.enclave_fingerprint);
    }

    #[test]
    fn test_pinned_mode_carries_measurement() {
        let measurement = Measurement {
            type_: PredicateType::SevGuestV2,
            registers: vec!["abc".into()],
        };
        let client =
            SecureClient::with_measurement("enclave.example.com", measurement.clone(), None);
        assert_eq!(client.code_measurement, Some(measurement));
        assert!(client.repo().is_empty());
    }
}
