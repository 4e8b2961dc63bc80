//! Pre-fetched attestation bundle verification
//!
//! An aggregator can hand the client everything one verification pass needs
//! in a single fetch: the enclave attestation, the VCEK, the Sigstore bundle
//! and the enclave certificate. The flow is the same as the live pass except
//! that TLS binding is derived from the supplied certificate: its SANs must
//! cover the claimed domain and decode to the attested HPKE key and
//! attestation-document hash. The aggregator is only trusted for the routing
//! claim; every cryptographic fact is re-verified.

use base64::Engine;
use serde::Deserialize;

use crate::attestation::cert::verify_certificate;
use crate::attestation::sev::SevVerifier;
use crate::attestation::tdx::TdxVerifier;
use crate::attestation::{self, Document, PredicateType, Verification};
use crate::client::GroundTruth;
use crate::error::{Error, Result, Stage};
use crate::sigstore;
use crate::util::Fetcher;

/// Default aggregated-bundle endpoint
pub const DEFAULT_BUNDLE_URL: &str = "https://atc.tinfoil.sh/bundle";

/// Everything needed for one offline verification pass
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub domain: String,
    pub digest: String,
    pub enclave_attestation_report: Document,
    /// VCEK certificate, base64-encoded DER
    pub vcek: String,
    /// Raw Sigstore bundle JSON
    pub sigstore_bundle: Box<serde_json::value::RawValue>,
    /// Enclave TLS certificate, PEM
    pub enclave_cert: String,
}

/// Fetch an aggregated bundle for a domain.
pub async fn fetch_bundle(fetcher: &dyn Fetcher, base_url: &str, domain: &str) -> Result<Bundle> {
    let url = format!("{base_url}/{domain}");
    let raw = fetcher.get(&url).await?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Verifier for aggregated bundles.
pub struct BundleVerifier {
    sigstore: sigstore::Client,
    sev: SevVerifier,
    tdx: TdxVerifier,
}

impl BundleVerifier {
    pub fn new(sigstore: sigstore::Client) -> Result<Self> {
        Ok(Self {
            sigstore,
            sev: SevVerifier::new()?,
            tdx: TdxVerifier::new()?,
        })
    }

    /// Verify a bundle end to end and emit the ground truth.
    pub async fn verify(&self, bundle: &Bundle, repo: &str) -> Result<GroundTruth> {
        let code_measurement = self
            .sigstore
            .verify_attestation(
                bundle.sigstore_bundle.get().as_bytes(),
                &bundle.digest,
                repo,
            )
            .map_err(|e| Error::stage(Stage::VerifyCode, e))?;

        let enclave_verification = self
            .verify_enclave_attestation(bundle)
            .map_err(|e| Error::stage(Stage::VerifyEnclave, e))?;

        let format = bundle.enclave_attestation_report.format;
        let matched_hardware = if format.is_tdx() {
            let measurements = self
                .sigstore
                .latest_hardware_measurements()
                .await
                .map_err(|e| Error::stage(Stage::VerifyHardware, e))?;
            Some(
                attestation::verify_hardware(&measurements, &enclave_verification.measurement)
                    .map_err(|e| Error::stage(Stage::VerifyHardware, e))?
                    .clone(),
            )
        } else {
            None
        };

        // Bind the supplied certificate instead of dialing the enclave
        verify_certificate(
            &bundle.enclave_cert,
            &bundle.domain,
            &bundle.enclave_attestation_report,
            &enclave_verification.hpke_public_key,
        )
        .map_err(|e| Error::stage(Stage::ValidateTls, e))?;

        code_measurement
            .equals(&enclave_verification.measurement)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;

        let code_fingerprint = code_measurement
            .fingerprint(matched_hardware.as_ref(), format)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;
        let enclave_fingerprint = enclave_verification
            .measurement
            .fingerprint(matched_hardware.as_ref(), format)
            .map_err(|e| Error::stage(Stage::Measurements, e.into()))?;

        Ok(GroundTruth {
            enclave: bundle.domain.clone(),
            public_key: enclave_verification.tls_public_key_fp,
            hpke_public_key: enclave_verification.hpke_public_key,
            digest: bundle.digest.clone(),
            hardware_platform: matched_hardware.map(|m| m.id),
            code_measurement,
            enclave_measurement: enclave_verification.measurement,
            code_fingerprint,
            enclave_fingerprint,
        })
    }

    fn verify_enclave_attestation(&self, bundle: &Bundle) -> Result<Verification> {
        let doc = &bundle.enclave_attestation_report;
        match doc.format {
            PredicateType::SevGuestV1 | PredicateType::SevGuestV2 => {
                let vcek_der = base64::engine::general_purpose::STANDARD
                    .decode(&bundle.vcek)
                    .map_err(|e| Error::Decode(format!("bad VCEK encoding: {e}")))?;
                if doc.format == PredicateType::SevGuestV1 {
                    self.sev.verify_v1_with_vcek(&doc.body, &vcek_der)
                } else {
                    self.sev.verify_v2_with_vcek(&doc.body, &vcek_der)
                }
            }
            PredicateType::TdxGuestV1 => self.tdx.verify_v1(&doc.body),
            PredicateType::TdxGuestV2 => self.tdx.verify_v2(&doc.body),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_deserialization() {
        let raw = r#"{
            "domain": "enclave.example.com",
            "digest": "ab12",
            "enclave_attestation_report": {
                "format": "https://tinfoil.sh/predicate/tdx-guest/v2",
                "body": "H4sI"
            },
            "vcek": "AAEC",
            "sigstore_bundle": {"mediaType": "application/vnd.dev.sigstore.bundle.v0.3+json"},
            "enclave_cert": "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----"
        }"#;
        let bundle: Bundle = serde_json::from_str(raw).unwrap();
        assert_eq!(bundle.domain, "enclave.example.com");
        assert_eq!(
            bundle.enclave_attestation_report.format,
            PredicateType::TdxGuestV2
        );
        assert!(bundle.sigstore_bundle.get().contains("mediaType"));
    }
}
