//! Sigstore verification for code provenance
//!
//! Consumes the DSSE attestation bundle a repository publishes for each
//! release and produces the expected [`Measurement`] the enclave quote is
//! compared against. The trust root is fetched once per client from the
//! Sigstore TUF repository (or injected) and reused for every verification.

mod verify;

use std::sync::Arc;

use crate::attestation::hardware::HardwareMeasurement;
use crate::attestation::types::{Measurement, PredicateType};
use crate::error::{Error, Result};
use crate::github;
use crate::util::{Fetcher, HttpFetcher};

pub use verify::{Statement, TrustedRoot};

/// Pinned `trusted_root.json` target in the Sigstore TUF CDN. The TUF
/// metadata client proper is out of scope; callers needing full TUF
/// verification can fetch the target themselves and use
/// [`Client::with_trust_root`].
const TRUSTED_ROOT_URL: &str =
    "https://tuf-repo-cdn.sigstore.dev/targets/4364d7724c04cc912ce2a6c45ed2610e8d8d1c4dc857fb500292738d4d9c8d2c.trusted_root.json";

/// Repo publishing the signed hardware platform allow-list
const HARDWARE_MEASUREMENTS_REPO: &str = "tinfoilsh/hardware-measurements";

/// Fetch the Sigstore trust root material.
pub async fn fetch_trust_root(fetcher: &dyn Fetcher) -> Result<Vec<u8>> {
    fetcher.get(TRUSTED_ROOT_URL).await
}

/// Sigstore verification client holding the parsed trust root.
pub struct Client {
    trust_root: TrustedRoot,
    fetcher: Arc<dyn Fetcher>,
}

impl Client {
    /// Create a client, fetching the trust root from the Sigstore TUF CDN.
    pub async fn new() -> Result<Self> {
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new());
        let trust_root_json = fetch_trust_root(fetcher.as_ref()).await?;
        Ok(Self {
            trust_root: TrustedRoot::from_json(&trust_root_json)?,
            fetcher,
        })
    }

    /// Create a client over caller-supplied trust root material.
    pub fn with_trust_root(trust_root_json: &[u8]) -> Result<Self> {
        Ok(Self {
            trust_root: TrustedRoot::from_json(trust_root_json)?,
            fetcher: Arc::new(HttpFetcher::new()),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Verify the attested measurements of an enclave image against the
    /// trust root and return the measurement payload contained in the DSSE.
    pub fn verify_attestation(
        &self,
        bundle_json: &[u8],
        hex_digest: &str,
        repo: &str,
    ) -> Result<Measurement> {
        let statement = verify::verify_bundle(&self.trust_root, bundle_json, hex_digest, repo)?;
        measurement_from_statement(&statement)
    }

    /// Verify a `hardware-measurements/v1` bundle and return the allow-list
    /// entries, each identified as `<platform>@<digest>`.
    pub async fn fetch_hardware_measurements(
        &self,
        repo: &str,
        hex_digest: &str,
    ) -> Result<Vec<HardwareMeasurement>> {
        let bundle = github::fetch_attestation_bundle(self.fetcher.as_ref(), repo, hex_digest).await?;
        let statement = verify::verify_bundle(&self.trust_root, &bundle, hex_digest, repo)?;

        let predicate_type: PredicateType =
            serde_json::from_value(serde_json::Value::String(statement.predicate_type.clone()))
                .unwrap_or(PredicateType::Unknown);
        if predicate_type != PredicateType::HardwareMeasurementsV1 {
            return Err(Error::UnsupportedPredicate(statement.predicate_type));
        }

        let platforms = statement
            .predicate
            .as_object()
            .ok_or_else(|| Error::BundleVerify("hardware predicate is not an object".into()))?;

        let mut measurements = Vec::new();
        for (platform, registers) in platforms {
            let Some(fields) = registers.as_object() else {
                continue;
            };
            let (Some(mrtd), Some(rtmr0)) = (
                fields.get("mrtd").and_then(|v| v.as_str()),
                fields.get("rtmr0").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            measurements.push(HardwareMeasurement {
                id: format!("{platform}@{hex_digest}"),
                mrtd: mrtd.to_string(),
                rtmr0: rtmr0.to_string(),
            });
        }

        measurements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(measurements)
    }

    /// Fetch and verify the latest hardware allow-list from the dedicated
    /// hardware measurements repo.
    pub async fn latest_hardware_measurements(&self) -> Result<Vec<HardwareMeasurement>> {
        let digest =
            github::fetch_latest_digest(self.fetcher.as_ref(), HARDWARE_MEASUREMENTS_REPO).await?;
        self.fetch_hardware_measurements(HARDWARE_MEASUREMENTS_REPO, &digest)
            .await
    }
}

/// Map a verified statement's predicate to the expected measurement.
fn measurement_from_statement(statement: &Statement) -> Result<Measurement> {
    let predicate_type: PredicateType =
        serde_json::from_value(serde_json::Value::String(statement.predicate_type.clone()))
            .unwrap_or(PredicateType::Unknown);

    match predicate_type {
        PredicateType::SevGuestV1 => {
            let measurement = statement
                .predicate
                .get("measurement")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::BundleVerify("SEV predicate is missing its measurement".into())
                })?;
            Ok(Measurement {
                type_: PredicateType::SevGuestV1,
                registers: vec![measurement.to_string()],
            })
        }
        PredicateType::SnpTdxMultiPlatformV1 => {
            let snp = non_null_str(&statement.predicate, &["snp_measurement"])
                .ok_or_else(|| missing_multiplatform_field("snp_measurement"))?;

            if statement
                .predicate
                .get("tdx_measurement")
                .map(|v| v.is_null())
                .unwrap_or(true)
            {
                return Err(missing_multiplatform_field("tdx_measurement"));
            }
            let rtmr1 = non_null_str(&statement.predicate, &["tdx_measurement", "rtmr1"])
                .ok_or_else(|| missing_multiplatform_field("tdx_measurement.rtmr1"))?;
            let rtmr2 = non_null_str(&statement.predicate, &["tdx_measurement", "rtmr2"])
                .ok_or_else(|| missing_multiplatform_field("tdx_measurement.rtmr2"))?;

            Ok(Measurement {
                type_: PredicateType::SnpTdxMultiPlatformV1,
                registers: vec![snp.to_string(), rtmr1.to_string(), rtmr2.to_string()],
            })
        }
        _ => Err(Error::UnsupportedPredicate(
            statement.predicate_type.clone(),
        )),
    }
}

fn non_null_str<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().filter(|s| !s.is_empty())
}

fn missing_multiplatform_field(field: &str) -> Error {
    Error::InvalidMultiplatformPredicate(format!("missing or null {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(predicate_type: &str, predicate: serde_json::Value) -> Statement {
        serde_json::from_value(serde_json::json!({
            "_type": "https://in-toto.io/Statement/v1",
            "predicateType": predicate_type,
            "predicate": predicate,
            "subject": [{"name": "a", "digest": {"sha256": "00"}}]
        }))
        .unwrap()
    }

    #[test]
    fn test_sev_predicate_mapping() {
        let s = statement(
            "https://tinfoil.sh/predicate/sev-snp-guest/v1",
            serde_json::json!({"measurement": "abc123"}),
        );
        let m = measurement_from_statement(&s).unwrap();
        assert_eq!(m.type_, PredicateType::SevGuestV1);
        assert_eq!(m.registers, vec!["abc123"]);
    }

    #[test]
    fn test_multiplatform_predicate_mapping() {
        let s = statement(
            "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1",
            serde_json::json!({
                "snp_measurement": "snp",
                "tdx_measurement": {"mrtd": "m", "rtmr0": "r0", "rtmr1": "r1", "rtmr2": "r2"}
            }),
        );
        let m = measurement_from_statement(&s).unwrap();
        assert_eq!(m.type_, PredicateType::SnpTdxMultiPlatformV1);
        assert_eq!(m.registers, vec!["snp", "r1", "r2"]);
    }

    #[test]
    fn test_multiplatform_predicate_null_fields() {
        let cases = [
            serde_json::json!({"tdx_measurement": {"rtmr1": "a", "rtmr2": "b"}}),
            serde_json::json!({"snp_measurement": "snp"}),
            serde_json::json!({"snp_measurement": "snp", "tdx_measurement": null}),
            serde_json::json!({"snp_measurement": "snp", "tdx_measurement": {"rtmr2": "b"}}),
            serde_json::json!({"snp_measurement": "snp", "tdx_measurement": {"rtmr1": null, "rtmr2": "b"}}),
        ];
        for predicate in cases {
            let s = statement(
                "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1",
                predicate,
            );
            assert!(
                matches!(
                    measurement_from_statement(&s),
                    Err(Error::InvalidMultiplatformPredicate(_))
                ),
                "accepted invalid multiplatform predicate"
            );
        }
    }

    #[test]
    fn test_unsupported_predicate() {
        let s = statement(
            "https://tinfoil.sh/predicate/tdx-guest/v2",
            serde_json::json!({}),
        );
        assert!(matches!(
            measurement_from_statement(&s),
            Err(Error::UnsupportedPredicate(_))
        ));
    }
}
