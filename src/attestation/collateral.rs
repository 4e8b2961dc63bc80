//! Endorsement collateral providers
//!
//! Intel PCS responses are fragile and rate-limited, so the verifier ships
//! its collateral compiled in: QE identity, CRLs and per-FMSPC TCB info for
//! TDX, and the Genoa VCEK issuer chain for SEV-SNP. Only the VCEK leaf
//! itself is fetched at runtime, through the AMD KDS proxy. The embedded
//! artifacts are refreshed by `data/fetch.sh`.

use serde::Deserialize;
use serde_json::value::RawValue;

use crate::error::{Error, Result};

/// Minimum TCB evaluation data number for embedded collateral. Outdated
/// collateral cannot be loaded: provider construction fails if any embedded
/// artifact is older. See Intel's TCB Recovery guidance.
pub const MIN_TCB_EVALUATION_DATA_NUMBER: u32 = 18;

/// Intel SGX provisioning root certificate (PEM).
pub const SGX_ROOT_CA_PEM: &str = include_str!("data/sgx_root_ca.pem");

const QE_IDENTITY_JSON: &str = include_str!("data/qe_identity.json");
const QE_IDENTITY_CHAIN: &str = include_str!("data/qe_identity_issuer_chain.pem");
const ROOT_CA_CRL: &[u8] = include_bytes!("data/root_ca.crl");
const PCK_CRL_PROCESSOR: &[u8] = include_bytes!("data/pck_crl_processor.crl");
const PCK_CRL_PROCESSOR_CHAIN: &str = include_str!("data/pck_crl_processor_chain.pem");
const PCK_CRL_PLATFORM: &[u8] = include_bytes!("data/pck_crl_platform.crl");
const PCK_CRL_PLATFORM_CHAIN: &str = include_str!("data/pck_crl_platform_chain.pem");
const TCB_INFO_CHAIN: &str = include_str!("data/tcb_info_issuer_chain.pem");
const GENOA_CERT_CHAIN_PEM: &[u8] = include_bytes!("data/genoa_cert_chain.pem");

/// Embedded TCB info keyed by lowercase hex FMSPC.
const TCB_INFOS: &[(&str, &str)] = &[
    ("90c06f000000", include_str!("data/tcb_info_90c06f000000.json")),
    ("00806f050000", include_str!("data/tcb_info_00806f050000.json")),
];

/// Which PCK issuing CA signed the quote's PCK certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PckCa {
    Processor,
    Platform,
}

impl PckCa {
    pub fn as_str(&self) -> &'static str {
        match self {
            PckCa::Processor => "processor",
            PckCa::Platform => "platform",
        }
    }
}

/// A PCS artifact in signed form: the exact JSON bytes that were signed, the
/// detached signature, and the issuer certificate chain.
#[derive(Debug, Clone)]
pub struct SignedCollateral {
    pub body: String,
    pub signature: Vec<u8>,
    pub issuer_chain: String,
}

/// A certificate revocation list with its issuer chain.
#[derive(Debug, Clone)]
pub struct CrlCollateral {
    pub der: Vec<u8>,
    pub issuer_chain: String,
}

/// Capability set for endorsement collateral lookups.
pub trait CollateralProvider: Send + Sync {
    fn qe_identity(&self) -> Result<SignedCollateral>;
    fn pck_crl(&self, ca: PckCa) -> Result<CrlCollateral>;
    fn tcb_info(&self, fmspc: &str) -> Result<SignedCollateral>;
    fn root_ca_crl(&self) -> Result<Vec<u8>>;
    /// VCEK issuer chain (ASK + ARK) in PEM for a product line. Only Genoa
    /// is shipped; every other product is an error.
    fn vcek_cert_chain(&self, product: &str) -> Result<Vec<u8>>;
}

/// PCS responses wrap the signed payload next to a hex signature. The signed
/// payload must be preserved byte-for-byte, hence the raw capture.
#[derive(Deserialize)]
struct SignedResponse<'a> {
    #[serde(borrow, alias = "tcbInfo", alias = "enclaveIdentity")]
    body: &'a RawValue,
    signature: String,
}

#[derive(Deserialize)]
struct EvalNumberProbe {
    #[serde(rename = "tcbEvaluationDataNumber")]
    tcb_evaluation_data_number: u32,
}

fn split_signed(raw: &str, what: &str) -> Result<(String, Vec<u8>)> {
    let response: SignedResponse = serde_json::from_str(raw)
        .map_err(|e| Error::CollateralMissing(format!("malformed embedded {what}: {e}")))?;
    let signature = hex::decode(&response.signature)
        .map_err(|e| Error::CollateralMissing(format!("bad {what} signature encoding: {e}")))?;
    Ok((response.body.get().to_string(), signature))
}

fn check_eval_number(signed_body: &str, what: &str) -> Result<()> {
    let probe: EvalNumberProbe = serde_json::from_str(signed_body)
        .map_err(|e| Error::CollateralMissing(format!("malformed embedded {what}: {e}")))?;
    if probe.tcb_evaluation_data_number < MIN_TCB_EVALUATION_DATA_NUMBER {
        return Err(Error::CollateralMissing(format!(
            "embedded {what} tcbEvaluationDataNumber {} is below minimum {}",
            probe.tcb_evaluation_data_number, MIN_TCB_EVALUATION_DATA_NUMBER
        )));
    }
    Ok(())
}

/// Collateral provider backed entirely by compile-time data. Requests for
/// artifacts outside the embedded set fail rather than falling back to the
/// network.
pub struct StaticCollateral {
    qe_identity: SignedCollateral,
    tcb_infos: Vec<(String, SignedCollateral)>,
}

impl StaticCollateral {
    pub fn new() -> Result<Self> {
        let (qe_body, qe_signature) = split_signed(QE_IDENTITY_JSON, "QE identity")?;
        check_eval_number(&qe_body, "QE identity")?;

        let mut tcb_infos = Vec::with_capacity(TCB_INFOS.len());
        for (fmspc, raw) in TCB_INFOS {
            let what = format!("TCB info for FMSPC {fmspc}");
            let (body, signature) = split_signed(raw, &what)?;
            check_eval_number(&body, &what)?;
            tcb_infos.push((
                fmspc.to_string(),
                SignedCollateral {
                    body,
                    signature,
                    issuer_chain: TCB_INFO_CHAIN.to_string(),
                },
            ));
        }

        Ok(Self {
            qe_identity: SignedCollateral {
                body: qe_body,
                signature: qe_signature,
                issuer_chain: QE_IDENTITY_CHAIN.to_string(),
            },
            tcb_infos,
        })
    }
}

impl CollateralProvider for StaticCollateral {
    fn qe_identity(&self) -> Result<SignedCollateral> {
        Ok(self.qe_identity.clone())
    }

    fn pck_crl(&self, ca: PckCa) -> Result<CrlCollateral> {
        let (der, issuer_chain) = match ca {
            PckCa::Processor => (PCK_CRL_PROCESSOR, PCK_CRL_PROCESSOR_CHAIN),
            PckCa::Platform => (PCK_CRL_PLATFORM, PCK_CRL_PLATFORM_CHAIN),
        };
        Ok(CrlCollateral {
            der: der.to_vec(),
            issuer_chain: issuer_chain.to_string(),
        })
    }

    fn tcb_info(&self, fmspc: &str) -> Result<SignedCollateral> {
        let fmspc = fmspc.to_ascii_lowercase();
        self.tcb_infos
            .iter()
            .find(|(key, _)| *key == fmspc)
            .map(|(_, collateral)| collateral.clone())
            .ok_or_else(|| {
                Error::CollateralMissing(format!(
                    "TCB info for FMSPC {fmspc} not found in embedded collateral"
                ))
            })
    }

    fn root_ca_crl(&self) -> Result<Vec<u8>> {
        Ok(ROOT_CA_CRL.to_vec())
    }

    fn vcek_cert_chain(&self, product: &str) -> Result<Vec<u8>> {
        if product == "Genoa" {
            Ok(GENOA_CERT_CHAIN_PEM.to_vec())
        } else {
            Err(Error::CollateralMissing(format!(
                "cert_chain for product {product} is not supported"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_collateral_meets_eval_floor() {
        // Construction fails outright if any embedded artifact is older than
        // the floor, so this is the build-time freshness gate.
        StaticCollateral::new().unwrap();
    }

    #[test]
    fn test_tcb_info_lookup_is_case_insensitive() {
        let provider = StaticCollateral::new().unwrap();
        assert!(provider.tcb_info("90C06F000000").is_ok());
        assert!(provider.tcb_info("90c06f000000").is_ok());
    }

    #[test]
    fn test_unknown_fmspc_is_missing() {
        let provider = StaticCollateral::new().unwrap();
        assert!(matches!(
            provider.tcb_info("ffffffffffff"),
            Err(Error::CollateralMissing(_))
        ));
    }

    #[test]
    fn test_signed_body_preserved_verbatim() {
        let provider = StaticCollateral::new().unwrap();
        let qe = provider.qe_identity().unwrap();
        // The signed body is the raw JSON object, not a re-serialization
        assert!(qe.body.starts_with('{'));
        assert!(qe.body.contains("tcbEvaluationDataNumber"));
        assert!(!qe.signature.is_empty());
    }

    #[test]
    fn test_vcek_chain_genoa_only() {
        let provider = StaticCollateral::new().unwrap();
        assert!(provider.vcek_cert_chain("Genoa").is_ok());
        assert!(matches!(
            provider.vcek_cert_chain("Milan"),
            Err(Error::CollateralMissing(_))
        ));
    }
}
