//! Intel TDX attestation verification
//!
//! TDX QuoteV4 verification runs in two layers: `dcap-qvl` performs the
//! DCAP signature-chain, CRL and TCB checks against the collateral this
//! crate supplies, then the header and TD-report policy specific to Tinfoil
//! enclaves is enforced on the parsed quote.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dcap_qvl::quote::{Quote, TDReport10};
use dcap_qvl::QuoteCollateralV3;

use super::collateral::{CollateralProvider, PckCa, StaticCollateral};
use super::decode_body;
use super::types::{Measurement, PredicateType, Verification};
use crate::error::{Error, Result};

/// Minimum Quoting Enclave security version. Intel's current "UpToDate" is 8,
/// but the Ubuntu Noble libsgx-ae-tdqe package still ships an enclave with
/// SVN 0. Raise once distro packages catch up.
const MINIMUM_QE_SVN: u16 = 0;

/// Minimum Provisioning Certification Enclave security version, same
/// packaging caveat as [`MINIMUM_QE_SVN`].
const MINIMUM_PCE_SVN: u16 = 0;

/// Intel's QE vendor ID (939a7233-f79c-4ca9-940a-0db3957f0607)
const INTEL_QE_VENDOR_ID: [u8; 16] = [
    0x93, 0x9a, 0x72, 0x33, 0xf7, 0x9c, 0x4c, 0xa9, 0x94, 0x0a, 0x0d, 0xb3, 0x95, 0x7f, 0x06,
    0x07,
];

/// QuoteV4 with a TDX TEE type
const QUOTE_VERSION: u16 = 4;
const TEE_TYPE_TDX: u32 = 0x81;

/// Component-wise minimum TEE TCB SVN (TDX module 3.1.2)
const MINIMUM_TEE_TCB_SVN: [u8; 16] = [
    0x03, 0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

/// All attribute bits clear except SEPT_VE_DISABLE
const EXPECTED_TD_ATTRIBUTES: [u8; 8] = [0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00];

/// Processor features allowed inside the TD: FP, SSE, AVX, AVX512, PK, AMX
const EXPECTED_XFAM: [u8; 8] = [0xe7, 0x02, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00];

/// TDX module measurements published by Intel
/// (github.com/intel/confidential-computing.tdx.tdx-module releases)
const ACCEPTED_MR_SEAMS: [&str; 2] = [
    "49b66faa451d19ebbdbe89371b8daf2b65aa3984ec90110343e9e2eec116af08850fa20e3b1aa9a874d77a65380ee7e6",
    "685f891ea5c20e8fa27b151bf34bf3b50fbaf7143cc53662727cbdb167c0ad8385f1f6f3571539a91e104a1c96d75e04",
];

/// DER encoding of the FMSPC OID (1.2.840.113741.1.13.1.4) inside the PCK
/// certificate's SGX extension
const FMSPC_OID_DER: [u8; 12] = [
    0x06, 0x0a, 0x2a, 0x86, 0x48, 0x86, 0xf8, 0x4d, 0x01, 0x0d, 0x01, 0x04,
];

const SGX_EXTENSIONS_OID: &str = "1.2.840.113741.1.13.1";

fn system_now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// TDX verifier parameterized by the collateral provider and a clock so
/// tests can inject fixed times and synthetic collateral.
pub struct TdxVerifier {
    collateral: Arc<dyn CollateralProvider>,
    clock: fn() -> u64,
}

impl TdxVerifier {
    /// Verifier over the embedded collateral and the system clock. Fails if
    /// the embedded collateral does not pass the freshness floor.
    pub fn new() -> Result<Self> {
        Ok(Self::with_collateral(Arc::new(StaticCollateral::new()?)))
    }

    pub fn with_collateral(collateral: Arc<dyn CollateralProvider>) -> Self {
        Self {
            collateral,
            clock: system_now_unix,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Verify a v1 attestation body (raw base64). The report data carries the
    /// TLS key fingerprint as an ASCII hex string.
    pub fn verify_v1(&self, body: &str) -> Result<Verification> {
        let (measurement, report_data) = self.verify_quote_body(body, false, PredicateType::TdxGuestV1)?;

        let tls_fp = String::from_utf8(report_data.to_vec())
            .map_err(|_| Error::QuoteParse("v1 report data is not valid UTF-8".into()))?
            .trim_end_matches('\0')
            .to_string();

        Ok(Verification {
            measurement,
            tls_public_key_fp: tls_fp,
            hpke_public_key: String::new(),
        })
    }

    /// Verify a v2 attestation body (base64 over gzip). The report data is 64
    /// bytes: TLS key fingerprint then HPKE public key.
    pub fn verify_v2(&self, body: &str) -> Result<Verification> {
        let (measurement, report_data) = self.verify_quote_body(body, true, PredicateType::TdxGuestV2)?;
        Ok(Verification::from_report_data_v2(measurement, &report_data))
    }

    fn verify_quote_body(
        &self,
        body: &str,
        compressed: bool,
        format: PredicateType,
    ) -> Result<(Measurement, [u8; 64])> {
        let raw = decode_body(body, compressed)?;

        let quote = Quote::parse(&raw)
            .map_err(|e| Error::QuoteParse(format!("failed to parse TDX quote: {e:?}")))?;
        validate_header(&quote)?;

        let report = quote
            .report
            .as_td10()
            .ok_or_else(|| Error::QuoteParse("expected a TD 1.0 report".into()))?;

        let collateral = self.assemble_collateral(&raw)?;
        let verified = dcap_qvl::verify::verify(&raw, &collateral, (self.clock)())
            .map_err(|e| Error::QuoteSignature(format!("DCAP verification failed: {e:?}")))?;
        tracing::debug!(status = %verified.status, "TDX quote TCB status");

        validate_td_report(report)?;

        let measurement = Measurement {
            type_: format,
            registers: vec![
                hex::encode(report.mr_td),
                hex::encode(report.rt_mr0),
                hex::encode(report.rt_mr1),
                hex::encode(report.rt_mr2),
                hex::encode(report.rt_mr3),
            ],
        };

        Ok((measurement, report.report_data))
    }

    /// Build the DCAP collateral for this quote from the provider, keyed by
    /// the FMSPC and issuing CA of the quote's PCK certificate.
    fn assemble_collateral(&self, raw_quote: &[u8]) -> Result<QuoteCollateralV3> {
        let chain = extract_pck_chain(raw_quote)?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::QuoteParse("quote carries no PCK certificate".into()))?;

        let fmspc = fmspc_from_pck_leaf(leaf)?;
        let ca = pck_issuer_ca(leaf)?;
        tracing::debug!(%fmspc, ca = ca.as_str(), "selecting embedded collateral");

        let qe_identity = self.collateral.qe_identity()?;
        let tcb_info = self.collateral.tcb_info(&fmspc)?;
        let pck_crl = self.collateral.pck_crl(ca)?;
        let root_ca_crl = self.collateral.root_ca_crl()?;

        Ok(QuoteCollateralV3 {
            pck_crl_issuer_chain: pck_crl.issuer_chain,
            root_ca_crl,
            pck_crl: pck_crl.der,
            tcb_info_issuer_chain: tcb_info.issuer_chain,
            tcb_info: tcb_info.body,
            tcb_info_signature: tcb_info.signature,
            qe_identity_issuer_chain: qe_identity.issuer_chain,
            qe_identity: qe_identity.body,
            qe_identity_signature: qe_identity.signature,
            pck_certificate_chain: None,
        })
    }
}

fn validate_header(quote: &Quote) -> Result<()> {
    let header = &quote.header;

    if header.version != QUOTE_VERSION {
        return Err(Error::QuoteParse(format!(
            "unsupported quote version: {}",
            header.version
        )));
    }
    if header.tee_type != TEE_TYPE_TDX {
        return Err(Error::QuoteParse(format!(
            "not a TDX quote: TEE type {:#x}",
            header.tee_type
        )));
    }
    if header.qe_svn < MINIMUM_QE_SVN {
        return Err(Error::QuotePolicy(format!(
            "QE SVN {} below minimum {MINIMUM_QE_SVN}",
            header.qe_svn
        )));
    }
    if header.pce_svn < MINIMUM_PCE_SVN {
        return Err(Error::QuotePolicy(format!(
            "PCE SVN {} below minimum {MINIMUM_PCE_SVN}",
            header.pce_svn
        )));
    }
    if header.qe_vendor_id[..] != INTEL_QE_VENDOR_ID[..] {
        return Err(Error::QuotePolicy(format!(
            "unexpected QE vendor ID: {}",
            hex::encode(&header.qe_vendor_id)
        )));
    }

    Ok(())
}

fn validate_td_report(report: &TDReport10) -> Result<()> {
    for (index, (got, min)) in report
        .tee_tcb_svn
        .iter()
        .zip(MINIMUM_TEE_TCB_SVN.iter())
        .enumerate()
    {
        if got < min {
            return Err(Error::QuotePolicy(format!(
                "TEE TCB SVN component {index} is {got}, minimum {min}"
            )));
        }
    }

    if report.td_attributes != EXPECTED_TD_ATTRIBUTES {
        return Err(Error::QuotePolicy(format!(
            "unexpected TD attributes: {}",
            hex::encode(report.td_attributes)
        )));
    }
    if report.xfam != EXPECTED_XFAM {
        return Err(Error::QuotePolicy(format!(
            "unexpected XFAM: {}",
            hex::encode(report.xfam)
        )));
    }

    if report.mr_config_id != [0u8; 48] {
        return Err(Error::QuotePolicy("MRCONFIGID must be zero".into()));
    }
    if report.mr_owner != [0u8; 48] {
        return Err(Error::QuotePolicy("MROWNER must be zero".into()));
    }
    if report.mr_owner_config != [0u8; 48] {
        return Err(Error::QuotePolicy("MROWNERCONFIG must be zero".into()));
    }

    let mr_seam = hex::encode(report.mr_seam);
    if !ACCEPTED_MR_SEAMS.contains(&mr_seam.as_str()) {
        return Err(Error::UnexpectedMrSeam(mr_seam));
    }

    Ok(())
}

/// Extract the PEM certificate chain that QuoteV4 embeds in its
/// certification data (type 5: PCK leaf, issuing CA, root).
fn extract_pck_chain(raw_quote: &[u8]) -> Result<Vec<Vec<u8>>> {
    const BEGIN: &[u8] = b"-----BEGIN CERTIFICATE-----";
    const END: &[u8] = b"-----END CERTIFICATE-----";

    let start = raw_quote
        .windows(BEGIN.len())
        .position(|w| w == BEGIN)
        .ok_or_else(|| Error::QuoteParse("no PCK certificate chain in quote".into()))?;
    let end = raw_quote
        .windows(END.len())
        .rposition(|w| w == END)
        .ok_or_else(|| Error::QuoteParse("unterminated PCK certificate chain".into()))?
        + END.len();

    let pems = pem::parse_many(&raw_quote[start..end])
        .map_err(|e| Error::QuoteParse(format!("bad PCK certificate chain: {e}")))?;
    Ok(pems.into_iter().map(|p| p.contents().to_vec()).collect())
}

/// Pull the FMSPC out of the PCK leaf's SGX extension, lowercase hex.
fn fmspc_from_pck_leaf(leaf_der: &[u8]) -> Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| Error::QuoteParse(format!("failed to parse PCK certificate: {e}")))?;

    let sgx_ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == SGX_EXTENSIONS_OID)
        .ok_or_else(|| Error::QuoteParse("PCK certificate has no SGX extension".into()))?;

    // The SGX extension is a sequence of {OID, value} pairs; the FMSPC entry
    // is the OID followed by an OCTET STRING of 6 bytes
    let value = sgx_ext.value;
    let at = value
        .windows(FMSPC_OID_DER.len())
        .position(|w| w == FMSPC_OID_DER)
        .ok_or_else(|| Error::QuoteParse("PCK certificate has no FMSPC".into()))?;

    let tail = &value[at + FMSPC_OID_DER.len()..];
    if tail.len() < 8 || tail[0] != 0x04 || tail[1] != 0x06 {
        return Err(Error::QuoteParse("malformed FMSPC encoding".into()));
    }

    Ok(hex::encode(&tail[2..8]))
}

/// Which issuing CA signed the PCK leaf, from its issuer CN.
fn pck_issuer_ca(leaf_der: &[u8]) -> Result<PckCa> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| Error::QuoteParse(format!("failed to parse PCK certificate: {e}")))?;

    let issuer = cert.issuer().to_string();
    if issuer.contains("Platform") {
        Ok(PckCa::Platform)
    } else if issuer.contains("Processor") {
        Ok(PckCa::Processor)
    } else {
        Err(Error::QuoteParse(format!(
            "unrecognized PCK issuing CA: {issuer}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TDX_V1_BODY: &str = include_str!("testdata/tdx_quote_v1.b64");

    fn test_quote() -> Vec<u8> {
        decode_body(TDX_V1_BODY.trim(), false).unwrap()
    }

    #[test]
    fn test_parse_quote_registers() {
        let raw = test_quote();
        let quote = Quote::parse(&raw).unwrap();
        let report = quote.report.as_td10().unwrap();

        assert_eq!(
            hex::encode(report.mr_td),
            "7357a10d2e2724dffe68813e3cc4cfcde6814d749f2fb62e3953e54f6e0b50a219786afe2cd478f684b52c61837e1114"
        );
        assert_eq!(
            hex::encode(report.rt_mr1),
            "10a05f3fba7d66babcc8a8143451443a564963ced77c7fa126f004857753f87c318720e29e9ed2f46c8753b44b01004d"
        );
        assert_eq!(hex::encode(report.rt_mr3), crate::attestation::types::RTMR3_ZERO);
        assert_eq!(
            String::from_utf8(report.report_data[..64].to_vec()).unwrap(),
            "7322c7143477b84284133465487049437651f0cf5739d867e4a81956410f83b9"
        );
    }

    #[test]
    fn test_header_policy_accepts_real_quote() {
        let raw = test_quote();
        let quote = Quote::parse(&raw).unwrap();
        validate_header(&quote).unwrap();
    }

    #[test]
    fn test_td_report_policy_accepts_real_quote() {
        let raw = test_quote();
        let quote = Quote::parse(&raw).unwrap();
        validate_td_report(quote.report.as_td10().unwrap()).unwrap();
    }

    #[test]
    fn test_pck_chain_extraction() {
        let raw = test_quote();
        let chain = extract_pck_chain(&raw).unwrap();
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_fmspc_extraction() {
        let raw = test_quote();
        let chain = extract_pck_chain(&raw).unwrap();
        assert_eq!(fmspc_from_pck_leaf(&chain[0]).unwrap(), "90c06f000000");
    }

    #[test]
    fn test_pck_issuer_ca_detection() {
        let raw = test_quote();
        let chain = extract_pck_chain(&raw).unwrap();
        assert_eq!(pck_issuer_ca(&chain[0]).unwrap(), PckCa::Platform);
    }

    #[test]
    fn test_accepted_mr_seams_wellformed() {
        for mr_seam in ACCEPTED_MR_SEAMS {
            assert_eq!(mr_seam.len(), 96);
            assert!(mr_seam.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    // TD report field offsets inside the raw quote (48-byte header first)
    const TD_ATTRIBUTES_OFFSET: usize = 48 + 120;
    const MR_SEAM_OFFSET: usize = 48 + 16;

    #[test]
    fn test_td_report_policy_rejects_debug_attributes() {
        let mut raw = test_quote();
        raw[TD_ATTRIBUTES_OFFSET] = 0x01;
        let quote = Quote::parse(&raw).unwrap();
        assert!(matches!(
            validate_td_report(quote.report.as_td10().unwrap()),
            Err(Error::QuotePolicy(_))
        ));
    }

    #[test]
    fn test_td_report_policy_rejects_unknown_mr_seam() {
        let mut raw = test_quote();
        raw[MR_SEAM_OFFSET..MR_SEAM_OFFSET + 48].fill(0xab);
        let quote = Quote::parse(&raw).unwrap();
        assert!(matches!(
            validate_td_report(quote.report.as_td10().unwrap()),
            Err(Error::UnexpectedMrSeam(_))
        ));
    }
}
