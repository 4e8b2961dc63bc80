//! AMD SEV-SNP attestation verification
//!
//! Verification flow:
//! 1. Parse the raw attestation report (fixed ABI layout)
//! 2. Enforce guest policy, TCB, firmware and platform-info requirements
//! 3. Fetch the VCEK leaf from the AMD KDS proxy; the Genoa issuer chain
//!    (ASK + ARK) ships embedded
//! 4. Verify ARK pinning and the ARK -> ASK -> VCEK signatures
//!    (RSA-PSS SHA-384)
//! 5. Verify the report signature against the VCEK (ECDSA P-384)
//! 6. Extract the launch measurement and the report-data key material

use std::sync::Arc;

use der::{Decode, Encode};
use sha2::{Digest, Sha256, Sha384};
use x509_cert::Certificate;

use super::collateral::{CollateralProvider, StaticCollateral};
use super::types::{Measurement, PredicateType, Verification};
use super::decode_body;
use crate::error::{Error, Result};
use crate::util::{Fetcher, HttpFetcher};

/// Report size in bytes (0x4A0)
const REPORT_SIZE: usize = 0x4A0;

// Field offsets from the SEV-SNP ABI
const VERSION_OFFSET: usize = 0x00;
const POLICY_OFFSET: usize = 0x08;
const CURRENT_TCB_OFFSET: usize = 0x38;
const PLATFORM_INFO_OFFSET: usize = 0x40;
const REPORT_DATA_OFFSET: usize = 0x50;
const MEASUREMENT_OFFSET: usize = 0x90;
const REPORTED_TCB_OFFSET: usize = 0x180;
const CHIP_ID_OFFSET: usize = 0x1A0;
const CURRENT_BUILD_OFFSET: usize = 0x1E8;
const CURRENT_MINOR_OFFSET: usize = 0x1E9;
const CURRENT_MAJOR_OFFSET: usize = 0x1EA;
const LAUNCH_TCB_OFFSET: usize = 0x1F0;
const SIGNATURE_OFFSET: usize = 0x2A0;

const REPORT_DATA_SIZE: usize = 64;
const MEASUREMENT_SIZE: usize = 48;
const CHIP_ID_SIZE: usize = 64;
const SIGNATURE_SIZE: usize = 512;

// ECDSA P-384 signature components are stored little-endian in 72-byte slots
const SIG_COMPONENT_SIZE: usize = 72;
const SIG_VALUE_SIZE: usize = 48;

// Guest policy bit positions
const POLICY_SMT_BIT: u64 = 16;
const POLICY_RESERVED1_BIT: u64 = 17;
const POLICY_MIGRATE_MA_BIT: u64 = 18;
const POLICY_DEBUG_BIT: u64 = 19;
const POLICY_SINGLE_SOCKET_BIT: u64 = 20;

// Platform info bit positions
const PLATFORM_INFO_SMT_BIT: u64 = 0;
const PLATFORM_INFO_TSME_BIT: u64 = 1;
/// Only SMT and TSME may be set in PLATFORM_INFO
const PLATFORM_INFO_ALLOWED_MASK: u64 =
    (1 << PLATFORM_INFO_SMT_BIT) | (1 << PLATFORM_INFO_TSME_BIT);

/// Minimum TCB security patch levels, applied to the current, reported and
/// launch TCB alike. Ecosystem configuration, not a protocol invariant.
const MIN_TCB: TcbVersion = TcbVersion {
    boot_loader: 0x07,
    tee: 0x00,
    snp: 0x0e,
    microcode: 0x48,
};

/// Minimum firmware build number
const MIN_BUILD: u8 = 21;

/// Minimum firmware version, encoded as (major << 8) | minor
const MIN_VERSION: u16 = (1 << 8) | 55;

/// Product line the verifier accepts; the embedded issuer chain and the
/// KDS URLs are specific to it. Machine stepping 0.
const PRODUCT: &str = "Genoa";

/// SPKI SHA-256 of the AMD root key (ARK) for Genoa. Pinning the ARK means a
/// substituted issuer chain cannot pass even if its signatures are internally
/// consistent.
const ARK_GENOA_SPKI_FINGERPRINT: &str =
    "429a69c9422aa258ee4d8db5fcda9c6470ef15f8cd5a9cebd6cbc7d90b863831";

/// AMD KDS proxy; the upstream KDS heavily rate-limits direct callers.
const KDS_PROXY: &str = "https://kds-proxy.tinfoil.sh";

/// TCB version components packed into the 64-bit TCB fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcbVersion {
    pub boot_loader: u8,
    pub tee: u8,
    pub snp: u8,
    pub microcode: u8,
}

impl TcbVersion {
    /// Layout: bl(8) | tee(8) | reserved(32) | snp(8) | ucode(8), little-endian
    pub fn from_u64(val: u64) -> Self {
        Self {
            boot_loader: (val & 0xFF) as u8,
            tee: ((val >> 8) & 0xFF) as u8,
            snp: ((val >> 48) & 0xFF) as u8,
            microcode: ((val >> 56) & 0xFF) as u8,
        }
    }

    pub fn meets_minimum(&self, min: &TcbVersion) -> bool {
        self.boot_loader >= min.boot_loader
            && self.tee >= min.tee
            && self.snp >= min.snp
            && self.microcode >= min.microcode
    }
}

impl std::fmt::Display for TcbVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bl={:#x} tee={:#x} snp={:#x} ucode={:#x}",
            self.boot_loader, self.tee, self.snp, self.microcode
        )
    }
}

/// Parsed guest policy
#[derive(Debug, Clone)]
pub struct SnpPolicy {
    pub abi_minor: u8,
    pub abi_major: u8,
    pub smt: bool,
    pub migrate_ma: bool,
    pub debug: bool,
    pub single_socket: bool,
}

impl SnpPolicy {
    pub fn from_u64(policy: u64) -> Result<Self> {
        // Bit 17 is reserved-must-be-one
        if policy & (1 << POLICY_RESERVED1_BIT) == 0 {
            return Err(Error::QuotePolicy(
                "policy reserved bit 17 must be 1".into(),
            ));
        }

        Ok(Self {
            abi_minor: (policy & 0xFF) as u8,
            abi_major: ((policy >> 8) & 0xFF) as u8,
            smt: policy & (1 << POLICY_SMT_BIT) != 0,
            migrate_ma: policy & (1 << POLICY_MIGRATE_MA_BIT) != 0,
            debug: policy & (1 << POLICY_DEBUG_BIT) != 0,
            single_socket: policy & (1 << POLICY_SINGLE_SOCKET_BIT) != 0,
        })
    }
}

/// Fields of a parsed SEV-SNP report needed for verification
pub struct SevReport {
    raw: Vec<u8>,
    pub version: u32,
    pub policy: u64,
    pub platform_info: u64,
    pub current_tcb: TcbVersion,
    pub reported_tcb: TcbVersion,
    pub launch_tcb: TcbVersion,
    pub build: u8,
    pub api_version: u16,
    pub measurement: [u8; MEASUREMENT_SIZE],
    pub report_data: [u8; REPORT_DATA_SIZE],
    pub chip_id: [u8; CHIP_ID_SIZE],
}

impl SevReport {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != REPORT_SIZE {
            return Err(Error::QuoteParse(format!(
                "invalid report size: expected {REPORT_SIZE}, got {}",
                raw.len()
            )));
        }

        let u32_at = |offset: usize| {
            u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap_or_default())
        };
        let u64_at = |offset: usize| {
            u64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap_or_default())
        };

        let version = u32_at(VERSION_OFFSET);
        if !(2..=5).contains(&version) {
            return Err(Error::QuoteParse(format!(
                "unsupported report version: {version}"
            )));
        }

        let mut measurement = [0u8; MEASUREMENT_SIZE];
        measurement.copy_from_slice(&raw[MEASUREMENT_OFFSET..MEASUREMENT_OFFSET + MEASUREMENT_SIZE]);
        let mut report_data = [0u8; REPORT_DATA_SIZE];
        report_data.copy_from_slice(&raw[REPORT_DATA_OFFSET..REPORT_DATA_OFFSET + REPORT_DATA_SIZE]);
        let mut chip_id = [0u8; CHIP_ID_SIZE];
        chip_id.copy_from_slice(&raw[CHIP_ID_OFFSET..CHIP_ID_OFFSET + CHIP_ID_SIZE]);

        Ok(Self {
            raw: raw.to_vec(),
            version,
            policy: u64_at(POLICY_OFFSET),
            platform_info: u64_at(PLATFORM_INFO_OFFSET),
            current_tcb: TcbVersion::from_u64(u64_at(CURRENT_TCB_OFFSET)),
            reported_tcb: TcbVersion::from_u64(u64_at(REPORTED_TCB_OFFSET)),
            launch_tcb: TcbVersion::from_u64(u64_at(LAUNCH_TCB_OFFSET)),
            build: raw[CURRENT_BUILD_OFFSET],
            api_version: ((raw[CURRENT_MAJOR_OFFSET] as u16) << 8)
                | raw[CURRENT_MINOR_OFFSET] as u16,
            measurement,
            report_data,
            chip_id,
        })
    }

    fn signed_body(&self) -> &[u8] {
        &self.raw[..SIGNATURE_OFFSET]
    }

    fn signature(&self) -> &[u8] {
        &self.raw[SIGNATURE_OFFSET..SIGNATURE_OFFSET + SIGNATURE_SIZE]
    }
}

/// SEV-SNP verifier parameterized by collateral and transport so tests can
/// inject both.
pub struct SevVerifier {
    collateral: Arc<dyn CollateralProvider>,
    fetcher: Arc<dyn Fetcher>,
}

impl SevVerifier {
    /// Verifier over the embedded Genoa issuer chain and the KDS proxy.
    /// Fails if the embedded collateral does not pass the freshness floor.
    pub fn new() -> Result<Self> {
        Ok(Self::with_providers(
            Arc::new(StaticCollateral::new()?),
            Arc::new(HttpFetcher::new()),
        ))
    }

    pub fn with_providers(collateral: Arc<dyn CollateralProvider>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            collateral,
            fetcher,
        }
    }

    /// Verify a v1 attestation body (raw base64). The report data carries the
    /// TLS key fingerprint as an ASCII hex string.
    pub async fn verify_v1(&self, body: &str) -> Result<Verification> {
        let report = self.verify_report_body(body, false).await?;
        to_verification_v1(&report)
    }

    /// Verify a v2 attestation body (base64 over gzip). The report data is 64
    /// bytes: TLS key fingerprint then HPKE public key.
    pub async fn verify_v2(&self, body: &str) -> Result<Verification> {
        let report = self.verify_report_body(body, true).await?;
        Ok(to_verification_v2(&report))
    }

    /// Verify a v1 attestation body against a caller-supplied VCEK (DER)
    /// instead of fetching it from the KDS.
    pub fn verify_v1_with_vcek(&self, body: &str, vcek_der: &[u8]) -> Result<Verification> {
        let raw = decode_body(body, false)?;
        let report = self.verify_report_with_vcek(&raw, vcek_der)?;
        to_verification_v1(&report)
    }

    /// Verify a v2 attestation body against a caller-supplied VCEK (DER).
    pub fn verify_v2_with_vcek(&self, body: &str, vcek_der: &[u8]) -> Result<Verification> {
        let raw = decode_body(body, true)?;
        let report = self.verify_report_with_vcek(&raw, vcek_der)?;
        Ok(to_verification_v2(&report))
    }

    async fn verify_report_body(&self, body: &str, compressed: bool) -> Result<SevReport> {
        let raw = decode_body(body, compressed)?;
        let report = SevReport::parse(&raw)?;
        validate_policy(&report)?;

        let vcek = self.fetch_vcek(&report).await?;
        self.verify_chain_and_signature(&report, &vcek)?;

        Ok(report)
    }

    /// Verify a report against a caller-supplied VCEK (DER), as delivered by
    /// the aggregated attestation bundle.
    pub fn verify_report_with_vcek(&self, raw: &[u8], vcek_der: &[u8]) -> Result<SevReport> {
        let report = SevReport::parse(raw)?;
        validate_policy(&report)?;
        self.verify_chain_and_signature(&report, vcek_der)?;
        Ok(report)
    }

    async fn fetch_vcek(&self, report: &SevReport) -> Result<Vec<u8>> {
        let tcb = &report.reported_tcb;
        let url = format!(
            "{KDS_PROXY}/vcek/v1/{PRODUCT}/{}?blSPL={}&teeSPL={}&snpSPL={}&ucodeSPL={}",
            hex::encode(report.chip_id),
            tcb.boot_loader,
            tcb.tee,
            tcb.snp,
            tcb.microcode
        );
        self.fetcher.get(&url).await
    }

    fn verify_chain_and_signature(&self, report: &SevReport, vcek_der: &[u8]) -> Result<()> {
        let chain_pem = self.collateral.vcek_cert_chain(PRODUCT)?;
        verify_cert_chain(vcek_der, &chain_pem)?;
        verify_report_signature(report, vcek_der)
    }
}

fn to_verification_v1(report: &SevReport) -> Result<Verification> {
    let tls_fp = String::from_utf8(report.report_data.to_vec())
        .map_err(|_| Error::QuoteParse("v1 report data is not valid UTF-8".into()))?
        .trim_end_matches('\0')
        .to_string();

    Ok(Verification {
        measurement: Measurement {
            type_: PredicateType::SevGuestV1,
            registers: vec![hex::encode(report.measurement)],
        },
        tls_public_key_fp: tls_fp,
        hpke_public_key: String::new(),
    })
}

fn to_verification_v2(report: &SevReport) -> Verification {
    let measurement = Measurement {
        type_: PredicateType::SevGuestV2,
        registers: vec![hex::encode(report.measurement)],
    };
    Verification::from_report_data_v2(measurement, &report.report_data)
}

fn validate_policy(report: &SevReport) -> Result<()> {
    let policy = SnpPolicy::from_u64(report.policy)?;

    if !policy.smt {
        return Err(Error::QuotePolicy("SMT must be enabled".into()));
    }
    if policy.migrate_ma {
        return Err(Error::QuotePolicy("migration agent must be disabled".into()));
    }
    if policy.debug {
        return Err(Error::QuotePolicy(
            "debug mode is enabled; enclave memory can be inspected by the host".into(),
        ));
    }
    if policy.single_socket {
        return Err(Error::QuotePolicy("single socket must be disabled".into()));
    }

    for (name, tcb) in [
        ("current", report.current_tcb),
        ("reported", report.reported_tcb),
        ("launch", report.launch_tcb),
    ] {
        if !tcb.meets_minimum(&MIN_TCB) {
            return Err(Error::QuotePolicy(format!(
                "{name} TCB below minimum: got {tcb}, minimum {MIN_TCB}"
            )));
        }
    }

    if report.build < MIN_BUILD {
        return Err(Error::QuotePolicy(format!(
            "firmware build too low: got {}, minimum {MIN_BUILD}",
            report.build
        )));
    }
    if report.api_version < MIN_VERSION {
        return Err(Error::QuotePolicy(format!(
            "firmware version too low: got {}.{}, minimum {}.{}",
            report.api_version >> 8,
            report.api_version & 0xFF,
            MIN_VERSION >> 8,
            MIN_VERSION & 0xFF
        )));
    }
    // Provisional firmware is permitted: committed versions are not compared

    if report.platform_info & (1 << PLATFORM_INFO_SMT_BIT) == 0 {
        return Err(Error::QuotePolicy("platform SMT must be enabled".into()));
    }
    if report.platform_info & (1 << PLATFORM_INFO_TSME_BIT) == 0 {
        return Err(Error::QuotePolicy("platform TSME must be enabled".into()));
    }
    if report.platform_info & !PLATFORM_INFO_ALLOWED_MASK != 0 {
        return Err(Error::QuotePolicy(format!(
            "unexpected platform info bits: {:#x}",
            report.platform_info
        )));
    }

    Ok(())
}

/// Split an ECDSA P-384 signature into big-endian r and s scalars.
fn parse_signature_components(sig_bytes: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    if sig_bytes.len() < SIG_COMPONENT_SIZE * 2 {
        return Err(Error::QuoteSignature("signature too short".into()));
    }

    let r_be: Vec<u8> = sig_bytes[..SIG_VALUE_SIZE].iter().rev().copied().collect();
    let s_be: Vec<u8> = sig_bytes[SIG_COMPONENT_SIZE..SIG_COMPONENT_SIZE + SIG_VALUE_SIZE]
        .iter()
        .rev()
        .copied()
        .collect();

    if r_be.iter().all(|&b| b == 0) || s_be.iter().all(|&b| b == 0) {
        return Err(Error::QuoteSignature("zero ECDSA signature component".into()));
    }

    Ok((r_be, s_be))
}

fn parse_pem_chain(chain_pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let pems = pem::parse_many(chain_pem)
        .map_err(|e| Error::QuoteSignature(format!("failed to parse PEM chain: {e}")))?;
    Ok(pems.into_iter().map(|p| p.contents().to_vec()).collect())
}

fn parse_cert(der_bytes: &[u8], what: &str) -> Result<Certificate> {
    Certificate::from_der(der_bytes)
        .map_err(|e| Error::QuoteSignature(format!("failed to parse {what}: {e}")))
}

/// SHA-256 over the DER-encoded SubjectPublicKeyInfo of a certificate.
fn spki_fingerprint(cert: &Certificate) -> Result<String> {
    let spki_der = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::QuoteSignature(format!("failed to encode SPKI: {e}")))?;
    Ok(hex::encode(Sha256::digest(spki_der)))
}

fn tbs_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .to_der()
        .map_err(|e| Error::QuoteSignature(format!("failed to encode TBS: {e}")))
}

fn spki_der(cert: &Certificate) -> Result<Vec<u8>> {
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| Error::QuoteSignature(format!("failed to encode SPKI: {e}")))
}

fn extract_cn(name: &x509_cert::name::Name) -> Result<String> {
    use der::asn1::Utf8StringRef;
    use x509_cert::der::oid::db::rfc4519::CN;

    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            if atv.oid != CN {
                continue;
            }
            let der_bytes = atv
                .value
                .to_der()
                .map_err(|e| Error::QuoteSignature(format!("bad CN encoding: {e}")))?;
            if let Ok(s) = Utf8StringRef::from_der(&der_bytes) {
                return Ok(s.as_str().to_string());
            }
            if let Ok(s) = std::str::from_utf8(atv.value.value()) {
                return Ok(s.to_string());
            }
            return Err(Error::QuoteSignature("CN value is not valid UTF-8".into()));
        }
    }

    Err(Error::QuoteSignature("no CN found in certificate".into()))
}

/// Verify an RSA-PSS SHA-384 signature over a TBS certificate.
fn verify_rsa_pss(tbs: &[u8], signature: &[u8], signer_spki: &[u8], context: &str) -> Result<()> {
    use rsa::pkcs8::DecodePublicKey;
    use rsa::pss::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::RsaPublicKey;

    let pubkey = RsaPublicKey::from_public_key_der(signer_spki)
        .map_err(|e| Error::QuoteSignature(format!("invalid RSA key for {context}: {e}")))?;
    let verifying_key: VerifyingKey<Sha384> = VerifyingKey::new(pubkey);

    let sig = Signature::try_from(signature)
        .map_err(|e| Error::QuoteSignature(format!("invalid signature for {context}: {e}")))?;

    verifying_key
        .verify(tbs, &sig)
        .map_err(|e| Error::QuoteSignature(format!("{context} verification failed: {e}")))
}

/// Verify VCEK -> ASK -> ARK, with the ARK public key pinned.
fn verify_cert_chain(vcek_der: &[u8], chain_pem: &[u8]) -> Result<()> {
    let chain = parse_pem_chain(chain_pem)?;
    if chain.len() < 2 {
        return Err(Error::QuoteSignature(
            "certificate chain should contain ASK and ARK".into(),
        ));
    }

    let vcek = parse_cert(vcek_der, "VCEK")?;
    let ask = parse_cert(&chain[0], "ASK")?;
    let ark = parse_cert(&chain[1], "ARK")?;

    let ark_fingerprint = spki_fingerprint(&ark)?;
    if ark_fingerprint != ARK_GENOA_SPKI_FINGERPRINT {
        return Err(Error::QuoteSignature(format!(
            "ARK public key fingerprint mismatch: expected {ARK_GENOA_SPKI_FINGERPRINT}, got {ark_fingerprint}"
        )));
    }

    if vcek.tbs_certificate.issuer != ask.tbs_certificate.subject {
        return Err(Error::QuoteSignature(
            "VCEK issuer does not match ASK subject".into(),
        ));
    }
    if ask.tbs_certificate.issuer != ark.tbs_certificate.subject {
        return Err(Error::QuoteSignature(
            "ASK issuer does not match ARK subject".into(),
        ));
    }
    if ark.tbs_certificate.issuer != ark.tbs_certificate.subject {
        return Err(Error::QuoteSignature("ARK is not self-signed".into()));
    }

    let ark_cn = extract_cn(&ark.tbs_certificate.subject)?;
    if ark_cn != format!("ARK-{PRODUCT}") {
        return Err(Error::QuoteSignature(format!("unexpected ARK CN: {ark_cn}")));
    }
    let ask_cn = extract_cn(&ask.tbs_certificate.subject)?;
    if ask_cn != format!("SEV-{PRODUCT}") {
        return Err(Error::QuoteSignature(format!("unexpected ASK CN: {ask_cn}")));
    }

    let ark_spki = spki_der(&ark)?;
    verify_rsa_pss(
        &tbs_der(&ark)?,
        ark.signature.raw_bytes(),
        &ark_spki,
        "ARK self-signature",
    )?;
    verify_rsa_pss(
        &tbs_der(&ask)?,
        ask.signature.raw_bytes(),
        &ark_spki,
        "ASK signature",
    )?;
    verify_rsa_pss(
        &tbs_der(&vcek)?,
        vcek.signature.raw_bytes(),
        &spki_der(&ask)?,
        "VCEK signature",
    )?;

    Ok(())
}

/// Verify the report signature against the VCEK public key (ECDSA P-384).
fn verify_report_signature(report: &SevReport, vcek_der: &[u8]) -> Result<()> {
    use p384::ecdsa::signature::Verifier;
    use p384::ecdsa::{Signature, VerifyingKey};
    use p384::elliptic_curve::generic_array::GenericArray;

    let vcek = parse_cert(vcek_der, "VCEK")?;
    let pubkey_bytes = vcek
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();

    let (r_be, s_be) = parse_signature_components(report.signature())?;
    let signature = Signature::from_scalars(
        GenericArray::clone_from_slice(&r_be),
        GenericArray::clone_from_slice(&s_be),
    )
    .map_err(|e| Error::QuoteSignature(format!("invalid signature format: {e}")))?;

    let verifying_key = VerifyingKey::from_sec1_bytes(pubkey_bytes)
        .map_err(|e| Error::QuoteSignature(format!("invalid VCEK public key: {e}")))?;

    verifying_key
        .verify(report.signed_body(), &signature)
        .map_err(|e| Error::QuoteSignature(format!("report signature verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    // v1 attestation body from a production inference enclave
    const SEV_V1_BODY: &str = "BQAAAAAAAAAAAAMAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAEAAAAKAAAAAAAYVGUAAAAAAAAAAAAAAAAAAAAxNzBhMTY0NjA0Mjc1M2E3NTUyN2YxZTcxZWViNTI5ZTc3NzkzMWVjMTI5YzhmYjJlNjU0YzNiZjQzNjg2NzM3xpcnS1gX2gmLsHNJiNPnS7sl+aA+Kcu52P0f28pPhJ9jN56AX4NeeF2tq53M/IpPAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAxO1fKfg6oYpKV0k1dN6GKk8dLbPihbqnyW6u8YFbKvP//////////////////////////////////////////CgAAAAAAGFQZEQEAAAAAAAAAAAAAAAAAAAAAAAAAAAAmvPtFq6V+1iAk0qrXH6ibJ1yRBW5I+gNtSkEC/cAmYKd6UdrCLNjS2kXDm4cppbCNdHJMW8pykk0hC88B8wxuCgAAAAAAGFQqNwEAKjcBAAoAAAAAABhUAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAEGDoOLfYSTsgZhziNiMCwnhvLYoY+gG277Y9DI87Qp94NZ4XissbWDwdnngZbsNbAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAeHTCsniGLxjaB52h3nPYwrQR2Zs1zQHN0iJb//x0sL/MGnzQpcICFOlaKgLiKYaxAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA==";

    #[test]
    fn test_parse_v1_report_fields() {
        let raw = decode_body(SEV_V1_BODY, false).unwrap();
        let report = SevReport::parse(&raw).unwrap();

        assert_eq!(report.version, 5);
        assert_eq!(
            hex::encode(report.measurement),
            "c697274b5817da098bb0734988d3e74bbb25f9a03e29cbb9d8fd1fdbca4f849f63379e805f835e785dadab9dccfc8a4f"
        );
        assert_eq!(
            String::from_utf8(report.report_data.to_vec()).unwrap(),
            "170a1646042753a75527f1e71eeb529e777931ec129c8fb2e654c3bf43686737"
        );
        assert_eq!(report.build, 42);
        assert_eq!(report.api_version, (1 << 8) | 55);
        assert!(report.current_tcb.meets_minimum(&MIN_TCB));
        assert!(report.reported_tcb.meets_minimum(&MIN_TCB));
        assert!(report.launch_tcb.meets_minimum(&MIN_TCB));
    }

    #[test]
    fn test_parse_rejects_wrong_size() {
        assert!(matches!(
            SevReport::parse(&[0u8; 100]),
            Err(Error::QuoteParse(_))
        ));
    }

    #[test]
    fn test_tcb_version_packing() {
        let tcb = TcbVersion::from_u64(0x4854_0000_0000_0007);
        assert_eq!(tcb.boot_loader, 0x07);
        assert_eq!(tcb.tee, 0x00);
        assert_eq!(tcb.snp, 0x54);
        assert_eq!(tcb.microcode, 0x48);
    }

    #[test]
    fn test_tcb_below_minimum() {
        let tcb = TcbVersion {
            boot_loader: 0x07,
            tee: 0x00,
            snp: 0x0e,
            microcode: 0x40,
        };
        assert!(!tcb.meets_minimum(&MIN_TCB));
    }

    #[test]
    fn test_policy_valid() {
        let policy = (1u64 << POLICY_RESERVED1_BIT) | (1u64 << POLICY_SMT_BIT);
        let parsed = SnpPolicy::from_u64(policy).unwrap();
        assert!(parsed.smt);
        assert!(!parsed.debug);
        assert!(!parsed.migrate_ma);
        assert!(!parsed.single_socket);
    }

    #[test]
    fn test_policy_missing_reserved_bit() {
        assert!(SnpPolicy::from_u64(1u64 << POLICY_SMT_BIT).is_err());
    }

    fn synthetic_report(policy: u64, platform_info: u64) -> SevReport {
        let mut raw = vec![0u8; REPORT_SIZE];
        raw[VERSION_OFFSET] = 2;
        raw[POLICY_OFFSET..POLICY_OFFSET + 8].copy_from_slice(&policy.to_le_bytes());
        raw[PLATFORM_INFO_OFFSET..PLATFORM_INFO_OFFSET + 8]
            .copy_from_slice(&platform_info.to_le_bytes());
        let tcb = 0x4800_0000_0000_0007u64 | (0x0e << 48);
        for offset in [CURRENT_TCB_OFFSET, REPORTED_TCB_OFFSET, LAUNCH_TCB_OFFSET] {
            raw[offset..offset + 8].copy_from_slice(&tcb.to_le_bytes());
        }
        raw[CURRENT_BUILD_OFFSET] = MIN_BUILD;
        raw[CURRENT_MINOR_OFFSET] = 55;
        raw[CURRENT_MAJOR_OFFSET] = 1;
        SevReport::parse(&raw).unwrap()
    }

    #[test]
    fn test_validate_policy_accepts_expected_configuration() {
        let report = synthetic_report(
            (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT),
            PLATFORM_INFO_ALLOWED_MASK,
        );
        validate_policy(&report).unwrap();
    }

    #[test]
    fn test_validate_policy_rejects_debug() {
        let report = synthetic_report(
            (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT) | (1 << POLICY_DEBUG_BIT),
            PLATFORM_INFO_ALLOWED_MASK,
        );
        assert!(matches!(
            validate_policy(&report),
            Err(Error::QuotePolicy(_))
        ));
    }

    #[test]
    fn test_validate_policy_rejects_migration_agent() {
        let report = synthetic_report(
            (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT) | (1 << POLICY_MIGRATE_MA_BIT),
            PLATFORM_INFO_ALLOWED_MASK,
        );
        assert!(validate_policy(&report).is_err());
    }

    #[test]
    fn test_validate_policy_rejects_unexpected_platform_bits() {
        let report = synthetic_report(
            (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT),
            PLATFORM_INFO_ALLOWED_MASK | (1 << 2),
        );
        assert!(validate_policy(&report).is_err());
    }

    #[test]
    fn test_validate_policy_rejects_disabled_tsme() {
        let report = synthetic_report(
            (1 << POLICY_RESERVED1_BIT) | (1 << POLICY_SMT_BIT),
            1 << PLATFORM_INFO_SMT_BIT,
        );
        assert!(matches!(
            validate_policy(&report),
            Err(Error::QuotePolicy(_))
        ));
    }

    #[test]
    fn test_signature_component_endianness() {
        let mut sig = vec![0u8; SIGNATURE_SIZE];
        for i in 0..SIG_VALUE_SIZE {
            sig[i] = (SIG_VALUE_SIZE - i) as u8;
        }
        for i in 0..SIG_VALUE_SIZE {
            sig[SIG_COMPONENT_SIZE + i] = (i + 1) as u8;
        }

        let (r_be, s_be) = parse_signature_components(&sig).unwrap();
        assert_eq!(r_be[0], 1);
        assert_eq!(r_be[SIG_VALUE_SIZE - 1], SIG_VALUE_SIZE as u8);
        assert_eq!(s_be[0], SIG_VALUE_SIZE as u8);
        assert_eq!(s_be[SIG_VALUE_SIZE - 1], 1);
    }

    #[test]
    fn test_signature_all_zero_rejected() {
        let sig = vec![0u8; SIGNATURE_SIZE];
        assert!(parse_signature_components(&sig).is_err());
    }

    #[test]
    fn test_ark_fingerprint_format() {
        assert_eq!(ARK_GENOA_SPKI_FINGERPRINT.len(), 64);
        assert!(ARK_GENOA_SPKI_FINGERPRINT
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }
}
