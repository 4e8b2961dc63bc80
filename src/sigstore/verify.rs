//! DSSE bundle verification against the Sigstore trust root
//!
//! Verifies a GitHub attestation bundle the way the keyless flow demands:
//! the Fulcio-issued signing certificate must chain to a trust-root CA and
//! carry an embedded SCT, the Rekor transparency-log entry must carry a
//! signed entry timestamp that verifies against a trust-root log key and
//! whose integrated time falls inside the certificate validity window, the
//! DSSE signature must verify against the certificate key over the
//! pre-authentication encoding, and the signer identity and artifact digest
//! must match the caller's expectations.

use std::collections::HashMap;

use base64::Engine;
use der::asn1::Utf8StringRef;
use der::Decode;
use regex::Regex;
use serde::Deserialize;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;

use crate::error::{Error, Result};

const OIDC_ISSUER: &str = "https://token.actions.githubusercontent.com";

// Fulcio certificate extensions
const OID_FULCIO_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";
const OID_FULCIO_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
// Embedded signed certificate timestamps (RFC 6962)
const OID_EMBEDDED_SCT: &str = "1.3.6.1.4.1.11129.2.4.2";

const OID_ECDSA_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_SHA384: &str = "1.2.840.10045.4.3.3";

/// Trust material parsed from `trusted_root.json`: the Fulcio CA
/// certificates (DER) and the Rekor transparency-log keys.
#[derive(Debug)]
pub struct TrustedRoot {
    ca_certs: Vec<Vec<u8>>,
    tlog_keys: Vec<TlogKey>,
}

#[derive(Debug)]
struct TlogKey {
    key_id: Vec<u8>,
    spki_der: Vec<u8>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrustedRoot {
    #[serde(default)]
    tlogs: Vec<RawTlog>,
    #[serde(default)]
    certificate_authorities: Vec<RawCa>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTlog {
    public_key: RawPublicKey,
    log_id: RawLogId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPublicKey {
    raw_bytes: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogId {
    key_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCa {
    cert_chain: RawCertChain,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCertChain {
    certificates: Vec<RawCert>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCert {
    raw_bytes: String,
}

impl TrustedRoot {
    pub fn from_json(json: &[u8]) -> Result<Self> {
        let raw: RawTrustedRoot = serde_json::from_slice(json)
            .map_err(|e| Error::BundleVerify(format!("parsing trust root: {e}")))?;

        let b64 = &base64::engine::general_purpose::STANDARD;

        let mut ca_certs = Vec::new();
        for ca in &raw.certificate_authorities {
            for cert in &ca.cert_chain.certificates {
                ca_certs.push(
                    b64.decode(&cert.raw_bytes)
                        .map_err(|e| Error::BundleVerify(format!("bad CA certificate: {e}")))?,
                );
            }
        }

        let mut tlog_keys = Vec::new();
        for tlog in &raw.tlogs {
            tlog_keys.push(TlogKey {
                key_id: b64
                    .decode(&tlog.log_id.key_id)
                    .map_err(|e| Error::BundleVerify(format!("bad tlog key id: {e}")))?,
                spki_der: b64
                    .decode(&tlog.public_key.raw_bytes)
                    .map_err(|e| Error::BundleVerify(format!("bad tlog key: {e}")))?,
            });
        }

        if ca_certs.is_empty() {
            return Err(Error::BundleVerify(
                "trust root contains no certificate authorities".into(),
            ));
        }

        Ok(Self {
            ca_certs,
            tlog_keys,
        })
    }

    fn tlog_key(&self, key_id: &[u8]) -> Option<&TlogKey> {
        self.tlog_keys.iter().find(|key| key.key_id == key_id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundle {
    verification_material: RawVerificationMaterial,
    dsse_envelope: RawDsseEnvelope,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerificationMaterial {
    #[serde(default)]
    certificate: Option<RawCert>,
    #[serde(default)]
    x509_certificate_chain: Option<RawCertChain>,
    #[serde(default)]
    tlog_entries: Vec<RawTlogEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTlogEntry {
    log_index: String,
    log_id: RawLogId,
    integrated_time: String,
    #[serde(default)]
    inclusion_promise: Option<RawInclusionPromise>,
    canonicalized_body: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInclusionPromise {
    signed_entry_timestamp: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDsseEnvelope {
    payload: String,
    payload_type: String,
    signatures: Vec<RawSignature>,
}

#[derive(Deserialize)]
struct RawSignature {
    sig: String,
}

/// The in-toto statement carried by a verified DSSE envelope
#[derive(Debug, Deserialize)]
pub struct Statement {
    #[serde(rename = "_type")]
    pub type_: String,
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    pub predicate: serde_json::Value,
    pub subject: Vec<Subject>,
}

#[derive(Debug, Deserialize)]
pub struct Subject {
    #[serde(default)]
    pub name: String,
    pub digest: HashMap<String, String>,
}

/// Verify a bundle end to end and return its in-toto statement.
pub fn verify_bundle(
    trust_root: &TrustedRoot,
    bundle_json: &[u8],
    hex_digest: &str,
    repo: &str,
) -> Result<Statement> {
    let bundle: RawBundle = serde_json::from_slice(bundle_json)
        .map_err(|e| Error::BundleVerify(format!("parsing bundle: {e}")))?;

    let b64 = &base64::engine::general_purpose::STANDARD;

    let leaf_der = match (
        &bundle.verification_material.certificate,
        &bundle.verification_material.x509_certificate_chain,
    ) {
        (Some(cert), _) => b64
            .decode(&cert.raw_bytes)
            .map_err(|e| Error::BundleVerify(format!("bad signing certificate: {e}")))?,
        (None, Some(chain)) if !chain.certificates.is_empty() => b64
            .decode(&chain.certificates[0].raw_bytes)
            .map_err(|e| Error::BundleVerify(format!("bad signing certificate: {e}")))?,
        _ => return Err(Error::BundleVerify("no certificate in bundle".into())),
    };

    let (_, leaf) = x509_parser::parse_x509_certificate(&leaf_der)
        .map_err(|e| Error::BundleVerify(format!("parsing signing certificate: {e}")))?;

    verify_cert_chains_to_root(&leaf, trust_root)?;
    require_embedded_sct(&leaf)?;
    verify_tlog_entries(&bundle, &leaf, trust_root)?;
    verify_identity(&leaf, repo)?;

    let payload = b64
        .decode(&bundle.dsse_envelope.payload)
        .map_err(|e| Error::BundleVerify(format!("bad DSSE payload: {e}")))?;
    verify_dsse_signature(&bundle.dsse_envelope, &payload, &leaf)?;

    let statement: Statement = serde_json::from_slice(&payload)
        .map_err(|e| Error::BundleVerify(format!("parsing in-toto statement: {e}")))?;
    verify_subject_digest(&statement, hex_digest)?;

    Ok(statement)
}

/// Verify that a trust-root CA certificate issued the leaf.
fn verify_cert_chains_to_root(leaf: &X509Certificate<'_>, trust_root: &TrustedRoot) -> Result<()> {
    for ca_der in &trust_root.ca_certs {
        let Ok((_, ca)) = x509_parser::parse_x509_certificate(ca_der) else {
            continue;
        };
        if ca.subject() != leaf.issuer() {
            continue;
        }
        return verify_x509_signature(leaf, &ca);
    }

    Err(Error::BundleVerify(
        "signing certificate does not chain to the trust root".into(),
    ))
}

/// Verify `cert`'s signature with `issuer`'s public key.
fn verify_x509_signature(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Result<()> {
    let tbs = cert.tbs_certificate.as_ref();
    let signature = cert.signature_value.data.as_ref();
    let issuer_spki = issuer.public_key().raw;
    let alg = cert.signature_algorithm.algorithm.to_id_string();

    verify_ecdsa_der(tbs, signature, issuer_spki, &alg)
}

fn verify_ecdsa_der(message: &[u8], sig_der: &[u8], spki_der: &[u8], alg_oid: &str) -> Result<()> {
    use p256::pkcs8::DecodePublicKey;

    match alg_oid {
        OID_ECDSA_SHA256 => {
            use p256::ecdsa::signature::Verifier;
            let key = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .map_err(|e| Error::BundleVerify(format!("bad P-256 key: {e}")))?;
            let sig = p256::ecdsa::Signature::from_der(sig_der)
                .map_err(|e| Error::BundleVerify(format!("bad ECDSA signature: {e}")))?;
            key.verify(message, &sig)
                .map_err(|e| Error::BundleVerify(format!("signature verification failed: {e}")))
        }
        OID_ECDSA_SHA384 => {
            use p384::ecdsa::signature::Verifier;
            let key = p384::ecdsa::VerifyingKey::from_public_key_der(spki_der)
                .map_err(|e| Error::BundleVerify(format!("bad P-384 key: {e}")))?;
            let sig = p384::ecdsa::Signature::from_der(sig_der)
                .map_err(|e| Error::BundleVerify(format!("bad ECDSA signature: {e}")))?;
            key.verify(message, &sig)
                .map_err(|e| Error::BundleVerify(format!("signature verification failed: {e}")))
        }
        other => Err(Error::BundleVerify(format!(
            "unsupported signature algorithm: {other}"
        ))),
    }
}

/// The keyless flow requires at least one signed certificate timestamp,
/// embedded in the certificate per RFC 6962.
fn require_embedded_sct(leaf: &X509Certificate<'_>) -> Result<()> {
    let present = leaf
        .extensions()
        .iter()
        .any(|ext| ext.oid.to_id_string() == OID_EMBEDDED_SCT && !ext.value.is_empty());
    if !present {
        return Err(Error::BundleVerify(
            "certificate carries no signed certificate timestamp".into(),
        ));
    }
    Ok(())
}

/// Verify the transparency-log entries: at least one entry whose signed
/// entry timestamp verifies against a trust-root log key, and whose
/// integrated time (the observer timestamp) falls inside the certificate
/// validity window.
fn verify_tlog_entries(
    bundle: &RawBundle,
    leaf: &X509Certificate<'_>,
    trust_root: &TrustedRoot,
) -> Result<()> {
    let entries = &bundle.verification_material.tlog_entries;
    if entries.is_empty() {
        return Err(Error::BundleVerify("no transparency log entries".into()));
    }

    let b64 = &base64::engine::general_purpose::STANDARD;

    for entry in entries {
        let key_id = b64
            .decode(&entry.log_id.key_id)
            .map_err(|e| Error::BundleVerify(format!("bad log id: {e}")))?;
        let key = trust_root.tlog_key(&key_id).ok_or_else(|| {
            Error::BundleVerify(format!("unknown transparency log: {}", hex::encode(&key_id)))
        })?;

        let integrated_time: i64 = entry
            .integrated_time
            .parse()
            .map_err(|_| Error::BundleVerify("bad integrated time".into()))?;
        let log_index: i64 = entry
            .log_index
            .parse()
            .map_err(|_| Error::BundleVerify("bad log index".into()))?;

        let promise = entry
            .inclusion_promise
            .as_ref()
            .ok_or_else(|| Error::BundleVerify("tlog entry has no inclusion promise".into()))?;
        let set = b64
            .decode(&promise.signed_entry_timestamp)
            .map_err(|e| Error::BundleVerify(format!("bad signed entry timestamp: {e}")))?;

        // Rekor signs the canonical JSON of the entry fields
        let signed_payload = format!(
            "{{\"body\":\"{}\",\"integratedTime\":{},\"logID\":\"{}\",\"logIndex\":{}}}",
            entry.canonicalized_body,
            integrated_time,
            hex::encode(&key_id),
            log_index
        );
        verify_ecdsa_der(
            signed_payload.as_bytes(),
            &set,
            &key.spki_der,
            OID_ECDSA_SHA256,
        )?;

        // Observer timestamp: the log saw the signature while the
        // short-lived certificate was valid
        let not_before = leaf.validity().not_before.timestamp();
        let not_after = leaf.validity().not_after.timestamp();
        if integrated_time < not_before || integrated_time > not_after {
            return Err(Error::BundleVerify(format!(
                "integrated time {integrated_time} outside certificate validity [{not_before}, {not_after}]"
            )));
        }
    }

    Ok(())
}

/// Enforce the signer identity: the GitHub Actions OIDC issuer and a SAN of
/// a tag-build workflow in the expected repository.
fn verify_identity(leaf: &X509Certificate<'_>, repo: &str) -> Result<()> {
    let issuer = fulcio_issuer(leaf)?;
    if issuer != OIDC_ISSUER {
        return Err(Error::BundleVerify(format!(
            "certificate not issued via GitHub Actions: {issuer}"
        )));
    }

    let san_pattern = format!("^https://github.com/{repo}/.github/workflows/.*@refs/tags/*");
    let re = Regex::new(&san_pattern)
        .map_err(|e| Error::BundleVerify(format!("bad identity pattern: {e}")))?;

    let sans = leaf
        .subject_alternative_name()
        .map_err(|e| Error::BundleVerify(format!("bad SAN extension: {e}")))?
        .ok_or_else(|| Error::BundleVerify("certificate has no SAN".into()))?;

    for name in &sans.value.general_names {
        if let GeneralName::URI(uri) = name {
            if re.is_match(uri) {
                return Ok(());
            }
        }
    }

    Err(Error::BundleVerify(format!(
        "no SAN matches workflow identity for {repo}"
    )))
}

/// Read the OIDC issuer from the Fulcio extensions: the v2 extension is a
/// DER UTF8String, the original v1 extension raw bytes.
fn fulcio_issuer(leaf: &X509Certificate<'_>) -> Result<String> {
    for ext in leaf.extensions() {
        if ext.oid.to_id_string() == OID_FULCIO_ISSUER_V2 {
            let value = Utf8StringRef::from_der(ext.value)
                .map_err(|e| Error::BundleVerify(format!("bad issuer extension: {e}")))?;
            return Ok(value.as_str().to_string());
        }
    }
    for ext in leaf.extensions() {
        if ext.oid.to_id_string() == OID_FULCIO_ISSUER_V1 {
            return String::from_utf8(ext.value.to_vec())
                .map_err(|_| Error::BundleVerify("bad issuer extension encoding".into()));
        }
    }
    Err(Error::BundleVerify(
        "certificate has no OIDC issuer extension".into(),
    ))
}

/// DSSE pre-authentication encoding:
/// `"DSSEv1" SP LEN(type) SP type SP LEN(body) SP body`
fn compute_pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

fn verify_dsse_signature(
    envelope: &RawDsseEnvelope,
    payload: &[u8],
    leaf: &X509Certificate<'_>,
) -> Result<()> {
    use p256::ecdsa::signature::Verifier;
    use p256::pkcs8::DecodePublicKey;

    let signature_b64 = envelope
        .signatures
        .first()
        .map(|s| s.sig.as_str())
        .ok_or_else(|| Error::BundleVerify("no signature in DSSE envelope".into()))?;
    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| Error::BundleVerify(format!("bad DSSE signature: {e}")))?;

    let pae = compute_pae(&envelope.payload_type, payload);

    let key = p256::ecdsa::VerifyingKey::from_public_key_der(leaf.public_key().raw)
        .map_err(|e| Error::BundleVerify(format!("bad signing key: {e}")))?;

    // Fulcio signatures are DER; tolerate raw r||s as well
    let signature = if signature_bytes.first() == Some(&0x30) {
        p256::ecdsa::Signature::from_der(&signature_bytes)
            .map_err(|e| Error::BundleVerify(format!("bad DER signature: {e}")))?
    } else {
        p256::ecdsa::Signature::from_slice(&signature_bytes)
            .map_err(|e| Error::BundleVerify(format!("bad raw signature: {e}")))?
    };

    key.verify(&pae, &signature)
        .map_err(|e| Error::BundleVerify(format!("DSSE signature verification failed: {e}")))
}

fn verify_subject_digest(statement: &Statement, hex_digest: &str) -> Result<()> {
    let matched = statement.subject.iter().any(|subject| {
        subject
            .digest
            .get("sha256")
            .map(|d| d.eq_ignore_ascii_case(hex_digest))
            .unwrap_or(false)
    });
    if !matched {
        return Err(Error::BundleVerify(format!(
            "statement does not attest sha256:{hex_digest}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pae_encoding() {
        // Test vector from the DSSE specification
        let pae = compute_pae("http://example.com/HelloWorld", b"hello world");
        assert_eq!(
            pae,
            b"DSSEv1 29 http://example.com/HelloWorld 11 hello world"
        );
    }

    #[test]
    fn test_subject_digest_match() {
        let statement: Statement = serde_json::from_str(
            r#"{
                "_type": "https://in-toto.io/Statement/v1",
                "predicateType": "https://tinfoil.sh/predicate/sev-snp-guest/v1",
                "predicate": {},
                "subject": [{"name": "tinfoil.hash", "digest": {"sha256": "AABB00"}}]
            }"#,
        )
        .unwrap();

        assert!(verify_subject_digest(&statement, "aabb00").is_ok());
        assert!(verify_subject_digest(&statement, "ffffff").is_err());
    }

    #[test]
    fn test_trust_root_requires_cas() {
        let err = TrustedRoot::from_json(br#"{"tlogs": [], "certificateAuthorities": []}"#)
            .unwrap_err();
        assert!(matches!(err, Error::BundleVerify(_)));
    }

    #[test]
    fn test_trust_root_parses_material() {
        let json = br#"{
            "tlogs": [{
                "baseUrl": "https://rekor.sigstore.dev",
                "publicKey": {"rawBytes": "AAEC"},
                "logId": {"keyId": "wNI9atQGlz+VWfO6LRygH4QUfY/8W4RFwiT5i5WRgB0="}
            }],
            "certificateAuthorities": [{
                "certChain": {"certificates": [{"rawBytes": "AwQF"}]}
            }]
        }"#;
        let root = TrustedRoot::from_json(json).unwrap();
        assert_eq!(root.ca_certs.len(), 1);
        assert_eq!(root.ca_certs[0], vec![0x03, 0x04, 0x05]);
        assert_eq!(root.tlog_keys.len(), 1);
        assert!(root
            .tlog_key(&root.tlog_keys[0].key_id.clone())
            .is_some());
    }

    #[test]
    fn test_rekor_set_payload_shape() {
        // Canonical JSON: keys sorted, no whitespace
        let payload = format!(
            "{{\"body\":\"{}\",\"integratedTime\":{},\"logID\":\"{}\",\"logIndex\":{}}}",
            "Zm9v", 1700000000, "c0d23d", 42
        );
        assert_eq!(
            payload,
            r#"{"body":"Zm9v","integratedTime":1700000000,"logID":"c0d23d","logIndex":42}"#
        );
    }
}
