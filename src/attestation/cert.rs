//! Enclave certificate verification for the aggregated bundle path
//!
//! When verification runs from a pre-fetched bundle there is no live TLS
//! connection to pin against. Instead the bundle carries the enclave's
//! certificate, whose SANs embed the HPKE public key and the attestation
//! document hash as indexed base32 chunks of the form
//! `NN<base32>.<prefix>.<domain>` (`hpke` and `hatt` prefixes). Binding is
//! re-derived by decoding those chunks and comparing against the attested
//! values.

use data_encoding::BASE32_NOPAD;
use x509_parser::extensions::GeneralName;

use super::Document;
use crate::error::{Error, Result};

/// Values extracted and checked during certificate verification
#[derive(Debug, Clone)]
pub struct CertVerificationResult {
    pub hpke_public_key: String,
    pub attestation_hash: String,
    pub dns_names: Vec<String>,
}

/// Verify an enclave TLS certificate against the attested values:
/// the certificate must cover the expected domain, and its SANs must decode
/// to the attested HPKE key and the attestation document hash.
pub fn verify_certificate(
    cert_pem: &str,
    expected_domain: &str,
    attestation_doc: &Document,
    expected_hpke_key: &str,
) -> Result<CertVerificationResult> {
    let (_, parsed_pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Decode(format!("failed to parse certificate PEM: {e}")))?;
    let cert = parsed_pem
        .parse_x509()
        .map_err(|e| Error::Decode(format!("failed to parse certificate: {e}")))?;

    let sans = dns_names(&cert)?;
    if sans.is_empty() {
        return Err(Error::CertSanMissing("any subject alternative name".into()));
    }

    if !domain_matches_sans(&sans, expected_domain) {
        return Err(Error::CertDomainMismatch {
            domain: expected_domain.to_string(),
        });
    }

    let hpke_bytes = decode_domains(&sans, "hpke")?;
    let hpke_public_key = hex::encode(hpke_bytes);
    if hpke_public_key != expected_hpke_key {
        return Err(Error::HpkeMismatch {
            expected: expected_hpke_key.to_string(),
            actual: hpke_public_key,
        });
    }

    // The hash is embedded as its hex string bytes
    let hash_bytes = decode_domains(&sans, "hatt")?;
    let cert_attestation_hash = String::from_utf8(hash_bytes)
        .map_err(|_| Error::Decode("attestation hash SANs are not valid UTF-8".into()))?;
    let computed_hash = attestation_doc.hash();
    if cert_attestation_hash != computed_hash {
        return Err(Error::AttestationHashMismatch {
            computed: computed_hash,
            actual: cert_attestation_hash,
        });
    }

    Ok(CertVerificationResult {
        hpke_public_key,
        attestation_hash: computed_hash,
        dns_names: sans,
    })
}

fn dns_names(cert: &x509_parser::certificate::X509Certificate<'_>) -> Result<Vec<String>> {
    let san_ext = cert
        .subject_alternative_name()
        .map_err(|e| Error::Decode(format!("bad SAN extension: {e}")))?;

    let mut names = Vec::new();
    if let Some(ext) = san_ext {
        for name in &ext.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }
    Ok(names)
}

/// `sub.example.com` -> `example.com`
fn parent_domain(domain: &str) -> &str {
    match domain.split_once('.') {
        Some((_, rest)) if rest.contains('.') => rest,
        _ => domain,
    }
}

/// Whether the domain matches any SAN, exactly or via a wildcard. Per RFC
/// 6125 a wildcard covers a single label and never the apex domain.
fn domain_matches_sans(sans: &[String], expected_domain: &str) -> bool {
    let parent = parent_domain(expected_domain);

    sans.iter().any(|san| {
        if san == expected_domain {
            return true;
        }
        san.strip_prefix("*.")
            .map(|base| base == parent && expected_domain != parent)
            .unwrap_or(false)
    })
}

/// Decode dcode-encoded data from certificate SANs: filter names carrying
/// `.<prefix>.`, order their chunks by the two-digit index, concatenate, and
/// base32-decode (standard alphabet, no padding).
fn decode_domains(domains: &[String], prefix: &str) -> Result<Vec<u8>> {
    let pattern = format!(".{prefix}.");

    let mut chunks: Vec<(u32, &str)> = Vec::new();
    for domain in domains {
        if !domain.contains(&pattern) {
            continue;
        }

        let first = match domain.split('.').next() {
            Some(label) if label.len() >= 2 => label,
            _ => continue,
        };

        let index = match first[..2].parse::<u32>() {
            Ok(i) => i,
            Err(_) => continue,
        };

        chunks.push((index, &first[2..]));
    }

    if chunks.is_empty() {
        return Err(Error::CertSanMissing(prefix.to_string()));
    }

    chunks.sort_by_key(|(index, _)| *index);

    let combined: String = chunks.iter().map(|(_, chunk)| *chunk).collect();
    BASE32_NOPAD
        .decode(combined.to_ascii_uppercase().as_bytes())
        .map_err(|e| Error::Decode(format!("base32 decode error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_domain() {
        assert_eq!(parent_domain("sub.example.com"), "example.com");
        assert_eq!(parent_domain("example.com"), "example.com");
        assert_eq!(parent_domain("a.b.example.com"), "b.example.com");
    }

    #[test]
    fn test_domain_exact_match() {
        let sans = vec!["enclave.tinfoil.sh".to_string()];
        assert!(domain_matches_sans(&sans, "enclave.tinfoil.sh"));
        assert!(!domain_matches_sans(&sans, "other.tinfoil.sh"));
    }

    #[test]
    fn test_domain_wildcard_single_label() {
        let sans = vec!["*.tinfoil.sh".to_string()];
        assert!(domain_matches_sans(&sans, "enclave.tinfoil.sh"));
        // Wildcards never match the apex domain
        assert!(!domain_matches_sans(&sans, "tinfoil.sh"));
        // Or more than one label
        assert!(!domain_matches_sans(&sans, "a.b.tinfoil.sh"));
    }

    #[test]
    fn test_decode_domains_ordered_chunks() {
        // base32("...") of the 32-byte HPKE key below, split into chunks
        let sans = vec![
            "01p7ktg4mmuezmt62yooyc.hpke.example.com".to_string(),
            "00xznjzbhvwu5e5wnlz56p.hpke.example.com".to_string(),
            "02vf6s4ieb7agq.hpke.example.com".to_string(),
            "enclave.example.com".to_string(),
        ];
        let decoded = decode_domains(&sans, "hpke").unwrap();
        assert_eq!(
            hex::encode(decoded),
            "be5a9c84f5b53a4ed9abcf7cf7fd533718ca132c9fb5873b02a97d2e2081f80d"
        );
    }

    #[test]
    fn test_decode_domains_missing_prefix() {
        let sans = vec!["enclave.example.com".to_string()];
        assert!(matches!(
            decode_domains(&sans, "hpke"),
            Err(Error::CertSanMissing(_))
        ));
    }

    #[test]
    fn test_decode_domains_hatt_hex_string() {
        let sans = vec![
            "00hbtdimzugm2dmnruhbtdmyrzgzsgmo.hatt.example.com".to_string(),
            "01bzmrsgcojqgfrtkmjxgzrdcmdbgzsd.hatt.example.com".to_string(),
            "02qmzzgyywizbtmmywcyzyhbrdkolcgj.hatt.example.com".to_string(),
            "03sggmzsg5qwcna.hatt.example.com".to_string(),
        ];
        let decoded = decode_domains(&sans, "hatt").unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"
        );
    }
}
