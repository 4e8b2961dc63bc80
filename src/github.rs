//! Release and provenance fetching from the repository host
//!
//! Resolves a repo's latest release to an artifact digest and pulls the
//! Sigstore attestation bundle for it. Requests go through the GitHub API
//! proxies so unauthenticated clients are not rate-limited.

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::util::Fetcher;

const GITHUB_PROXY: &str = "https://api-github-proxy.tinfoil.sh";
const ATTESTATION_PROXY: &str = "https://gh-attestation-proxy.tinfoil.sh";

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct AttestationResponse {
    attestations: Vec<AttestationEntry>,
}

#[derive(Debug, Deserialize)]
struct AttestationEntry {
    bundle: Box<serde_json::value::RawValue>,
}

/// Fetch the latest release of a repo and resolve its attestation digest.
///
/// The digest normally lives in a `tinfoil.hash` release asset; old EIF
/// releases carried it in the release body as `EIF hash: <64 hex>` instead.
pub async fn fetch_latest_release(fetcher: &dyn Fetcher, repo: &str) -> Result<(String, String)> {
    let url = format!("{GITHUB_PROXY}/repos/{repo}/releases/latest");
    let response = fetcher.get(&url).await?;
    let release: ReleaseResponse = serde_json::from_slice(&response)?;

    if let Some(digest) = parse_legacy_eif_digest(&release.body) {
        return Ok((release.tag_name, digest));
    }

    let digest_url = format!(
        "{GITHUB_PROXY}/{repo}/releases/download/{}/tinfoil.hash",
        release.tag_name
    );
    let digest = fetcher.get(&digest_url).await?;
    let digest = String::from_utf8(digest)
        .map_err(|_| Error::Decode("digest file is not valid UTF-8".into()))?
        .trim()
        .to_string();

    Ok((release.tag_name, digest))
}

/// Fetch only the digest of the latest release.
pub async fn fetch_latest_digest(fetcher: &dyn Fetcher, repo: &str) -> Result<String> {
    let (_, digest) = fetch_latest_release(fetcher, repo).await?;
    Ok(digest)
}

/// Fetch the raw Sigstore bundle attached to a repo for an artifact digest.
/// The API returns a list; the first entry is used.
pub async fn fetch_attestation_bundle(
    fetcher: &dyn Fetcher,
    repo: &str,
    digest: &str,
) -> Result<Vec<u8>> {
    let url = format!("{ATTESTATION_PROXY}/repos/{repo}/attestations/sha256:{digest}");
    let response = fetcher.get(&url).await?;

    let parsed: AttestationResponse = serde_json::from_slice(&response)?;
    let entry = parsed
        .attestations
        .into_iter()
        .next()
        .ok_or_else(|| Error::Decode(format!("no attestations found for sha256:{digest}")))?;

    Ok(entry.bundle.get().as_bytes().to_vec())
}

fn parse_legacy_eif_digest(body: &str) -> Option<String> {
    let re = Regex::new(r"EIF hash: ([a-fA-F0-9]{64})").ok()?;
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_eif_digest_parse() {
        let body = "Release notes\nEIF hash: fe03832f4045909235b2c4f62a2dcfce4212383e48d111f65eb3971af264a9bc\nmore text";
        assert_eq!(
            parse_legacy_eif_digest(body).unwrap(),
            "fe03832f4045909235b2c4f62a2dcfce4212383e48d111f65eb3971af264a9bc"
        );
    }

    #[test]
    fn test_legacy_eif_digest_absent() {
        assert!(parse_legacy_eif_digest("just release notes").is_none());
        assert!(parse_legacy_eif_digest("EIF hash: deadbeef").is_none());
    }

    #[test]
    fn test_attestation_response_takes_first_bundle() {
        let raw = r#"{"attestations":[{"bundle":{"mediaType":"a"}},{"bundle":{"mediaType":"b"}}]}"#;
        let parsed: AttestationResponse = serde_json::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(parsed.attestations.len(), 2);
        assert!(parsed.attestations[0].bundle.get().contains("\"a\""));
    }

    #[test]
    fn test_release_response_defaults_body() {
        let parsed: ReleaseResponse = serde_json::from_str(r#"{"tag_name":"v1.2.3"}"#).unwrap();
        assert_eq!(parsed.tag_name, "v1.2.3");
        assert!(parsed.body.is_empty());
    }
}
