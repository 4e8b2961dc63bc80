//! Client version gating
//!
//! Deployments publish a small JSON config naming the client versions they
//! accept, as a semver constraint: `{"allowed": ">=0.4.0, <2"}`.

use semver::{Version, VersionReq};
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RawConfig {
    allowed: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub allowed: String,
    constraint: VersionReq,
}

impl Config {
    pub fn parse(s: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(s)?;
        let constraint = VersionReq::parse(&raw.allowed)
            .map_err(|e| Error::Decode(format!("bad version constraint: {e}")))?;
        Ok(Self {
            allowed: raw.allowed,
            constraint,
        })
    }

    /// Whether the given version satisfies the allowed constraint.
    pub fn is_valid_version(&self, version: &str) -> bool {
        Version::parse(version)
            .map(|v| self.constraint.matches(&v))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_versions() {
        let config = Config::parse(r#"{"allowed": ">=0.4.0, <2.0.0"}"#).unwrap();
        assert!(config.is_valid_version("0.4.0"));
        assert!(config.is_valid_version("1.9.3"));
        assert!(!config.is_valid_version("2.0.0"));
        assert!(!config.is_valid_version("0.3.9"));
    }

    #[test]
    fn test_invalid_version_string() {
        let config = Config::parse(r#"{"allowed": ">=1"}"#).unwrap();
        assert!(!config.is_valid_version("not-a-version"));
    }

    #[test]
    fn test_bad_constraint_rejected() {
        assert!(Config::parse(r#"{"allowed": "!!nope"}"#).is_err());
    }
}
