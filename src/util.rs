//! Shared fetch and display helpers

use async_trait::async_trait;

use crate::error::{Error, Result};

/// ANSI color codes used by the measurement diagnostic output.
pub const COLOR_RESET: &str = "\x1b[0m";
pub const COLOR_GREY: &str = "\x1b[90m";
pub const COLOR_GREEN: &str = "\x1b[32m";
pub const COLOR_RED: &str = "\x1b[31m";

/// Wraps `text` in the given ANSI color and resets afterwards.
pub fn colorize(color: &str, text: &str) -> String {
    format!("{color}{text}{COLOR_RESET}")
}

/// HTTP GET capability. All outbound fetches of the verifier go through this
/// trait so tests and constrained targets can inject transport.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// Default fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Network(format!(
                "GET {url} returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colorize_wraps_and_resets() {
        let out = colorize(COLOR_RED, "boom");
        assert!(out.starts_with(COLOR_RED));
        assert!(out.ends_with(COLOR_RESET));
        assert!(out.contains("boom"));
    }
}
