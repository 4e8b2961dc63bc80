//! # Tinfoil Verifier
//!
//! Remote-attestation verifier for confidential-compute enclaves. A client
//! talking to a service inside a TEE needs three facts established before
//! trusting the connection:
//!
//! 1. **Enclave integrity** — the platform attestation (AMD SEV-SNP report
//!    or Intel TDX quote) verifies against the hardware vendor's root of
//!    trust and satisfies the security policy.
//! 2. **Code provenance** — a Sigstore DSSE bundle proves the expected
//!    measurement was produced by a tagged GitHub Actions build of the
//!    published source repo.
//! 3. **Connection binding** — the TLS endpoint's public key fingerprint is
//!    bound into the hardware-signed report data.
//!
//! The verifier reduces these to a single [`client::GroundTruth`] record and
//! a TLS-pinned HTTP transport.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tinfoil_verifier::SecureClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = SecureClient::new(
//!         "inference.tinfoil.sh",
//!         "tinfoilsh/confidential-model-router",
//!     );
//!
//!     let ground_truth = client.verify().await?;
//!     println!("verified enclave key {}", ground_truth.public_key);
//!
//!     // All further requests are pinned to the attested certificate
//!     let response = client.get("/v1/models", &[]).await?;
//!     println!("{}", String::from_utf8_lossy(&response.body));
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod bundle;
pub mod client;
pub mod config;
pub mod error;
pub mod github;
pub mod sigstore;
pub mod tls;
pub mod util;

pub use attestation::{Document, HardwareMeasurement, Measurement, PredicateType, Verification};
pub use client::{GroundTruth, SecureClient};
pub use error::{Error, Result};
