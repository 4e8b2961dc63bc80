//! Example verifier driver
//!
//! Verifies an enclave against its source repo and prints the measurement
//! comparison. Exits nonzero on any verification failure.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info, warn};

use tinfoil_verifier::attestation::{self, Document};
use tinfoil_verifier::{sigstore, tls, Measurement};

#[derive(Parser)]
#[command(name = "tinfoil-verify", about = "Verify a Tinfoil enclave")]
struct Args {
    /// Config repo attesting the enclave image
    #[arg(short = 'r', long = "repo", default_value = "tinfoilsh/confidential-model-router")]
    repo: String,

    /// Enclave host
    #[arg(short = 'e', long = "enclave", default_value = "inference.tinfoil.sh")]
    enclave: String,

    /// Path to an attestation document file instead of fetching it
    #[arg(short = 'a', long = "attestation")]
    attestation_file: Option<String>,

    /// Skip web-PKI verification on the TLS probe
    #[arg(short = 'i', long = "insecure")]
    insecure: bool,
}

async fn run(args: &Args) -> tinfoil_verifier::Result<()> {
    if args.insecure {
        warn!("running in insecure TLS mode");
    }

    // The code-provenance side and the enclave attestation are independent
    let code_side = async {
        let client = sigstore::Client::new().await?;

        let fetcher = tinfoil_verifier::util::HttpFetcher::new();
        info!(repo = %args.repo, "fetching latest release");
        let digest = tinfoil_verifier::github::fetch_latest_digest(&fetcher, &args.repo).await?;

        info!(repo = %args.repo, %digest, "fetching attestation bundle");
        let bundle =
            tinfoil_verifier::github::fetch_attestation_bundle(&fetcher, &args.repo, &digest)
                .await?;

        info!("verifying source attestation");
        let measurement = client.verify_attestation(&bundle, &digest, &args.repo)?;
        Ok::<_, tinfoil_verifier::Error>((client, measurement))
    };

    let enclave_side = async {
        match &args.attestation_file {
            Some(path) => {
                info!(file = %path, "reading enclave attestation");
                Document::from_file(path)
            }
            None => {
                info!(enclave = %args.enclave, "fetching runtime attestation");
                attestation::fetch(&args.enclave).await
            }
        }
    };

    let ((sigstore_client, code_measurement), enclave_attestation) =
        tokio::try_join!(code_side, enclave_side)?;

    debug!(enclave = %args.enclave, "fetching TLS public key");
    let tls_public_key = tls::tls_public_key(&args.enclave, args.insecure).await?;
    info!(%tls_public_key, "connection TLS public key");

    info!("verifying enclave measurements");
    let verification = enclave_attestation.verify().await?;

    if enclave_attestation.format.is_tdx() {
        info!("fetching latest hardware measurements");
        let hardware = sigstore_client.latest_hardware_measurements().await?;

        info!("verifying hardware measurements");
        let matched = attestation::verify_hardware(&hardware, &verification.measurement)?;
        info!(hardware_measurement = %matched.id, "matched hardware platform");
    }

    info!(
        tls_public_key_fp = %verification.tls_public_key_fp,
        hpke_public_key = %verification.hpke_public_key,
        "verified remote attestation"
    );

    if verification.tls_public_key_fp != tls_public_key {
        return Err(tinfoil_verifier::Error::CertMismatch {
            expected: verification.tls_public_key_fp,
            actual: tls_public_key,
        });
    }
    info!("TLS public key fingerprint matches");

    print_comparison(&code_measurement, &verification.measurement)?;
    Ok(())
}

fn print_comparison(
    code: &Measurement,
    enclave: &Measurement,
) -> tinfoil_verifier::Result<()> {
    let comparison = code.compare(enclave);
    if !comparison.display.is_empty() {
        println!("{}", comparison.display);
    }
    match comparison.result {
        Ok(()) => {
            info!("measurements match");
            Ok(())
        }
        Err(e) => {
            error!("measurements do not match");
            Err(e.into())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .without_time()
        .init();

    let args = Args::parse();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
