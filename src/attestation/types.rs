//! Core types for attestation verification

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::attestation::hardware::HardwareMeasurement;
use crate::util::{colorize, COLOR_GREEN, COLOR_GREY, COLOR_RED};

/// Expected RTMR3 value for Tinfoil enclaves: nothing is ever extended into
/// RTMR3, so a multi-platform comparison requires it to be all zeros.
pub const RTMR3_ZERO: &str = "000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000";

/// Predicate types for the attestation formats the verifier understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    /// v1 guest reports carry the TLS key fingerprint as an ASCII hex string
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v1")]
    SevGuestV1,

    #[serde(rename = "https://tinfoil.sh/predicate/tdx-guest/v1")]
    TdxGuestV1,

    /// v2 guest reports carry 32 bytes of TLS key fingerprint followed by
    /// 32 bytes of HPKE public key, and the body is gzip-compressed
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v2")]
    SevGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/tdx-guest/v2")]
    TdxGuestV2,

    /// Code measurement that specifies SNP and TDX register values at once
    #[serde(rename = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1")]
    SnpTdxMultiPlatformV1,

    /// Allow-list of hardware platform registers (MRTD, RTMR0)
    #[serde(rename = "https://tinfoil.sh/predicate/hardware-measurements/v1")]
    HardwareMeasurementsV1,

    #[serde(other)]
    Unknown,
}

impl PredicateType {
    pub fn is_sev(&self) -> bool {
        matches!(self, PredicateType::SevGuestV1 | PredicateType::SevGuestV2)
    }

    pub fn is_tdx(&self) -> bool {
        matches!(self, PredicateType::TdxGuestV1 | PredicateType::TdxGuestV2)
    }

    pub fn is_multiplatform(&self) -> bool {
        matches!(self, PredicateType::SnpTdxMultiPlatformV1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PredicateType::SevGuestV1 => "https://tinfoil.sh/predicate/sev-snp-guest/v1",
            PredicateType::TdxGuestV1 => "https://tinfoil.sh/predicate/tdx-guest/v1",
            PredicateType::SevGuestV2 => "https://tinfoil.sh/predicate/sev-snp-guest/v2",
            PredicateType::TdxGuestV2 => "https://tinfoil.sh/predicate/tdx-guest/v2",
            PredicateType::SnpTdxMultiPlatformV1 => {
                "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1"
            }
            PredicateType::HardwareMeasurementsV1 => {
                "https://tinfoil.sh/predicate/hardware-measurements/v1"
            }
            PredicateType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for PredicateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Register-level comparison and fingerprint failures. The multi-platform to
/// TDX comparison joins all failing registers into a single error instead of
/// short-circuiting on the first.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeasurementError {
    #[error("attestation format mismatch")]
    FormatMismatch,

    #[error("measurement mismatch")]
    MeasurementMismatch,

    #[error("RTMR1 mismatch")]
    Rtmr1Mismatch,

    #[error("RTMR2 mismatch")]
    Rtmr2Mismatch,

    #[error("RTMR3 mismatch")]
    Rtmr3Mismatch,

    #[error("fewer registers than expected")]
    FewRegisters,

    #[error("multi-platform measurement mismatch")]
    MultiPlatformMismatch,

    #[error("multi-platform SEV-SNP measurement mismatch")]
    MultiPlatformSevSnpMismatch,

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("hardware measurement required for multi-platform TDX fingerprint")]
    MissingHardware,

    #[error("{}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Joined(Vec<MeasurementError>),
}

impl MeasurementError {
    /// Join multiple register-level errors into one, flattening singletons.
    fn join(mut errors: Vec<MeasurementError>) -> MeasurementError {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            MeasurementError::Joined(errors)
        }
    }

    /// Whether this error is, or joins, the given kind.
    pub fn is(&self, kind: &MeasurementError) -> bool {
        match self {
            MeasurementError::Joined(inner) => inner.iter().any(|e| e == kind),
            other => other == kind,
        }
    }
}

/// Outcome of a measurement comparison: the reproducible human-readable
/// diagnostic plus the semantic result.
#[derive(Debug)]
pub struct Comparison {
    pub display: String,
    pub result: std::result::Result<(), MeasurementError>,
}

/// Measurement registers of an enclave or a code attestation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    #[serde(rename = "type")]
    pub type_: PredicateType,
    pub registers: Vec<String>,
}

impl Measurement {
    /// Construct a measurement, validating register arity for the format.
    pub fn new(type_: PredicateType, registers: Vec<String>) -> Result<Self, MeasurementError> {
        let expected = match type_ {
            PredicateType::SevGuestV1 | PredicateType::SevGuestV2 => 1,
            PredicateType::TdxGuestV1 | PredicateType::TdxGuestV2 => 5,
            PredicateType::SnpTdxMultiPlatformV1 => 3,
            PredicateType::HardwareMeasurementsV1 => 2,
            PredicateType::Unknown => {
                return Err(MeasurementError::UnsupportedPlatform("unknown".into()))
            }
        };
        if registers.len() < expected {
            return Err(MeasurementError::FewRegisters);
        }
        Ok(Self { type_, registers })
    }

    /// Compare measurements, handling multi-platform code measurements.
    ///
    /// Equality is commutative modulo normalization: the multi-platform side
    /// is always canonicalized to the left operand before branching on the
    /// other side's type.
    pub fn equals(&self, other: &Measurement) -> Result<(), MeasurementError> {
        self.compare(other).result
    }

    /// Compare measurements and also produce a per-register diagnostic that
    /// flags matching (`[+]`), mismatching (`[-]`) and informational (`[i]`)
    /// registers.
    pub fn compare(&self, other: &Measurement) -> Comparison {
        // Base case: two multi-platform measurements compare directly
        if self.type_.is_multiplatform() && other.type_.is_multiplatform() {
            if self.registers != other.registers {
                return Comparison {
                    display: String::new(),
                    result: Err(MeasurementError::MultiPlatformMismatch),
                };
            }
            return Comparison {
                display: "MP-MP exact match".into(),
                result: Ok(()),
            };
        }

        // Canonicalize the multi-platform side to the left operand
        if other.type_.is_multiplatform() {
            return other.compare(self);
        }

        if self.type_.is_multiplatform() {
            return self.compare_multiplatform(other);
        }

        if self.type_ != other.type_ {
            return Comparison {
                display: String::new(),
                result: Err(MeasurementError::FormatMismatch),
            };
        }

        if self.registers != other.registers {
            return Comparison {
                display: String::new(),
                result: Err(MeasurementError::MeasurementMismatch),
            };
        }

        Comparison {
            display: String::new(),
            result: Ok(()),
        }
    }

    fn compare_multiplatform(&self, other: &Measurement) -> Comparison {
        if self.registers.len() < 3 {
            return Comparison {
                display: String::new(),
                result: Err(MeasurementError::FewRegisters),
            };
        }

        let expected_snp = &self.registers[0];
        let expected_rtmr1 = &self.registers[1];
        let expected_rtmr2 = &self.registers[2];

        let mut out = String::new();

        if other.type_.is_tdx() {
            if other.registers.len() < 4 {
                return Comparison {
                    display: "MP-TDX unable to compare, too few TDX registers".into(),
                    result: Err(MeasurementError::FewRegisters),
                };
            }

            // 0 is MRTD, 1 is RTMR0; both are hardware registers matched
            // against the allow-list, not the code measurement
            let actual_rtmr1 = &other.registers[2];
            let actual_rtmr2 = &other.registers[3];
            // Legacy TDX quotes omit RTMR3; absent counts as all zeros
            let actual_rtmr3 = other
                .registers
                .get(4)
                .map(String::as_str)
                .unwrap_or(RTMR3_ZERO);

            let mut errors = Vec::new();

            out.push_str(&colorize(COLOR_GREY, &format!("[i] SNP   {expected_snp}\n")));

            if expected_rtmr1 != actual_rtmr1 {
                out.push_str(&colorize(
                    COLOR_RED,
                    &format!("[-] RTMR1 {expected_rtmr1} != {actual_rtmr1}\n"),
                ));
                errors.push(MeasurementError::Rtmr1Mismatch);
            }
            if expected_rtmr2 != actual_rtmr2 {
                out.push_str(&colorize(
                    COLOR_RED,
                    &format!("[-] RTMR2 {expected_rtmr2} != {actual_rtmr2}\n"),
                ));
                errors.push(MeasurementError::Rtmr2Mismatch);
            }
            if actual_rtmr3 != RTMR3_ZERO {
                out.push_str(&colorize(
                    COLOR_RED,
                    &format!("[-] RTMR3 {RTMR3_ZERO} != {actual_rtmr3}\n"),
                ));
                errors.push(MeasurementError::Rtmr3Mismatch);
            }

            if errors.is_empty() {
                out.push_str(&colorize(
                    COLOR_GREEN,
                    &format!("[+] RTMR1 {expected_rtmr1}\n[+] RTMR2 {expected_rtmr2}\n"),
                ));
            }

            let result = if errors.is_empty() {
                Ok(())
            } else {
                Err(MeasurementError::join(errors))
            };
            return Comparison {
                display: out.trim_end_matches('\n').to_string(),
                result,
            };
        }

        if other.type_.is_sev() {
            let result = match other.registers.first() {
                None => Err(MeasurementError::FewRegisters),
                Some(actual_snp) if actual_snp != expected_snp => {
                    out.push_str(&colorize(
                        COLOR_RED,
                        &format!("[-] SNP   {expected_snp} != {actual_snp}\n"),
                    ));
                    Err(MeasurementError::MultiPlatformSevSnpMismatch)
                }
                Some(_) => {
                    out.push_str(&colorize(
                        COLOR_GREEN,
                        &format!("[+] SNP   {expected_snp}\n"),
                    ));
                    Ok(())
                }
            };

            out.push_str(&colorize(
                COLOR_GREY,
                &format!("[i] RTMR1 {expected_rtmr1}\n[i] RTMR2 {expected_rtmr2}"),
            ));

            return Comparison {
                display: out.trim_end_matches('\n').to_string(),
                result,
            };
        }

        Comparison {
            display: String::new(),
            result: Err(MeasurementError::UnsupportedPlatform(format!(
                "unsupported enclave platform for multi-platform code measurements: {}",
                other.type_
            ))),
        }
    }

    /// Compute a stable fingerprint that lets measurements from different
    /// predicate families be compared by value when they describe the same
    /// enclave. The fingerprint is the SHA-256 of the selected registers
    /// joined with `|`.
    ///
    /// For a multi-platform measurement fingerprinted against a TDX target
    /// the hardware registers (MRTD, RTMR0) come from the matched
    /// [`HardwareMeasurement`] since a code measurement cannot know them.
    pub fn fingerprint(
        &self,
        hardware: Option<&HardwareMeasurement>,
        target: PredicateType,
    ) -> Result<String, MeasurementError> {
        let registers: Vec<&str> = if self.type_.is_multiplatform() {
            if self.registers.len() < 3 {
                return Err(MeasurementError::FewRegisters);
            }
            if target.is_sev() {
                vec![&self.registers[0]]
            } else if target.is_tdx() {
                let hw = hardware.ok_or(MeasurementError::MissingHardware)?;
                vec![&hw.mrtd, &hw.rtmr0, &self.registers[1], &self.registers[2]]
            } else {
                return Err(MeasurementError::UnsupportedPlatform(target.to_string()));
            }
        } else if self.type_.is_tdx() {
            if self.registers.len() < 4 {
                return Err(MeasurementError::FewRegisters);
            }
            self.registers[0..=3].iter().map(String::as_str).collect()
        } else if self.type_.is_sev() {
            match self.registers.first() {
                Some(r) => vec![r.as_str()],
                None => return Err(MeasurementError::FewRegisters),
            }
        } else {
            return Err(MeasurementError::UnsupportedPlatform(self.type_.to_string()));
        };

        let joined = registers.join("|");
        Ok(hex::encode(Sha256::digest(joined.as_bytes())))
    }
}

/// Result of a successful platform verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verification {
    pub measurement: Measurement,

    /// Hex-encoded SHA-256 of the enclave's TLS SubjectPublicKeyInfo
    #[serde(rename = "tls_public_key")]
    pub tls_public_key_fp: String,

    /// Hex-encoded HPKE public key, empty for v1 attestations
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hpke_public_key: String,
}

impl Verification {
    /// Build a v2 verification from the 64-byte report data: the first half
    /// is the TLS key fingerprint, the second half the HPKE public key.
    pub(crate) fn from_report_data_v2(measurement: Measurement, keys: &[u8]) -> Self {
        Self {
            measurement,
            tls_public_key_fp: hex::encode(&keys[..32]),
            hpke_public_key: hex::encode(&keys[32..64]),
        }
    }
}
