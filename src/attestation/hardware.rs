//! Hardware platform allow-list verification
//!
//! TDX measurements include two registers (MRTD, RTMR0) that depend on the
//! physical attestation-signing platform rather than the enclave image. A
//! separate signed allow-list of trusted platforms provides the acceptable
//! values; the enclave measurement must match one of its entries.

use serde::{Deserialize, Serialize};

use crate::attestation::types::Measurement;
use crate::error::{Error, Result};

/// Measurement values for a single trusted platform from the hardware
/// measurement repo. The id has the form `<platform>@<digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareMeasurement {
    pub id: String,
    pub mrtd: String,
    pub rtmr0: String,
}

/// Compares an enclave measurement against the set of valid hardware
/// measurements and returns the first matching entry.
///
/// Only TDX enclave measurements carry platform registers; any other type is
/// rejected rather than silently passed through.
pub fn verify_hardware<'a>(
    measurements: &'a [HardwareMeasurement],
    enclave_measurement: &Measurement,
) -> Result<&'a HardwareMeasurement> {
    if !enclave_measurement.type_.is_tdx() {
        return Err(Error::Measurement(
            crate::attestation::types::MeasurementError::UnsupportedPlatform(
                enclave_measurement.type_.to_string(),
            ),
        ));
    }

    if enclave_measurement.registers.len() < 2 {
        return Err(Error::Measurement(
            crate::attestation::types::MeasurementError::FewRegisters,
        ));
    }

    measurements
        .iter()
        .find(|m| {
            m.mrtd == enclave_measurement.registers[0]
                && m.rtmr0 == enclave_measurement.registers[1]
        })
        .ok_or(Error::HardwareNoMatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::types::{MeasurementError, PredicateType};

    fn measurements() -> Vec<HardwareMeasurement> {
        vec![
            HardwareMeasurement {
                id: "alpha@0".into(),
                mrtd: "abcdef".into(),
                rtmr0: "012345".into(),
            },
            HardwareMeasurement {
                id: "beta@1".into(),
                mrtd: "fedcba".into(),
                rtmr0: "543210".into(),
            },
        ]
    }

    fn tdx(type_: PredicateType, registers: &[&str]) -> Measurement {
        Measurement {
            type_,
            registers: registers.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn test_tdx_v1_match() {
        let list = measurements();
        let matched = verify_hardware(
            &list,
            &tdx(PredicateType::TdxGuestV1, &["abcdef", "012345"]),
        )
        .unwrap();
        assert_eq!(matched.id, "alpha@0");
        assert_eq!(matched.mrtd, "abcdef");
        assert_eq!(matched.rtmr0, "012345");
    }

    #[test]
    fn test_tdx_v2_match() {
        let list = measurements();
        let matched = verify_hardware(
            &list,
            &tdx(PredicateType::TdxGuestV2, &["fedcba", "543210"]),
        )
        .unwrap();
        assert_eq!(matched.id, "beta@1");
    }

    #[test]
    fn test_no_match() {
        let list = measurements();
        let err = verify_hardware(
            &list,
            &tdx(PredicateType::TdxGuestV1, &["aaaaaa", "bbbbbb"]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::HardwareNoMatch));
    }

    #[test]
    fn test_unsupported_platform() {
        let list = measurements();
        let err = verify_hardware(
            &list,
            &tdx(PredicateType::SevGuestV2, &["abcdef", "012345"]),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Measurement(MeasurementError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_insufficient_registers() {
        let list = measurements();
        let err = verify_hardware(&list, &tdx(PredicateType::TdxGuestV1, &["abcdef"])).unwrap_err();
        assert!(matches!(
            err,
            Error::Measurement(MeasurementError::FewRegisters)
        ));
    }

    #[test]
    fn test_empty_list() {
        let err = verify_hardware(&[], &tdx(PredicateType::TdxGuestV1, &["abcdef", "012345"]))
            .unwrap_err();
        assert!(matches!(err, Error::HardwareNoMatch));
    }
}
