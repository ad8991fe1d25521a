//! Weight Measurement payload decoding.
//!
//! Layout of the payload consumed here:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 1 | flags, bit 0 = unit (0 = kg, 1 = lb) |
//! | 1 | 2 | weight, `u16` little-endian, resolution 0.01 |
//!
//! Only the unit flag is interpreted. Timestamp, user id, BMI/height and the
//! instability flag of the full Weight Measurement format are ignored, and
//! every decoded reading is reported as stable.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::transport::CharacteristicValue;
use crate::types::{WeightReading, WeightUnit};

/// Minimum payload length: flags byte plus the 16-bit weight.
pub const MIN_PAYLOAD_LEN: usize = 3;

/// Flags bit selecting imperial units.
pub const FLAG_IMPERIAL_UNITS: u8 = 0b0000_0001;

/// Fixed-point divisor for the raw weight field.
const WEIGHT_SCALE_FACTOR: f64 = 100.0;

/// Reasons a measurement payload could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than [`MIN_PAYLOAD_LEN`] bytes.
    #[error("Weight payload too short: {len} bytes (need at least 3)")]
    TooShort {
        /// Received length.
        len: usize,
    },

    /// The transport encoding (base64) of the value was malformed.
    #[error("Invalid payload encoding: {0}")]
    InvalidEncoding(String),
}

/// Decode a Weight Measurement payload, stamping it with the current time.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for payloads under three bytes.
pub fn decode_weight_measurement(data: &[u8]) -> Result<WeightReading, DecodeError> {
    decode_weight_measurement_at(data, Utc::now())
}

/// Decode a Weight Measurement payload with an explicit capture time.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for payloads under three bytes.
pub fn decode_weight_measurement_at(
    data: &[u8],
    timestamp: DateTime<Utc>,
) -> Result<WeightReading, DecodeError> {
    let &[flags, lo, hi, ..] = data else {
        return Err(DecodeError::TooShort { len: data.len() });
    };

    let unit = if flags & FLAG_IMPERIAL_UNITS == 0 {
        WeightUnit::Kilograms
    } else {
        WeightUnit::Pounds
    };
    let raw = u16::from_le_bytes([lo, hi]);

    Ok(WeightReading {
        weight: f64::from(raw) / WEIGHT_SCALE_FACTOR,
        unit,
        timestamp,
        stable: true,
    })
}

/// Decode a transport value, unwrapping its encoding first.
///
/// # Errors
///
/// Returns [`DecodeError::InvalidEncoding`] for malformed base64 and
/// [`DecodeError::TooShort`] for short payloads.
pub fn decode_characteristic_value(
    value: &CharacteristicValue,
) -> Result<WeightReading, DecodeError> {
    match value {
        CharacteristicValue::Bytes(bytes) => decode_weight_measurement(bytes),
        CharacteristicValue::Base64(_) => {
            let bytes = value.to_bytes().map_err(DecodeError::InvalidEncoding)?;
            decode_weight_measurement(&bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_weight(reading: &WeightReading, expected: f64) {
        assert!(
            (reading.weight - expected).abs() < 1e-9,
            "expected {expected}, got {}",
            reading.weight
        );
    }

    #[test]
    fn test_decode_kilograms() {
        let reading = decode_weight_measurement(&[0x00, 0x10, 0x27]).unwrap();
        assert_weight(&reading, 40.96);
        assert_eq!(reading.unit, WeightUnit::Kilograms);
        assert!(reading.stable);
    }

    #[test]
    fn test_decode_pounds() {
        let reading = decode_weight_measurement(&[0x01, 0xE8, 0x03]).unwrap();
        assert_weight(&reading, 10.0);
        assert_eq!(reading.unit, WeightUnit::Pounds);
    }

    #[test]
    fn test_other_flag_bits_are_ignored() {
        let reading = decode_weight_measurement(&[0b1111_1110, 0xE8, 0x03]).unwrap();
        assert_eq!(reading.unit, WeightUnit::Kilograms);
        assert_weight(&reading, 10.0);
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let reading =
            decode_weight_measurement(&[0x00, 0x10, 0x27, 0xE8, 0x07, 0x01, 0x01]).unwrap();
        assert_weight(&reading, 40.96);
    }

    #[test]
    fn test_short_payloads_fail() {
        for data in [&[][..], &[0x00][..], &[0x00, 0x10][..]] {
            assert_eq!(
                decode_weight_measurement(data),
                Err(DecodeError::TooShort { len: data.len() })
            );
        }
    }

    #[test]
    fn test_decoding_is_deterministic() {
        let at = Utc::now();
        let payload = [0x01, 0x34, 0x12];
        let first = decode_weight_measurement_at(&payload, at).unwrap();
        let second = decode_weight_measurement_at(&payload, at).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_maximum_raw_value() {
        let reading = decode_weight_measurement(&[0x00, 0xFF, 0xFF]).unwrap();
        assert_weight(&reading, 655.35);
    }

    #[test]
    fn test_decode_base64_value() {
        let value = CharacteristicValue::Base64("AegD".into());
        let reading = decode_characteristic_value(&value).unwrap();
        assert_eq!(reading.unit, WeightUnit::Pounds);
        assert_weight(&reading, 10.0);
    }

    #[test]
    fn test_malformed_base64_fails() {
        let value = CharacteristicValue::Base64("%%%".into());
        assert!(matches!(
            decode_characteristic_value(&value),
            Err(DecodeError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_short_base64_payload_fails() {
        let value = CharacteristicValue::Base64("ABA=".into());
        assert_eq!(
            decode_characteristic_value(&value),
            Err(DecodeError::TooShort { len: 2 })
        );
    }
}
