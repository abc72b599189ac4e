/// Decoding of the standard BLE Weight Measurement characteristic (0x2A9D)
use thiserror::Error;

use crate::models::{Measurement, SensorId};

// Weight Measurement protocol constants
const PAYLOAD_LEN: usize = 4;
const FLAG_IMPERIAL: u8 = 0x01; // bit 0: lb/in instead of kg/m
const FLAG_TIMESTAMP: u8 = 0x02; // bit 1: timestamp field present
const FLAG_USER_ID: u8 = 0x04; // bit 2: user id field present
const FLAG_BMI_HEIGHT: u8 = 0x08; // bit 3: BMI and height fields present
const GRAMS_PER_UNIT: f64 = 5.0; // standard weight resolution

/// Why the flags byte was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagReason {
    ImperialUnits,
    TimestampPresent,
    UserIdMissing,
    BmiHeightPresent,
}

impl std::fmt::Display for FlagReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            FlagReason::ImperialUnits => "scale is reporting in Imperial units instead of SI units",
            FlagReason::TimestampPresent => "scale includes a timestamp",
            FlagReason::UserIdMissing => "scale doesn't report user ID",
            FlagReason::BmiHeightPresent => "scale includes BMI and Height",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("garbled weight measurement: data length = {0}")]
    BadLength(usize),
    #[error("unexpected weight flags 0x{flags:02x}: {reason}")]
    UnexpectedFlags { flags: u8, reason: FlagReason },
    #[error("unknown user id {0}")]
    UnknownSensor(u8),
}

/// Decode one Weight Measurement notification
///
/// The scale sends a 4-byte payload:
/// - Byte 0: Flags (only "SI units, user id present" is accepted)
/// - Bytes 1-2: Weight (unsigned 16-bit little endian, 5 g resolution)
/// - Byte 3: User id, used by the scale as the load cell id (0..=5)
///
/// # Arguments
/// * `data` - Raw characteristic value from the notification
///
/// # Returns
/// The decoded measurement, or why the payload was rejected. User id 5
/// decodes successfully as [`SensorId::Reset`]; callers drop it.
pub fn decode_weight(data: &[u8]) -> Result<Measurement, DecodeError> {
    if data.len() != PAYLOAD_LEN {
        return Err(DecodeError::BadLength(data.len()));
    }

    let flags = data[0];
    check_flags(flags).map_err(|reason| DecodeError::UnexpectedFlags { flags, reason })?;

    let raw_weight = u16::from_le_bytes([data[1], data[2]]);
    let sensor_id = SensorId::from_raw(data[3]).ok_or(DecodeError::UnknownSensor(data[3]))?;

    Ok(Measurement {
        sensor_id,
        weight_kg: raw_weight as f64 * GRAMS_PER_UNIT / 1000.0,
    })
}

fn check_flags(flags: u8) -> Result<(), FlagReason> {
    if flags & FLAG_IMPERIAL != 0 {
        return Err(FlagReason::ImperialUnits);
    }
    if flags & FLAG_TIMESTAMP != 0 {
        return Err(FlagReason::TimestampPresent);
    }
    if flags & FLAG_USER_ID == 0 {
        return Err(FlagReason::UserIdMissing);
    }
    if flags & FLAG_BMI_HEIGHT != 0 {
        return Err(FlagReason::BmiHeightPresent);
    }
    Ok(())
}
