//! Identity, battery and clock payloads of the Information message group.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, FromRepr};

use crate::error::Error;
use crate::reader::{self, ByteReader};

pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 30;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter, FromRepr,
)]
#[repr(u8)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeviceType {
    LeftInsole,
    RightInsole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum InsoleSide {
    Left,
    Right,
}

impl DeviceType {
    #[allow(clippy::as_conversions)]
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn is_insole(self) -> bool {
        matches!(self, Self::LeftInsole | Self::RightInsole)
    }

    pub fn insole_side(self) -> InsoleSide {
        match self {
            Self::LeftInsole => InsoleSide::Left,
            Self::RightInsole => InsoleSide::Right,
        }
    }
}

pub fn parse_is_charging(payload: &[u8]) -> Result<bool, Error> {
    ByteReader::new(payload, "isCharging").bool()
}

pub fn parse_battery_current(payload: &[u8]) -> Result<f32, Error> {
    ByteReader::new(payload, "batteryCurrent").f32_le()
}

pub fn parse_mtu(payload: &[u8]) -> Result<u16, Error> {
    ByteReader::new(payload, "mtu").u16_le()
}

pub fn parse_text(payload: &[u8], context: &'static str) -> Result<String, Error> {
    reader::utf8(payload, context)
}

pub fn parse_device_type(payload: &[u8]) -> Result<DeviceType, Error> {
    let index = ByteReader::new(payload, "deviceType").u8()?;
    DeviceType::from_repr(index).ok_or(Error::InvalidEnum {
        kind: "device type",
        index,
    })
}

/// Device clock in Unix milliseconds; 0 means the clock was never set.
pub fn parse_current_time(payload: &[u8]) -> Result<u64, Error> {
    ByteReader::new(payload, "currentTime").u64_le()
}

pub fn encode_current_time(unix_ms: u64) -> [u8; 8] {
    unix_ms.to_le_bytes()
}

/// Name length is counted in characters, as the device firmware does.
pub fn validate_name(name: &str) -> Result<(), Error> {
    let len = name.chars().count();
    if len < MIN_NAME_LEN {
        return Err(Error::validation(
            "name",
            format!("must be at least {MIN_NAME_LEN} characters long (\"{name}\" is {len})"),
        ));
    }
    if len >= MAX_NAME_LEN {
        return Err(Error::validation(
            "name",
            format!("must be shorter than {MAX_NAME_LEN} characters (\"{name}\" is {len})"),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_fields() {
        assert!(parse_is_charging(&[1]).unwrap());
        assert!(!parse_is_charging(&[0]).unwrap());
        assert!((parse_battery_current(&1.5f32.to_le_bytes()).unwrap() - 1.5).abs() < f32::EPSILON);
        assert_eq!(parse_mtu(&[0xF7, 0x00]).unwrap(), 247);
        assert_eq!(parse_current_time(&encode_current_time(1_700_000_000_000)).unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn device_type_maps_to_side() {
        assert_eq!(parse_device_type(&[1]).unwrap(), DeviceType::RightInsole);
        assert_eq!(DeviceType::LeftInsole.insole_side(), InsoleSide::Left);
        assert!(matches!(parse_device_type(&[2]), Err(Error::InvalidEnum { index: 2, .. })));
    }

    #[test]
    fn name_bounds() {
        assert!(validate_name("a").is_err());
        assert!(validate_name("ab").is_ok());
        assert!(validate_name(&"x".repeat(29)).is_ok());
        assert!(validate_name(&"x".repeat(30)).is_err());
    }

    #[test]
    fn empty_payload_is_truncated() {
        assert!(matches!(parse_mtu(&[]), Err(Error::Truncated { context: "mtu", .. })));
    }
}
