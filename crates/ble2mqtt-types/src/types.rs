//! Core types for peripheral state and identity.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Exact size of a kettle status record in bytes.
pub const KETTLE_STATUS_BYTES: usize = 13;

/// Operating mode reported by the kettle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum Mode {
    /// Not heating and not holding temperature.
    Idle = 0x00,
    /// Heating water.
    Heating = 0x01,
    /// Cooling down towards the keep-warm temperature.
    Cooling = 0x02,
    /// Holding the target temperature.
    KeepWarm = 0x03,
}

impl TryFrom<u8> for Mode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Mode::Idle),
            0x01 => Ok(Mode::Heating),
            0x02 => Ok(Mode::Cooling),
            0x03 => Ok(Mode::KeepWarm),
            _ => Err(ParseError::InvalidValue {
                field: "mode",
                value,
            }),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Heating => write!(f, "heating"),
            Mode::Cooling => write!(f, "cooling"),
            Mode::KeepWarm => write!(f, "keep warm"),
        }
    }
}

/// Which LED the kettle has lit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum LedMode {
    /// Boil LED.
    Boil = 0x01,
    /// Keep-warm LED.
    KeepWarm = 0x02,
    /// No LED.
    None = 0xFF,
}

impl TryFrom<u8> for LedMode {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(LedMode::Boil),
            0x02 => Ok(LedMode::KeepWarm),
            0xFF => Ok(LedMode::None),
            _ => Err(ParseError::InvalidValue {
                field: "led_mode",
                value,
            }),
        }
    }
}

/// How the kettle reaches its keep-warm temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[repr(u8)]
pub enum KeepWarmType {
    /// Boil first, then cool down to the target.
    BoilAndCooldown = 0x00,
    /// Heat straight up to the target.
    HeatToTemp = 0x01,
}

impl TryFrom<u8> for KeepWarmType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(KeepWarmType::BoilAndCooldown),
            0x01 => Ok(KeepWarmType::HeatToTemp),
            _ => Err(ParseError::InvalidValue {
                field: "keep_warm_type",
                value,
            }),
        }
    }
}

/// Decoded kettle status record.
///
/// Replaced wholesale on every status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KettleState {
    /// Current operating mode.
    pub mode: Mode,
    /// LED indicator.
    pub led_mode: LedMode,
    /// Current water temperature in °C.
    pub temperature: u8,
    /// Keep-warm target temperature in °C.
    pub target_temperature: u8,
    /// Keep-warm strategy.
    pub keep_warm_type: KeepWarmType,
    /// Keep-warm duration in minutes.
    pub keep_warm_time: u16,
}

impl KettleState {
    /// Decode a status record.
    ///
    /// The byte layout is:
    /// - byte 0: mode
    /// - byte 1: LED mode
    /// - bytes 2-3: reserved
    /// - byte 4: target temperature (°C)
    /// - byte 5: current temperature (°C)
    /// - byte 6: keep-warm type
    /// - bytes 7-8: keep-warm time (u16 LE, minutes)
    /// - bytes 9-12: reserved
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidLength`] unless `data` is exactly
    /// [`KETTLE_STATUS_BYTES`] long, and [`ParseError::InvalidValue`] when an
    /// enumerated field holds an unknown value.
    ///
    /// # Examples
    ///
    /// ```
    /// use ble2mqtt_types::{KettleState, Mode};
    ///
    /// let record = [0x01, 0x01, 0, 0, 0x64, 0x2D, 0x00, 0x05, 0x00, 0, 0, 0, 0];
    /// let state = KettleState::from_bytes(&record).unwrap();
    /// assert_eq!(state.mode, Mode::Heating);
    /// assert_eq!(state.temperature, 45);
    /// ```
    #[must_use = "parsing returns a Result that should be handled"]
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        use bytes::Buf;

        if data.len() != KETTLE_STATUS_BYTES {
            return Err(ParseError::InvalidLength {
                expected: KETTLE_STATUS_BYTES,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let mode = Mode::try_from(buf.get_u8())?;
        let led_mode = LedMode::try_from(buf.get_u8())?;
        buf.advance(2);
        let target_temperature = buf.get_u8();
        let temperature = buf.get_u8();
        let keep_warm_type = KeepWarmType::try_from(buf.get_u8())?;
        let keep_warm_time = buf.get_u16_le();

        Ok(KettleState {
            mode,
            led_mode,
            temperature,
            target_temperature,
            keep_warm_type,
            keep_warm_time,
        })
    }
}

/// Descriptive information about a bridged device.
///
/// `sw_version` is only known once the device has been connected and
/// initialized at least once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceInfo {
    /// Model name.
    pub model: String,
    /// Manufacturer name.
    pub manufacturer: String,
    /// Firmware / software version.
    pub sw_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_try_from() {
        assert_eq!(Mode::try_from(0x00), Ok(Mode::Idle));
        assert_eq!(Mode::try_from(0x03), Ok(Mode::KeepWarm));
        assert_eq!(
            Mode::try_from(0x04),
            Err(ParseError::InvalidValue {
                field: "mode",
                value: 0x04
            })
        );
    }

    #[test]
    fn test_led_mode_try_from() {
        assert_eq!(LedMode::try_from(0xFF), Ok(LedMode::None));
        assert_eq!(LedMode::try_from(0x02), Ok(LedMode::KeepWarm));
        assert!(LedMode::try_from(0x00).is_err());
    }

    #[test]
    fn test_keep_warm_type_try_from() {
        assert_eq!(KeepWarmType::try_from(0x01), Ok(KeepWarmType::HeatToTemp));
        assert!(KeepWarmType::try_from(0x02).is_err());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::KeepWarm.to_string(), "keep warm");
        assert_eq!(Mode::Heating.to_string(), "heating");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_kettle_state_serializes_snake_case() {
        let state = KettleState {
            mode: Mode::KeepWarm,
            led_mode: LedMode::None,
            temperature: 60,
            target_temperature: 60,
            keep_warm_type: KeepWarmType::HeatToTemp,
            keep_warm_time: 120,
        };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["mode"], "keep_warm");
        assert_eq!(json["keep_warm_type"], "heat_to_temp");
        assert_eq!(json["keep_warm_time"], 120);
    }
}
