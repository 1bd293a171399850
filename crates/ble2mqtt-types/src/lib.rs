//! Platform-agnostic types for the BLE to MQTT bridge.
//!
//! This crate provides shared types used by the BLE side (ble2mqtt-core)
//! and the MQTT side (ble2mqtt-bridge).
//!
//! # Features
//!
//! - Kettle status record decoding
//! - Entity descriptors for Home Assistant discovery
//! - Device information structures
//! - UUID and handshake constants for BLE characteristics
//! - Error types for data parsing

pub mod entity;
pub mod error;
pub mod types;
pub mod uuid;

pub use entity::{Entities, Entity, EntityDomain};
pub use error::{ParseError, ParseResult};
pub use types::{DeviceInfo, KETTLE_STATUS_BYTES, KeepWarmType, KettleState, LedMode, Mode};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_kettle_state_from_valid_bytes() {
        let bytes: [u8; 13] = [
            0x01, // mode = Heating
            0x01, // led = Boil
            0x00, 0x00, // reserved
            0x64, // target = 100
            0x2D, // current = 45
            0x00, // keep warm type = BoilAndCooldown
            0x05, 0x00, // keep warm time = 5
            0x00, 0x00, 0x00, 0x00, // reserved
        ];

        let state = KettleState::from_bytes(&bytes).unwrap();

        assert_eq!(state.mode, Mode::Heating);
        assert_eq!(state.led_mode, LedMode::Boil);
        assert_eq!(state.target_temperature, 100);
        assert_eq!(state.temperature, 45);
        assert_eq!(state.keep_warm_type, KeepWarmType::BoilAndCooldown);
        assert_eq!(state.keep_warm_time, 5);
    }

    #[test]
    fn test_parse_kettle_state_keep_warm_time_is_little_endian() {
        let bytes: [u8; 13] = [0x03, 0x02, 0, 0, 0x3C, 0x3B, 0x01, 0x2C, 0x01, 0, 0, 0, 0];
        let state = KettleState::from_bytes(&bytes).unwrap();
        assert_eq!(state.mode, Mode::KeepWarm);
        assert_eq!(state.keep_warm_type, KeepWarmType::HeatToTemp);
        assert_eq!(state.keep_warm_time, 300);
    }

    #[test]
    fn test_parse_kettle_state_short_record() {
        let bytes = [0x01, 0x01, 0, 0, 0x64, 0x2D, 0x00, 0x05, 0x00, 0, 0, 0];
        assert_eq!(
            KettleState::from_bytes(&bytes),
            Err(ParseError::InvalidLength {
                expected: 13,
                actual: 12
            })
        );
    }

    #[test]
    fn test_parse_kettle_state_invalid_mode() {
        let bytes: [u8; 13] = [0x09, 0x01, 0, 0, 0x64, 0x2D, 0x00, 0x05, 0x00, 0, 0, 0, 0];
        assert!(matches!(
            KettleState::from_bytes(&bytes),
            Err(ParseError::InvalidValue { field: "mode", .. })
        ));
    }

    #[test]
    fn test_parse_kettle_state_invalid_led_mode() {
        let bytes: [u8; 13] = [0x00, 0x00, 0, 0, 0x64, 0x2D, 0x00, 0x05, 0x00, 0, 0, 0, 0];
        assert!(matches!(
            KettleState::from_bytes(&bytes),
            Err(ParseError::InvalidValue {
                field: "led_mode",
                ..
            })
        ));
    }

    proptest! {
        #[test]
        fn prop_wrong_length_never_decodes(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assume!(data.len() != KETTLE_STATUS_BYTES);
            let is_length_error = matches!(
                KettleState::from_bytes(&data),
                Err(ParseError::InvalidLength { .. })
            );
            prop_assert!(is_length_error);
        }

        #[test]
        fn prop_reserved_bytes_are_ignored(reserved in any::<[u8; 6]>()) {
            let bytes: [u8; 13] = [
                0x00, 0xFF, reserved[0], reserved[1], 0x50, 0x20, 0x00, 0x00, 0x00,
                reserved[2], reserved[3], reserved[4], reserved[5],
            ];
            let state = KettleState::from_bytes(&bytes).unwrap();
            prop_assert_eq!(state.mode, Mode::Idle);
            prop_assert_eq!(state.led_mode, LedMode::None);
            prop_assert_eq!(state.target_temperature, 0x50);
            prop_assert_eq!(state.temperature, 0x20);
        }
    }
}
