//! Bluetooth UUIDs and protocol constants for supported peripherals.
//!
//! This module contains the GATT identifiers needed to talk to the
//! Xiaomi kettle over Bluetooth Low Energy.

use uuid::{Uuid, uuid};

// --- Xiaomi Kettle Service UUIDs ---

/// Xiaomi (MiBeacon) service advertised by the kettle.
pub const KETTLE_SERVICE: Uuid = uuid!("0000fe95-0000-1000-8000-00805f9b34fb");

// --- Xiaomi Kettle Characteristic UUIDs ---

/// Authentication bootstrap characteristic (receives `AUTH_MAGIC1`).
pub const AUTH_INIT: Uuid = uuid!("00000010-0000-1000-8000-00805f9b34fb");

/// Authentication exchange characteristic (write + notify).
pub const AUTH: Uuid = uuid!("00000001-0000-1000-8000-00805f9b34fb");

/// Protocol version characteristic, read to finish the handshake.
pub const VERSION: Uuid = uuid!("00000004-0000-1000-8000-00805f9b34fb");

/// Kettle status record characteristic (notify).
pub const STATUS: Uuid = uuid!("0000aa02-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Characteristic UUIDs ---

/// Software revision string characteristic.
pub const SOFTWARE_REVISION: Uuid = uuid!("00002a28-0000-1000-8000-00805f9b34fb");

// --- Handshake Constants ---

/// First magic written to [`AUTH_INIT`] to start authentication.
pub const AUTH_MAGIC1: [u8; 4] = [0x90, 0xCA, 0x85, 0xDE];

/// Second magic, encrypted with the token, that confirms authentication.
pub const AUTH_MAGIC2: [u8; 4] = [0x92, 0xAB, 0x54, 0xFA];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristics_share_bluetooth_base() {
        for uuid in [AUTH_INIT, AUTH, VERSION, STATUS, SOFTWARE_REVISION, KETTLE_SERVICE] {
            assert!(
                uuid.to_string().ends_with("-0000-1000-8000-00805f9b34fb"),
                "{} is not a 16-bit Bluetooth UUID",
                uuid
            );
        }
    }

    #[test]
    fn test_short_forms() {
        assert_eq!(AUTH_INIT.as_fields().0, 0x0010);
        assert_eq!(AUTH.as_fields().0, 0x0001);
        assert_eq!(VERSION.as_fields().0, 0x0004);
        assert_eq!(STATUS.as_fields().0, 0xaa02);
        assert_eq!(KETTLE_SERVICE.as_fields().0, 0xfe95);
    }
}
