//! Error types for data parsing in ble2mqtt-types.

use thiserror::Error;

/// Errors that can occur when decoding data received from a peripheral.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in ble2mqtt-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The record does not have the exact expected length.
    #[error("Invalid record length: expected {expected} bytes, got {actual}")]
    InvalidLength {
        /// Expected record size.
        expected: usize,
        /// Actual record size received.
        actual: usize,
    },

    /// A field holds a value outside its enumeration.
    #[error("Invalid value 0x{value:02X} for field '{field}'")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// The raw byte that was rejected.
        value: u8,
    },
}

/// Result type alias using ble2mqtt-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
