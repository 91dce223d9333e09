//! Implements the protocol-specific parts of HID++ that correlation depends
//! on.
//!
//! Both protocol versions answer a failed command with a dedicated error
//! report instead of the regular response. The error report echoes the
//! identity of the failed command, so the dispatchers can complete the right
//! pending command with a [`ProtocolError`].

use thiserror::Error;

pub mod v10;
pub mod v20;

/// Represents an error reply a device sent instead of a regular response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Error)]
pub enum ProtocolError {
    /// A HID++1.0 error reply with a known error code.
    #[error("the device returned a HID++1.0 error: {0:?}")]
    V10(v10::ErrorType),

    /// A HID++1.0 error reply with an error code this crate does not know.
    #[error("the device returned an unknown HID++1.0 error code {0:#04x}")]
    UnknownV10(u8),

    /// A HID++2.0 error reply with a known error code.
    #[error("the device returned a HID++2.0 error: {0:?}")]
    V20(v20::ErrorType),

    /// A HID++2.0 error reply with an error code this crate does not know.
    #[error("the device returned an unknown HID++2.0 error code {0:#04x}")]
    UnknownV20(u8),
}

impl ProtocolError {
    /// Maps a raw HID++1.0 error code.
    pub fn from_v10_code(code: u8) -> Self {
        v10::ErrorType::try_from(code)
            .map(Self::V10)
            .unwrap_or(Self::UnknownV10(code))
    }

    /// Maps a raw HID++2.0 error code.
    pub fn from_v20_code(code: u8) -> Self {
        v20::ErrorType::try_from(code)
            .map(Self::V20)
            .unwrap_or(Self::UnknownV20(code))
    }
}
