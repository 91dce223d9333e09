//! Implements functionality specific to HID++2.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    nibble::U4,
    report::{DeviceIndex, LONG_PARAMS_LENGTH, Report, ReportHeader},
};

/// The feature index HID++2.0 devices use for error replies.
pub const ERROR_FEATURE_INDEX: u8 = 0xff;

/// The index of the root feature every HID++2.0 device supports.
pub const ROOT_FEATURE_INDEX: u8 = 0x00;

/// Represents an error code returned by a HID++2.0 device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    NoError = 0x00,
    Unknown = 0x01,
    InvalidArgument = 0x02,
    OutOfRange = 0x03,
    HardwareError = 0x04,

    /// Reserved for internal use by Logitech.
    LogitechInternal = 0x05,

    /// The feature index of the call does not exist on the device.
    InvalidFeatureIndex = 0x06,

    /// The function ID of the call is not implemented by the feature.
    InvalidFunctionId = 0x07,

    Busy = 0x08,
    Unsupported = 0x09,
}

/// The identity of a failed feature call as echoed by a HID++2.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ErrorMessage {
    pub device_index: DeviceIndex,

    /// The feature index of the failed call.
    pub feature_index: u8,

    /// The packed function ID and software ID of the failed call.
    pub function_byte: u8,

    /// The raw error code.
    pub code: u8,
}

impl ErrorMessage {
    /// Recognizes a HID++2.0 error reply. These are always long reports laid
    /// out as `[0x11, device, 0xff, feature_index, function_byte, code, ..]`.
    pub fn parse(report: &Report) -> Option<Self> {
        let Report::Long(header, params) = report else {
            return None;
        };

        if header.sub_id != ERROR_FEATURE_INDEX {
            return None;
        }

        Some(Self {
            device_index: header.device_index,
            feature_index: header.address,
            function_byte: params[0],
            code: params[1],
        })
    }

    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.function_byte)
    }

    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.function_byte)
    }

    /// Builds the error reply a device would send for a failed call.
    pub fn to_report(&self) -> Report {
        let mut params = [0u8; LONG_PARAMS_LENGTH];
        params[0] = self.function_byte;
        params[1] = self.code;

        Report::Long(
            ReportHeader {
                device_index: self.device_index,
                sub_id: ERROR_FEATURE_INDEX,
                address: self.feature_index,
            },
            params,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_long_error_reply() {
        let mut raw = [0u8; 20];
        raw[..6].copy_from_slice(&[0x11, 0x01, 0xff, 0x05, 0x2a, 0x07]);
        let report = Report::read_raw(&raw).unwrap();

        let error = ErrorMessage::parse(&report).unwrap();
        assert_eq!(error.device_index, DeviceIndex::Wireless1);
        assert_eq!(error.feature_index, 0x05);
        assert_eq!(error.function_id(), U4::from_lo(0x2));
        assert_eq!(error.software_id(), U4::from_lo(0xa));
        assert_eq!(error.code, 0x07);
        assert_eq!(error.to_report(), report);
    }

    #[test]
    fn ignores_short_reports() {
        let report = Report::read_raw(&[0x10, 0x01, 0xff, 0x05, 0x2a, 0x07, 0x00]).unwrap();
        assert_eq!(ErrorMessage::parse(&report), None);
    }
}
