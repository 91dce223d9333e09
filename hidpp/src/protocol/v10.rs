//! Implements functionality specific to HID++1.0.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::report::{DeviceIndex, Report, ReportHeader};

/// Represents a globally defined sub ID of a HID++1.0 message.
///
/// This enum only includes sub IDs that are defined globally across all
/// devices. Most devices (e.g. the Unifying Receiver) define additional sub IDs
/// specific to their functionality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum MessageType {
    /// Sent by a receiver when a paired device disconnects.
    DeviceDisconnection = 0x40,

    /// Sent by a receiver when a paired device connects or disconnects. Bit 6
    /// of the first parameter byte is set when the link is not established.
    DeviceConnection = 0x41,

    /// Used to set a 3-byte register value.
    SetRegister = 0x80,

    /// Used to retrieve a 3-byte register value.
    GetRegister = 0x81,

    /// Used to set a 16-byte register value.
    SetLongRegister = 0x82,

    /// Used to retrieve a 16-byte register value.
    GetLongRegister = 0x83,

    /// Used to indicate an error response. The error code included in the
    /// message can be mapped using [`ErrorType::try_from`].
    Error = 0x8f,
}

/// Represents the type of an error a HID++1.0 device returns as part of a
/// message with the [`MessageType::Error`] type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorType {
    Success = 0x00,

    /// The sub ID of a sent message is invalid. HID++2.0 devices never
    /// answer with this, which is what protocol version detection relies on.
    InvalidSubId = 0x01,

    InvalidAddress = 0x02,
    InvalidValue = 0x03,

    /// A connection request failed on the receiver's side.
    ConnectFail = 0x04,

    TooManyDevices = 0x05,
    AlreadyExists = 0x06,

    /// The receiver is currently handling a downstream (to device) message and
    /// cannot process a second one.
    Busy = 0x07,

    /// There is no device paired at the addressed device index.
    UnknownDevice = 0x08,

    /// The addressed device is paired but currently disconnected.
    ResourceError = 0x09,

    RequestUnavailable = 0x0a,
    InvalidParamValue = 0x0b,
    WrongPinCode = 0x0c,
}

/// The identity of a failed command as echoed by a HID++1.0 error reply.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ErrorMessage {
    pub device_index: DeviceIndex,

    /// The sub ID of the failed command.
    pub sub_id: u8,

    /// The address of the failed command.
    pub address: u8,

    /// The raw error code.
    pub code: u8,
}

impl ErrorMessage {
    /// Recognizes a HID++1.0 error reply. These are always short reports
    /// laid out as `[0x10, device, 0x8f, sub_id, address, code, 0x00]`.
    pub fn parse(report: &Report) -> Option<Self> {
        let Report::Short(header, params) = report else {
            return None;
        };

        if header.sub_id != u8::from(MessageType::Error) {
            return None;
        }

        Some(Self {
            device_index: header.device_index,
            sub_id: header.address,
            address: params[0],
            code: params[1],
        })
    }

    /// Builds the error reply a device would send for a failed command.
    pub fn to_report(&self) -> Report {
        Report::Short(
            ReportHeader {
                device_index: self.device_index,
                sub_id: MessageType::Error.into(),
                address: self.sub_id,
            },
            [self.address, self.code, 0x00],
        )
    }
}
