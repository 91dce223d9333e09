//! Implements the two HID++ wire frames and their codec.
//!
//! Every HID++ report starts with a report ID selecting the frame shape,
//! followed by the device index, the sub ID (HID++1.0) or feature index
//! (HID++2.0) and a byte whose meaning depends on the protocol version:
//! HID++1.0 uses it as a register address, HID++2.0 splits it into the
//! function ID (high nibble) and the software ID (low nibble). The remaining
//! bytes are parameters.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::nibble::{self, U4};

/// The total size of a short HID++ report, including the report ID.
pub const SHORT_REPORT_LENGTH: usize = 7;

/// The total size of a long HID++ report, including the report ID.
pub const LONG_REPORT_LENGTH: usize = 20;

/// The amount of parameter bytes a short report carries.
pub const SHORT_PARAMS_LENGTH: usize = SHORT_REPORT_LENGTH - HEADER_LENGTH;

/// The amount of parameter bytes a long report carries.
pub const LONG_PARAMS_LENGTH: usize = LONG_REPORT_LENGTH - HEADER_LENGTH;

/// Report ID, device index, sub ID and address.
const HEADER_LENGTH: usize = 4;

/// The report ID selecting one of the two HID++ frame shapes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum ReportType {
    /// A 7 byte report with 3 bytes of parameters.
    Short = 0x10,

    /// A 20 byte report with 16 bytes of parameters.
    Long = 0x11,
}

impl ReportType {
    /// The total size of a frame of this type on the wire.
    pub const fn frame_length(self) -> usize {
        match self {
            Self::Short => SHORT_REPORT_LENGTH,
            Self::Long => LONG_REPORT_LENGTH,
        }
    }

    /// The size of the parameter region of a frame of this type.
    pub const fn params_length(self) -> usize {
        self.frame_length() - HEADER_LENGTH
    }
}

/// Addresses a device on a HID++ channel.
///
/// Receivers forward reports to up to six paired wireless devices. Devices
/// connected directly (or the receiver itself) answer on one of the two
/// sentinel indices.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, IntoPrimitive, TryFromPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum DeviceIndex {
    /// Used by some corded devices instead of [`Self::Default`].
    Corded = 0x00,
    Wireless1 = 0x01,
    Wireless2 = 0x02,
    Wireless3 = 0x03,
    Wireless4 = 0x04,
    Wireless5 = 0x05,
    Wireless6 = 0x06,
    /// The receiver itself, or a device connected without a receiver.
    Default = 0xff,
}

impl DeviceIndex {
    /// The index to use when talking to a receiver.
    pub const RECEIVER: DeviceIndex = DeviceIndex::Default;

    /// Every known device index, sentinels first.
    pub const ALL: [DeviceIndex; 8] = [
        DeviceIndex::Default,
        DeviceIndex::Corded,
        DeviceIndex::Wireless1,
        DeviceIndex::Wireless2,
        DeviceIndex::Wireless3,
        DeviceIndex::Wireless4,
        DeviceIndex::Wireless5,
        DeviceIndex::Wireless6,
    ];

    /// Returns the index of the `n`th paired wireless device, counting from 1.
    pub fn wireless(n: u8) -> Option<Self> {
        match n {
            1..=6 => Self::try_from(n).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Corded => f.write_str("corded"),
            wireless => write!(f, "wireless {}", u8::from(*wireless)),
        }
    }
}

/// Represents the header that starts every HID++ report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReportHeader {
    /// The index of the device involved in the communication.
    pub device_index: DeviceIndex,

    /// The HID++1.0 sub ID or the HID++2.0 feature index.
    ///
    /// Together with [`Self::device_index`], this is what listeners match
    /// incoming reports on.
    pub sub_id: u8,

    /// The HID++1.0 register address, or the HID++2.0 function ID and
    /// software ID packed into one byte.
    pub address: u8,
}

/// Represents a single HID++ report.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Report {
    /// A short report with 3 bytes of parameters.
    Short(ReportHeader, [u8; SHORT_PARAMS_LENGTH]),

    /// A long report with 16 bytes of parameters.
    Long(ReportHeader, [u8; LONG_PARAMS_LENGTH]),
}

impl Report {
    /// Builds a report of the given type.
    ///
    /// `params` may be shorter than the parameter region of the frame, in
    /// which case the remainder is zero-filled.
    pub fn new(
        report_type: ReportType,
        device_index: DeviceIndex,
        sub_id: u8,
        address: u8,
        params: &[u8],
    ) -> Result<Self, ReportError> {
        let capacity = report_type.params_length();
        if params.len() > capacity {
            return Err(ReportError::ParameterOverflow {
                report_type,
                capacity,
                actual: params.len(),
            });
        }

        let header = ReportHeader {
            device_index,
            sub_id,
            address,
        };

        Ok(match report_type {
            ReportType::Short => {
                let mut data = [0u8; SHORT_PARAMS_LENGTH];
                data[..params.len()].copy_from_slice(params);
                Self::Short(header, data)
            },
            ReportType::Long => {
                let mut data = [0u8; LONG_PARAMS_LENGTH];
                data[..params.len()].copy_from_slice(params);
                Self::Long(header, data)
            },
        })
    }

    /// Builds a HID++2.0 feature call.
    ///
    /// A short report is used if the parameters fit into one, otherwise a long
    /// report is used.
    pub fn new_v20(
        device_index: DeviceIndex,
        feature_index: u8,
        function_id: U4,
        software_id: U4,
        params: &[u8],
    ) -> Result<Self, ReportError> {
        let report_type = if params.len() <= SHORT_PARAMS_LENGTH {
            ReportType::Short
        } else {
            ReportType::Long
        };

        Self::new(
            report_type,
            device_index,
            feature_index,
            nibble::combine(function_id, software_id),
            params,
        )
    }

    /// Decodes a report from a raw frame as read from the transport.
    pub fn read_raw(data: &[u8]) -> Result<Self, ReportError> {
        let Some(&id) = data.first() else {
            return Err(ReportError::Empty);
        };

        let report_type =
            ReportType::try_from(id).map_err(|_| ReportError::UnknownReportType(id))?;

        if data.len() != report_type.frame_length() {
            return Err(ReportError::InvalidLength {
                report_type,
                expected: report_type.frame_length(),
                actual: data.len(),
            });
        }

        let device_index =
            DeviceIndex::try_from(data[1]).map_err(|_| ReportError::UnknownDeviceIndex(data[1]))?;

        Self::new(
            report_type,
            device_index,
            data[2],
            data[3],
            &data[HEADER_LENGTH..],
        )
    }

    /// Writes the report in its raw byte form into a buffer.
    ///
    /// Returns the amount of written bytes, which is always the frame length
    /// of [`Self::report_type`].
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the frame length.
    pub fn write_raw(&self, buf: &mut [u8]) -> usize {
        let header = self.header();
        let len = self.report_type().frame_length();

        buf[0] = self.report_type().into();
        buf[1] = header.device_index.into();
        buf[2] = header.sub_id;
        buf[3] = header.address;
        buf[HEADER_LENGTH..len].copy_from_slice(self.parameters());

        len
    }

    /// Encodes the report into a freshly allocated frame.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.report_type().frame_length()];
        self.write_raw(&mut buf);
        buf
    }

    /// Extracts the header of the report.
    pub fn header(&self) -> ReportHeader {
        match *self {
            Self::Short(header, _) => header,
            Self::Long(header, _) => header,
        }
    }

    pub fn report_type(&self) -> ReportType {
        match self {
            Self::Short(..) => ReportType::Short,
            Self::Long(..) => ReportType::Long,
        }
    }

    pub fn device_index(&self) -> DeviceIndex {
        self.header().device_index
    }

    /// The HID++1.0 sub ID of the report.
    pub fn sub_id(&self) -> u8 {
        self.header().sub_id
    }

    /// The HID++2.0 feature index of the report. This is the same byte as
    /// [`Self::sub_id`].
    pub fn feature_index(&self) -> u8 {
        self.header().sub_id
    }

    /// The HID++1.0 register address, or the raw HID++2.0 function byte.
    pub fn address(&self) -> u8 {
        self.header().address
    }

    /// The HID++2.0 function ID.
    pub fn function_id(&self) -> U4 {
        U4::from_hi(self.address())
    }

    /// The HID++2.0 software ID. Reports originating from the device itself
    /// (notifications) carry a software ID of zero.
    pub fn software_id(&self) -> U4 {
        U4::from_lo(self.address())
    }

    /// The parameter region of the report. Its length depends on the frame
    /// shape.
    pub fn parameters(&self) -> &[u8] {
        match self {
            Self::Short(_, params) => params,
            Self::Long(_, params) => params,
        }
    }

    /// Extracts the parameters of the report and fits them into an array
    /// capable of containing the longest possible parameter region, filling
    /// the rest up with zeroes.
    pub fn extend_parameters(&self) -> [u8; LONG_PARAMS_LENGTH] {
        match *self {
            Self::Short(_, params) => {
                let mut data = [0; LONG_PARAMS_LENGTH];
                data[..SHORT_PARAMS_LENGTH].copy_from_slice(&params);
                data
            },
            Self::Long(_, params) => params,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:02x} {:02x} {:02x?}",
            self.device_index(),
            self.sub_id(),
            self.address(),
            self.parameters()
        )
    }
}

/// Indicates that a frame read from the transport is not a valid HID++
/// report.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum ReportError {
    /// The frame contains no data at all.
    #[error("the frame is empty")]
    Empty,

    /// The leading report ID is neither the short nor the long HID++ one.
    #[error("unknown report ID {0:#04x}")]
    UnknownReportType(u8),

    /// The frame length does not match the length implied by its report ID.
    #[error("{report_type:?} report must be {expected} bytes, got {actual}")]
    InvalidLength {
        report_type: ReportType,
        expected: usize,
        actual: usize,
    },

    /// The device index byte does not name any known device slot.
    #[error("unknown device index {0:#04x}")]
    UnknownDeviceIndex(u8),

    /// More parameters were supplied than the frame can carry.
    #[error("{report_type:?} report holds {capacity} parameter bytes, got {actual}")]
    ParameterOverflow {
        report_type: ReportType,
        capacity: usize,
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn decodes_short_frame() {
        let report =
            Report::read_raw(&[0x10, 0x01, 0x8f, 0x81, 0x00, 0x01, 0x02]).expect("valid frame");

        assert_eq!(report.report_type(), ReportType::Short);
        assert_eq!(report.device_index(), DeviceIndex::Wireless1);
        assert_eq!(report.sub_id(), 0x8f);
        assert_eq!(report.address(), 0x81);
        assert_eq!(report.parameters(), &[0x00, 0x01, 0x02]);
    }

    #[test]
    fn encodes_v20_call_with_zero_padding() {
        let report = Report::new_v20(
            DeviceIndex::Default,
            0x00,
            U4::from_lo(0x1),
            U4::from_lo(0xa),
            &[0x00],
        )
        .expect("params fit");

        assert_eq!(report.to_vec(), vec![0x10, 0xff, 0x00, 0x1a, 0x00, 0x00, 0x00]);
        assert_eq!(u8::from(report.function_id()), 0x1);
        assert_eq!(u8::from(report.software_id()), 0xa);
    }

    #[test]
    fn v20_call_switches_to_long_frame() {
        let report = Report::new_v20(
            DeviceIndex::Wireless2,
            0x05,
            U4::from_lo(0x2),
            U4::from_lo(0x1),
            &[1, 2, 3, 4],
        )
        .expect("params fit");

        let raw = report.to_vec();
        assert_eq!(raw.len(), LONG_REPORT_LENGTH);
        assert_eq!(&raw[..8], &[0x11, 0x02, 0x05, 0x21, 1, 2, 3, 4]);
        assert!(raw[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert_eq!(Report::read_raw(&[]), Err(ReportError::Empty));
        assert_eq!(
            Report::read_raw(&[0x20, 0x01, 0x41, 0x00]),
            Err(ReportError::UnknownReportType(0x20))
        );
        assert_eq!(
            Report::read_raw(&[0x10, 0x01, 0x41, 0x00]),
            Err(ReportError::InvalidLength {
                report_type: ReportType::Short,
                expected: SHORT_REPORT_LENGTH,
                actual: 4,
            })
        );
        assert_eq!(
            Report::read_raw(&[0x10, 0x07, 0x41, 0x00, 0x00, 0x00, 0x00]),
            Err(ReportError::UnknownDeviceIndex(0x07))
        );

        let mut long_as_short = [0u8; LONG_REPORT_LENGTH];
        long_as_short[0] = 0x10;
        assert!(matches!(
            Report::read_raw(&long_as_short),
            Err(ReportError::InvalidLength { .. })
        ));
    }

    #[test]
    fn rejects_parameter_overflow() {
        let err = Report::new(ReportType::Short, DeviceIndex::Default, 0x81, 0x00, &[0; 4])
            .expect_err("too many params");

        assert_eq!(err, ReportError::ParameterOverflow {
            report_type: ReportType::Short,
            capacity: SHORT_PARAMS_LENGTH,
            actual: 4,
        });
    }

    #[test]
    fn wireless_indices_are_bounded() {
        assert_eq!(DeviceIndex::wireless(1), Some(DeviceIndex::Wireless1));
        assert_eq!(DeviceIndex::wireless(6), Some(DeviceIndex::Wireless6));
        assert_eq!(DeviceIndex::wireless(0), None);
        assert_eq!(DeviceIndex::wireless(7), None);
    }

    fn any_device_index() -> impl Strategy<Value = DeviceIndex> {
        prop::sample::select(DeviceIndex::ALL.to_vec())
    }

    fn any_report() -> impl Strategy<Value = Report> {
        (
            prop_oneof![Just(ReportType::Short), Just(ReportType::Long)],
            any_device_index(),
            any::<u8>(),
            any::<u8>(),
            prop::collection::vec(any::<u8>(), LONG_PARAMS_LENGTH),
        )
            .prop_map(|(report_type, device_index, sub_id, address, params)| {
                let params = &params[..report_type.params_length()];
                Report::new(report_type, device_index, sub_id, address, params)
                    .expect("params sized to the frame")
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(report in any_report()) {
            let raw = report.to_vec();
            prop_assert_eq!(raw.len(), report.report_type().frame_length());
            prop_assert_eq!(Report::read_raw(&raw), Ok(report));
        }
    }
}
