//! Implements the dispatching of HID++ reports read from a [`RawTransport`].
//!
//! A dispatcher owns the transport and multiplexes it between command/response
//! exchanges and listeners interested in unsolicited notifications. Two
//! implementations exist:
//!
//! - [`SimpleDispatcher`] reads on the caller's thread. Only one blocking
//!   operation may be in progress at a time and event handlers run inside it.
//! - [`DispatcherThread`] reads on a background thread and fans reports out to
//!   per-consumer queues, so any number of threads can wait concurrently.

use std::{ops::ControlFlow, sync::Mutex, time::Duration};

use hidreport::{Field, Report as _, ReportDescriptor, Usage, UsageId, UsagePage};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    protocol::{ProtocolError, v10, v20},
    report::{DeviceIndex, Report, ReportError, ReportHeader, ReportType},
    sw_id::SoftwareIds,
    transport::{RawTransport, TransportError},
};

pub mod listener;
pub mod simple;
pub mod thread;

pub use listener::{ListenerHandle, ListenerKey};
pub use simple::{SimpleDispatcher, StopHandle};
pub use thread::DispatcherThread;

/// hidapi defines this as the maximum EXPECTED size of report descriptors.
const MAX_REPORT_DESCRIPTOR_LENGTH: usize = 4096;

/// The size of the buffer incoming frames are read into. Larger than any
/// HID++ frame so oversized frames are detected instead of truncated.
const READ_BUFFER_LENGTH: usize = 64;

const HIDPP_USAGE_PAGE: u16 = 0xff00;
const SHORT_REPORT_USAGE: u16 = 0x0001;
const LONG_REPORT_USAGE: u16 = 0x0002;

/// A callback receiving every report matching the key it was registered for.
///
/// Returning [`ControlFlow::Break`] unregisters the handler; it will not see
/// any further report. Handlers only get to look at the report, they never get
/// access to the dispatcher that is currently busy delivering it.
pub type EventHandler = Box<dyn FnMut(&Report) -> ControlFlow<()> + Send>;

/// Handlers are shared between the listener map and the snapshot taken while
/// dispatching, so removing one mid-dispatch is safe.
pub(crate) type SharedHandler = std::sync::Arc<Mutex<EventHandler>>;

/// A report that will arrive later.
///
/// Dropping the handle without calling one of the getters is allowed and
/// releases whatever the dispatcher keeps around for it.
pub trait AsyncReport {
    /// Blocks until the report arrives.
    fn get(self: Box<Self>) -> Result<Report, DispatchError>;

    /// Blocks until the report arrives or `timeout` elapsed, whichever comes
    /// first. The timeout covers the whole wait, no matter how many unrelated
    /// reports arrive in between.
    fn get_timeout(self: Box<Self>, timeout: Duration) -> Result<Report, DispatchError>;
}

/// The operations every dispatcher offers. Feature implementations only ever
/// talk to a device through this trait.
pub trait Dispatcher {
    /// The USB vendor ID of the underlying device.
    fn vendor_id(&self) -> u16;

    /// The USB product ID of the underlying device.
    fn product_id(&self) -> u16;

    /// The name of the underlying device.
    fn name(&self) -> &str;

    /// Whether the device accepts short (7 bytes) HID++ reports.
    fn supports_short(&self) -> bool;

    /// Whether the device accepts long (20 bytes) HID++ reports.
    fn supports_long(&self) -> bool;

    /// The software IDs feature calls sent through this dispatcher should use.
    fn software_ids(&self) -> &SoftwareIds;

    /// Writes a report without waiting for any response.
    fn send_command_without_response(&self, report: Report) -> Result<(), DispatchError>;

    /// Writes a report and returns a handle to its response.
    ///
    /// The response is the first report from the same device whose sub ID and
    /// address equal the ones of the sent report. A HID++1.0 or HID++2.0 error
    /// reply echoing the sent report completes the command with
    /// [`DispatchError::Protocol`].
    fn send_command(&self, report: Report) -> Result<Box<dyn AsyncReport + '_>, DispatchError>;

    /// Returns a handle to the next report matching `device_index` and
    /// `sub_id`.
    fn get_notification(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
    ) -> Result<Box<dyn AsyncReport + '_>, DispatchError>;

    /// Registers a handler for every report matching `device_index` and
    /// `sub_id`. Any number of handlers may share a key, all of them receive
    /// matching reports.
    fn register_event_handler(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
        handler: EventHandler,
    ) -> ListenerHandle;

    /// Unregisters a handler. Returns `false` if it was not registered
    /// (anymore).
    fn unregister_event_handler(&self, handle: ListenerHandle) -> bool;

    /// Checks whether the device supports the shape of the given report.
    fn supports_report(&self, report: &Report) -> bool {
        match report.report_type() {
            ReportType::Short => self.supports_short(),
            ReportType::Long => self.supports_long(),
        }
    }
}

/// Identifies the response to a sent command.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CommandKey {
    pub device_index: DeviceIndex,
    pub sub_id: u8,
    pub address: u8,
}

impl CommandKey {
    pub fn of(report: &Report) -> Self {
        let ReportHeader {
            device_index,
            sub_id,
            address,
        } = report.header();

        Self {
            device_index,
            sub_id,
            address,
        }
    }

    /// Checks whether `response` answers the command.
    ///
    /// Returns `Some(Ok(()))` for a regular response, `Some(Err(_))` for an
    /// error reply to the command and [`None`] for unrelated reports.
    pub fn matches(&self, response: &Report) -> Option<Result<(), ProtocolError>> {
        if response.device_index() != self.device_index {
            return None;
        }

        if response.sub_id() == self.sub_id && response.address() == self.address {
            return Some(Ok(()));
        }

        if let Some(error) = v10::ErrorMessage::parse(response) {
            if error.sub_id == self.sub_id && error.address == self.address {
                return Some(Err(ProtocolError::from_v10_code(error.code)));
            }
        }

        if let Some(error) = v20::ErrorMessage::parse(response) {
            if error.feature_index == self.sub_id && error.function_byte == self.address {
                return Some(Err(ProtocolError::from_v20_code(error.code)));
            }
        }

        None
    }
}

/// Represents an error that occurred while dispatching HID++ reports.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The bounded wait elapsed before the expected report arrived.
    #[error("timed out waiting for the report")]
    Timeout,

    /// The wait was cut short by an explicit stop.
    #[error("the dispatcher was stopped")]
    Interrupted,

    /// The device is gone. No further operation on the dispatcher can succeed.
    #[error("the transport was closed")]
    TransportClosed,

    /// A blocking operation was started while another one was still in
    /// progress on the same dispatcher, e.g. from inside an event handler.
    #[error("another blocking operation is already in progress on this dispatcher")]
    Reentrancy,

    /// The device does not declare any HID++ report.
    #[error("the device does not support HID++")]
    HidppNotSupported,

    /// The device does not declare the shape (short/long) of the report.
    #[error("the device does not support the given HID++ report type")]
    MessageTypeNotSupported,

    /// The HID report descriptor could not be parsed.
    #[error("the report descriptor could not be parsed")]
    ReportDescriptor(hidreport::ParserError),

    /// The device answered the command with an error reply.
    #[error("the device rejected the command")]
    Protocol(#[from] ProtocolError),

    /// Any other transport failure.
    #[error("the transport returned an error")]
    Transport(#[source] TransportError),
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::Interrupted => Self::Interrupted,
            TransportError::Closed => Self::TransportClosed,
            other => Self::Transport(other),
        }
    }
}

/// Checks whether a transport supports short or long HID++ reports.
///
/// Unless the transport already knows, its report descriptor is parsed and
/// searched for the vendor-defined HID++ usages.
pub fn supports_short_long_hidpp<T: RawTransport + ?Sized>(
    transport: &T,
) -> Result<(bool, bool), DispatchError> {
    if let Some(support) = transport.supports_short_long_hidpp() {
        return Ok(support);
    }

    let mut raw_descriptor = vec![0u8; MAX_REPORT_DESCRIPTOR_LENGTH];
    let descriptor_size = transport.report_descriptor(&mut raw_descriptor)?;

    let descriptor = ReportDescriptor::try_from(&raw_descriptor[..descriptor_size])
        .map_err(DispatchError::ReportDescriptor)?;

    let declares = |report_type: ReportType, usage: u16| {
        descriptor
            .find_input_report(&[u8::from(report_type)])
            .and_then(|report| report.fields().first())
            .and_then(|field| match field {
                Field::Array(arr) => Some(arr.usage_range()),
                _ => None,
            })
            .is_some_and(|range| {
                range
                    .lookup_usage(&Usage::from_page_and_id(
                        UsagePage::from(HIDPP_USAGE_PAGE),
                        UsageId::from(usage),
                    ))
                    .is_some()
            })
    };

    Ok((
        declares(ReportType::Short, SHORT_REPORT_USAGE),
        declares(ReportType::Long, LONG_REPORT_USAGE),
    ))
}

/// Probes report support and rejects transports without any HID++ report.
fn probe_support<T: RawTransport + ?Sized>(transport: &T) -> Result<(bool, bool), DispatchError> {
    let (supports_short, supports_long) = supports_short_long_hidpp(transport)?;
    if !supports_short && !supports_long {
        return Err(DispatchError::HidppNotSupported);
    }

    debug!(
        vendor_id = format_args!("{:#06x}", transport.vendor_id()),
        product_id = format_args!("{:#06x}", transport.product_id()),
        supports_short,
        supports_long,
        "HID++ transport ready"
    );

    Ok((supports_short, supports_long))
}

/// Logs a frame that could not be decoded. Such frames are dropped.
fn log_malformed(frame: &[u8], err: &ReportError) {
    match err {
        // Many receivers interleave non-HID++ reports on the same node.
        ReportError::UnknownReportType(_) => {
            debug!(frame = format_args!("{:02x?}", frame), "ignoring non-HID++ report");
        },
        _ => warn!(
            frame = format_args!("{:02x?}", frame),
            error = %err,
            "dropping malformed report"
        ),
    }
}
