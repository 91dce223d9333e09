//! Abstracts the raw HID device node a dispatcher reads reports from and
//! writes reports to.

use std::{io, time::Duration};

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod hidraw;
#[cfg(test)]
pub(crate) mod mock;

/// Represents an opened raw HID device node that is both readable and
/// writable with blocking I/O.
///
/// A dispatcher exclusively owns its transport. The only method that may be
/// called concurrently with a blocked [`Self::read_report`] is
/// [`Self::interrupt_read`].
pub trait RawTransport: Send + Sync + 'static {
    /// The USB vendor ID of the device.
    fn vendor_id(&self) -> u16;

    /// The USB product ID of the device.
    fn product_id(&self) -> u16;

    /// The human readable name of the device.
    fn name(&self) -> &str;

    /// Writes a raw report to the device.
    ///
    /// Returns the exact amount of written bytes on success.
    fn write_report(&self, src: &[u8]) -> Result<usize, TransportError>;

    /// Reads a single raw report from the device.
    ///
    /// Blocks until a report is available, the timeout elapses
    /// ([`TransportError::Timeout`]) or [`Self::interrupt_read`] is called
    /// ([`TransportError::Interrupted`]). A timeout of [`None`] waits forever.
    ///
    /// If the buffer is not large enough to fit the whole report, its remainder
    /// is discarded.
    ///
    /// Returns the exact amount of read bytes on success.
    fn read_report(&self, buf: &mut [u8], timeout: Option<Duration>)
    -> Result<usize, TransportError>;

    /// Makes the read in progress return [`TransportError::Interrupted`].
    ///
    /// If no read is in progress, the next one returns immediately instead.
    /// Every call interrupts exactly one read.
    fn interrupt_read(&self) -> Result<(), TransportError>;

    /// If the implementation already knows whether the underlying device
    /// supports HID++ reports, it should return `Some((supports_short,
    /// supports_long))` from this method.
    ///
    /// In this case, the report descriptor will not be read and parsed.
    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        None
    }

    /// Copies the raw HID report descriptor of the device into `buf`.
    ///
    /// Returns the exact size of the report descriptor on success.
    fn report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Represents an error returned by a [`RawTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The device node does not exist.
    #[error("the device could not be found")]
    DeviceNotFound,

    /// The process may not open the device node.
    #[error("permission to access the device was denied")]
    PermissionDenied,

    /// The device is gone, typically because it was unplugged.
    #[error("the device was closed")]
    Closed,

    /// No report arrived before the timeout elapsed.
    #[error("timed out waiting for a report")]
    Timeout,

    /// The read was interrupted by [`RawTransport::interrupt_read`].
    #[error("the read was interrupted")]
    Interrupted,

    /// Any other I/O error.
    #[error("I/O error on the device")]
    Io(#[source] io::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        if is_unplugged(&err) {
            return Self::Closed;
        }

        match err.kind() {
            io::ErrorKind::NotFound => Self::DeviceNotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Io(err),
        }
    }
}

#[cfg(target_os = "linux")]
fn is_unplugged(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENODEV)
}

#[cfg(not(target_os = "linux"))]
fn is_unplugged(_: &io::Error) -> bool {
    false
}
