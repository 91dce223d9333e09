//! Report dispatching for Logitech's HID++ protocol.
//!
//! Logitech peripherals and their wireless receivers speak HID++, a vendor
//! protocol tunneled through two vendor-defined HID reports. Both requests and
//! unsolicited notifications (a device connecting, a key being pressed on a
//! diverted button, ...) travel over the same HID node, interleaved in no
//! particular order. This crate provides the layer every HID++ feature
//! implementation sits on top of:
//!
//! - a codec for the short (7 byte) and long (20 byte) HID++ [`report`]s
//! - a [`transport`] abstraction over the raw HID node, including a Linux
//!   hidraw implementation
//! - [`dispatcher`]s correlating sent commands with their responses while
//!   delivering every other report to registered listeners
//! - [`event`] queues and [`driver`]s for long-lived consumers running on
//!   threads of their own
//!
//! What the parameters of a specific feature mean is out of scope. The crate
//! only understands the error replies both protocol versions use to reject a
//! command, see [`protocol`].
//!
//! # Quickstart
//!
//! ## Open a transport
//!
//! A dispatcher exclusively owns a [`transport::RawTransport`]. On Linux,
//! [`transport::hidraw::Hidraw`] opens a `/dev/hidrawN` node. Any other HID
//! backend can be plugged in by implementing the trait.
//!
//! ## Send commands
//!
//! [`dispatcher::SimpleDispatcher`] does not spawn any thread. Reports are read
//! on the calling thread while it waits for a response:
//!
//! ```no_run
//! use std::{ops::ControlFlow, time::Duration};
//!
//! use hidpp_dispatch::{
//!     dispatcher::{Dispatcher, SimpleDispatcher},
//!     nibble::U4,
//!     report::{DeviceIndex, Report},
//!     transport::hidraw::Hidraw,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // This fails with `DispatchError::HidppNotSupported` if the node does not
//! // declare any HID++ report in its report descriptor.
//! let dispatcher = SimpleDispatcher::new(Hidraw::open("/dev/hidraw0")?)?;
//!
//! // Rotating the software ID makes it easier to tell responses apart in
//! // traces. By default, the software ID is `0x1` and does not rotate.
//! dispatcher.software_ids().set_rotating_sw_id(true);
//!
//! // Every report from the first paired device announcing a connection change
//! // ends up here, even while we are waiting for something else.
//! dispatcher.register_event_handler(
//!     DeviceIndex::Wireless1,
//!     0x41,
//!     Box::new(|report: &Report| {
//!         println!("connection changed: {report}");
//!         ControlFlow::Continue(())
//!     }),
//! );
//!
//! // Ping the root feature (index 0x00, function 0x1) of the first device.
//! let ping = Report::new_v20(
//!     DeviceIndex::Wireless1,
//!     0x00,
//!     U4::from_lo(0x1),
//!     dispatcher.software_ids().get_sw_id(),
//!     &[0x00, 0x00, 0x5a],
//! )?;
//!
//! let response = dispatcher
//!     .send_command(ping)?
//!     .get_timeout(Duration::from_secs(1))?;
//! let params = response.parameters();
//! println!("HID++{}.{}", params[0], params[1]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Share a dispatcher between threads
//!
//! [`dispatcher::DispatcherThread`] reads on a background thread of its own.
//! Any number of threads may wait for responses and notifications at the same
//! time, and [`driver::Driver`] runs a worker for long-lived consumers:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hidpp_dispatch::{
//!     dispatcher::DispatcherThread,
//!     driver::Driver,
//!     report::DeviceIndex,
//!     transport::hidraw::Hidraw,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Arc::new(DispatcherThread::new(Hidraw::open("/dev/hidraw0")?)?);
//!
//! let driver = Driver::spawn(
//!     Arc::clone(&dispatcher),
//!     &[(DeviceIndex::Wireless1, 0x40), (DeviceIndex::Wireless1, 0x41)],
//!     |report| println!("{report}"),
//! )?;
//!
//! // Later on: unregister, interrupt and join the worker.
//! driver.shutdown();
//! dispatcher.stop();
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod driver;
pub mod event;
pub mod nibble;
pub mod protocol;
pub mod report;
pub mod sw_id;
pub mod transport;
