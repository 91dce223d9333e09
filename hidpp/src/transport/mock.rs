//! A scripted [`RawTransport`] for tests.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::{RawTransport, TransportError};
use crate::report::Report;

/// The HID++ collections of a Logitech Unifying receiver: vendor page
/// `0xff00`, usage `0x01` on report `0x10` and usage `0x02` on report `0x11`.
pub const HIDPP_DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xff, 0x09, 0x01, 0xa1, 0x01, 0x85, 0x10, 0x75, 0x08, 0x95, 0x06, 0x15, 0x00,
    0x26, 0xff, 0x00, 0x09, 0x01, 0x81, 0x00, 0x09, 0x01, 0x91, 0x00, 0xc0, 0x06, 0x00, 0xff,
    0x09, 0x02, 0xa1, 0x01, 0x85, 0x11, 0x75, 0x08, 0x95, 0x13, 0x15, 0x00, 0x26, 0xff, 0x00,
    0x09, 0x02, 0x81, 0x00, 0x09, 0x02, 0x91, 0x00, 0xc0,
];

/// A receiver's DJ collection (reports `0x20` and `0x21`) without any HID++
/// report.
pub const DJ_ONLY_DESCRIPTOR: &[u8] = &[
    0x06, 0x00, 0xff, 0x09, 0x04, 0xa1, 0x01, 0x85, 0x20, 0x75, 0x08, 0x95, 0x0e, 0x15, 0x00,
    0x26, 0xff, 0x00, 0x09, 0x41, 0x81, 0x00, 0x09, 0x41, 0x91, 0x00, 0x85, 0x21, 0x95, 0x1f,
    0x15, 0x00, 0x26, 0xff, 0x00, 0x09, 0x42, 0x81, 0x00, 0x09, 0x42, 0x91, 0x00, 0xc0,
];

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Mock transport that hands out queued frames and records written ones.
///
/// Clones share the same state, so a test can keep a clone around to feed
/// frames while a dispatcher owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changed: Condvar,
    responder: Mutex<Option<Responder>>,
    support: Option<(bool, bool)>,
    descriptor: Vec<u8>,
}

#[derive(Default)]
struct State {
    incoming: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    pending_interrupts: usize,
    closed: bool,
}

impl MockTransport {
    /// A transport supporting both short and long reports.
    pub fn new() -> Self {
        Self::build(Some((true, true)), Vec::new())
    }

    /// A transport announcing the given report support.
    pub fn with_support(supports_short: bool, supports_long: bool) -> Self {
        Self::build(Some((supports_short, supports_long)), Vec::new())
    }

    /// A transport whose report support has to be parsed from `descriptor`.
    pub fn with_descriptor(descriptor: Vec<u8>) -> Self {
        Self::build(None, descriptor)
    }

    fn build(support: Option<(bool, bool)>, descriptor: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Condvar::new(),
                responder: Mutex::new(None),
                support,
                descriptor,
            }),
        }
    }

    /// Queues a raw frame for reading.
    pub fn push_frame(&self, frame: Vec<u8>) {
        let mut state = self.inner.state.lock().unwrap();
        state.incoming.push_back(frame);
        self.inner.changed.notify_all();
    }

    /// Queues an encoded report for reading.
    pub fn push_report(&self, report: &Report) {
        self.push_frame(report.to_vec());
    }

    /// Installs a closure producing the frames a device answers a written
    /// frame with. The answers are queued in order.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *self.inner.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// All frames written so far, decoded.
    pub fn written_reports(&self) -> Vec<Report> {
        self.inner
            .state
            .lock()
            .unwrap()
            .written
            .iter()
            .map(|frame| Report::read_raw(frame).unwrap())
            .collect()
    }

    /// Pushes `report` every `interval` from a background thread until the
    /// returned [`Feeder`] is dropped.
    pub fn feed_every(&self, report: Report, interval: Duration) -> Feeder {
        let (stop, stopped) = flume::bounded::<()>(0);
        let transport = self.clone();

        let worker = thread::spawn(move || {
            // Dropping the sender disconnects the channel and ends the loop.
            while let Err(flume::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                transport.push_report(&report);
            }
        });

        Feeder {
            stop: Some(stop),
            worker: Some(worker),
        }
    }

    /// Simulates the device being unplugged.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        self.inner.changed.notify_all();
    }
}

/// A background thread started by [`MockTransport::feed_every`]. Dropping it
/// stops and joins the thread.
pub struct Feeder {
    stop: Option<flume::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }
}

impl RawTransport for MockTransport {
    fn vendor_id(&self) -> u16 {
        0x046d
    }

    fn product_id(&self) -> u16 {
        0xc52b
    }

    fn name(&self) -> &str {
        "Mock Receiver"
    }

    fn write_report(&self, src: &[u8]) -> Result<usize, TransportError> {
        if self.inner.state.lock().unwrap().closed {
            return Err(TransportError::Closed);
        }

        let answers = match self.inner.responder.lock().unwrap().as_mut() {
            Some(responder) => responder(src),
            None => Vec::new(),
        };

        let mut state = self.inner.state.lock().unwrap();
        state.written.push(src.to_vec());
        state.incoming.extend(answers);
        self.inner.changed.notify_all();

        Ok(src.len())
    }

    fn read_report(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if state.pending_interrupts > 0 {
                state.pending_interrupts -= 1;
                return Err(TransportError::Interrupted);
            }

            if let Some(frame) = state.incoming.pop_front() {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                return Ok(len);
            }

            if state.closed {
                return Err(TransportError::Closed);
            }

            state = match deadline {
                None => self.inner.changed.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }

                    self.inner
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap()
                        .0
                },
            };
        }
    }

    fn interrupt_read(&self) -> Result<(), TransportError> {
        let mut state = self.inner.state.lock().unwrap();
        state.pending_interrupts += 1;
        self.inner.changed.notify_all();
        Ok(())
    }

    fn supports_short_long_hidpp(&self) -> Option<(bool, bool)> {
        self.inner.support
    }

    fn report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let len = self.inner.descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&self.inner.descriptor[..len]);
        Ok(len)
    }
}
