//! Implements a dispatcher that reads on the caller's thread.

use std::{
    cell::{Cell, RefCell},
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use super::{
    AsyncReport,
    CommandKey,
    DispatchError,
    Dispatcher,
    EventHandler,
    READ_BUFFER_LENGTH,
    SharedHandler,
    listener::{ListenerHandle, ListenerKey, ListenerMap},
    log_malformed,
    probe_support,
};
use crate::{
    protocol::ProtocolError,
    report::{DeviceIndex, LONG_REPORT_LENGTH, Report},
    sw_id::SoftwareIds,
    transport::RawTransport,
};

/// What the blocking operation in progress waits for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Pending {
    Idle,
    Command(CommandKey),
    Notification(ListenerKey),
    Listening,
}

/// Resets the pending slot when the operation occupying it ends.
struct PendingGuard<'a> {
    slot: &'a Cell<Pending>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.slot.set(Pending::Idle);
    }
}

/// A dispatcher without any thread of its own.
///
/// Reports are only read while one of the blocking operations
/// ([`AsyncReport::get`], [`Self::listen`]) runs. Every report read is first
/// delivered to the registered event handlers, on the calling thread, and then
/// checked against what the blocking operation waits for.
///
/// At most one command or notification can be awaited at a time. Starting a
/// second one while the handle of the first is still alive fails with
/// [`DispatchError::Reentrancy`].
///
/// The dispatcher is not [`Sync`]. The only way to reach it from another
/// thread is a [`StopHandle`].
pub struct SimpleDispatcher<T: RawTransport> {
    transport: Arc<T>,
    supports_short: bool,
    supports_long: bool,
    software_ids: SoftwareIds,
    listeners: RefCell<ListenerMap<SharedHandler>>,
    pending: Cell<Pending>,
}

impl<T: RawTransport> SimpleDispatcher<T> {
    /// Takes ownership of a transport.
    ///
    /// Fails with [`DispatchError::HidppNotSupported`] if the device declares
    /// neither short nor long HID++ reports.
    pub fn new(transport: T) -> Result<Self, DispatchError> {
        let (supports_short, supports_long) = probe_support(&transport)?;

        Ok(Self {
            transport: Arc::new(transport),
            supports_short,
            supports_long,
            software_ids: SoftwareIds::new(),
            listeners: RefCell::new(ListenerMap::new()),
            pending: Cell::new(Pending::Idle),
        })
    }

    /// Returns a handle that can stop a blocking operation from another
    /// thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            transport: Arc::clone(&self.transport) as Arc<dyn RawTransport>,
        }
    }

    /// Reads and dispatches reports to the event handlers until stopped.
    ///
    /// Returns `Ok(())` once [`StopHandle::stop`] was called and an error if
    /// the transport fails.
    pub fn listen(&self) -> Result<(), DispatchError> {
        let _pending = self.occupy(Pending::Listening)?;
        debug!("listening for reports");

        match self.read_until(None, |_| None) {
            Ok(_) => Ok(()),
            Err(DispatchError::Interrupted) => {
                debug!("stopped listening");
                Ok(())
            },
            Err(err) => Err(err),
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    fn occupy(&self, pending: Pending) -> Result<PendingGuard<'_>, DispatchError> {
        let current = self.pending.get();
        if current != Pending::Idle {
            debug!(?current, requested = ?pending, "dispatcher busy");
            return Err(DispatchError::Reentrancy);
        }

        self.pending.set(pending);
        Ok(PendingGuard {
            slot: &self.pending,
        })
    }

    fn write(&self, report: &Report) -> Result<(), DispatchError> {
        if !self.supports_report(report) {
            return Err(DispatchError::MessageTypeNotSupported);
        }

        let mut buf = [0u8; LONG_REPORT_LENGTH];
        let len = report.write_raw(&mut buf);

        trace!(frame = format_args!("{:02x?}", &buf[..len]), "writing report");
        self.transport.write_report(&buf[..len])?;
        Ok(())
    }

    /// Reads until `is_match` accepts a report or the deadline passes.
    fn read_until<F>(
        &self,
        deadline: Option<Instant>,
        mut is_match: F,
    ) -> Result<Report, DispatchError>
    where
        F: FnMut(&Report) -> Option<Result<(), ProtocolError>>,
    {
        let mut buf = [0u8; READ_BUFFER_LENGTH];

        loop {
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(DispatchError::Timeout);
                    }
                    Some(remaining)
                },
                None => None,
            };

            let len = self.transport.read_report(&mut buf, timeout)?;
            let frame = &buf[..len];
            trace!(frame = format_args!("{:02x?}", frame), "read report");

            let report = match Report::read_raw(frame) {
                Ok(report) => report,
                Err(err) => {
                    log_malformed(frame, &err);
                    continue;
                },
            };

            self.dispatch(&report);

            match is_match(&report) {
                Some(Ok(())) => return Ok(report),
                Some(Err(err)) => return Err(err.into()),
                None => {},
            }
        }
    }

    /// Hands a report to every event handler registered for it.
    fn dispatch(&self, report: &Report) {
        let key = (report.device_index(), report.sub_id());
        let handlers: Vec<_> = self
            .listeners
            .borrow()
            .matching(key)
            .map(|(handle, handler)| (handle, Arc::clone(handler)))
            .collect();

        for (handle, handler) in handlers {
            // The snapshot may be stale.
            if !self.listeners.borrow().contains(handle) {
                continue;
            }

            let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
            let callback: &mut EventHandler = &mut handler;

            if callback(report).is_break() {
                self.listeners.borrow_mut().remove(handle);
                debug!(%handle, "event handler unregistered itself");
            }
        }
    }

    fn await_report<F>(
        &self,
        timeout: Option<Duration>,
        is_match: F,
    ) -> Result<Report, DispatchError>
    where
        F: FnMut(&Report) -> Option<Result<(), ProtocolError>>,
    {
        // A deadline too far away to represent is no deadline at all.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        self.read_until(deadline, is_match)
    }
}

impl<T: RawTransport> Dispatcher for SimpleDispatcher<T> {
    fn vendor_id(&self) -> u16 {
        self.transport.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.transport.product_id()
    }

    fn name(&self) -> &str {
        self.transport.name()
    }

    fn supports_short(&self) -> bool {
        self.supports_short
    }

    fn supports_long(&self) -> bool {
        self.supports_long
    }

    fn software_ids(&self) -> &SoftwareIds {
        &self.software_ids
    }

    fn send_command_without_response(&self, report: Report) -> Result<(), DispatchError> {
        self.write(&report)
    }

    fn send_command(&self, report: Report) -> Result<Box<dyn AsyncReport + '_>, DispatchError> {
        let key = CommandKey::of(&report);
        let pending = self.occupy(Pending::Command(key))?;
        self.write(&report)?;

        Ok(Box::new(CommandResponse {
            dispatcher: self,
            key,
            _pending: pending,
        }))
    }

    fn get_notification(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
    ) -> Result<Box<dyn AsyncReport + '_>, DispatchError> {
        let key = (device_index, sub_id);
        let pending = self.occupy(Pending::Notification(key))?;

        Ok(Box::new(Notification {
            dispatcher: self,
            key,
            _pending: pending,
        }))
    }

    fn register_event_handler(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
        handler: EventHandler,
    ) -> ListenerHandle {
        let handle = self
            .listeners
            .borrow_mut()
            .insert((device_index, sub_id), Arc::new(Mutex::new(handler)));

        debug!(
            %handle,
            %device_index,
            sub_id = format_args!("{sub_id:#04x}"),
            "registered event handler"
        );
        handle
    }

    fn unregister_event_handler(&self, handle: ListenerHandle) -> bool {
        let removed = self.listeners.borrow_mut().remove(handle).is_some();
        if removed {
            debug!(%handle, "unregistered event handler");
        }
        removed
    }
}

impl<T: RawTransport> fmt::Debug for SimpleDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleDispatcher")
            .field("name", &self.transport.name())
            .field("supports_short", &self.supports_short)
            .field("supports_long", &self.supports_long)
            .field("pending", &self.pending.get())
            .finish_non_exhaustive()
    }
}

/// The response to a command sent through a [`SimpleDispatcher`].
struct CommandResponse<'a, T: RawTransport> {
    dispatcher: &'a SimpleDispatcher<T>,
    key: CommandKey,
    _pending: PendingGuard<'a>,
}

impl<T: RawTransport> CommandResponse<'_, T> {
    fn wait(self, timeout: Option<Duration>) -> Result<Report, DispatchError> {
        let key = self.key;
        self.dispatcher
            .await_report(timeout, |report| key.matches(report))
    }
}

impl<T: RawTransport> AsyncReport for CommandResponse<'_, T> {
    fn get(self: Box<Self>) -> Result<Report, DispatchError> {
        self.wait(None)
    }

    fn get_timeout(self: Box<Self>, timeout: Duration) -> Result<Report, DispatchError> {
        self.wait(Some(timeout))
    }
}

/// A notification awaited through a [`SimpleDispatcher`].
struct Notification<'a, T: RawTransport> {
    dispatcher: &'a SimpleDispatcher<T>,
    key: ListenerKey,
    _pending: PendingGuard<'a>,
}

impl<T: RawTransport> Notification<'_, T> {
    fn wait(self, timeout: Option<Duration>) -> Result<Report, DispatchError> {
        let (device_index, sub_id) = self.key;
        self.dispatcher.await_report(timeout, |report| {
            (report.device_index() == device_index && report.sub_id() == sub_id).then_some(Ok(()))
        })
    }
}

impl<T: RawTransport> AsyncReport for Notification<'_, T> {
    fn get(self: Box<Self>) -> Result<Report, DispatchError> {
        self.wait(None)
    }

    fn get_timeout(self: Box<Self>, timeout: Duration) -> Result<Report, DispatchError> {
        self.wait(Some(timeout))
    }
}

/// Stops the blocking operation of a [`SimpleDispatcher`] from any thread.
///
/// If no operation is blocked, the next read returns right away, so a stop
/// racing the start of [`SimpleDispatcher::listen`] is never lost.
#[derive(Clone)]
pub struct StopHandle {
    transport: Arc<dyn RawTransport>,
}

impl StopHandle {
    pub fn stop(&self) -> Result<(), DispatchError> {
        debug!("stopping dispatcher");
        self.transport.interrupt_read()?;
        Ok(())
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("name", &self.transport.name())
            .finish()
    }
}
