//! Implements a dispatcher that reads on a background thread.

use std::{
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
    time::Duration,
};

use tracing::{debug, trace, warn};

use super::{
    AsyncReport,
    CommandKey,
    DispatchError,
    Dispatcher,
    EventHandler,
    READ_BUFFER_LENGTH,
    SharedHandler,
    listener::{ListenerHandle, ListenerMap},
    log_malformed,
    probe_support,
};
use crate::{
    event::{EventQueue, PopError},
    report::{DeviceIndex, LONG_REPORT_LENGTH, Report},
    sw_id::SoftwareIds,
    transport::{RawTransport, TransportError},
};

const THREAD_NAME: &str = "hidpp-dispatcher";

/// A dispatcher reading the transport on a dedicated thread.
///
/// Every incoming report is fanned out to the event queues and pending
/// commands interested in it, then to the matching event handlers. Handlers
/// run on the dispatcher thread and must not block on it: waiting for a
/// report from within a handler fails with [`DispatchError::Reentrancy`].
///
/// Any number of threads may send commands and wait for notifications at the
/// same time. Each of them waits on a queue of its own.
pub struct DispatcherThread<T: RawTransport> {
    shared: Arc<Shared<T>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    reader_id: ThreadId,
    supports_short: bool,
    supports_long: bool,
    software_ids: SoftwareIds,
}

struct Shared<T> {
    transport: T,
    state: Mutex<State>,
    stopping: AtomicBool,
}

struct State {
    listeners: ListenerMap<Consumer>,
    commands: Vec<PendingCommand>,
    next_command_id: u64,
    closed: Option<CloseReason>,
}

enum Consumer {
    Queue(Arc<EventQueue>),
    Handler(SharedHandler),
}

/// A command waiting for its response. Commands are registered before they
/// are written, so a fast response cannot be missed.
struct PendingCommand {
    id: u64,
    key: CommandKey,
    queue: Arc<EventQueue>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CloseReason {
    Stopped,
    Failed,
}

impl CloseReason {
    fn error(self) -> DispatchError {
        match self {
            Self::Stopped => DispatchError::Interrupted,
            Self::Failed => DispatchError::TransportClosed,
        }
    }
}

impl<T: RawTransport> DispatcherThread<T> {
    /// Takes ownership of a transport and starts reading it.
    pub fn new(transport: T) -> Result<Self, DispatchError> {
        let (supports_short, supports_long) = probe_support(&transport)?;

        let shared = Arc::new(Shared {
            transport,
            state: Mutex::new(State {
                listeners: ListenerMap::new(),
                commands: Vec::new(),
                next_command_id: 0,
                closed: None,
            }),
            stopping: AtomicBool::new(false),
        });

        let reader = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.run()
            })
            .map_err(|err| DispatchError::Transport(TransportError::Io(err)))?;

        debug!(name = shared.transport.name(), "dispatcher thread started");

        Ok(Self {
            shared,
            reader_id: reader.thread().id(),
            reader: Mutex::new(Some(reader)),
            supports_short,
            supports_long,
            software_ids: SoftwareIds::new(),
        })
    }

    /// Stops the dispatcher thread and waits for it to end.
    ///
    /// Every waiting caller wakes up with [`DispatchError::Interrupted`] and
    /// every registered event queue is interrupted. Idempotent.
    pub fn stop(&self) {
        let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        self.shared.stopping.store(true, Ordering::SeqCst);
        if let Err(err) = self.shared.transport.interrupt_read() {
            warn!(error = %err, "could not interrupt the dispatcher thread");
        }

        // Stopping from a handler must not wait for the handler itself.
        if thread::current().id() == self.reader_id {
            return;
        }

        if reader.join().is_err() {
            warn!("dispatcher thread panicked");
        }
    }

    /// Whether the dispatcher thread is still reading.
    pub fn is_running(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|reader| !reader.is_finished())
    }

    /// Registers a queue receiving every report matching `device_index` and
    /// `sub_id`.
    ///
    /// The queue is interrupted when the dispatcher stops.
    pub fn register_event_queue(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
        queue: Arc<EventQueue>,
    ) -> ListenerHandle {
        let mut state = self.shared.state();
        if state.closed.is_some() {
            queue.interrupt();
        }

        let handle = state
            .listeners
            .insert((device_index, sub_id), Consumer::Queue(queue));

        debug!(
            %handle,
            %device_index,
            sub_id = format_args!("{sub_id:#04x}"),
            "registered event queue"
        );
        handle
    }

    /// Unregisters a queue. The queue itself is left untouched.
    pub fn unregister_event_queue(&self, handle: ListenerHandle) -> bool {
        self.unregister(handle)
    }

    #[cfg(test)]
    pub(crate) fn pending_command_count(&self) -> usize {
        self.shared.state().commands.len()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.shared.state().listeners.len()
    }

    fn unregister(&self, handle: ListenerHandle) -> bool {
        let removed = self.shared.state().listeners.remove(handle).is_some();
        if removed {
            debug!(%handle, "unregistered listener");
        }
        removed
    }

    fn write(&self, report: &Report) -> Result<(), DispatchError> {
        if !self.supports_report(report) {
            return Err(DispatchError::MessageTypeNotSupported);
        }

        if let Some(reason) = self.shared.state().closed {
            return Err(reason.error());
        }

        let mut buf = [0u8; LONG_REPORT_LENGTH];
        let len = report.write_raw(&mut buf);

        trace!(frame = format_args!("{:02x?}", &buf[..len]), "writing report");
        self.shared.transport.write_report(&buf[..len])?;
        Ok(())
    }

    /// Pops the report a caller waits for from its queue.
    fn wait(&self, queue: &EventQueue, timeout: Option<Duration>) -> Result<Report, DispatchError> {
        if thread::current().id() == self.reader_id {
            return Err(DispatchError::Reentrancy);
        }

        let popped = match timeout {
            Some(timeout) => queue.pop_timeout(timeout),
            None => queue.pop().ok_or(PopError::Interrupted),
        };

        match popped {
            Ok(report) => Ok(report),
            Err(PopError::Timeout) => Err(DispatchError::Timeout),
            Err(PopError::Interrupted) => Err(self
                .shared
                .state()
                .closed
                .map_or(DispatchError::Interrupted, CloseReason::error)),
        }
    }
}

impl<T: RawTransport> Shared<T> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        // Also wakes every waiter if a handler panics.
        let mut closer = Closer {
            shared: self,
            reason: CloseReason::Failed,
        };
        let mut buf = [0u8; READ_BUFFER_LENGTH];

        loop {
            match self.transport.read_report(&mut buf, None) {
                Ok(len) => self.handle_frame(&buf[..len]),
                Err(TransportError::Interrupted) if self.stopping.load(Ordering::SeqCst) => {
                    closer.reason = CloseReason::Stopped;
                    break;
                },
                Err(TransportError::Interrupted | TransportError::Timeout) => {},
                Err(err) => {
                    warn!(error = %err, "transport failed, closing dispatcher");
                    break;
                },
            }
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        trace!(frame = format_args!("{:02x?}", frame), "read report");

        let report = match Report::read_raw(frame) {
            Ok(report) => report,
            Err(err) => {
                log_malformed(frame, &err);
                return;
            },
        };

        let handlers: Vec<(ListenerHandle, SharedHandler)> = {
            let mut state = self.state();

            if let Some(pos) = state
                .commands
                .iter()
                .position(|command| command.key.matches(&report).is_some())
            {
                let command = state.commands.remove(pos);
                command.queue.push(report);
            }

            state
                .listeners
                .matching((report.device_index(), report.sub_id()))
                .filter_map(|(handle, consumer)| match consumer {
                    Consumer::Queue(queue) => {
                        queue.push(report);
                        None
                    },
                    Consumer::Handler(handler) => Some((handle, Arc::clone(handler))),
                })
                .collect()
        };

        for (handle, handler) in handlers {
            // Another handler of this report may have unregistered this one.
            if !self.state().listeners.contains(handle) {
                continue;
            }

            let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
            let callback: &mut EventHandler = &mut handler;

            if callback(&report).is_break() {
                self.state().listeners.remove(handle);
                debug!(%handle, "event handler unregistered itself");
            }
        }
    }

    fn close(&self, reason: CloseReason) {
        let mut state = self.state();
        state.closed = Some(reason);

        for command in state.commands.drain(..) {
            command.queue.interrupt();
        }

        for consumer in state.listeners.drain() {
            if let Consumer::Queue(queue) = consumer {
                queue.interrupt();
            }
        }

        debug!(?reason, "dispatcher thread ended");
    }
}

/// Closes the dispatcher when the reader thread ends, however it ends.
struct Closer<'a, T: RawTransport> {
    shared: &'a Shared<T>,
    reason: CloseReason,
}

impl<T: RawTransport> Drop for Closer<'_, T> {
    fn drop(&mut self) {
        self.shared.close(self.reason);
    }
}

impl<T: RawTransport> Dispatcher for DispatcherThread<T> {
    fn vendor_id(&self) -> u16 {
        self.shared.transport.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.shared.transport.product_id()
    }

    fn name(&self) -> &str {
        self.shared.transport.name()
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
        let queue = Arc::new(EventQueue::new());

        let id = {
            let mut state = self.shared.state();
            if let Some(reason) = state.closed {
                return Err(reason.error());
            }

            let id = state.next_command_id;
            state.next_command_id += 1;
            state.commands.push(PendingCommand {
                id,
                key,
                queue: Arc::clone(&queue),
            });
            id
        };

        // Unregisters the command again if writing fails.
        let response = CommandResponse {
            dispatcher: self,
            id,
            key,
            queue,
        };
        self.write(&report)?;

        Ok(Box::new(response))
    }

    fn get_notification(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
    ) -> Result<Box<dyn AsyncReport + '_>, DispatchError> {
        let queue = Arc::new(EventQueue::new());

        let handle = {
            let mut state = self.shared.state();
            if let Some(reason) = state.closed {
                return Err(reason.error());
            }

            state
                .listeners
                .insert((device_index, sub_id), Consumer::Queue(Arc::clone(&queue)))
        };

        Ok(Box::new(Notification {
            dispatcher: self,
            handle,
            queue,
        }))
    }

    fn register_event_handler(
        &self,
        device_index: DeviceIndex,
        sub_id: u8,
        handler: EventHandler,
    ) -> ListenerHandle {
        let handle = self.shared.state().listeners.insert(
            (device_index, sub_id),
            Consumer::Handler(Arc::new(Mutex::new(handler))),
        );

        debug!(
            %handle,
            %device_index,
            sub_id = format_args!("{sub_id:#04x}"),
            "registered event handler"
        );
        handle
    }

    fn unregister_event_handler(&self, handle: ListenerHandle) -> bool {
        self.unregister(handle)
    }
}

impl<T: RawTransport> Drop for DispatcherThread<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: RawTransport> fmt::Debug for DispatcherThread<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherThread")
            .field("name", &self.shared.transport.name())
            .field("supports_short", &self.supports_short)
            .field("supports_long", &self.supports_long)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

struct CommandResponse<'a, T: RawTransport> {
    dispatcher: &'a DispatcherThread<T>,
    id: u64,
    key: CommandKey,
    queue: Arc<EventQueue>,
}

impl<T: RawTransport> CommandResponse<'_, T> {
    fn wait(&self, timeout: Option<Duration>) -> Result<Report, DispatchError> {
        let report = self.dispatcher.wait(&self.queue, timeout)?;

        match self.key.matches(&report) {
            Some(Err(err)) => Err(err.into()),
            _ => Ok(report),
        }
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

impl<T: RawTransport> Drop for CommandResponse<'_, T> {
    fn drop(&mut self) {
        self.dispatcher
            .shared
            .state()
            .commands
            .retain(|command| command.id != self.id);
    }
}

struct Notification<'a, T: RawTransport> {
    dispatcher: &'a DispatcherThread<T>,
    handle: ListenerHandle,
    queue: Arc<EventQueue>,
}

impl<T: RawTransport> AsyncReport for Notification<'_, T> {
    fn get(self: Box<Self>) -> Result<Report, DispatchError> {
        self.dispatcher.wait(&self.queue, None)
    }

    fn get_timeout(self: Box<Self>, timeout: Duration) -> Result<Report, DispatchError> {
        self.dispatcher.wait(&self.queue, Some(timeout))
    }
}

impl<T: RawTransport> Drop for Notification<'_, T> {
    fn drop(&mut self) {
        self.dispatcher.shared.state().listeners.remove(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ops::ControlFlow,
        sync::{
            Weak,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    use super::*;
    use crate::{
        nibble::U4,
        protocol::{ProtocolError, v10},
        report::ReportType,
        transport::mock::MockTransport,
    };

    fn short(device_index: DeviceIndex, sub_id: u8, address: u8, params: &[u8]) -> Report {
        Report::new(ReportType::Short, device_index, sub_id, address, params).unwrap()
    }

    fn feature_call(feature_index: u8) -> Report {
        Report::new_v20(
            DeviceIndex::Wireless1,
            feature_index,
            U4::from_lo(0x1),
            U4::from_lo(0x1),
            &[],
        )
        .unwrap()
    }

    /// Answers every written report with a report echoing its header.
    fn echoing_transport() -> MockTransport {
        let transport = MockTransport::new();
        transport.respond_with(|frame| {
            let command = Report::read_raw(frame).unwrap();
            let response = Report::new(
                ReportType::Long,
                command.device_index(),
                command.sub_id(),
                command.address(),
                &[command.sub_id()],
            )
            .unwrap();
            vec![response.to_vec()]
        });
        transport
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn concurrent_commands_get_their_own_response() {
        let dispatcher = DispatcherThread::new(echoing_transport()).unwrap();

        thread::scope(|s| {
            let callers: Vec<_> = (0x01..=0x08)
                .map(|feature_index| {
                    let dispatcher = &dispatcher;
                    s.spawn(move || {
                        let response = dispatcher
                            .send_command(feature_call(feature_index))
                            .unwrap()
                            .get_timeout(Duration::from_secs(5))
                            .unwrap();
                        (feature_index, response)
                    })
                })
                .collect();

            for caller in callers {
                let (feature_index, response) = caller.join().unwrap();
                assert_eq!(response.feature_index(), feature_index);
                assert_eq!(response.parameters()[0], feature_index);
            }
        });

        assert_eq!(dispatcher.pending_command_count(), 0);
    }

    #[test]
    fn timed_out_command_does_not_claim_later_reports() {
        let transport = MockTransport::new();
        let dispatcher = DispatcherThread::new(transport.clone()).unwrap();

        let result = dispatcher
            .send_command(feature_call(0x05))
            .unwrap()
            .get_timeout(Duration::from_millis(20));
        assert!(matches!(result, Err(DispatchError::Timeout)));
        assert_eq!(dispatcher.pending_command_count(), 0);

        let late_response = short(DeviceIndex::Wireless1, 0x05, 0x11, &[]);
        let notification = dispatcher
            .get_notification(DeviceIndex::Wireless1, 0x05)
            .unwrap();
        transport.push_report(&late_response);

        assert_eq!(
            notification.get_timeout(Duration::from_secs(5)).unwrap(),
            late_response
        );
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn error_reply_fails_the_command() {
        let transport = MockTransport::new();
        transport.respond_with(|frame| {
            let command = Report::read_raw(frame).unwrap();
            let error = v10::ErrorMessage {
                device_index: command.device_index(),
                sub_id: command.sub_id(),
                address: command.address(),
                code: 0x01,
            };
            vec![error.to_report().to_vec()]
        });
        let dispatcher = DispatcherThread::new(transport).unwrap();

        let result = dispatcher
            .send_command(feature_call(0x00))
            .unwrap()
            .get_timeout(Duration::from_secs(5));

        assert!(matches!(
            result,
            Err(DispatchError::Protocol(ProtocolError::V10(
                v10::ErrorType::InvalidSubId
            )))
        ));
    }

    #[test]
    fn closed_transport_wakes_every_waiter() {
        let transport = MockTransport::new();
        let dispatcher = DispatcherThread::new(transport.clone()).unwrap();
        let queue = Arc::new(EventQueue::new());
        dispatcher.register_event_queue(DeviceIndex::Wireless2, 0x41, Arc::clone(&queue));

        thread::scope(|s| {
            let notification = s.spawn(|| {
                dispatcher
                    .get_notification(DeviceIndex::Wireless1, 0x41)
                    .unwrap()
                    .get()
            });
            let command = s.spawn(|| dispatcher.send_command(feature_call(0x05)).unwrap().get());
            let consumer = s.spawn(|| queue.pop());

            thread::sleep(Duration::from_millis(20));
            transport.close();

            assert!(matches!(
                notification.join().unwrap(),
                Err(DispatchError::TransportClosed)
            ));
            assert!(matches!(
                command.join().unwrap(),
                Err(DispatchError::TransportClosed)
            ));
            assert_eq!(consumer.join().unwrap(), None);
        });

        assert!(wait_until(|| !dispatcher.is_running()));
        assert!(matches!(
            dispatcher.send_command(feature_call(0x05)),
            Err(DispatchError::TransportClosed)
        ));
        assert!(matches!(
            dispatcher.get_notification(DeviceIndex::Wireless1, 0x41),
            Err(DispatchError::TransportClosed)
        ));
    }

    #[test]
    fn stop_interrupts_queues() {
        let dispatcher = DispatcherThread::new(MockTransport::new()).unwrap();
        let queue = Arc::new(EventQueue::new());
        dispatcher.register_event_queue(DeviceIndex::Wireless1, 0x41, Arc::clone(&queue));
        assert!(dispatcher.is_running());

        thread::scope(|s| {
            let consumer = s.spawn(|| queue.pop());

            thread::sleep(Duration::from_millis(20));
            dispatcher.stop();

            assert_eq!(consumer.join().unwrap(), None);
        });

        assert!(!dispatcher.is_running());
        assert!(matches!(
            dispatcher.send_command_without_response(feature_call(0x05)),
            Err(DispatchError::Interrupted)
        ));
        dispatcher.stop();
    }

    #[test]
    fn queues_and_handlers_see_matching_reports() {
        let transport = MockTransport::new();
        let dispatcher = DispatcherThread::new(transport.clone()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher.register_event_handler(
            DeviceIndex::Wireless1,
            0x41,
            Box::new({
                let calls = Arc::clone(&calls);
                move |_: &Report| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ControlFlow::Break(())
                }
            }),
        );
        let connections = Arc::new(EventQueue::new());
        dispatcher.register_event_queue(DeviceIndex::Wireless1, 0x41, Arc::clone(&connections));
        let marker = Arc::new(EventQueue::new());
        dispatcher.register_event_queue(DeviceIndex::Wireless1, 0x40, Arc::clone(&marker));

        let first = short(DeviceIndex::Wireless1, 0x41, 0x04, &[0x01]);
        let second = short(DeviceIndex::Wireless1, 0x41, 0x04, &[0x02]);
        let disconnection = short(DeviceIndex::Wireless1, 0x40, 0x02, &[]);
        transport.push_report(&first);
        transport.push_report(&second);
        transport.push_report(&disconnection);

        // Reports are handled in order, so once the last one is queued the
        // handlers of the earlier ones have returned.
        assert_eq!(marker.pop_timeout(Duration::from_secs(5)), Ok(disconnection));
        assert_eq!(connections.pop_timeout(Duration::from_secs(5)), Ok(first));
        assert_eq!(connections.pop_timeout(Duration::from_secs(5)), Ok(second));
        assert!(connections.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.listener_count(), 2);
    }

    #[test]
    fn unrepresentable_deadline_waits_without_bound() {
        let transport = echoing_transport();
        let dispatcher = DispatcherThread::new(transport.clone()).unwrap();

        let notification = dispatcher
            .get_notification(DeviceIndex::Wireless1, 0x41)
            .unwrap();
        let connection = short(DeviceIndex::Wireless1, 0x41, 0x04, &[]);
        transport.push_report(&connection);
        assert_eq!(notification.get_timeout(Duration::MAX).unwrap(), connection);

        let response = dispatcher
            .send_command(feature_call(0x03))
            .unwrap()
            .get_timeout(Duration::MAX)
            .unwrap();
        assert_eq!(response.parameters()[0], 0x03);
    }

    #[test]
    fn waiting_from_a_handler_is_rejected() {
        let transport = MockTransport::new();
        let dispatcher = Arc::new(DispatcherThread::new(transport.clone()).unwrap());
        let (results, received) = flume::unbounded();

        dispatcher.register_event_handler(
            DeviceIndex::Wireless1,
            0x41,
            Box::new({
                let dispatcher: Weak<DispatcherThread<MockTransport>> = Arc::downgrade(&dispatcher);
                move |_: &Report| {
                    if let Some(dispatcher) = dispatcher.upgrade() {
                        let result = dispatcher
                            .get_notification(DeviceIndex::Wireless1, 0x40)
                            .and_then(|notification| notification.get());
                        results.send(result).unwrap();
                    }
                    ControlFlow::Break(())
                }
            }),
        );

        transport.push_report(&short(DeviceIndex::Wireless1, 0x41, 0x04, &[]));

        assert!(matches!(
            received.recv_timeout(Duration::from_secs(5)),
            Ok(Err(DispatchError::Reentrancy))
        ));
    }
}
