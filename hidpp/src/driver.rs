//! Bridges notifications received by a [`DispatcherThread`] into a worker
//! thread of their own.
//!
//! A driver registers one [`EventQueue`] for every key it is interested in and
//! hands each popped report to a closure running on its worker thread. This is
//! how a long-lived consumer, e.g. one per paired device, forwards events into
//! another subsystem without ever blocking the dispatcher thread.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

use crate::{
    dispatcher::{DispatchError, DispatcherThread, ListenerHandle, ListenerKey},
    event::EventQueue,
    report::{DeviceIndex, Report},
    transport::{RawTransport, TransportError},
};

const THREAD_NAME: &str = "hidpp-driver";

/// A worker thread consuming the reports matching a set of keys.
///
/// Dropping the driver unregisters its queue from every key, then interrupts
/// the queue and finally joins the worker. Reports still queued at that point
/// are discarded.
pub struct Driver<T: RawTransport> {
    dispatcher: Arc<DispatcherThread<T>>,
    queue: Arc<EventQueue>,
    handles: Mutex<Vec<ListenerHandle>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: RawTransport> Driver<T> {
    /// Starts a worker calling `handler` for every report matching one of
    /// `keys`.
    pub fn spawn<F>(
        dispatcher: Arc<DispatcherThread<T>>,
        keys: &[ListenerKey],
        mut handler: F,
    ) -> Result<Self, DispatchError>
    where
        F: FnMut(Report) + Send + 'static,
    {
        let queue = Arc::new(EventQueue::new());

        let worker = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn({
                let queue = Arc::clone(&queue);
                move || {
                    while let Some(report) = queue.pop() {
                        handler(report);
                    }
                    debug!("driver worker ended");
                }
            })
            .map_err(|err| DispatchError::Transport(TransportError::Io(err)))?;

        let driver = Self {
            dispatcher,
            queue,
            handles: Mutex::new(Vec::with_capacity(keys.len())),
            worker: Some(worker),
        };

        for &(device_index, sub_id) in keys {
            driver.add_event(device_index, sub_id);
        }

        Ok(driver)
    }

    /// Additionally feeds reports matching `device_index` and `sub_id` to the
    /// worker.
    pub fn add_event(&self, device_index: DeviceIndex, sub_id: u8) -> ListenerHandle {
        let handle =
            self.dispatcher
                .register_event_queue(device_index, sub_id, Arc::clone(&self.queue));
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        handle
    }

    /// Stops the worker. Equivalent to dropping the driver.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            self.dispatcher.unregister_event_queue(handle);
        }

        self.queue.interrupt();

        if worker.join().is_err() {
            warn!("driver worker panicked");
        }
    }
}

impl<T: RawTransport> Drop for Driver<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<T: RawTransport> fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("queued", &self.queue.len())
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{report::ReportType, transport::mock::MockTransport};

    fn short(device_index: DeviceIndex, sub_id: u8) -> Report {
        Report::new(ReportType::Short, device_index, sub_id, 0x04, &[]).unwrap()
    }

    #[test]
    fn worker_receives_registered_keys() {
        let transport = MockTransport::new();
        let dispatcher = Arc::new(DispatcherThread::new(transport.clone()).unwrap());
        let (sender, received) = flume::unbounded();

        let driver = Driver::spawn(
            Arc::clone(&dispatcher),
            &[(DeviceIndex::Wireless1, 0x41)],
            move |report| sender.send(report).unwrap(),
        )
        .unwrap();

        transport.push_report(&short(DeviceIndex::Wireless2, 0x41));
        transport.push_report(&short(DeviceIndex::Wireless1, 0x41));
        assert_eq!(
            received.recv_timeout(Duration::from_secs(5)),
            Ok(short(DeviceIndex::Wireless1, 0x41))
        );

        driver.add_event(DeviceIndex::Wireless2, 0x40);
        transport.push_report(&short(DeviceIndex::Wireless2, 0x40));
        assert_eq!(
            received.recv_timeout(Duration::from_secs(5)),
            Ok(short(DeviceIndex::Wireless2, 0x40))
        );
    }

    #[test]
    fn shutdown_unregisters_and_joins() {
        let dispatcher = Arc::new(DispatcherThread::new(MockTransport::new()).unwrap());

        let driver = Driver::spawn(
            Arc::clone(&dispatcher),
            &[(DeviceIndex::Wireless1, 0x40), (DeviceIndex::Wireless1, 0x41)],
            |_| {},
        )
        .unwrap();
        assert_eq!(dispatcher.listener_count(), 2);

        driver.shutdown();
        assert_eq!(dispatcher.listener_count(), 0);
        assert!(dispatcher.is_running());
    }

    #[test]
    fn stopped_dispatcher_ends_the_worker() {
        let dispatcher = Arc::new(DispatcherThread::new(MockTransport::new()).unwrap());
        let (sender, ended) = flume::bounded::<()>(1);

        // `sender` lives exactly as long as the worker.
        let driver = Driver::spawn(
            Arc::clone(&dispatcher),
            &[(DeviceIndex::Wireless1, 0x41)],
            move |_| {
                let _sender = &sender;
            },
        )
        .unwrap();

        dispatcher.stop();
        assert_eq!(
            ended.recv_timeout(Duration::from_secs(5)),
            Err(flume::RecvTimeoutError::Disconnected)
        );

        drop(driver);
    }
}
