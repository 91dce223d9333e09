//! Keeps track of the listeners registered on a dispatcher.

use std::{collections::BTreeMap, fmt};

use crate::report::DeviceIndex;

/// The device index and sub ID a listener is interested in.
pub type ListenerKey = (DeviceIndex, u8);

/// Identifies a registered listener.
///
/// Handles are never reused during the lifetime of a dispatcher, so a stale
/// handle cannot accidentally unregister another listener.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ListenerHandle(u64);

impl fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A multimap from [`ListenerKey`] to listeners of type `C`.
///
/// Listeners sharing a key are kept in registration order.
pub(crate) struct ListenerMap<C> {
    next_handle: u64,
    listeners: BTreeMap<ListenerHandle, (ListenerKey, C)>,
}

impl<C> ListenerMap<C> {
    pub fn new() -> Self {
        Self {
            next_handle: 0,
            listeners: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: ListenerKey, listener: C) -> ListenerHandle {
        let handle = ListenerHandle(self.next_handle);
        self.next_handle += 1;
        self.listeners.insert(handle, (key, listener));
        handle
    }

    pub fn remove(&mut self, handle: ListenerHandle) -> Option<C> {
        self.listeners.remove(&handle).map(|(_, listener)| listener)
    }

    pub fn contains(&self, handle: ListenerHandle) -> bool {
        self.listeners.contains_key(&handle)
    }

    /// Iterates over all listeners registered for `key`, oldest first.
    pub fn matching(&self, key: ListenerKey) -> impl Iterator<Item = (ListenerHandle, &C)> {
        self.listeners
            .iter()
            .filter(move |(_, (listener_key, _))| *listener_key == key)
            .map(|(handle, (_, listener))| (*handle, listener))
    }

    /// Removes every listener, handing them out in registration order.
    pub fn drain(&mut self) -> impl Iterator<Item = C> {
        std::mem::take(&mut self.listeners)
            .into_values()
            .map(|(_, listener)| listener)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl<C> Default for ListenerMap<C> {
    fn default() -> Self {
        Self::new()
    }
}
