//! Hands out the software ID placed in outgoing HID++2.0 feature calls.
//!
//! HID++2.0 includes an arbitrary "software ID" in every message. This ID is
//! meant to differentiate messages of different softwares, but it can also be
//! used to ease the mapping of incoming messages to previously sent outgoing
//! messages by rotating it after every sent message.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::nibble::U4;

/// The software ID used unless configured otherwise.
pub const DEFAULT_SW_ID: U4 = U4::from_lo(0x1);

/// Software ID configuration shared by all callers of one dispatcher.
///
/// By default, the software ID is `0x1` and does not rotate. A software ID of
/// zero is never handed out because devices use it to mark notifications.
#[derive(Debug)]
pub struct SoftwareIds {
    current: AtomicU8,
    rotating: AtomicBool,
}

impl SoftwareIds {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(DEFAULT_SW_ID.to_lo()),
            rotating: AtomicBool::new(false),
        }
    }

    /// Sets the software ID handed out next. Zero is replaced by `0x1`.
    pub fn set_sw_id(&self, sw_id: U4) {
        self.current.store(sw_id.to_lo().max(1), Ordering::SeqCst);
    }

    /// Enables or disables rotation. When enabled, every call to
    /// [`Self::get_sw_id`] advances the ID, cycling through `0x1..=0xf`.
    pub fn set_rotating_sw_id(&self, rotating: bool) {
        self.rotating.store(rotating, Ordering::SeqCst);
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::SeqCst)
    }

    /// Returns the software ID to use for the next feature call.
    pub fn get_sw_id(&self) -> U4 {
        if !self.is_rotating() {
            return U4::from_lo(self.current.load(Ordering::SeqCst));
        }

        let previous = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                Some(if id >= U4::MAX.to_lo() { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id);

        U4::from_lo(previous)
    }
}

impl Default for SoftwareIds {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_id_does_not_change() {
        let ids = SoftwareIds::new();
        assert_eq!(ids.get_sw_id(), DEFAULT_SW_ID);
        assert_eq!(ids.get_sw_id(), DEFAULT_SW_ID);

        ids.set_sw_id(U4::from_lo(0xa));
        assert_eq!(ids.get_sw_id(), U4::from_lo(0xa));
    }

    #[test]
    fn rotation_skips_zero() {
        let ids = SoftwareIds::new();
        ids.set_sw_id(U4::from_lo(0xe));
        ids.set_rotating_sw_id(true);

        let handed_out: Vec<u8> = (0..4).map(|_| ids.get_sw_id().to_lo()).collect();
        assert_eq!(handed_out, vec![0xe, 0xf, 0x1, 0x2]);
    }

    #[test]
    fn zero_is_never_configured() {
        let ids = SoftwareIds::new();
        ids.set_sw_id(U4::from_lo(0x0));
        assert_eq!(ids.get_sw_id(), U4::from_lo(0x1));
    }
}
