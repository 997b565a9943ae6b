//! Ordering guard for unreliable packets
//!
//! Each message key carries its own 16-bit counter. Outgoing packets are
//! stamped with the next counter value; incoming packets are accepted only
//! when strictly newer than the last accepted value for that key.
//!
//! Counters wrap. "Newer" uses serial-number arithmetic: `b` is newer than
//! `a` when `b - a` (mod 2^16) lies in `1..=32767`. A jump of half the range
//! or more is therefore treated as stale.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{MessageKey, Timestamp};

const HALF_RANGE: Timestamp = Timestamp::MAX / 2 + 1;

/// Whether `candidate` comes after `last` under wrapping comparison
pub fn is_newer(candidate: Timestamp, last: Timestamp) -> bool {
    let distance = candidate.wrapping_sub(last);
    distance != 0 && distance < HALF_RANGE
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-connection guard state
#[derive(Debug, Default)]
pub struct OrderedPacketGuard {
    /// Last issued timestamp per outgoing key
    outgoing: Mutex<HashMap<MessageKey, Timestamp>>,
    /// Last accepted timestamp per incoming key
    incoming: Mutex<HashMap<MessageKey, Timestamp>>,
}

impl OrderedPacketGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the timestamp for the next outgoing packet on `key`
    pub fn next_timestamp(&self, key: MessageKey) -> Timestamp {
        let mut outgoing = lock(&self.outgoing);
        let counter = outgoing.entry(key).or_insert(0);
        *counter = counter.wrapping_add(1);
        *counter
    }

    /// Accept or discard an incoming packet on `key` stamped with `timestamp`
    pub fn accept(&self, key: MessageKey, timestamp: Timestamp) -> bool {
        let mut incoming = lock(&self.incoming);
        match incoming.get_mut(&key) {
            Some(last) if !is_newer(timestamp, *last) => false,
            Some(last) => {
                *last = timestamp;
                true
            }
            None => {
                incoming.insert(key, timestamp);
                true
            }
        }
    }

    /// Last accepted timestamp for `key`
    pub fn last_accepted(&self, key: MessageKey) -> Option<Timestamp> {
        lock(&self.incoming).get(&key).copied()
    }

    /// Number of keys with incoming or outgoing state
    pub fn tracked_keys(&self) -> usize {
        let incoming = lock(&self.incoming);
        let outgoing = lock(&self.outgoing);
        incoming.len() + outgoing.keys().filter(|k| !incoming.contains_key(k)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked_keys() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_timestamps_are_accepted_in_order() {
        let sender = OrderedPacketGuard::new();
        let receiver = OrderedPacketGuard::new();

        let stamps: Vec<_> = (0..100).map(|_| sender.next_timestamp(3)).collect();
        for ts in &stamps {
            assert!(receiver.accept(3, *ts));
        }
        for ts in &stamps {
            assert!(!receiver.accept(3, *ts));
        }
    }

    #[test]
    fn test_stale_packet_discarded() {
        let guard = OrderedPacketGuard::new();
        assert!(guard.accept(7, 10));
        assert!(!guard.accept(7, 9));
        assert!(!guard.accept(7, 10));
        assert!(guard.accept(7, 11));
        assert_eq!(guard.last_accepted(7), Some(11));
    }

    #[test]
    fn test_keys_are_independent() {
        let guard = OrderedPacketGuard::new();
        assert!(guard.accept(1, 500));
        assert!(guard.accept(2, 3));
        assert!(guard.accept(2, 4));
        assert!(!guard.accept(1, 499));

        assert_eq!(guard.next_timestamp(1), 1);
        assert_eq!(guard.next_timestamp(1), 2);
        assert_eq!(guard.next_timestamp(2), 1);
    }

    #[test]
    fn test_wraparound() {
        assert!(is_newer(0, Timestamp::MAX));
        assert!(is_newer(5, 65530));
        assert!(!is_newer(65530, 5));
        assert!(!is_newer(HALF_RANGE, 0));
        assert!(is_newer(HALF_RANGE - 1, 0));

        let guard = OrderedPacketGuard::new();
        assert!(guard.accept(1, Timestamp::MAX - 1));
        assert!(guard.accept(1, Timestamp::MAX));
        assert!(guard.accept(1, 0));
        assert!(!guard.accept(1, Timestamp::MAX));
    }

    #[test]
    fn test_outgoing_counter_wraps() {
        let guard = OrderedPacketGuard::new();
        let mut last = 0;
        // 65537 calls: 1..=65535, then 0, then 1
        for _ in 0..=Timestamp::MAX as u32 + 1 {
            last = guard.next_timestamp(9);
        }
        assert_eq!(last, 1);
    }

    #[test]
    fn test_tracked_keys() {
        let guard = OrderedPacketGuard::new();
        assert!(guard.is_empty());
        guard.next_timestamp(1);
        guard.accept(1, 1);
        guard.accept(2, 1);
        assert_eq!(guard.tracked_keys(), 2);
    }
}
