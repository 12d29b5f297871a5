//! Serial number arithmetic per RFC 1982
//!
//! CmdSN, StatSN and DataSN are 32-bit counters that wrap every 2^32 PDUs,
//! so ordering decisions must never use plain integer subtraction. The
//! comparison here normalizes the wrapped difference into the signed range
//! `[-2^31, 2^31)` before judging order.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, Ordering as MemOrdering};

/// A 32-bit sequence number with modulo-2^32 ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerialNumber(pub u32);

impl SerialNumber {
    pub fn new(value: u32) -> Self {
        SerialNumber(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// RFC 1982 comparison: the wrapped difference is interpreted as a
    /// signed 32-bit quantity, so `0` follows `0xFFFF_FFFF`.
    pub fn compare(self, other: u32) -> Ordering {
        let diff = self.0.wrapping_sub(other) as i32;
        diff.cmp(&0)
    }

    /// Advances by one, wrapping `0xFFFF_FFFF` to `0`.
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// True if `self` lies in the inclusive window `[exp, max]` under
    /// wraparound arithmetic. Used for the CmdSN command window.
    pub fn in_window(self, exp: u32, max: u32) -> bool {
        let from_exp = self.0.wrapping_sub(exp) as i32;
        let to_max = max.wrapping_sub(self.0) as i32;
        from_exp >= 0 && to_max >= 0
    }
}

impl From<u32> for SerialNumber {
    fn from(value: u32) -> Self {
        SerialNumber(value)
    }
}

/// A sequence counter owned by exactly one logical writer but readable from
/// other threads (e.g. StatSN advanced by the connection receive thread and
/// observed by task completion paths).
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU32);

impl SequenceCounter {
    pub fn new(value: u32) -> Self {
        SequenceCounter(AtomicU32::new(value))
    }

    pub fn get(&self) -> SerialNumber {
        SerialNumber(self.0.load(MemOrdering::Acquire))
    }

    /// Sets the counter. Only the owning writer may call this.
    pub fn set(&self, value: u32) {
        self.0.store(value, MemOrdering::Release);
    }

    /// Returns the current value and advances the counter. Only the owning
    /// writer may call this.
    pub fn fetch_increment(&self) -> SerialNumber {
        SerialNumber(self.0.fetch_add(1, MemOrdering::AcqRel))
    }

    /// Advances the counter without observing it.
    pub fn increment(&self) {
        self.0.fetch_add(1, MemOrdering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_without_wrap() {
        assert_eq!(SerialNumber(5).compare(3), Ordering::Greater);
        assert_eq!(SerialNumber(3).compare(5), Ordering::Less);
        assert_eq!(SerialNumber(7).compare(7), Ordering::Equal);
    }

    #[test]
    fn test_compare_across_wrap() {
        // 0 follows 0xFFFFFFFF, so 0xFFFFFFFF is less than 0.
        assert_eq!(SerialNumber(0xFFFF_FFFF).compare(0), Ordering::Less);
        assert_eq!(SerialNumber(0).compare(0xFFFF_FFFF), Ordering::Greater);
        assert_eq!(SerialNumber(2).compare(0xFFFF_FFF0), Ordering::Greater);
    }

    #[test]
    fn test_increment_wraps() {
        let mut sn = SerialNumber(0xFFFF_FFFF);
        sn.increment();
        assert_eq!(sn.value(), 0);
    }

    #[test]
    fn test_window_without_wrap() {
        assert!(SerialNumber(100).in_window(100, 110));
        assert!(SerialNumber(110).in_window(100, 110));
        assert!(!SerialNumber(99).in_window(100, 110));
        assert!(!SerialNumber(111).in_window(100, 110));
    }

    #[test]
    fn test_window_across_wrap() {
        // Window [0xFFFFFFFE, 2] spans the wrap point.
        assert!(SerialNumber(0xFFFF_FFFF).in_window(0xFFFF_FFFE, 2));
        assert!(SerialNumber(0).in_window(0xFFFF_FFFE, 2));
        assert!(SerialNumber(2).in_window(0xFFFF_FFFE, 2));
        assert!(!SerialNumber(3).in_window(0xFFFF_FFFE, 2));
        assert!(!SerialNumber(0xFFFF_FFFD).in_window(0xFFFF_FFFE, 2));
    }

    #[test]
    fn test_counter_fetch_increment() {
        let counter = SequenceCounter::new(0xFFFF_FFFF);
        assert_eq!(counter.fetch_increment().value(), 0xFFFF_FFFF);
        assert_eq!(counter.get().value(), 0);
    }
}
