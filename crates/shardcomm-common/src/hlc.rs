//! Hybrid logical clock.
//!
//! Produces 64-bit ticks that are monotonic within the process and track
//! wall-clock time across nodes: the high bits carry physical milliseconds
//! since the Unix epoch, the low [`LOGICAL_BITS`] bits a logical counter
//! that absorbs bursts and clock skew.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 20;

/// A process-local hybrid logical clock.
///
/// # Example
///
/// ```
/// use shardcomm_common::HybridLogicalClock;
///
/// let clock = HybridLogicalClock::new();
/// let a = clock.now();
/// let b = clock.now();
/// assert!(b > a);
/// ```
#[derive(Debug, Default)]
pub struct HybridLogicalClock {
    state: AtomicU64,
}

impl HybridLogicalClock {
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
        }
    }

    /// Returns the next tick.
    ///
    /// The result is strictly greater than every tick previously returned
    /// by this instance, and at least the current physical time.
    pub fn now(&self) -> u64 {
        let physical = wall_millis() << LOGICAL_BITS;
        let mut last = self.state.load(Ordering::Relaxed);
        loop {
            let next = physical.max(last + 1);
            match self.state.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => last = observed,
            }
        }
    }

    /// Observes a tick received from a peer, advancing the local clock
    /// past it.
    pub fn observe(&self, tick: u64) {
        self.state.fetch_max(tick, Ordering::Relaxed);
    }

    /// Encodes a tick for transport in a header.
    pub fn encode_time_stamp(tick: u64) -> String {
        format!("{tick:x}")
    }

    /// Decodes a tick encoded with [`Self::encode_time_stamp`].
    pub fn decode_time_stamp(encoded: &str) -> Option<u64> {
        u64::from_str_radix(encoded, 16).ok()
    }
}

fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_strictly_increasing() {
        let clock = HybridLogicalClock::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let tick = clock.now();
            assert!(tick > last);
            last = tick;
        }
    }

    #[test]
    fn observe_advances_past_remote_ticks() {
        let clock = HybridLogicalClock::new();
        let remote = clock.now() + (1 << 40);
        clock.observe(remote);
        assert!(clock.now() > remote);
    }

    #[test]
    fn encode_decode_round_trip() {
        let tick = 0x1234_5678_9abc_def0;
        let encoded = HybridLogicalClock::encode_time_stamp(tick);
        assert_eq!(HybridLogicalClock::decode_time_stamp(&encoded), Some(tick));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(HybridLogicalClock::decode_time_stamp("not-hex"), None);
    }
}
