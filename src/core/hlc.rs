use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::time::unix_now_ns;

/// Hybrid logical clock producing the per-vbucket CAS stream.
///
/// The upper 48 bits carry physical time (nanoseconds, truncated), the low
/// 16 bits a logical counter that absorbs bursts and clock stalls. CAS
/// values are strictly monotonic within a vbucket, across restarts when
/// seeded from the persisted max CAS.
#[derive(Debug)]
pub struct HybridClock {
    max_cas: AtomicU64,
    drift_ahead_threshold_ns: u64,
    drift_behind_threshold_ns: u64,
    drift_ahead: AtomicU64,
    drift_behind: AtomicU64,
}

const LOGICAL_BITS: u64 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

impl HybridClock {
    pub fn new(initial_cas: u64, drift_ahead_us: u64, drift_behind_us: u64) -> Self {
        Self {
            max_cas: AtomicU64::new(initial_cas),
            drift_ahead_threshold_ns: drift_ahead_us.saturating_mul(1000),
            drift_behind_threshold_ns: drift_behind_us.saturating_mul(1000),
            drift_ahead: AtomicU64::new(0),
            drift_behind: AtomicU64::new(0),
        }
    }

    /// Next CAS: `max(physical, current + 1)`.
    pub fn next_cas(&self) -> u64 {
        let physical = unix_now_ns() & !LOGICAL_MASK;
        let mut current = self.max_cas.load(Ordering::Acquire);
        loop {
            let candidate = physical.max(current + 1);
            match self.max_cas.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Fold an incoming CAS (setWithMeta / delWithMeta) into the clock and
    /// account drift against the local wall clock.
    pub fn observe_cas(&self, incoming: u64) {
        let local = unix_now_ns();
        let incoming_physical = incoming & !LOGICAL_MASK;
        if incoming_physical > local {
            if incoming_physical - local > self.drift_ahead_threshold_ns {
                self.drift_ahead.fetch_add(1, Ordering::Relaxed);
            }
        } else if local - incoming_physical > self.drift_behind_threshold_ns {
            self.drift_behind.fetch_add(1, Ordering::Relaxed);
        }

        self.max_cas.fetch_max(incoming, Ordering::AcqRel);
    }

    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    pub fn drift_ahead_count(&self) -> u64 {
        self.drift_ahead.load(Ordering::Relaxed)
    }

    pub fn drift_behind_count(&self) -> u64 {
        self.drift_behind.load(Ordering::Relaxed)
    }
}
