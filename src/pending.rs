//! Lock-free counter of in-flight calls.
//!
//! Tracks how many calls are currently between push and pop, plus the sum of
//! their wall and CPU start times (nanoseconds). The sums intentionally wrap:
//! under sustained load they overflow `u64` and stay "correct modulo 2^64",
//! which is all the short-horizon average needs:
//!
//! `avg_in_flight(now) = (count * now - sum_start) / count`
//!
//! Only meaningful while `count > 0`; consumers must not archive the raw sums.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::clock;

/// Lock-free in-flight call counter with start-time sums.
#[derive(Debug, Default)]
pub struct PendingCounter {
    pending_count: AtomicI64,
    pending_sum_start_ns: AtomicU64,
    pending_sum_start_cpu_ns: AtomicU64,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one call as in-flight.
    pub fn add_pending(&self, start_ns: u64, start_cpu_ns: u64) {
        self.pending_count.fetch_add(1, Ordering::Relaxed);
        self.pending_sum_start_ns
            .fetch_add(start_ns, Ordering::Relaxed);
        self.pending_sum_start_cpu_ns
            .fetch_add(start_cpu_ns, Ordering::Relaxed);
    }

    /// Deregister one call, using the same start times it was added with.
    pub fn remove_pending(&self, start_ns: u64, start_cpu_ns: u64) {
        self.pending_count.fetch_sub(1, Ordering::Relaxed);
        self.pending_sum_start_ns
            .fetch_sub(start_ns, Ordering::Relaxed);
        self.pending_sum_start_cpu_ns
            .fetch_sub(start_cpu_ns, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> i64 {
        self.pending_count.load(Ordering::Relaxed)
    }

    /// Wrapping sum of in-flight start times (wall nanos).
    pub fn pending_sum_start_ns(&self) -> u64 {
        self.pending_sum_start_ns.load(Ordering::Relaxed)
    }

    /// Wrapping sum of in-flight CPU start times (nanos).
    pub fn pending_sum_start_cpu_ns(&self) -> u64 {
        self.pending_sum_start_cpu_ns.load(Ordering::Relaxed)
    }

    /// Estimated average wall duration of in-flight calls at `now_ns`.
    /// Returns 0 when nothing is pending.
    pub fn average_pending_ns(&self, now_ns: u64) -> u64 {
        let count = self.pending_count();
        if count <= 0 {
            return 0;
        }
        let count = count as u64;
        let sum = self.pending_sum_start_ns();
        count
            .wrapping_mul(now_ns)
            .wrapping_sub(sum)
            .wrapping_div(count)
    }

    /// Estimated average CPU duration of in-flight calls at `now_cpu_ns`.
    pub fn average_pending_cpu_ns(&self, now_cpu_ns: u64) -> u64 {
        let count = self.pending_count();
        if count <= 0 {
            return 0;
        }
        let count = count as u64;
        let sum = self.pending_sum_start_cpu_ns();
        count
            .wrapping_mul(now_cpu_ns)
            .wrapping_sub(sum)
            .wrapping_div(count)
    }

    /// Millisecond convenience wrapper around [`Self::average_pending_ns`].
    pub fn average_pending_ms(&self, now_ns: u64) -> i64 {
        clock::nanos_to_millis(self.average_pending_ns(now_ns))
    }

    /// Add pre-aggregated raw state into this counter. Used when merging
    /// transported data.
    pub fn add_raw(&self, count: i64, sum_start_ns: u64, sum_start_cpu_ns: u64) {
        self.pending_count.fetch_add(count, Ordering::Relaxed);
        self.pending_sum_start_ns
            .fetch_add(sum_start_ns, Ordering::Relaxed);
        self.pending_sum_start_cpu_ns
            .fetch_add(sum_start_cpu_ns, Ordering::Relaxed);
    }

    /// Add another counter's state into this one (rollup).
    pub fn merge(&self, src: &PendingCounter) {
        self.pending_count
            .fetch_add(src.pending_count(), Ordering::Relaxed);
        self.pending_sum_start_ns
            .fetch_add(src.pending_sum_start_ns(), Ordering::Relaxed);
        self.pending_sum_start_cpu_ns
            .fetch_add(src.pending_sum_start_cpu_ns(), Ordering::Relaxed);
    }

    /// Overwrite this counter with the state of `src`.
    pub fn assign(&self, src: &PendingCounter) {
        self.pending_count
            .store(src.pending_count(), Ordering::Relaxed);
        self.pending_sum_start_ns
            .store(src.pending_sum_start_ns(), Ordering::Relaxed);
        self.pending_sum_start_cpu_ns
            .store(src.pending_sum_start_cpu_ns(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.pending_count.store(0, Ordering::Relaxed);
        self.pending_sum_start_ns.store(0, Ordering::Relaxed);
        self.pending_sum_start_cpu_ns.store(0, Ordering::Relaxed);
    }
}

impl Clone for PendingCounter {
    fn clone(&self) -> Self {
        let copy = Self::new();
        copy.assign(self);
        copy
    }
}
