//! Aggregated statistics for one call path: an in-flight counter plus three
//! latency histograms (wall-elapsed, thread-user, thread-cpu).
//!
//! Frame timestamps arrive in nanoseconds; histogram values are milliseconds.
//! The nanos-to-millis conversion happens here, at the boundary, so the
//! bucket table keeps its documented millisecond ranges. The pending counter
//! stays in nanoseconds.
//!
//! Push and pop touch two separate atomic groups (the pending counter and the
//! histograms); a reader sampling between them may see a one-call skew. That
//! is accepted: this is non-blocking, approximate observability.

use crate::clock::nanos_to_millis;
use crate::histogram::LatencyHistogram;
use crate::pending::PendingCounter;

/// Per-call-path statistics: one [`PendingCounter`] and three
/// [`LatencyHistogram`]s. All mutation is lock-free; share behind `Arc`.
#[derive(Debug, Default, Clone)]
pub struct CallStats {
    pending: PendingCounter,
    elapsed: LatencyHistogram,
    thread_user: LatencyHistogram,
    thread_cpu: LatencyHistogram,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &PendingCounter {
        &self.pending
    }

    /// Wall-elapsed histogram (milliseconds).
    pub fn elapsed(&self) -> &LatencyHistogram {
        &self.elapsed
    }

    /// Thread user-time histogram (milliseconds).
    pub fn thread_user(&self) -> &LatencyHistogram {
        &self.thread_user
    }

    /// Thread cpu-time histogram (milliseconds).
    pub fn thread_cpu(&self) -> &LatencyHistogram {
        &self.thread_cpu
    }

    pub fn pending_count(&self) -> i64 {
        self.pending.pending_count()
    }

    /// Mark one call as started.
    pub fn add_pending(&self, start_ns: u64, start_cpu_ns: u64) {
        self.pending.add_pending(start_ns, start_cpu_ns);
    }

    /// Undo [`Self::add_pending`] without recording a completion (used when a
    /// call is abandoned rather than finished).
    pub fn remove_pending(&self, start_ns: u64, start_cpu_ns: u64) {
        self.pending.remove_pending(start_ns, start_cpu_ns);
    }

    /// Record one completed call from raw nanosecond deltas.
    pub fn record_elapsed(&self, elapsed_ns: u64, user_ns: u64, cpu_ns: u64) {
        self.elapsed.record(nanos_to_millis(elapsed_ns));
        self.thread_user.record(nanos_to_millis(user_ns));
        self.thread_cpu.record(nanos_to_millis(cpu_ns));
    }

    /// Record a completion and release its pending slot, from start/end
    /// nanosecond timestamps. Two atomic groups, not one transaction.
    pub fn record_and_remove_pending(
        &self,
        start_ns: u64,
        start_user_ns: u64,
        start_cpu_ns: u64,
        end_ns: u64,
        end_user_ns: u64,
        end_cpu_ns: u64,
    ) {
        self.record_elapsed(
            end_ns.wrapping_sub(start_ns),
            end_user_ns.wrapping_sub(start_user_ns),
            end_cpu_ns.wrapping_sub(start_cpu_ns),
        );
        self.pending.remove_pending(start_ns, start_cpu_ns);
    }

    /// Add another stats bundle into this one (rollup).
    pub fn merge(&self, src: &CallStats) {
        self.pending.merge(&src.pending);
        self.elapsed.merge(&src.elapsed);
        self.thread_user.merge(&src.thread_user);
        self.thread_cpu.merge(&src.thread_cpu);
    }

    /// Overwrite this bundle with the state of `src`.
    pub fn assign(&self, src: &CallStats) {
        self.pending.assign(&src.pending);
        self.elapsed.assign(&src.elapsed);
        self.thread_user.assign(&src.thread_user);
        self.thread_cpu.assign(&src.thread_cpu);
    }

    pub fn clear(&self) {
        self.pending.clear();
        self.elapsed.clear();
        self.thread_user.clear();
        self.thread_cpu.clear();
    }

    /// Drain this bundle into `dest` (added, not overwritten), then reset.
    /// Not atomic as a whole; concurrent recorders may land on either side.
    pub fn clear_and_copy_to(&self, dest: &CallStats) {
        dest.merge(self);
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_converts_nanos_to_millis() {
        let stats = CallStats::new();
        // 100ms elapsed, 40ms user, 60ms cpu
        stats.record_elapsed(100_000_000, 40_000_000, 60_000_000);

        assert_eq!(stats.elapsed().total_count(), 1);
        assert_eq!(stats.elapsed().total_sum(), 100);
        assert_eq!(stats.thread_user().total_sum(), 40);
        assert_eq!(stats.thread_cpu().total_sum(), 60);
        // 100ms lands in slot [64, 128)
        assert_eq!(stats.elapsed().count_at(3), 1);
    }

    #[test]
    fn push_pop_cycle_balances_pending() {
        let stats = CallStats::new();
        let (t0, u0, c0) = (1_000_000, 100, 200);
        stats.add_pending(t0, c0);
        assert_eq!(stats.pending_count(), 1);

        stats.record_and_remove_pending(
            t0,
            u0,
            c0,
            t0 + 35_000_000,
            u0 + 5_000_000,
            c0 + 10_000_000,
        );
        assert_eq!(stats.pending_count(), 0);
        assert_eq!(stats.elapsed().total_sum(), 35);
        assert_eq!(stats.thread_user().total_sum(), 5);
        assert_eq!(stats.thread_cpu().total_sum(), 10);
    }

    #[test]
    fn sub_millisecond_calls_land_in_slot_zero() {
        let stats = CallStats::new();
        stats.record_elapsed(900_000, 1_000, 2_000); // 0.9ms
        assert_eq!(stats.elapsed().count_at(0), 1);
        assert_eq!(stats.elapsed().total_sum(), 0);
    }

    #[test]
    fn merge_and_clear_and_copy_to() {
        let a = CallStats::new();
        let b = CallStats::new();
        a.record_elapsed(10_000_000, 0, 0);
        b.record_elapsed(20_000_000, 0, 0);

        a.merge(&b);
        assert_eq!(a.elapsed().total_count(), 2);
        assert_eq!(a.elapsed().total_sum(), 30);

        let dest = CallStats::new();
        dest.record_elapsed(1_000_000, 0, 0);
        a.clear_and_copy_to(&dest);
        assert_eq!(a.elapsed().total_count(), 0);
        // Drained stats are added to dest's existing data.
        assert_eq!(dest.elapsed().total_count(), 3);
        assert_eq!(dest.elapsed().total_sum(), 31);
    }
}
