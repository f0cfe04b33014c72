//! Lock-free latency histogram with fixed logarithmic bucketing.
//!
//! Values are millisecond durations bucketed into 10 hard-coded slots:
//!
//! - `[0]`: <= 0
//! - `[1]`: 1    - 31
//! - `[2]`: 32   - 63
//! - `[3]`: 64   - 127
//! - `[4]`: 128  - 255
//! - `[5]`: 256  - 511
//! - `[6]`: 512  - 1023
//! - `[7]`: 1024 - 2047
//! - `[8]`: 2048 - 4095
//! - `[9]`: 4096 and above
//!
//! All mutation is lock-free: per-slot counts and sums use atomic fetch-add,
//! and the global min/max use `fetch_min`/`fetch_max`, which retry the
//! compare-and-swap until it succeeds. A single-attempt CAS would silently
//! lose updates under contention.
//!
//! The only lock in this type guards the capture-site string recorded when a
//! new maximum is won; that path runs at most once per new maximum and never
//! on an ordinary `record`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::clock;

/// Number of histogram slots.
pub const SLOT_LEN: usize = 10;

/// Upper bound of the last finite slot; values at or above land in slot 9.
const MAX_SLOT_VALUE: i64 = 4096;

/// Slot index for values in `[32, 4096)`, keyed by `value >> 5`.
///
/// Index 0 is never consulted (values below 32 short-circuit to slot 1).
const SLOT_INDEX_BY_DIV32: [u8; 128] = build_slot_table();

const fn build_slot_table() -> [u8; 128] {
    let mut table = [0u8; 128];
    let mut i = 1usize;
    while i < 128 {
        // v in [i*32, (i+1)*32) maps to slot 2 + floor(log2(i))
        let mut slot = 2u8;
        let mut x = i;
        while x > 1 {
            x >>= 1;
            slot += 1;
        }
        table[i] = slot;
        i += 1;
    }
    table
}

/// Inclusive `[from, to]` value bounds of each slot, for reporting.
const SLOT_BOUNDS: [(i64, i64); SLOT_LEN] = [
    (i64::MIN, 0),
    (1, 31),
    (32, 63),
    (64, 127),
    (128, 255),
    (256, 511),
    (512, 1023),
    (1024, 2047),
    (2048, 4095),
    (4096, i64::MAX),
];

/// Map a value to its slot index. Pure function; O(1) with no boundary
/// branching thanks to the precomputed `v >> 5` lookup table.
pub fn value_to_slot_index(value: i64) -> usize {
    if value <= 0 {
        return 0;
    }
    if value >= MAX_SLOT_VALUE {
        return SLOT_LEN - 1;
    }
    let v = value as usize;
    if v < 32 {
        return 1;
    }
    SLOT_INDEX_BY_DIV32[v >> 5] as usize
}

/// Copy of one slot's state, with its value bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    /// Lowest value bucketed into this slot (inclusive).
    pub from: i64,
    /// Highest value bucketed into this slot (inclusive).
    pub to: i64,
    /// Occurrence count.
    pub count: u64,
    /// Sum of recorded values.
    pub sum: i64,
}

/// Lock-free 10-slot logarithmic histogram over `i64` values.
///
/// Shared across threads behind `Arc`; every accessor takes `&self`.
#[derive(Debug)]
pub struct LatencyHistogram {
    counts: [AtomicU64; SLOT_LEN],
    sums: [AtomicI64; SLOT_LEN],

    min_value: AtomicI64,
    max_value: AtomicI64,
    /// Unix millis when `max_value` was last raised.
    max_reached_unix_ms: AtomicU64,
    /// Short capture-site trace recorded when `max_value` was last raised.
    /// Rare path: locked only when a record wins a new maximum.
    max_site: Mutex<Option<String>>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            sums: std::array::from_fn(|_| AtomicI64::new(0)),
            min_value: AtomicI64::new(i64::MAX),
            max_value: AtomicI64::new(i64::MIN),
            max_reached_unix_ms: AtomicU64::new(0),
            max_site: Mutex::new(None),
        }
    }

    /// Record one value: bumps the slot count and sum, and maintains the
    /// global min/max with retry-until-success updates.
    pub fn record(&self, value: i64) {
        let index = value_to_slot_index(value);
        self.counts[index].fetch_add(1, Ordering::Relaxed);
        self.sums[index].fetch_add(value, Ordering::Relaxed);

        self.min_value.fetch_min(value, Ordering::Relaxed);
        let prev_max = self.max_value.fetch_max(value, Ordering::Relaxed);
        if value > prev_max {
            // This thread raised the maximum; stamp when and where.
            self.max_reached_unix_ms
                .store(clock::unix_now_ms(), Ordering::Relaxed);
            *self.max_site.lock() = Some(capture_site());
        }
    }

    /// Add every slot of `src` into this histogram (rollup). Min/max and the
    /// max provenance are not transferred; they describe individual records.
    pub fn merge(&self, src: &LatencyHistogram) {
        for i in 0..SLOT_LEN {
            self.counts[i].fetch_add(src.count_at(i), Ordering::Relaxed);
            self.sums[i].fetch_add(src.sum_at(i), Ordering::Relaxed);
        }
    }

    /// Add a pre-aggregated `(count, sum)` into one slot. Used when merging
    /// transported data whose individual values are no longer available.
    pub fn add_slot(&self, index: usize, count: u64, sum: i64) {
        self.counts[index].fetch_add(count, Ordering::Relaxed);
        self.sums[index].fetch_add(sum, Ordering::Relaxed);
    }

    /// Overwrite this histogram with the state of `src`.
    pub fn assign(&self, src: &LatencyHistogram) {
        for i in 0..SLOT_LEN {
            self.counts[i].store(src.count_at(i), Ordering::Relaxed);
            self.sums[i].store(src.sum_at(i), Ordering::Relaxed);
        }
        self.min_value.store(src.min_value(), Ordering::Relaxed);
        self.max_value.store(src.max_value(), Ordering::Relaxed);
        self.max_reached_unix_ms
            .store(src.max_reached_unix_ms(), Ordering::Relaxed);
        *self.max_site.lock() = src.max_site();
    }

    /// Reset all slots and the min/max state.
    pub fn clear(&self) {
        for i in 0..SLOT_LEN {
            self.counts[i].store(0, Ordering::Relaxed);
            self.sums[i].store(0, Ordering::Relaxed);
        }
        self.min_value.store(i64::MAX, Ordering::Relaxed);
        self.max_value.store(i64::MIN, Ordering::Relaxed);
        self.max_reached_unix_ms.store(0, Ordering::Relaxed);
        *self.max_site.lock() = None;
    }

    pub fn count_at(&self, index: usize) -> u64 {
        self.counts[index].load(Ordering::Relaxed)
    }

    pub fn sum_at(&self, index: usize) -> i64 {
        self.sums[index].load(Ordering::Relaxed)
    }

    /// Total occurrence count across all slots.
    pub fn total_count(&self) -> u64 {
        (0..SLOT_LEN).map(|i| self.count_at(i)).sum()
    }

    /// Total sum across all slots.
    pub fn total_sum(&self) -> i64 {
        (0..SLOT_LEN).map(|i| self.sum_at(i)).sum()
    }

    /// Mean recorded value, or 0.0 when nothing has been recorded.
    pub fn average(&self) -> f64 {
        let count = self.total_count();
        if count == 0 {
            return 0.0;
        }
        self.total_sum() as f64 / count as f64
    }

    /// Smallest recorded value; `i64::MAX` when nothing has been recorded.
    pub fn min_value(&self) -> i64 {
        self.min_value.load(Ordering::Relaxed)
    }

    /// Largest recorded value; `i64::MIN` when nothing has been recorded.
    pub fn max_value(&self) -> i64 {
        self.max_value.load(Ordering::Relaxed)
    }

    /// Unix millis when the current maximum was reached; 0 when empty.
    pub fn max_reached_unix_ms(&self) -> u64 {
        self.max_reached_unix_ms.load(Ordering::Relaxed)
    }

    /// Capture-site trace recorded when the current maximum was reached.
    pub fn max_site(&self) -> Option<String> {
        self.max_site.lock().clone()
    }

    /// Copy of the slot at `index` with its value bounds.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOT_LEN`.
    pub fn slot(&self, index: usize) -> SlotSnapshot {
        let (from, to) = SLOT_BOUNDS[index];
        SlotSnapshot {
            from,
            to,
            count: self.count_at(index),
            sum: self.sum_at(index),
        }
    }

    /// Copy of all slots, in order.
    pub fn slots(&self) -> [SlotSnapshot; SLOT_LEN] {
        std::array::from_fn(|i| self.slot(i))
    }

    /// Prefix-summed counts: `cumulative[i] = sum of counts for slots 0..=i`,
    /// so `cumulative[9]` is the grand total. Pure view; does not modify the
    /// histogram.
    pub fn cumulative_counts(&self) -> [u64; SLOT_LEN] {
        let mut cumul = 0u64;
        std::array::from_fn(|i| {
            cumul += self.count_at(i);
            cumul
        })
    }

    /// Prefix-summed sums, same shape as [`Self::cumulative_counts`].
    pub fn cumulative_sums(&self) -> [i64; SLOT_LEN] {
        let mut cumul = 0i64;
        std::array::from_fn(|i| {
            cumul += self.sum_at(i);
            cumul
        })
    }

    /// Heuristic change detection: true if any slot count differs from `cmp`.
    pub fn count_changed_since(&self, cmp: &LatencyHistogram) -> bool {
        (0..SLOT_LEN).any(|i| self.count_at(i) != cmp.count_at(i))
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for LatencyHistogram {
    fn clone(&self) -> Self {
        let copy = Self::new();
        copy.assign(self);
        copy
    }
}

/// Short capture-site trace: the first few application frames of the current
/// backtrace, innermost first. Only taken when a new maximum is recorded.
fn capture_site() -> String {
    const MAX_FRAMES: usize = 6;
    let mut names: Vec<String> = Vec::with_capacity(MAX_FRAMES);
    backtrace::trace(|frame| {
        backtrace::resolve_frame(frame, |symbol| {
            if let Some(name) = symbol.name() {
                let name = name.to_string();
                // Skip the backtrace machinery and this module's own frames.
                if !name.contains("backtrace") && !name.contains("perfstack::histogram") {
                    names.push(name);
                }
            }
        });
        names.len() < MAX_FRAMES
    });
    names.join(" < ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_index_boundaries() {
        assert_eq!(value_to_slot_index(0), 0);
        assert_eq!(value_to_slot_index(-1), 0);
        assert_eq!(value_to_slot_index(i64::MIN), 0);
        assert_eq!(value_to_slot_index(1), 1);
        assert_eq!(value_to_slot_index(30), 1);
        assert_eq!(value_to_slot_index(31), 1);
        assert_eq!(value_to_slot_index(32), 2);
        assert_eq!(value_to_slot_index(33), 2);
        assert_eq!(value_to_slot_index(63), 2);
        assert_eq!(value_to_slot_index(64), 3);
        assert_eq!(value_to_slot_index(4095), 8);
        assert_eq!(value_to_slot_index(4096), 9);
        assert_eq!(value_to_slot_index(10_000), 9);
        assert_eq!(value_to_slot_index(i64::MAX), 9);
    }

    #[test]
    fn slot_index_matches_bounds_table_exhaustively() {
        for (slot, &(from, to)) in SLOT_BOUNDS.iter().enumerate() {
            let lo = from.max(0);
            let hi = to.min(MAX_SLOT_VALUE + 100);
            for v in lo..=hi {
                assert_eq!(
                    value_to_slot_index(v),
                    slot,
                    "value {v} should land in slot {slot}"
                );
            }
        }
    }

    #[test]
    fn record_single_value() {
        let h = LatencyHistogram::new();
        h.record(100);

        assert_eq!(h.count_at(3), 1);
        assert_eq!(h.sum_at(3), 100);
        assert_eq!(h.total_count(), 1);
        assert_eq!(h.total_sum(), 100);
        assert_eq!(h.min_value(), 100);
        assert_eq!(h.max_value(), 100);
        assert!(h.max_reached_unix_ms() > 0);
    }

    #[test]
    fn negative_and_huge_values_saturate() {
        let h = LatencyHistogram::new();
        h.record(-50);
        h.record(1_000_000);

        assert_eq!(h.count_at(0), 1);
        assert_eq!(h.sum_at(0), -50);
        assert_eq!(h.count_at(9), 1);
        assert_eq!(h.sum_at(9), 1_000_000);
        assert_eq!(h.min_value(), -50);
        assert_eq!(h.max_value(), 1_000_000);
    }

    #[test]
    fn average_is_zero_when_empty() {
        let h = LatencyHistogram::new();
        assert_eq!(h.average(), 0.0);
        assert_eq!(h.total_count(), 0);
    }

    #[test]
    fn average_over_mixed_slots() {
        let h = LatencyHistogram::new();
        h.record(10);
        h.record(20);
        h.record(600);

        assert_eq!(h.total_count(), 3);
        assert_eq!(h.total_sum(), 630);
        assert_eq!(h.average(), 210.0);
    }

    #[test]
    fn max_site_records_a_trace() {
        let h = LatencyHistogram::new();
        assert!(h.max_site().is_none());
        h.record(42);
        let site = h.max_site().expect("site recorded with new max");
        assert!(!site.is_empty());

        // A smaller value must not disturb the max provenance.
        let stamp = h.max_reached_unix_ms();
        h.record(1);
        assert_eq!(h.max_value(), 42);
        assert_eq!(h.max_reached_unix_ms(), stamp);
    }

    #[test]
    fn merge_adds_all_slots() {
        let a = LatencyHistogram::new();
        a.record(5);
        a.record(100);
        let b = LatencyHistogram::new();
        b.record(100);
        b.record(5000);

        a.merge(&b);
        assert_eq!(a.count_at(1), 1);
        assert_eq!(a.count_at(3), 2);
        assert_eq!(a.count_at(9), 1);
        assert_eq!(a.total_count(), 4);
        assert_eq!(a.total_sum(), 5 + 100 + 100 + 5000);
    }

    #[test]
    fn clear_resets_everything() {
        let h = LatencyHistogram::new();
        h.record(64);
        h.record(7000);
        h.clear();

        assert_eq!(h.total_count(), 0);
        assert_eq!(h.total_sum(), 0);
        assert_eq!(h.min_value(), i64::MAX);
        assert_eq!(h.max_value(), i64::MIN);
        assert_eq!(h.max_reached_unix_ms(), 0);
        assert!(h.max_site().is_none());
    }

    #[test]
    fn clone_is_a_deep_snapshot() {
        let h = LatencyHistogram::new();
        h.record(50);
        let snap = h.clone();
        h.record(50);

        assert_eq!(snap.total_count(), 1);
        assert_eq!(h.total_count(), 2);
        assert_eq!(snap.min_value(), 50);
        assert_eq!(snap.max_value(), 50);
    }

    #[test]
    fn cumulative_prefix_law() {
        let h = LatencyHistogram::new();
        for v in [0, 1, 31, 32, 100, 600, 1500, 3000, 5000, 5000] {
            h.record(v);
        }

        let counts = h.cumulative_counts();
        let sums = h.cumulative_sums();
        for i in 1..SLOT_LEN {
            assert_eq!(counts[i], counts[i - 1] + h.count_at(i));
            assert_eq!(sums[i], sums[i - 1] + h.sum_at(i));
        }
        assert_eq!(counts[SLOT_LEN - 1], h.total_count());
        assert_eq!(sums[SLOT_LEN - 1], h.total_sum());
    }

    #[test]
    fn count_changed_since_detects_any_slot() {
        let a = LatencyHistogram::new();
        let b = LatencyHistogram::new();
        assert!(!a.count_changed_since(&b));
        a.record(10);
        assert!(a.count_changed_since(&b));
        b.record(10);
        assert!(!a.count_changed_since(&b));
    }

    #[test]
    fn slot_snapshot_carries_bounds() {
        let h = LatencyHistogram::new();
        h.record(40);
        let slot = h.slot(2);
        assert_eq!(slot.from, 32);
        assert_eq!(slot.to, 63);
        assert_eq!(slot.count, 1);
        assert_eq!(slot.sum, 40);

        let slots = h.slots();
        assert_eq!(slots[9].from, 4096);
        assert_eq!(slots[9].to, i64::MAX);
    }
}
