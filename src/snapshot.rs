//! Export DTOs: point-in-time, serde-serializable copies of live statistics.
//!
//! Snapshots are plain owned data, safe to hand to collectors, serialize to
//! JSON, and merge back into a live tree on the receiving side. Histograms
//! travel in cumulative (prefix-summed) form: slot `i` holds the total for
//! slots `0..=i`, so slot 9 is the grand total and a consumer that only wants
//! totals reads one cell. Per-slot values are recovered by differencing.
//!
//! A snapshot taken while recorders are running is internally consistent per
//! atomic cell, not across cells; transient off-by-one-call skews are part of
//! the contract, same as for live reads.

use serde::{Deserialize, Serialize};

use crate::call_stats::CallStats;
use crate::call_tree::CallTreeNode;
use crate::clock;
use crate::error::SnapshotError;
use crate::histogram::{LatencyHistogram, SLOT_LEN};
use crate::pending::PendingCounter;

/// One histogram in cumulative form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeHistogramSnapshot {
    pub cumulative_counts: [u64; SLOT_LEN],
    pub cumulative_sums: [i64; SLOT_LEN],
}

impl CumulativeHistogramSnapshot {
    pub fn from_histogram(src: &LatencyHistogram) -> Self {
        Self {
            cumulative_counts: src.cumulative_counts(),
            cumulative_sums: src.cumulative_sums(),
        }
    }

    /// Grand total count (cumulative slot 9).
    pub fn total_count(&self) -> u64 {
        self.cumulative_counts[SLOT_LEN - 1]
    }

    /// Grand total sum (cumulative slot 9).
    pub fn total_sum(&self) -> i64 {
        self.cumulative_sums[SLOT_LEN - 1]
    }

    /// Per-slot count, recovered by differencing the prefix sums. Decoded
    /// input may violate the prefix-sum invariant, so a non-monotone pair
    /// clamps to zero instead of underflowing.
    pub fn count_at(&self, index: usize) -> u64 {
        if index == 0 {
            self.cumulative_counts[0]
        } else {
            self.cumulative_counts[index].saturating_sub(self.cumulative_counts[index - 1])
        }
    }

    /// Per-slot sum, recovered by differencing the prefix sums. Cumulative
    /// sums are not monotone (slot 0 can be negative), so the difference is
    /// plain signed arithmetic; wrapping guards the overflow edge on
    /// decoded input.
    pub fn sum_at(&self, index: usize) -> i64 {
        if index == 0 {
            self.cumulative_sums[0]
        } else {
            self.cumulative_sums[index].wrapping_sub(self.cumulative_sums[index - 1])
        }
    }

    /// Add this snapshot's per-slot data into a live histogram.
    pub fn merge_into(&self, dest: &LatencyHistogram) {
        for i in 0..SLOT_LEN {
            dest.add_slot(i, self.count_at(i), self.sum_at(i));
        }
    }
}

/// In-flight counter state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub pending_count: i64,
    pub pending_sum_start_ns: u64,
    pub pending_sum_start_cpu_ns: u64,
}

impl PendingSnapshot {
    pub fn from_counter(src: &PendingCounter) -> Self {
        Self {
            pending_count: src.pending_count(),
            pending_sum_start_ns: src.pending_sum_start_ns(),
            pending_sum_start_cpu_ns: src.pending_sum_start_cpu_ns(),
        }
    }

    pub fn merge_into(&self, dest: &PendingCounter) {
        dest.add_raw(
            self.pending_count,
            self.pending_sum_start_ns,
            self.pending_sum_start_cpu_ns,
        );
    }
}

/// One [`CallStats`] bundle: pending counter plus the three histograms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStatsSnapshot {
    pub pending: PendingSnapshot,
    pub elapsed: CumulativeHistogramSnapshot,
    pub user: CumulativeHistogramSnapshot,
    pub cpu: CumulativeHistogramSnapshot,
}

impl CallStatsSnapshot {
    pub fn from_stats(src: &CallStats) -> Self {
        Self {
            pending: PendingSnapshot::from_counter(src.pending()),
            elapsed: CumulativeHistogramSnapshot::from_histogram(src.elapsed()),
            user: CumulativeHistogramSnapshot::from_histogram(src.thread_user()),
            cpu: CumulativeHistogramSnapshot::from_histogram(src.thread_cpu()),
        }
    }

    pub fn merge_into(&self, dest: &CallStats) {
        self.pending.merge_into(dest.pending());
        self.elapsed.merge_into(dest.elapsed());
        self.user.merge_into(dest.thread_user());
        self.cpu.merge_into(dest.thread_cpu());
    }
}

/// One tree node with its children, in the tree's insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTreeNodeSnapshot {
    pub name: String,
    pub stats: CallStatsSnapshot,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<CallTreeNodeSnapshot>,
}

impl CallTreeNodeSnapshot {
    /// Deep copy of a live subtree.
    pub fn from_node(src: &CallTreeNode) -> Self {
        Self {
            name: src.name().to_owned(),
            stats: CallStatsSnapshot::from_stats(src.stats()),
            children: src
                .children()
                .iter()
                .map(|child| Self::from_node(child))
                .collect(),
        }
    }

    /// Total completed-call count of this node (elapsed histogram total).
    pub fn call_count(&self) -> u64 {
        self.stats.elapsed.total_count()
    }
}

/// A full tree export with its collection window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTreeSnapshot {
    /// Collector-assigned name (e.g. host or process identity).
    pub name: String,
    /// Unix millis when the covered window began.
    pub taken_from_unix_ms: u64,
    /// Unix millis when the snapshot was taken.
    pub taken_to_unix_ms: u64,
    pub root: CallTreeNodeSnapshot,
}

impl CallTreeSnapshot {
    /// Capture a live tree now, covering the window since `from_unix_ms`.
    pub fn capture(name: &str, root: &CallTreeNode, from_unix_ms: u64) -> Self {
        Self {
            name: name.to_owned(),
            taken_from_unix_ms: from_unix_ms,
            taken_to_unix_ms: clock::unix_now_ms(),
            root: CallTreeNodeSnapshot::from_node(root),
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::Encode)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(json).map_err(SnapshotError::Decode)
    }
}
