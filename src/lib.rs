//! Perfstack - In-process call-stack instrumentation and statistics
//!
//! Application code marks call entry/exit through a thread-local tracer;
//! each active call is a frame carrying timing, parameters, and inherited
//! properties, and listeners aggregate completed calls into lock-free
//! per-call-path statistics (logarithmic latency histograms, in-flight
//! counts, hierarchical rollup trees) without ever locking the measurement
//! path.

pub mod call_stack;
pub mod call_stats;
pub mod call_tree;
pub mod clock;
pub mod error;
pub mod histogram;
pub mod listener;
pub mod pending;
pub mod snapshot;
pub mod tracer;

pub use call_stack::{CallFrame, CallStack, FramePopper, FramePusher, FrameTimes};
pub use call_stats::CallStats;
pub use call_tree::{CallTreeNode, StatsTreeListener};
pub use error::SnapshotError;
pub use histogram::LatencyHistogram;
pub use listener::CallStackListener;
pub use pending::PendingCounter;
pub use snapshot::{CallStatsSnapshot, CallTreeNodeSnapshot, CallTreeSnapshot};
pub use tracer::{tracer, ScopedCall, Tracer};
