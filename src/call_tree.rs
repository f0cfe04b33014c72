//! Hierarchical rollup of per-call-path statistics.
//!
//! Each [`CallTreeNode`] aggregates one call path (`root > svc:a > svc:b`)
//! and holds an insertion-ordered, copy-on-write child map. Reads are
//! lock-free (`ArcSwap` load); structural writes clone the map under a
//! narrow mutex, so the rare first-visit of a path never stalls readers on
//! the hot measurement path.
//!
//! [`StatsTreeListener`] bridges the stack and the tree: registered on a
//! [`CallStack`] (usually globally, via the tracer facade), it resolves the
//! tree node for each pushed frame and feeds pending/latency updates into
//! that node's [`CallStats`].

use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::call_stack::{CallFrame, CallStack};
use crate::call_stats::CallStats;
use crate::listener::CallStackListener;
use crate::snapshot::CallTreeNodeSnapshot;

type ChildMap = IndexMap<String, Arc<CallTreeNode>>;

/// One node of the statistics tree: a name, aggregated [`CallStats`], and an
/// ordered copy-on-write child map.
#[derive(Debug)]
pub struct CallTreeNode {
    name: String,
    parent: Weak<CallTreeNode>,
    stats: CallStats,
    children: ArcSwap<ChildMap>,
    /// Serializes structural writes only; readers never take it.
    write_lock: Mutex<()>,
}

impl CallTreeNode {
    /// A fresh root node.
    pub fn new_root() -> Arc<Self> {
        Arc::new(Self {
            name: "root".to_owned(),
            parent: Weak::new(),
            stats: CallStats::new(),
            children: ArcSwap::from_pointee(ChildMap::new()),
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.parent.upgrade().is_none()
    }

    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    /// Look up a child without creating it. Lock-free.
    pub fn child(&self, name: &str) -> Option<Arc<CallTreeNode>> {
        self.children.load().get(name).cloned()
    }

    /// Children in insertion order. Lock-free snapshot of the current map.
    pub fn children(&self) -> Vec<Arc<CallTreeNode>> {
        self.children.load().values().cloned().collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.load().len()
    }

    /// Find the child named `name`, creating it on first visit.
    ///
    /// The fast path is a lock-free map load. On a miss the writer lock is
    /// taken and the lookup repeated: a racing creator may have published
    /// the child between the load and the lock, and the first insert must
    /// win so every caller shares one node.
    pub fn find_or_create_child(self: &Arc<Self>, name: &str) -> Arc<CallTreeNode> {
        if let Some(child) = self.children.load().get(name) {
            return child.clone();
        }

        let _guard = self.write_lock.lock();
        if let Some(child) = self.children.load().get(name) {
            return child.clone();
        }

        let child = Arc::new(CallTreeNode {
            name: name.to_owned(),
            parent: Arc::downgrade(self),
            stats: CallStats::new(),
            children: ArcSwap::from_pointee(ChildMap::new()),
            write_lock: Mutex::new(()),
        });
        let mut next: ChildMap = (**self.children.load()).clone();
        next.insert(name.to_owned(), child.clone());
        self.children.store(Arc::new(next));
        child
    }

    /// Walk (creating as needed) the path of child names below this node.
    pub fn find_or_create_path<I, S>(self: &Arc<Self>, path: I) -> Arc<CallTreeNode>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut node = self.clone();
        for name in path {
            node = node.find_or_create_child(name.as_ref());
        }
        node
    }

    /// Node names from the root down to this node, root included.
    pub fn path(&self) -> Vec<String> {
        let mut path = vec![self.name.clone()];
        let mut parent = self.parent.upgrade();
        while let Some(node) = parent {
            path.push(node.name.clone());
            parent = node.parent.upgrade();
        }
        path.reverse();
        path
    }

    /// `root > svc:a > svc:b` rendering of [`Self::path`].
    pub fn path_string(&self) -> String {
        self.path().join(" > ")
    }

    /// Add another tree's stats into this one, creating missing children.
    /// `src` may be mutated concurrently; each node is merged as seen.
    pub fn merge_recursive(self: &Arc<Self>, src: &Arc<CallTreeNode>) {
        self.stats.merge(&src.stats);
        for src_child in src.children.load().values() {
            self.find_or_create_child(&src_child.name)
                .merge_recursive(src_child);
        }
    }

    /// Add a transported snapshot's stats into this live tree.
    pub fn merge_snapshot(self: &Arc<Self>, src: &CallTreeNodeSnapshot) {
        src.stats.merge_into(&self.stats);
        for src_child in &src.children {
            self.find_or_create_child(&src_child.name)
                .merge_snapshot(src_child);
        }
    }

    /// Reset this node's stats and atomically replace its child map with an
    /// empty one, under the same writer lock creation uses. Child nodes
    /// already handed out stay valid (with their stats); only navigation
    /// from this node changes.
    pub fn clear(&self) {
        self.stats.clear();
        let _guard = self.write_lock.lock();
        self.children.store(Arc::new(ChildMap::new()));
    }

    /// Drain this node into `dest` (stats added, not overwritten): merge and
    /// reset the stats, detach the child map, and recurse into the detached
    /// children so their data lands in `dest` too. Used by periodic
    /// export-and-reset collectors where `dest` accumulates across cycles.
    /// Not atomic as a whole; updates racing the drain land on one side or
    /// the other.
    pub fn clear_and_copy_to(self: &Arc<Self>, dest: &Arc<CallTreeNode>) {
        dest.stats.merge(&self.stats);
        self.stats.clear();
        let detached = {
            let _guard = self.write_lock.lock();
            self.children.swap(Arc::new(ChildMap::new()))
        };
        for src_child in detached.values() {
            src_child.clear_and_copy_to(&dest.find_or_create_child(&src_child.name));
        }
    }
}

/// Feeds pushed/popped frames into a statistics tree.
///
/// Shared across all per-thread stacks (register it as a global listener):
/// every method takes `&self` and all tree mutation is lock-free or behind
/// the tree's own narrow writer lock.
#[derive(Debug)]
pub struct StatsTreeListener {
    root: Arc<CallTreeNode>,
}

impl StatsTreeListener {
    pub fn new(root: Arc<CallTreeNode>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Arc<CallTreeNode> {
        &self.root
    }

    /// Resolve the tree node for `frame`'s position on `stack`. The stack's
    /// permanent root frame maps to the tree root itself. The frame's own
    /// name is taken from `frame` directly: during `on_pop` the stack has
    /// already retreated past it, so only the ancestors are read off the
    /// active path.
    fn node_for(&self, stack: &CallStack, frame: &CallFrame) -> Arc<CallTreeNode> {
        let mut node = self.root.clone();
        for depth in 1..frame.depth() {
            node = node.find_or_create_child(stack.frame_at(depth).qualified_name());
        }
        node.find_or_create_child(frame.qualified_name())
    }
}

impl CallStackListener for StatsTreeListener {
    fn on_push(&self, stack: &CallStack, frame: &CallFrame) {
        if frame.depth() == 0 {
            return;
        }
        let start = frame.start_times();
        self.node_for(stack, frame)
            .stats()
            .add_pending(start.wall_ns, start.cpu_ns);
    }

    fn on_pop(&self, stack: &CallStack, frame: &CallFrame) {
        if frame.depth() == 0 {
            return;
        }
        let start = frame.start_times();
        let end = frame.end_times();
        self.node_for(stack, frame).stats().record_and_remove_pending(
            start.wall_ns,
            start.user_ns,
            start.cpu_ns,
            end.wall_ns,
            end.user_ns,
            end.cpu_ns,
        );
    }
}
