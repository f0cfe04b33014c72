//! Per-thread call stack: an arena of reusable frame slots with a push/pop
//! state machine.
//!
//! One `CallStack` is owned by exactly one thread at a time (typically via
//! the thread-local facade in [`crate::tracer`]), so frame mutation needs no
//! locking. Frame slots are allocated once per depth and reused across many
//! push/pop cycles; a push overwrites the slot's identity and parameter maps
//! instead of allocating a fresh frame.
//!
//! ```text
//!                        <-\
//!                            pusher("scope","meth").push()
//!   +------------------+
//!   | frame   curr     |   <-- current stack position
//!   +------------------+
//!   |                        pop(popper)
//!   |  ..               <-/
//!   +------------------+
//!   | frame 1          |
//!   +------------------+
//!   | frame 0 (root)   |      permanent, never popped
//!   +------------------+
//! ```
//!
//! Depth 0 is a permanent root frame. The slot array grows by a fixed
//! increment when a push targets an unallocated depth and never shrinks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::Thread;

use serde_json::Value;

use crate::clock;
use crate::listener::{CallStackListener, ListenerSupport};

/// Initial number of preallocated frame slots (including the root).
const INITIAL_STACK_LEN: usize = 10;

/// How many slots are added when a push outgrows the arena.
const GROW_INCREMENT: usize = 5;

/// Reserved parameter key for return values.
pub const RETURN_PARAM: &str = "return";

/// Wall / thread-user / thread-cpu timestamps captured together, in
/// nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimes {
    pub wall_ns: u64,
    pub user_ns: u64,
    pub cpu_ns: u64,
}

impl FrameTimes {
    /// Read all three clocks once. Hot path: exactly one read per clock.
    fn now() -> Self {
        Self {
            wall_ns: clock::wall_now_ns(),
            user_ns: clock::thread_user_now_ns(),
            cpu_ns: clock::thread_cpu_now_ns(),
        }
    }
}

/// One stack slot. Reused across push/pop cycles for its depth; all fields
/// other than progress are settled when a push commits and stay immutable
/// until the matching pop.
#[derive(Debug)]
pub struct CallFrame {
    depth: usize,

    scope: String,
    name: String,
    /// `scope:name`, cached at push so listeners can read it without
    /// re-formatting on every event.
    qualified: String,

    params: HashMap<String, Value>,
    inheritable_props: HashMap<String, Value>,
    /// Resolved view: ancestors' inherited properties plus this frame's own
    /// inheritable properties (own values win). Computed eagerly when the
    /// push commits; the parent's view is already final at that point.
    inherited_props: HashMap<String, Value>,

    start: FrameTimes,
    end: FrameTimes,

    progress_expected_count: u32,
    progress_index: u32,
    progress_message: Option<String>,
}

impl CallFrame {
    fn new_slot(depth: usize) -> Self {
        Self {
            depth,
            scope: String::new(),
            name: String::new(),
            qualified: String::new(),
            params: HashMap::new(),
            inheritable_props: HashMap::new(),
            inherited_props: HashMap::new(),
            start: FrameTimes::default(),
            end: FrameTimes::default(),
            progress_expected_count: 0,
            progress_index: 0,
            progress_message: None,
        }
    }

    /// Reset this slot for a fresh push: new identity, empty maps.
    fn reset_for_push(&mut self, scope: &str, name: &str) {
        self.scope.clear();
        self.scope.push_str(scope);
        self.name.clear();
        self.name.push_str(name);
        self.qualified.clear();
        if !scope.is_empty() {
            self.qualified.push_str(scope);
            self.qualified.push(':');
        }
        self.qualified.push_str(name);
        self.params.clear();
        self.inheritable_props.clear();
        self.inherited_props.clear();
        self.progress_expected_count = 0;
        self.progress_index = 0;
        self.progress_message = None;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `scope:name` identity, or just `name` for scope-less frames (root).
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn inheritable_props(&self) -> &HashMap<String, Value> {
        &self.inheritable_props
    }

    /// This frame's resolved inherited-property view (own + ancestors).
    pub fn inherited_props(&self) -> &HashMap<String, Value> {
        &self.inherited_props
    }

    pub fn start_times(&self) -> FrameTimes {
        self.start
    }

    pub fn end_times(&self) -> FrameTimes {
        self.end
    }

    /// Wall-elapsed nanoseconds; meaningful after the frame is popped.
    pub fn elapsed_ns(&self) -> u64 {
        self.end.wall_ns.wrapping_sub(self.start.wall_ns)
    }

    pub fn progress_expected_count(&self) -> u32 {
        self.progress_expected_count
    }

    pub fn progress_index(&self) -> u32 {
        self.progress_index
    }

    pub fn progress_message(&self) -> Option<&str> {
        self.progress_message.as_deref()
    }
}

/// Release token for one active frame, produced by
/// [`FramePusher::push`]. Single use: hand it back to [`CallStack::pop`] on
/// every exit path, and do not retain it past that.
#[derive(Debug)]
#[must_use = "an unpopped frame corrupts all enclosing measurements"]
pub struct FramePopper {
    pub(crate) depth: usize,
}

/// Builder bound to the next not-yet-active frame slot. Configure identity,
/// parameters, and inheritable properties, then commit with [`Self::push`].
#[derive(Debug)]
pub struct FramePusher<'s> {
    stack: &'s mut CallStack,
    depth: usize,
}

impl FramePusher<'_> {
    pub fn with_param(self, name: &str, value: impl Into<Value>) -> Self {
        self.stack.frames[self.depth]
            .params
            .insert(name.to_owned(), value.into());
        self
    }

    pub fn with_inheritable_prop(self, name: &str, value: impl Into<Value>) -> Self {
        self.stack.frames[self.depth]
            .inheritable_props
            .insert(name.to_owned(), value.into());
        self
    }

    pub fn with_progress_expected_count(self, count: u32) -> Self {
        self.stack.frames[self.depth].progress_expected_count = count;
        self
    }

    /// Commit: capture start timestamps, advance the stack, notify
    /// listeners, and return the release token.
    pub fn push(self) -> FramePopper {
        self.stack.commit_push(self.depth, false)
    }

    /// Commit, but copy start timestamps from the parent frame instead of
    /// reading the clocks. Used for synthetic frames (e.g. recording an
    /// error) whose elapsed time should read "since the enclosing call
    /// began".
    pub fn push_with_parent_start_time(self) -> FramePopper {
        self.stack.commit_push(self.depth, true)
    }
}

/// Per-thread stack of reusable [`CallFrame`] slots.
#[derive(Debug)]
pub struct CallStack {
    frames: Vec<CallFrame>,
    curr_depth: usize,
    listeners: ListenerSupport,
}

impl CallStack {
    pub fn new() -> Self {
        let mut frames = Vec::with_capacity(INITIAL_STACK_LEN);
        for depth in 0..INITIAL_STACK_LEN {
            frames.push(CallFrame::new_slot(depth));
        }
        frames[0].reset_for_push("", "root");
        Self {
            frames,
            curr_depth: 0,
            listeners: ListenerSupport::new(),
        }
    }

    /// The currently active frame. Depth 0 (the root) when nothing is
    /// pushed.
    pub fn current(&self) -> &CallFrame {
        &self.frames[self.curr_depth]
    }

    pub fn current_depth(&self) -> usize {
        self.curr_depth
    }

    /// Number of allocated frame slots (grows, never shrinks).
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// The frame slot at `depth`.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is beyond the currently active path.
    pub fn frame_at(&self, depth: usize) -> &CallFrame {
        assert!(
            depth <= self.curr_depth,
            "frame_at({depth}) beyond active depth {}",
            self.curr_depth
        );
        &self.frames[depth]
    }

    /// Qualified names from the root down to `depth`, inclusive.
    pub fn path_at(&self, depth: usize) -> Vec<String> {
        (0..=depth)
            .map(|d| self.frame_at(d).qualified_name().to_owned())
            .collect()
    }

    /// Qualified names from the root down to the current frame.
    pub fn current_path(&self) -> Vec<String> {
        self.path_at(self.curr_depth)
    }

    pub fn add_listener(&mut self, listener: Arc<dyn CallStackListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn CallStackListener>) {
        self.listeners.remove(listener);
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    /// Begin a push: bind a builder to the slot above the current frame,
    /// growing the arena if that depth has never been reached.
    pub fn pusher(&mut self, scope: &str, name: &str) -> FramePusher<'_> {
        let depth = self.curr_depth + 1;
        self.ensure_slot(depth);
        self.frames[depth].reset_for_push(scope, name);
        FramePusher { stack: self, depth }
    }

    fn ensure_slot(&mut self, depth: usize) {
        while self.frames.len() <= depth {
            let base = self.frames.len();
            self.frames.reserve(GROW_INCREMENT);
            for d in base..base + GROW_INCREMENT {
                self.frames.push(CallFrame::new_slot(d));
            }
        }
    }

    fn commit_push(&mut self, depth: usize, inherit_parent_start: bool) -> FramePopper {
        debug_assert_eq!(depth, self.curr_depth + 1);

        // Resolve inherited properties eagerly: the parent's view is final
        // for the whole lifetime of this frame.
        let (below, above) = self.frames.split_at_mut(depth);
        let parent = &below[depth - 1];
        let frame = &mut above[0];
        frame
            .inherited_props
            .extend(parent.inherited_props.iter().map(|(k, v)| (k.clone(), v.clone())));
        let (inherited, own) = (&mut frame.inherited_props, &frame.inheritable_props);
        for (k, v) in own {
            inherited.insert(k.clone(), v.clone());
        }

        frame.start = if inherit_parent_start {
            parent.start
        } else {
            FrameTimes::now()
        };
        frame.end = FrameTimes::default();

        self.curr_depth = depth;
        self.listeners.fire_on_push(self, &self.frames[depth]);
        FramePopper { depth }
    }

    /// Release the current frame: capture end timestamps, retreat to the
    /// parent, and notify listeners.
    ///
    /// # Panics
    ///
    /// Panics if `popper` does not belong to the current frame (pop without
    /// a matching push, or out-of-order release). This is a precondition
    /// violation: tolerating it would leave the current-frame pointer
    /// inconsistent and corrupt every later measurement on this stack.
    pub fn pop(&mut self, popper: FramePopper) {
        assert!(
            popper.depth == self.curr_depth && self.curr_depth > 0,
            "call stack pop mismatch: token for depth {} but current depth is {}",
            popper.depth,
            self.curr_depth
        );
        let depth = popper.depth;
        let frame = &mut self.frames[depth];
        frame.end = FrameTimes::now();
        frame.progress_expected_count = 0;
        frame.progress_index = 0;
        frame.progress_message = None;

        self.curr_depth = depth - 1;
        self.listeners.fire_on_pop(self, &self.frames[depth]);
    }

    /// Advance the current frame's progress and notify listeners. Does not
    /// touch timing.
    pub fn progress_step(&mut self, incr: u32, message: &str) {
        self.progress_step_at(self.curr_depth, incr, message);
    }

    /// Advance the progress of the active frame at `depth`. Release handles
    /// bound to an enclosing frame use this so their updates do not land on
    /// a nested call.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is beyond the currently active path.
    pub fn progress_step_at(&mut self, depth: usize, incr: u32, message: &str) {
        assert!(
            depth <= self.curr_depth,
            "progress_step_at({depth}) beyond active depth {}",
            self.curr_depth
        );
        let frame = &mut self.frames[depth];
        frame.progress_index += incr;
        frame.progress_message = Some(message.to_owned());
        self.listeners
            .fire_on_progress_step(self, &self.frames[depth], incr, message);
    }

    /// Attach a late-bound parameter (e.g. a return value under
    /// [`RETURN_PARAM`]) to the current frame.
    pub fn set_param(&mut self, name: &str, value: impl Into<Value>) {
        self.set_param_at(self.curr_depth, name, value);
    }

    /// Attach a late-bound parameter to the active frame at `depth`.
    ///
    /// # Panics
    ///
    /// Panics if `depth` is beyond the currently active path.
    pub fn set_param_at(&mut self, depth: usize, name: &str, value: impl Into<Value>) {
        assert!(
            depth <= self.curr_depth,
            "set_param_at({depth}) beyond active depth {}",
            self.curr_depth
        );
        self.frames[depth].params.insert(name.to_owned(), value.into());
    }

    /// Record an error against the current call: pushes a synthetic child
    /// frame named `error-<kind>` with the parent's start time and pops it
    /// immediately, so its elapsed time reads "since the enclosing call
    /// began".
    pub fn record_error_frame(&mut self, kind: &str, detail: impl Into<Value>) {
        let scope = self.current().scope().to_owned();
        let name = format!("error-{kind}");
        let popper = self
            .pusher(&scope, &name)
            .with_param("error", detail)
            .push_with_parent_start_time();
        self.pop(popper);
    }

    /// Fire `on_log` on all listeners of this stack.
    pub fn log_event(&self, message: &str, named_values: &HashMap<String, Value>) {
        self.listeners.fire_on_log(message, named_values);
    }

    pub(crate) fn fire_attach_to_thread(&self, thread: &Thread) {
        self.listeners.fire_on_attach_to_thread(self, thread);
    }

    pub(crate) fn fire_detach_from_thread(&self, thread: &Thread) {
        self.listeners.fire_on_detach_from_thread(self, thread);
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}
