//! Listener contract for call-stack events.
//!
//! Listeners observe push/pop/progress/log events on one stack, plus
//! attach/detach notifications when a stack is handed between threads. All
//! methods default to no-ops so implementations override only what they need.
//!
//! Fan-out is fire-and-forget: a panicking listener is caught, logged, and
//! discarded. Instrumentation must never abort the call path it observes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::Thread;

use serde_json::Value;

use crate::call_stack::{CallFrame, CallStack};

/// Observer of one [`CallStack`]'s events.
///
/// Implementations must be `Send + Sync`: the same listener instance is
/// typically registered on many per-thread stacks.
#[allow(unused_variables)]
pub trait CallStackListener: Send + Sync {
    fn on_push(&self, stack: &CallStack, frame: &CallFrame) {}

    fn on_pop(&self, stack: &CallStack, frame: &CallFrame) {}

    fn on_progress_step(&self, stack: &CallStack, frame: &CallFrame, incr: u32, message: &str) {}

    fn on_log(&self, message: &str, named_values: &HashMap<String, Value>) {}

    fn on_attach_to_thread(&self, stack: &CallStack, thread: &Thread) {}

    fn on_detach_from_thread(&self, stack: &CallStack, thread: &Thread) {}
}

/// Registered listeners of one stack, with panic-isolating dispatch.
///
/// Owned by the stack, so registration goes through `&mut` and dispatch is a
/// plain slice walk; no synchronization is needed inside a single stack.
#[derive(Default)]
pub(crate) struct ListenerSupport {
    listeners: Vec<Arc<dyn CallStackListener>>,
}

impl ListenerSupport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, listener: Arc<dyn CallStackListener>) {
        self.listeners.push(listener);
    }

    /// Remove a previously added listener, matched by pointer identity.
    pub(crate) fn remove(&mut self, listener: &Arc<dyn CallStackListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn fire_on_push(&self, stack: &CallStack, frame: &CallFrame) {
        for listener in &self.listeners {
            guard_listener("on_push", || listener.on_push(stack, frame));
        }
    }

    pub(crate) fn fire_on_pop(&self, stack: &CallStack, frame: &CallFrame) {
        for listener in &self.listeners {
            guard_listener("on_pop", || listener.on_pop(stack, frame));
        }
    }

    pub(crate) fn fire_on_progress_step(
        &self,
        stack: &CallStack,
        frame: &CallFrame,
        incr: u32,
        message: &str,
    ) {
        for listener in &self.listeners {
            guard_listener("on_progress_step", || {
                listener.on_progress_step(stack, frame, incr, message);
            });
        }
    }

    pub(crate) fn fire_on_log(&self, message: &str, named_values: &HashMap<String, Value>) {
        for listener in &self.listeners {
            guard_listener("on_log", || listener.on_log(message, named_values));
        }
    }

    pub(crate) fn fire_on_attach_to_thread(&self, stack: &CallStack, thread: &Thread) {
        for listener in &self.listeners {
            guard_listener("on_attach_to_thread", || {
                listener.on_attach_to_thread(stack, thread);
            });
        }
    }

    pub(crate) fn fire_on_detach_from_thread(&self, stack: &CallStack, thread: &Thread) {
        for listener in &self.listeners {
            guard_listener("on_detach_from_thread", || {
                listener.on_detach_from_thread(stack, thread);
            });
        }
    }
}

impl std::fmt::Debug for ListenerSupport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSupport")
            .field("len", &self.listeners.len())
            .finish()
    }
}

/// Run one listener callback, swallowing (and logging) any panic.
fn guard_listener(event: &str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let detail = panic_message(&panic);
        tracing::error!(event, detail, "call-stack listener panicked; event dropped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_stack::CallStack;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        pushes: AtomicUsize,
        pops: AtomicUsize,
    }

    impl CallStackListener for CountingListener {
        fn on_push(&self, _stack: &CallStack, _frame: &CallFrame) {
            self.pushes.fetch_add(1, Ordering::Relaxed);
        }
        fn on_pop(&self, _stack: &CallStack, _frame: &CallFrame) {
            self.pops.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct PanickingListener;

    impl CallStackListener for PanickingListener {
        fn on_push(&self, _stack: &CallStack, _frame: &CallFrame) {
            panic!("listener bug");
        }
    }

    #[test]
    fn listeners_observe_push_and_pop() {
        let counter = Arc::new(CountingListener {
            pushes: AtomicUsize::new(0),
            pops: AtomicUsize::new(0),
        });
        let mut stack = CallStack::new();
        stack.add_listener(counter.clone());

        let popper = stack.pusher("svc", "work").push();
        stack.pop(popper);

        assert_eq!(counter.pushes.load(Ordering::Relaxed), 1);
        assert_eq!(counter.pops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_listener_does_not_abort_the_call_path() {
        let counter = Arc::new(CountingListener {
            pushes: AtomicUsize::new(0),
            pops: AtomicUsize::new(0),
        });
        let mut stack = CallStack::new();
        stack.add_listener(Arc::new(PanickingListener));
        stack.add_listener(counter.clone());

        let popper = stack.pusher("svc", "work").push();
        stack.pop(popper);

        // The panicking listener is isolated; later listeners still fire.
        assert_eq!(counter.pushes.load(Ordering::Relaxed), 1);
        assert_eq!(counter.pops.load(Ordering::Relaxed), 1);
        assert_eq!(stack.current_depth(), 0);
    }

    #[test]
    fn remove_listener_by_identity() {
        let counter = Arc::new(CountingListener {
            pushes: AtomicUsize::new(0),
            pops: AtomicUsize::new(0),
        });
        let mut stack = CallStack::new();
        let as_dyn: Arc<dyn CallStackListener> = counter.clone();
        stack.add_listener(as_dyn.clone());
        stack.remove_listener(&as_dyn);

        let popper = stack.pusher("svc", "work").push();
        stack.pop(popper);
        assert_eq!(counter.pushes.load(Ordering::Relaxed), 0);
    }
}
