//! Thread-local instrumentation facade.
//!
//! Application code does not manage [`CallStack`]s directly; it goes through
//! a [`Tracer`] bound to a scope name:
//!
//! ```
//! use perfstack::tracer;
//!
//! fn handle_request() {
//!     let call = tracer("web").meth("handle_request").with_param("route", "/users").push();
//!     // ... work ...
//!     call.close();
//! }
//! ```
//!
//! Each thread lazily owns one stack, created on first use with all global
//! listeners attached. [`ScopedCall`] is an RAII guard: dropping it releases
//! the frame, so early returns and panics cannot leave the stack unbalanced.
//!
//! Listener callbacks run while the thread-local stack is borrowed, so a
//! listener must not call back into this facade on the same thread.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::Level;

use crate::call_stack::{CallStack, FramePopper, RETURN_PARAM};
use crate::clock;
use crate::listener::CallStackListener;

type ListenerList = Vec<Arc<dyn CallStackListener>>;

/// Listeners attached to every subsequently created thread-local stack.
/// Copy-on-write: reads (one per stack creation) are lock-free.
static GLOBAL_LISTENERS: ArcSwapOption<ListenerList> = ArcSwapOption::const_empty();
static GLOBAL_LISTENERS_WRITE: Mutex<()> = Mutex::new(());

thread_local! {
    static THREAD_STACK: RefCell<Option<CallStack>> = const { RefCell::new(None) };
}

/// Register a listener on every thread-local stack created from now on.
/// Already-created stacks are not retrofitted.
pub fn add_global_listener(listener: Arc<dyn CallStackListener>) {
    let _guard = GLOBAL_LISTENERS_WRITE.lock();
    let mut next: ListenerList = GLOBAL_LISTENERS
        .load()
        .as_deref()
        .cloned()
        .unwrap_or_default();
    next.push(listener);
    GLOBAL_LISTENERS.store(Some(Arc::new(next)));
}

fn new_thread_stack() -> CallStack {
    let mut stack = CallStack::new();
    if let Some(listeners) = GLOBAL_LISTENERS.load().as_deref() {
        for listener in listeners {
            stack.add_listener(listener.clone());
        }
    }
    stack
}

/// Run `f` against this thread's stack, creating it on first use.
pub fn with_thread_stack<R>(f: impl FnOnce(&mut CallStack) -> R) -> R {
    THREAD_STACK.with_borrow_mut(|slot| f(slot.get_or_insert_with(new_thread_stack)))
}

/// Hand a stack to this thread, firing `on_attach_to_thread`. Replaces (and
/// drops) any stack the thread already had.
pub fn attach(stack: CallStack) {
    stack.fire_attach_to_thread(&std::thread::current());
    THREAD_STACK.with_borrow_mut(|slot| *slot = Some(stack));
}

/// Take this thread's stack for handoff, firing `on_detach_from_thread`.
/// Returns `None` if the thread never used the facade.
pub fn detach() -> Option<CallStack> {
    let stack = THREAD_STACK.with_borrow_mut(Option::take);
    if let Some(stack) = &stack {
        stack.fire_detach_from_thread(&std::thread::current());
    }
    stack
}

/// Entry point: a tracer for one scope (component / service name).
pub fn tracer(scope: impl Into<Cow<'static, str>>) -> Tracer {
    Tracer {
        scope: scope.into(),
    }
}

/// Scope-bound handle that starts instrumented calls.
#[derive(Debug, Clone)]
pub struct Tracer {
    scope: Cow<'static, str>,
}

impl Tracer {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Start building a call named `name` in this scope.
    pub fn meth(&self, name: impl Into<Cow<'static, str>>) -> MethodCall {
        MethodCall {
            scope: self.scope.clone(),
            name: name.into(),
            params: Vec::new(),
            inheritable_props: Vec::new(),
            progress_expected_count: 0,
            log: None,
        }
    }

    /// Shorthand for `meth(name).push()`.
    pub fn push(&self, name: impl Into<Cow<'static, str>>) -> ScopedCall {
        self.meth(name).push()
    }

    /// Fire `on_log` on this thread's stack listeners.
    pub fn log(&self, message: &str, named_values: &HashMap<String, Value>) {
        with_thread_stack(|stack| stack.log_event(message, named_values));
    }
}

/// Push/pop logging configuration for one call.
#[derive(Debug, Clone, Copy)]
struct LogConfig {
    push_level: Level,
    pop_level: Level,
    /// Pops slower than this escalate to at least WARN.
    slow_threshold_ms: i64,
}

/// Builder for one instrumented call. Terminated by [`Self::push`].
#[derive(Debug)]
#[must_use = "a call builder does nothing until push()"]
pub struct MethodCall {
    scope: Cow<'static, str>,
    name: Cow<'static, str>,
    params: Vec<(String, Value)>,
    inheritable_props: Vec<(String, Value)>,
    progress_expected_count: u32,
    log: Option<LogConfig>,
}

impl MethodCall {
    pub fn with_param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.push((name.to_owned(), value.into()));
        self
    }

    pub fn with_inheritable_prop(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inheritable_props.push((name.to_owned(), value.into()));
        self
    }

    pub fn with_progress_expected_count(mut self, count: u32) -> Self {
        self.progress_expected_count = count;
        self
    }

    /// Log through `tracing` on push and pop, escalating the pop to WARN
    /// when elapsed millis exceed `slow_threshold_ms`.
    pub fn with_logger(
        mut self,
        push_level: Level,
        pop_level: Level,
        slow_threshold_ms: i64,
    ) -> Self {
        self.log = Some(LogConfig {
            push_level,
            pop_level,
            slow_threshold_ms,
        });
        self
    }

    /// Push the frame on this thread's stack and return the release guard.
    pub fn push(self) -> ScopedCall {
        let MethodCall {
            scope,
            name,
            params,
            inheritable_props,
            progress_expected_count,
            log,
        } = self;

        let (popper, qualified, start_ns) = with_thread_stack(|stack| {
            let mut pusher = stack.pusher(&scope, &name);
            for (name, value) in params {
                pusher = pusher.with_param(&name, value);
            }
            for (name, value) in inheritable_props {
                pusher = pusher.with_inheritable_prop(&name, value);
            }
            if progress_expected_count > 0 {
                pusher = pusher.with_progress_expected_count(progress_expected_count);
            }
            let popper = pusher.push();
            let frame = stack.current();
            // Reuse the timestamp the push captured; the guard needs no
            // clock read of its own.
            (popper, frame.qualified_name().to_owned(), frame.start_times().wall_ns)
        });

        if let Some(log) = &log {
            log_at(log.push_level, &qualified, None, "call started");
        }

        ScopedCall {
            popper: Some(popper),
            qualified,
            start_ns,
            log,
        }
    }
}

/// RAII guard for one active frame. Releases on [`Self::close`] or on drop;
/// a second release is a no-op.
#[derive(Debug)]
pub struct ScopedCall {
    popper: Option<FramePopper>,
    qualified: String,
    start_ns: u64,
    log: Option<LogConfig>,
}

impl ScopedCall {
    /// Qualified `scope:name` of this call.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    /// Advance this call's progress. The update targets the frame this
    /// guard is bound to, even while a nested call is active.
    pub fn progress_step(&self, incr: u32, message: &str) {
        if let Some(popper) = &self.popper {
            let depth = popper.depth;
            with_thread_stack(|stack| stack.progress_step_at(depth, incr, message));
        }
    }

    /// Attach a late-bound parameter to the frame this guard is bound to.
    pub fn set_param(&self, name: &str, value: impl Into<Value>) {
        if let Some(popper) = &self.popper {
            let depth = popper.depth;
            with_thread_stack(|stack| stack.set_param_at(depth, name, value));
        }
    }

    /// Record `value` as this call's return value, release the frame, and
    /// pass the value through, so a `return` line stays a one-liner:
    /// `return call.return_value(result);`
    pub fn return_value<T: Into<Value> + Clone>(mut self, value: T) -> T {
        self.set_param(RETURN_PARAM, value.clone());
        self.release(false);
        value
    }

    /// Record `err` against this call (as a synthetic `error-<Type>` child
    /// frame timed from this call's start), release the frame, and pass the
    /// error through: `return Err(call.return_error(e));`
    pub fn return_error<E: std::fmt::Display>(mut self, err: E) -> E {
        let kind = short_type_name::<E>();
        with_thread_stack(|stack| stack.record_error_frame(kind, err.to_string()));
        self.release(false);
        err
    }

    /// Release the frame now. Calling this (or dropping the guard) after a
    /// release is harmless.
    pub fn close(mut self) {
        self.release(false);
    }

    fn release(&mut self, unwinding: bool) {
        let Some(popper) = self.popper.take() else {
            return;
        };

        if unwinding {
            // Release during a panic unwind must not panic again: a pop
            // mismatch here would turn a diagnosable panic into an abort.
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                with_thread_stack(|stack| stack.pop(popper));
            }));
            if outcome.is_err() {
                tracing::error!(
                    call = self.qualified.as_str(),
                    "failed to release call frame during panic unwind"
                );
            }
            return;
        }

        with_thread_stack(|stack| stack.pop(popper));

        if let Some(log) = &self.log {
            let elapsed_ms =
                clock::nanos_to_millis(clock::wall_now_ns().wrapping_sub(self.start_ns));
            let level = if elapsed_ms > log.slow_threshold_ms {
                most_severe(log.pop_level, Level::WARN)
            } else {
                log.pop_level
            };
            log_at(level, &self.qualified, Some(elapsed_ms), "call finished");
        }
    }
}

impl Drop for ScopedCall {
    fn drop(&mut self) {
        self.release(std::thread::panicking());
    }
}

/// `tracing` events take const levels only, so dynamic dispatch is a match.
fn log_at(level: Level, call: &str, elapsed_ms: Option<i64>, message: &str) {
    match level {
        Level::ERROR => tracing::error!(call, elapsed_ms, "{message}"),
        Level::WARN => tracing::warn!(call, elapsed_ms, "{message}"),
        Level::INFO => tracing::info!(call, elapsed_ms, "{message}"),
        Level::DEBUG => tracing::debug!(call, elapsed_ms, "{message}"),
        Level::TRACE => tracing::trace!(call, elapsed_ms, "{message}"),
    }
}

fn most_severe(a: Level, b: Level) -> Level {
    // tracing orders levels with ERROR as the minimum.
    if a < b {
        a
    } else {
        b
    }
}

/// `my_crate::io::TimeoutError` -> `TimeoutError`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_call_balances_on_close() {
        let call = tracer("svc").push("work");
        assert_eq!(call.qualified_name(), "svc:work");
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 1));
        call.close();
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn scoped_call_balances_on_drop() {
        {
            let _call = tracer("svc").push("dropped");
            with_thread_stack(|stack| assert_eq!(stack.current_depth(), 1));
        }
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn builder_configures_the_frame() {
        let call = tracer("svc")
            .meth("configured")
            .with_param("size", 3)
            .with_inheritable_prop("tenant", "acme")
            .with_progress_expected_count(7)
            .push();

        with_thread_stack(|stack| {
            let frame = stack.current();
            assert_eq!(frame.params().get("size"), Some(&serde_json::json!(3)));
            assert_eq!(
                frame.inherited_props().get("tenant"),
                Some(&serde_json::json!("acme"))
            );
            assert_eq!(frame.progress_expected_count(), 7);
        });
        call.close();
    }

    #[test]
    fn return_value_records_and_passes_through() {
        let call = tracer("svc").push("compute");
        let result = call.return_value(41);
        assert_eq!(result, 41);
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn return_error_records_a_synthetic_frame_and_passes_through() {
        let call = tracer("svc").push("failing");
        let err = call.return_error(std::fmt::Error);
        assert_eq!(err.to_string(), std::fmt::Error.to_string());
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn progress_and_params_reach_the_current_frame() {
        let call = tracer("svc")
            .meth("batch")
            .with_progress_expected_count(10)
            .push();
        call.progress_step(4, "halfway there");
        call.set_param("rows", 128);

        with_thread_stack(|stack| {
            let frame = stack.current();
            assert_eq!(frame.progress_index(), 4);
            assert_eq!(frame.progress_message(), Some("halfway there"));
            assert_eq!(frame.params().get("rows"), Some(&serde_json::json!(128)));
        });
        call.close();
    }

    #[test]
    fn guard_updates_target_their_own_frame() {
        let outer = tracer("svc").push("outer");
        let inner = tracer("svc").push("inner");

        // Updates through the outer guard must not land on the nested call.
        outer.set_param("who", "outer");
        outer.progress_step(2, "outer progress");

        with_thread_stack(|stack| {
            let outer_frame = stack.frame_at(1);
            assert_eq!(outer_frame.qualified_name(), "svc:outer");
            assert_eq!(outer_frame.params().get("who"), Some(&serde_json::json!("outer")));
            assert_eq!(outer_frame.progress_index(), 2);

            let inner_frame = stack.current();
            assert!(inner_frame.params().get("who").is_none());
            assert_eq!(inner_frame.progress_index(), 0);
        });

        inner.close();
        outer.close();
    }

    #[test]
    fn return_value_lands_on_the_bound_frame() {
        let call = tracer("svc").push("outer");
        {
            let inner = tracer("svc").push("inner");
            inner.close();
        }
        let result = call.return_value(9);
        assert_eq!(result, 9);
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn nested_tracer_calls_build_the_path() {
        let outer = tracer("svc").push("outer");
        let inner = tracer("svc").push("inner");
        with_thread_stack(|stack| {
            assert_eq!(stack.current_path(), vec!["root", "svc:outer", "svc:inner"]);
        });
        inner.close();
        outer.close();
    }

    #[test]
    fn detach_and_attach_move_the_stack() {
        let call = tracer("svc").push("kept");
        drop(call);
        let stack = detach().expect("stack exists after use");
        assert_eq!(stack.current_depth(), 0);
        attach(stack);
        with_thread_stack(|stack| assert_eq!(stack.current_depth(), 0));
    }

    #[test]
    fn severity_comparison_follows_tracing_order() {
        assert_eq!(most_severe(Level::INFO, Level::WARN), Level::WARN);
        assert_eq!(most_severe(Level::ERROR, Level::WARN), Level::ERROR);
        assert_eq!(short_type_name::<std::fmt::Error>(), "Error");
    }
}
