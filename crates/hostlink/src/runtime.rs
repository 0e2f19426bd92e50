//! Bridged runtime
//!
//! Owns one engine runtime, installs the [`Dispatcher`] as its native
//! handler and holds the constructor registry shared by all of its
//! contexts. Like the engine runtime it wraps, a `Runtime` stays on the
//! thread that created it; see [`PinnedRuntime`](crate::PinnedRuntime) for
//! driving one from other threads.

use std::sync::Arc;
use std::time::Duration;

use hostlink_engine::{self as engine, MemoryUsage, RuntimeOptions};
use tracing::debug;

use crate::context::{Context, ContextState};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::registry::ConstructorRegistry;

/// Bridge state shared by the runtime, its contexts and the dispatcher
pub(crate) struct RuntimeShared {
    pub(crate) registry: ConstructorRegistry,
}

pub struct Runtime {
    engine: engine::Runtime,
    shared: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        let engine = engine::Runtime::with_options(options);
        let shared = Arc::new(RuntimeShared {
            registry: ConstructorRegistry::new(),
        });
        engine.set_native_handler(Arc::new(Dispatcher::new(Arc::clone(&shared))));
        debug!(target: "hostlink", options = ?engine.options(), "runtime created");
        Self { engine, shared }
    }

    /// The underlying engine runtime
    pub fn engine(&self) -> &engine::Runtime {
        &self.engine
    }

    /// Create a context with its own handle table
    pub fn new_context(&self) -> Result<Context> {
        let raw = self.engine.new_context()?;
        let state = Arc::new(ContextState::new());
        raw.set_userdata(Arc::clone(&state) as Arc<dyn std::any::Any + Send + Sync>)?;
        Ok(Context::new(raw, state, Arc::clone(&self.shared)))
    }

    /// Free released objects, reclaim unreachable cycles and run the
    /// finalizers of collected instances
    pub fn run_gc(&self) {
        self.engine.run_gc();
    }

    /// Run one queued job. Returns `false` if the queue was empty.
    pub fn execute_pending_job(&self) -> Result<bool> {
        Ok(self.engine.execute_pending_job()?)
    }

    /// Drain the job queue, returning how many jobs ran
    pub fn execute_pending_jobs(&self) -> Result<usize> {
        Ok(self.engine.execute_pending_jobs()?)
    }

    pub fn is_job_pending(&self) -> bool {
        self.engine.is_job_pending()
    }

    /// Install a callback polled on every call; returning `true` aborts the
    /// running call with [`EngineError::Interrupted`](engine::EngineError::Interrupted)
    pub fn set_interrupt_handler<F>(&self, handler: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.engine.set_interrupt_handler(handler);
    }

    pub fn clear_interrupt_handler(&self) {
        self.engine.clear_interrupt_handler();
    }

    pub fn set_memory_limit(&self, limit: Option<usize>) {
        self.engine.set_memory_limit(limit);
    }

    pub fn set_max_call_depth(&self, depth: Option<usize>) {
        self.engine.set_max_call_depth(depth);
    }

    pub fn set_execute_timeout(&self, timeout: Option<Duration>) {
        self.engine.set_execute_timeout(timeout);
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.engine.memory_usage()
    }

    /// Number of live bridged class constructors
    pub fn registered_constructors(&self) -> usize {
        self.shared.registry.len()
    }

    /// Tear the runtime down, running the finalizers of every remaining
    /// instance
    pub fn close(self) {
        drop(self);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hostlink_engine::{EngineError, Value};

    use super::*;
    use crate::error::Error;

    #[test]
    fn test_contexts_have_separate_tables() {
        let rt = Runtime::new();
        let a = rt.new_context().unwrap();
        let b = rt.new_context().unwrap();
        let _f = a.function("f", |_, _, _| Ok(Value::undefined())).unwrap();
        assert_eq!(a.handle_count(), 1);
        assert_eq!(b.handle_count(), 0);
    }

    #[test]
    fn test_interrupt_handler_stops_host_calls() {
        let rt = Runtime::new();
        let ctx = rt.new_context().unwrap();
        let f = ctx.function("spin", |_, _, _| Ok(Value::undefined())).unwrap();

        let polls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&polls);
        rt.set_interrupt_handler(move || counter.fetch_add(1, Ordering::SeqCst) >= 2);

        assert!(ctx.call(&f, &Value::undefined(), &[]).is_ok());
        assert!(ctx.call(&f, &Value::undefined(), &[]).is_ok());
        let err = ctx.call(&f, &Value::undefined(), &[]).unwrap_err();
        assert!(matches!(err, Error::Engine(EngineError::Interrupted)));

        rt.clear_interrupt_handler();
        assert!(ctx.call(&f, &Value::undefined(), &[]).is_ok());
    }

    #[test]
    fn test_call_depth_limit_is_fatal_not_catchable() {
        let rt = Runtime::with_options(RuntimeOptions::new().with_max_call_depth(8));
        let ctx = rt.new_context().unwrap();
        let globals = ctx.globals().unwrap();
        let recurse = ctx
            .function("recurse", |ctx, _, _| {
                let globals = ctx.globals()?;
                let me = ctx.get(&globals, "recurse")?;
                ctx.call(&me, &Value::undefined(), &[])
            })
            .unwrap();
        ctx.set(&globals, "recurse", recurse.clone()).unwrap();

        let err = ctx.call(&recurse, &Value::undefined(), &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Engine(EngineError::StackOverflow { max: 8 })
        ));
    }
}
