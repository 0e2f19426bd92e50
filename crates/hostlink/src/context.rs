//! Bridged contexts
//!
//! A [`Context`] wraps one engine realm together with the handle table of
//! every host value that realm references. The table is reachable from the
//! realm's userdata, which is how the dispatcher and the instance finalizer
//! find it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hostlink_engine::{self as engine, ErrorKind, IntoValue, Value};
use tracing::debug;

use crate::dispatch::{self, Entry};
use crate::error::{Error, Result};
use crate::handle::{HandleId, HandleTable};
use crate::instance::HostValue;
use crate::runtime::RuntimeShared;

/// Per-context bridge state stored as the realm's userdata
pub(crate) struct ContextState {
    pub(crate) handles: HandleTable<Entry>,
    closed: AtomicBool,
}

impl ContextState {
    pub(crate) fn new() -> Self {
        Self {
            handles: HandleTable::new(),
            closed: AtomicBool::new(false),
        }
    }
}

/// A realm of a bridged runtime.
///
/// The context returned by [`Runtime::new_context`](crate::Runtime::new_context)
/// owns its realm: dropping it releases every handle and closes the realm.
/// Contexts handed to host callbacks only borrow it.
pub struct Context {
    engine: engine::Context,
    state: Arc<ContextState>,
    shared: Arc<RuntimeShared>,
    owner: bool,
}

impl Context {
    pub(crate) fn new(
        engine: engine::Context,
        state: Arc<ContextState>,
        shared: Arc<RuntimeShared>,
    ) -> Self {
        Self {
            engine,
            state,
            shared,
            owner: true,
        }
    }

    /// Borrow the bridge view of an engine context, if it was created by a
    /// bridged runtime
    pub(crate) fn attach(engine: &engine::Context, shared: &Arc<RuntimeShared>) -> Option<Self> {
        let state = engine.userdata()?.downcast::<ContextState>().ok()?;
        Some(Self {
            engine: engine.clone(),
            state,
            shared: Arc::clone(shared),
            owner: false,
        })
    }

    /// The underlying engine context
    pub fn engine(&self) -> &engine::Context {
        &self.engine
    }

    pub(crate) fn state(&self) -> &ContextState {
        &self.state
    }

    pub(crate) fn shared(&self) -> &RuntimeShared {
        &self.shared
    }

    /// A thread-safe view of this context's host value handles
    pub fn handles(&self) -> ContextHandles {
        ContextHandles {
            state: Arc::clone(&self.state),
        }
    }

    /// Number of live handles (functions, class members, instance values)
    pub fn handle_count(&self) -> usize {
        self.state.handles.count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Release every handle this context owns. Returns how many were
    /// released; closing twice releases nothing.
    ///
    /// Functions and instances that survive the close throw a
    /// `ReferenceError` when used.
    pub fn close(&self) -> usize {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let released = self.state.handles.clear();
        debug!(target: "hostlink", released, "context closed");
        released
    }

    // ===== Values =====

    pub fn undefined(&self) -> Value {
        Value::undefined()
    }

    pub fn null(&self) -> Value {
        Value::null()
    }

    pub fn bool(&self, b: bool) -> Value {
        Value::bool(b)
    }

    pub fn int32(&self, i: i32) -> Value {
        Value::int32(i)
    }

    pub fn float64(&self, f: f64) -> Value {
        Value::float64(f)
    }

    pub fn string(&self, s: &str) -> Value {
        Value::string(s)
    }

    /// A new plain object
    pub fn object(&self) -> Result<Value> {
        Ok(self.engine.new_object()?)
    }

    pub fn globals(&self) -> Result<Value> {
        Ok(self.engine.globals()?)
    }

    // ===== Properties and calls =====

    pub fn get(&self, obj: &Value, key: &str) -> Result<Value> {
        Ok(self.engine.get(obj, key)?)
    }

    pub fn set(&self, obj: &Value, key: &str, value: impl IntoValue) -> Result<()> {
        Ok(self.engine.set(obj, key, &value.into_value())?)
    }

    pub fn call(&self, f: &Value, this: &Value, args: &[Value]) -> Result<Value> {
        Ok(self.engine.call(f, this, args)?)
    }

    pub fn construct(&self, ctor: &Value, args: &[Value]) -> Result<Value> {
        Ok(self.engine.construct(ctor, args)?)
    }

    /// Create a script subclass of `base`
    pub fn derive_class(&self, name: &str, base: &Value) -> Result<Value> {
        Ok(self.engine.derive_class(name, base)?)
    }

    // ===== Exceptions =====

    fn throw(&self, kind: ErrorKind, message: impl Into<String>) -> Error {
        self.engine.throw(kind, message).into()
    }

    pub fn throw_error(&self, message: impl Into<String>) -> Error {
        self.throw(ErrorKind::Error, message)
    }

    pub fn throw_type_error(&self, message: impl Into<String>) -> Error {
        self.throw(ErrorKind::TypeError, message)
    }

    pub fn throw_range_error(&self, message: impl Into<String>) -> Error {
        self.throw(ErrorKind::RangeError, message)
    }

    pub fn throw_reference_error(&self, message: impl Into<String>) -> Error {
        self.throw(ErrorKind::ReferenceError, message)
    }

    pub fn throw_internal_error(&self, message: impl Into<String>) -> Error {
        self.throw(ErrorKind::InternalError, message)
    }

    // ===== Jobs =====

    /// Queue `job` to run when the runtime drains its job queue
    pub fn enqueue_job<F>(&self, job: F)
    where
        F: FnOnce(&Context) -> Result<()> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.engine.enqueue_job(move |raw| {
            let Some(ctx) = Context::attach(raw, &shared) else {
                return Ok(());
            };
            job(&ctx).map_err(|err| dispatch::into_engine_error(&ctx, err))
        });
    }

    /// Run jobs until `value` settles; a rejection is returned as an
    /// exception carrying the reason
    pub fn await_value(&self, value: &Value) -> Result<Value> {
        Ok(self.engine.await_value(value)?)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.owner {
            self.close();
        }
    }
}

// ============================================================================
// ContextHandles
// ============================================================================

/// Thread-safe access to a context's host values.
///
/// Values stored here are released by [`ContextHandles::release`] or when
/// the context closes.
#[derive(Clone)]
pub struct ContextHandles {
    state: Arc<ContextState>,
}

impl ContextHandles {
    pub fn store(&self, value: HostValue) -> HandleId {
        self.state.handles.store(Entry::Value(value))
    }

    pub fn load(&self, id: HandleId) -> Option<HostValue> {
        match self.state.handles.load(id) {
            Some(Entry::Value(value)) => Some(value),
            _ => None,
        }
    }

    /// Release a stored value; handles of functions and classes are left
    /// alone. Returns `false` if nothing was released.
    pub fn release(&self, id: HandleId) -> bool {
        match self.state.handles.load(id) {
            Some(Entry::Value(_)) => self.state.handles.delete(id),
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.state.handles.count()
    }
}
