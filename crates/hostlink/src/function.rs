//! Host functions exposed to scripts
//!
//! A bound function is a host closure stored in the context's handle table
//! plus a native function object whose `magic` is the handle. The handle is
//! released when the engine collects the function object or when the
//! context closes, whichever comes first.

use std::sync::Arc;

use hostlink_engine::{EngineError, ErrorKind, FromValue, NativeFunction, PromiseCapability, Value};

use crate::context::Context;
use crate::dispatch::{self, DispatchTag, Entry};
use crate::error::{Error, Result};
use crate::handle::HandleId;

/// `(ctx, this, args) -> result`
pub type HostFunction = Arc<dyn Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync>;

/// `(ctx, this, resolvers, args) -> result`; a non-undefined result resolves
/// the promise, an error rejects it
pub type AsyncHostFunction =
    Arc<dyn Fn(&Context, &Value, Resolvers, &[Value]) -> Result<Value> + Send + Sync>;

/// `(ctx, new_target, args) -> instance`
pub type Constructor = Arc<dyn Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync>;

/// `(ctx, this) -> value`
pub type Getter = Arc<dyn Fn(&Context, &Value) -> Result<Value> + Send + Sync>;

/// `(ctx, this, value)`
pub type Setter = Arc<dyn Fn(&Context, &Value, &Value) -> Result<()> + Send + Sync>;

/// Read argument `index` as `T`; a missing argument reads as `undefined`
pub fn arg<T: FromValue>(args: &[Value], index: usize) -> Result<T> {
    let value = args.get(index).cloned().unwrap_or_default();
    T::from_value(&value)
        .map_err(|err| Error::type_mismatch(format!("argument {index}: {err}")))
}

// ============================================================================
// Resolvers
// ============================================================================

/// The resolve/reject pair of a promise created by the bridge.
///
/// Both are bridged functions, so they can be cloned, sent to other threads
/// and settled later from a job. Settling a promise twice is a no-op.
#[derive(Clone, Debug)]
pub struct Resolvers {
    resolve: Value,
    reject: Value,
}

impl Resolvers {
    pub(crate) fn bind(ctx: &Context, capability: &PromiseCapability) -> Result<Self> {
        let raw_resolve = capability.resolve.clone();
        let resolve = ctx.function_with_length("resolve", 1, move |ctx, _, args| {
            let value = args.first().cloned().unwrap_or_default();
            ctx.engine().call(&raw_resolve, &Value::undefined(), &[value])?;
            Ok(Value::undefined())
        })?;

        let raw_reject = capability.reject.clone();
        let reject = ctx.function_with_length("reject", 1, move |ctx, _, args| {
            let reason = match args.first() {
                Some(reason) => reason.clone(),
                None => ctx
                    .engine()
                    .new_error(ErrorKind::Error, "Promise rejected without reason")?,
            };
            ctx.engine().call(&raw_reject, &Value::undefined(), &[reason])?;
            Ok(Value::undefined())
        })?;

        Ok(Self { resolve, reject })
    }

    pub fn resolve(&self, ctx: &Context, value: &Value) -> Result<()> {
        ctx.call(&self.resolve, &Value::undefined(), std::slice::from_ref(value))
            .map(drop)
    }

    pub fn reject(&self, ctx: &Context, reason: &Value) -> Result<()> {
        ctx.call(&self.reject, &Value::undefined(), std::slice::from_ref(reason))
            .map(drop)
    }

    /// Reject without a reason; the promise is rejected with an `Error`
    pub fn reject_empty(&self, ctx: &Context) -> Result<()> {
        ctx.call(&self.reject, &Value::undefined(), &[]).map(drop)
    }

    /// The script-visible resolve function
    pub fn resolve_function(&self) -> &Value {
        &self.resolve
    }

    /// The script-visible reject function
    pub fn reject_function(&self) -> &Value {
        &self.reject
    }
}

// ============================================================================
// Binding
// ============================================================================

impl Context {
    /// Expose `f` to scripts as a function accepting any number of arguments
    pub fn function<F>(&self, name: &str, f: F) -> Result<Value>
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.function_with_length(name, 0, f)
    }

    /// Like [`Context::function`], with `length` as the declared arity
    pub fn function_with_length<F>(&self, name: &str, length: u32, f: F) -> Result<Value>
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.bind_native(name, length, DispatchTag::Function, Entry::Function(Arc::new(f)))
            .map(|(_, function)| function)
    }

    /// Expose `f` to scripts as a function returning a promise.
    ///
    /// `f` runs synchronously on the engine thread. It may settle the promise
    /// through the [`Resolvers`] right away, keep them to settle later from a
    /// job, or simply return: a non-undefined result resolves the promise and
    /// an error rejects it.
    pub fn async_function<F>(&self, name: &str, f: F) -> Result<Value>
    where
        F: Fn(&Context, &Value, Resolvers, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.bind_native(
            name,
            0,
            DispatchTag::AsyncFunction,
            Entry::AsyncFunction(Arc::new(f)),
        )
        .map(|(_, function)| function)
    }

    /// Create a promise and hand its resolvers to `executor`.
    ///
    /// An error from `executor` rejects the promise instead of being
    /// returned, unless it is a fatal engine error.
    pub fn promise<F>(&self, executor: F) -> Result<Value>
    where
        F: FnOnce(&Context, Resolvers) -> Result<()>,
    {
        let capability = self.engine().new_promise_capability()?;
        let resolvers = Resolvers::bind(self, &capability)?;
        match executor(self, resolvers.clone()) {
            Ok(()) => {}
            Err(Error::Engine(fatal)) => return Err(Error::Engine(fatal)),
            Err(err) => resolvers.reject(self, &dispatch::exception_value(self, err))?,
        }
        Ok(capability.promise)
    }

    /// Store `entry` and create the native function that dispatches to it.
    /// The handle is deleted again if the function cannot be created.
    pub(crate) fn bind_native(
        &self,
        name: &str,
        length: u32,
        tag: DispatchTag,
        entry: Entry,
    ) -> Result<(HandleId, Value)> {
        if self.is_closed() {
            return Err(Error::Engine(EngineError::ContextClosed));
        }
        let id = self.state().handles.store(entry);
        let native = NativeFunction::new(name, tag.native_kind(), tag.as_u8(), id.get())
            .with_length(length);
        match self.engine().new_native_function(native) {
            Ok(function) => Ok((id, function)),
            Err(err) => {
                self.state().handles.delete(id);
                Err(err.into())
            }
        }
    }
}
