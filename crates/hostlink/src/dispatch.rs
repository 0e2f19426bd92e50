//! Trampoline between the engine's native boundary and host closures
//!
//! Every native function object the bridge creates carries a [`DispatchTag`]
//! in the engine's `tag` byte and a Handle ID in its `magic`. The engine
//! routes all of them to the one [`Dispatcher`] installed on the runtime,
//! which looks the handle up in the calling context's table and invokes the
//! host closure with the calling convention the tag names.
//!
//! Host failures never cross the boundary as Rust panics: errors are turned
//! into script exceptions and panics are caught and rethrown as
//! `InternalError`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use hostlink_engine::{
    self as engine, EngineError, ErrorKind, FreedFunction, NativeCall, NativeHandler, NativeKind,
    Value,
};
use tracing::{error, trace};

use crate::class::ClassEntry;
use crate::context::{Context, ContextState};
use crate::error::{Error, Result};
use crate::function::{AsyncHostFunction, Getter, HostFunction, Resolvers, Setter};
use crate::handle::HandleId;
use crate::instance::HostValue;
use crate::runtime::RuntimeShared;

/// Calling convention of a bridged native function
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchTag {
    Function = 0,
    AsyncFunction = 1,
    Constructor = 2,
    Method = 3,
    Getter = 4,
    Setter = 5,
}

impl DispatchTag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// How the engine should invoke a function carrying this tag
    pub fn native_kind(self) -> NativeKind {
        match self {
            DispatchTag::Function | DispatchTag::AsyncFunction | DispatchTag::Method => {
                NativeKind::Generic
            }
            DispatchTag::Constructor => NativeKind::Constructor,
            DispatchTag::Getter => NativeKind::Getter,
            DispatchTag::Setter => NativeKind::Setter,
        }
    }
}

impl TryFrom<u8> for DispatchTag {
    type Error = u8;

    fn try_from(raw: u8) -> std::result::Result<Self, u8> {
        match raw {
            0 => Ok(DispatchTag::Function),
            1 => Ok(DispatchTag::AsyncFunction),
            2 => Ok(DispatchTag::Constructor),
            3 => Ok(DispatchTag::Method),
            4 => Ok(DispatchTag::Getter),
            5 => Ok(DispatchTag::Setter),
            other => Err(other),
        }
    }
}

/// What a handle in a context's table refers to
#[derive(Clone)]
pub(crate) enum Entry {
    Function(HostFunction),
    AsyncFunction(AsyncHostFunction),
    Method(HostFunction),
    Getter(Getter),
    Setter(Setter),
    Class(Arc<ClassEntry>),
    Value(HostValue),
}

impl Entry {
    fn kind_name(&self) -> &'static str {
        match self {
            Entry::Function(_) => "function",
            Entry::AsyncFunction(_) => "async function",
            Entry::Method(_) => "method",
            Entry::Getter(_) => "getter",
            Entry::Setter(_) => "setter",
            Entry::Class(_) => "class",
            Entry::Value(_) => "host value",
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// The native handler installed on every bridged runtime
pub(crate) struct Dispatcher {
    shared: Arc<RuntimeShared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<RuntimeShared>) -> Self {
        Self { shared }
    }
}

impl NativeHandler for Dispatcher {
    fn call(&self, raw: &engine::Context, call: NativeCall<'_>) -> engine::Result<Value> {
        let Ok(tag) = DispatchTag::try_from(call.tag) else {
            return Err(raw.throw(
                ErrorKind::TypeError,
                format!("unknown dispatch tag {}", call.tag),
            ));
        };
        let Some(ctx) = Context::attach(raw, &self.shared) else {
            return Err(raw.throw(
                ErrorKind::InternalError,
                "native function called in a context without a handle table",
            ));
        };
        trace!(target: "hostlink", ?tag, magic = call.magic, argc = call.args.len(), "dispatch");

        match panic::catch_unwind(AssertUnwindSafe(|| dispatch(&ctx, tag, &call))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(into_engine_error(&ctx, err)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(target: "hostlink", ?tag, magic = call.magic, "host panic: {message}");
                Err(raw.throw(ErrorKind::InternalError, format!("host panic: {message}")))
            }
        }
    }

    fn release(&self, freed: FreedFunction) {
        if freed.tag == DispatchTag::Constructor.as_u8() {
            self.shared.registry.unregister(freed.object);
        }
        let Some(id) = HandleId::from_raw(freed.magic) else {
            return;
        };
        // a closed context has already cleared its table
        let Some(state) = freed
            .realm_data
            .and_then(|data| data.downcast::<ContextState>().ok())
        else {
            return;
        };
        if state.handles.delete(id) {
            trace!(target: "hostlink", handle = %id, tag = freed.tag, "released function handle");
        }
    }
}

fn dispatch(ctx: &Context, tag: DispatchTag, call: &NativeCall<'_>) -> Result<Value> {
    let id = HandleId::from_raw(call.magic)
        .ok_or_else(|| Error::type_mismatch(format!("invalid handle {}", call.magic)))?;
    let entry = ctx.state().handles.load(id).ok_or(Error::NotFound(id))?;

    match (tag, entry) {
        (DispatchTag::Function, Entry::Function(f)) | (DispatchTag::Method, Entry::Method(f)) => {
            f(ctx, call.this, call.args)
        }
        (DispatchTag::AsyncFunction, Entry::AsyncFunction(f)) => call_async(ctx, &f, call),
        (DispatchTag::Constructor, Entry::Class(class)) => construct(ctx, &class, call),
        (DispatchTag::Getter, Entry::Getter(get)) => get(ctx, call.this),
        (DispatchTag::Setter, Entry::Setter(set)) => {
            set(ctx, call.this, &call.arg(0))?;
            Ok(Value::undefined())
        }
        (tag, entry) => Err(Error::type_mismatch(format!(
            "handle {id} holds a {} entry, not a {tag:?} entry",
            entry.kind_name()
        ))),
    }
}

fn call_async(ctx: &Context, f: &AsyncHostFunction, call: &NativeCall<'_>) -> Result<Value> {
    let capability = ctx.engine().new_promise_capability()?;
    let resolvers = Resolvers::bind(ctx, &capability)?;
    match f(ctx, call.this, resolvers.clone(), call.args) {
        Ok(value) if value.is_undefined() => {}
        Ok(value) => resolvers.resolve(ctx, &value)?,
        Err(Error::Engine(fatal)) => return Err(Error::Engine(fatal)),
        Err(err) => resolvers.reject(ctx, &exception_value(ctx, err))?,
    }
    Ok(capability.promise)
}

fn construct(ctx: &Context, class: &ClassEntry, call: &NativeCall<'_>) -> Result<Value> {
    let new_target = call.new_target.unwrap_or(call.this);
    trace!(target: "hostlink", class = %class.name, class_id = %class.class_id, "construct");
    let instance = (class.constructor)(ctx, new_target, call.args)?;
    if !instance.is_object() {
        return Err(Error::type_mismatch(format!(
            "constructor of {} returned {}, not an object",
            class.name,
            instance.type_name()
        )));
    }
    class.replay_accessors(ctx, &instance)?;
    Ok(instance)
}

// ============================================================================
// Error Conversion
// ============================================================================

/// Turn a host error into what the engine should unwind with.
///
/// Thrown script values keep their identity; limits and interrupts stay
/// fatal; everything else becomes a fresh error object.
pub(crate) fn into_engine_error(ctx: &Context, err: Error) -> EngineError {
    let raw = ctx.engine();
    match err {
        Error::Exception(exception) => EngineError::Exception(exception),
        Error::Engine(fatal) => fatal,
        Error::NotFound(id) => raw.throw(
            ErrorKind::ReferenceError,
            format!("no host value for handle {id}"),
        ),
        Error::TypeMismatch(message) | Error::Validation(message) => {
            raw.throw(ErrorKind::TypeError, message)
        }
        Error::Host(message) => raw.throw(ErrorKind::Error, message),
        other @ (Error::Registration { .. } | Error::Overflow(_) | Error::Disconnected) => {
            raw.throw(ErrorKind::InternalError, other.to_string())
        }
    }
}

/// The value a promise should be rejected with for `err`
pub(crate) fn exception_value(ctx: &Context, err: Error) -> Value {
    match into_engine_error(ctx, err) {
        EngineError::Exception(exception) => exception.into_value(),
        other => Value::from(other.to_string()),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
