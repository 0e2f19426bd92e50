//! Native function boundary
//!
//! Native function objects carry no host pointers. Each one records a
//! calling convention ([`NativeKind`]) plus two small integers, an opaque
//! `tag` and a `magic`, which the engine hands back verbatim to the single
//! [`NativeHandler`] installed on the runtime.

use std::any::Any;
use std::sync::Arc;

use crate::context::Context;
use crate::error::{ErrorKind, Result};
use crate::object::ObjectId;
use crate::value::Value;

/// Calling convention of a native function object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    /// `(this, args)`
    Generic,
    /// `(new_target, args)`; calling it without `construct` throws
    Constructor,
    /// `(this)`
    Getter,
    /// `(this, value)`
    Setter,
}

/// Shape of a native function object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFunction {
    pub name: String,
    /// Declared arity, exposed as `length`
    pub length: u32,
    pub kind: NativeKind,
    pub tag: u8,
    pub magic: i32,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>, kind: NativeKind, tag: u8, magic: i32) -> Self {
        Self {
            name: name.into(),
            length: 0,
            kind,
            tag,
            magic,
        }
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = length;
        self
    }
}

/// One invocation of a native function
#[derive(Debug)]
pub struct NativeCall<'a> {
    pub kind: NativeKind,
    pub tag: u8,
    pub magic: i32,
    /// Receiver; for constructors this is `new_target`
    pub this: &'a Value,
    /// Set only for constructor calls
    pub new_target: Option<&'a Value>,
    pub args: &'a [Value],
}

impl NativeCall<'_> {
    /// Argument `index`, `undefined` when missing
    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }
}

/// Notification that a native function object was freed
pub struct FreedFunction {
    pub object: ObjectId,
    pub kind: NativeKind,
    pub tag: u8,
    pub magic: i32,
    /// Userdata of the context the function was created in, if still open
    pub realm_data: Option<Arc<dyn Any + Send + Sync>>,
}

/// The host side of the native boundary.
///
/// Exactly one handler is installed per runtime. It is always invoked on the
/// thread that owns the runtime.
pub trait NativeHandler: Send + Sync {
    /// Invoke the native function identified by `call.tag` and `call.magic`
    fn call(&self, ctx: &Context, call: NativeCall<'_>) -> Result<Value>;

    /// A native function object was collected
    fn release(&self, freed: FreedFunction) {
        let _ = freed;
    }
}

/// Handler used until the host installs its own
pub(crate) struct UnboundHandler;

impl NativeHandler for UnboundHandler {
    fn call(&self, ctx: &Context, call: NativeCall<'_>) -> Result<Value> {
        Err(ctx.throw(
            ErrorKind::InternalError,
            format!("no native handler bound for tag {}", call.tag),
        ))
    }
}
