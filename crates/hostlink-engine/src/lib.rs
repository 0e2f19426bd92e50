//! hostlink-engine: a small reference-counted script object engine
//!
//! The engine exposes the surface a host bridge needs and nothing more:
//!
//! - objects with prototypes, data and accessor properties
//! - native function objects carrying a `tag` and a `magic` integer that are
//!   routed to one [`NativeHandler`] per runtime
//! - class identities with finalizers and a per-instance opaque slot
//! - reference counting with deferred frees and a cycle-collecting sweep
//! - exceptions, promises and a job queue
//!
//! There is no parser. Script behaviour is expressed through [`Context`]
//! operations such as [`Context::call`], [`Context::construct`] and
//! [`Context::derive_class`].
//!
//! A [`Runtime`] and its contexts stay on the thread that created them.
//! [`Value`]s are `Send + Sync`; releasing the last reference on another
//! thread only queues the object for the owner's next sweep.

pub mod class;
pub mod context;
pub mod convert;
pub mod error;
pub mod job;
pub mod native;
pub mod object;
pub mod options;
pub mod promise;
pub mod runtime;
pub mod value;

pub use class::{ClassDef, ClassId, Finalized, Finalizer, MAX_CLASS_ID};
pub use context::Context;
pub use convert::{FromValue, IntoValue};
pub use error::{ConvertError, EngineError, ErrorKind, Exception, Result};
pub use job::Job;
pub use native::{FreedFunction, NativeCall, NativeFunction, NativeHandler, NativeKind};
pub use object::{ObjectId, PropertyFlags, OBJECT_COST};
pub use options::{RuntimeOptions, DEFAULT_MAX_CALL_DEPTH};
pub use promise::{PromiseCapability, PromiseState};
pub use runtime::{InterruptHandler, MemoryUsage, Runtime};
pub use value::Value;
