//! hostlink: expose host functions, classes and values to a reference-counted
//! script engine
//!
//! The engine's native boundary only carries small integers, so every host
//! closure or value the bridge hands to the engine is parked in a per-context
//! [`HandleTable`] and referenced by its [`HandleId`]. One trampoline, the
//! dispatcher, receives every native call and routes it by [`DispatchTag`].
//!
//! ```no_run
//! use hostlink::{arg, ClassBuilder, HostValue, Runtime, Value};
//!
//! struct Point {
//!     x: f64,
//!     y: f64,
//! }
//!
//! let rt = Runtime::new();
//! let ctx = rt.new_context()?;
//!
//! let (point, class_id) = ClassBuilder::new("Point")
//!     .constructor(|ctx, new_target, args| {
//!         let point = Point { x: arg(args, 0)?, y: arg(args, 1)? };
//!         ctx.create_instance(new_target, HostValue::new(point))
//!     })
//!     .getter("x", |ctx, this| {
//!         let point = ctx.any_instance_data(this)?;
//!         Ok(Value::from(point.downcast_ref::<Point>().map_or(0.0, |p| p.x)))
//!     })
//!     .build(&ctx)?;
//!
//! let p = ctx.construct(&point, &[Value::from(3), Value::from(4)])?;
//! let data = ctx.instance_data_as::<Point>(&p, class_id)?;
//! assert_eq!(data.y, 4.0);
//! # Ok::<(), hostlink::Error>(())
//! ```

pub mod class;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod function;
pub mod handle;
pub mod instance;
pub mod pinned;
pub mod registry;
pub mod runtime;

pub use class::{AccessorEntry, ClassBuilder, MethodEntry};
pub use context::{Context, ContextHandles};
pub use dispatch::DispatchTag;
pub use error::{Error, Result, ScriptError};
pub use function::{arg, AsyncHostFunction, Constructor, Getter, HostFunction, Resolvers, Setter};
pub use handle::{HandleError, HandleId, HandleTable};
pub use instance::{Finalize, HostValue};
pub use pinned::PinnedRuntime;
pub use registry::ConstructorRegistry;
pub use runtime::Runtime;

pub use hostlink_engine::{
    ClassId, EngineError, ErrorKind, FromValue, IntoValue, MemoryUsage, PromiseState,
    RuntimeOptions, Value,
};
