//! Instance lifecycle
//!
//! An instance is an engine object of a bridged class whose opaque slot holds
//! the Handle ID of its host value. The value lives in the creating
//! context's handle table until the engine collects the instance, at which
//! point the class finalizer deletes the handle and runs the value's
//! [`Finalize`] hook, if any, exactly once.

use std::any::{Any, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use hostlink_engine::{ClassId, Finalized, Finalizer, Value};
use once_cell::sync::Lazy;
use tracing::{error, trace, warn};

use crate::context::{Context, ContextState};
use crate::dispatch::Entry;
use crate::error::{Error, Result};
use crate::handle::HandleId;

/// Cleanup hook run when the instance owning a value is collected
pub trait Finalize: Send + Sync + 'static {
    fn finalize(&self);
}

type FinalizeHook = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// A host value attached to an instance
#[derive(Clone)]
pub struct HostValue {
    data: Arc<dyn Any + Send + Sync>,
    hook: Option<FinalizeHook>,
}

impl HostValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc(data: Arc<dyn Any + Send + Sync>) -> Self {
        Self { data, hook: None }
    }

    /// Wrap a value whose [`Finalize::finalize`] runs when its instance is
    /// collected
    pub fn finalizable<T: Finalize>(value: T) -> Self {
        let hook: FinalizeHook = Arc::new(|data: &(dyn Any + Send + Sync)| {
            if let Some(value) = data.downcast_ref::<T>() {
                value.finalize();
            }
        });
        Self {
            data: Arc::new(value),
            hook: Some(hook),
        }
    }

    pub fn data(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.data
    }

    pub fn is<T: Any>(&self) -> bool {
        self.data.is::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.data).downcast::<T>().ok()
    }

    fn finalize(&self) {
        if let Some(hook) = &self.hook {
            hook(self.data.as_ref());
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostValue")
            .field("finalizable", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Finalizer
// ============================================================================

/// One finalizer shared by every bridged class
static INSTANCE_FINALIZER: Lazy<Finalizer> = Lazy::new(|| {
    let finalizer: Finalizer = Arc::new(finalize_instance);
    finalizer
});

pub(crate) fn finalizer() -> Finalizer {
    Arc::clone(&INSTANCE_FINALIZER)
}

fn finalize_instance(freed: Finalized) {
    // opaque 0: construction failed before the handle was written
    let Some(id) = HandleId::from_opaque(freed.opaque) else {
        return;
    };
    let Some(state) = freed
        .realm_data
        .and_then(|data| data.downcast::<ContextState>().ok())
    else {
        trace!(target: "hostlink", handle = %id, "instance outlived its context");
        return;
    };
    match state.handles.load(id) {
        Some(Entry::Value(_)) => {}
        Some(_) => {
            warn!(
                target: "hostlink",
                handle = %id,
                class_id = %freed.class_id,
                "instance slot does not point at a host value"
            );
            return;
        }
        None => return,
    }
    let Some(Entry::Value(value)) = state.handles.take(id) else {
        return;
    };
    trace!(target: "hostlink", handle = %id, class_id = %freed.class_id, "finalize instance");
    if panic::catch_unwind(AssertUnwindSafe(|| value.finalize())).is_err() {
        error!(target: "hostlink", handle = %id, "finalize hook panicked");
    }
}

// ============================================================================
// Context API
// ============================================================================

impl Context {
    /// Create an instance of the bridged class `new_target` constructs,
    /// carrying `value`.
    ///
    /// Call this from a class constructor with the `new_target` it received;
    /// for script subclasses the instance gets the subclass prototype.
    pub fn create_instance(&self, new_target: &Value, value: HostValue) -> Result<Value> {
        let engine = self.engine();
        let class_id = self
            .shared()
            .registry
            .resolve(engine, new_target)
            .ok_or_else(|| {
                Error::type_mismatch("new_target is not a bridged class constructor")
            })?;

        let proto = engine.get(new_target, "prototype")?;
        let proto = if proto.is_object() {
            proto
        } else {
            engine.class_proto(class_id).unwrap_or_else(Value::null)
        };

        let id = self.state().handles.store(Entry::Value(value));
        let instance = engine
            .new_object_proto_class(&proto, class_id)
            .and_then(|obj| engine.set_opaque(&obj, id.as_opaque()).map(|()| obj));
        match instance {
            Ok(obj) => Ok(obj),
            Err(err) => {
                self.state().handles.delete(id);
                Err(err.into())
            }
        }
    }

    /// The host value of an instance of `class_id`
    pub fn instance_data(
        &self,
        value: &Value,
        class_id: ClassId,
    ) -> Result<Arc<dyn Any + Send + Sync>> {
        self.host_value(value, class_id).map(|v| Arc::clone(v.data()))
    }

    /// The host value of an instance of `class_id`, downcast to `T`
    pub fn instance_data_as<T: Any + Send + Sync>(
        &self,
        value: &Value,
        class_id: ClassId,
    ) -> Result<Arc<T>> {
        self.host_value(value, class_id)?.downcast::<T>().ok_or_else(|| {
            Error::type_mismatch(format!("host value is not a {}", type_name::<T>()))
        })
    }

    /// The host value of an instance of any bridged class
    pub fn any_instance_data(&self, value: &Value) -> Result<Arc<dyn Any + Send + Sync>> {
        let class_id = self.engine().class_id_of(value).ok_or_else(|| {
            Error::type_mismatch(format!("{} is not a class instance", value.type_name()))
        })?;
        self.instance_data(value, class_id)
    }

    pub fn is_instance_of(&self, value: &Value, class_id: ClassId) -> bool {
        self.engine().class_id_of(value) == Some(class_id)
    }

    fn host_value(&self, value: &Value, class_id: ClassId) -> Result<HostValue> {
        if !value.is_object() {
            return Err(Error::type_mismatch(format!(
                "expected an instance of class {class_id}, got {}",
                value.type_name()
            )));
        }
        match self.engine().class_id_of(value) {
            Some(actual) if actual == class_id => {}
            Some(actual) => {
                return Err(Error::type_mismatch(format!(
                    "expected an instance of class {class_id}, got class {actual}"
                )))
            }
            None => {
                return Err(Error::type_mismatch(format!(
                    "expected an instance of class {class_id}, got a plain object"
                )))
            }
        }
        let id = self
            .engine()
            .opaque(value, class_id)
            .and_then(HandleId::from_opaque)
            .ok_or_else(|| Error::type_mismatch("instance has no host value attached"))?;
        // the slot indexes the table of the context that created the instance
        let owner = self
            .engine()
            .realm_data_of(value)
            .and_then(|data| data.downcast::<ContextState>().ok())
            .ok_or_else(|| {
                Error::type_mismatch("instance belongs to a closed or unbridged context")
            })?;
        match owner.handles.load(id) {
            Some(Entry::Value(host)) => Ok(host),
            Some(_) => Err(Error::type_mismatch(format!(
                "handle {id} does not hold a host value"
            ))),
            None => Err(Error::NotFound(id)),
        }
    }
}
