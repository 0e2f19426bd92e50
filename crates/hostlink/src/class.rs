//! Class binder
//!
//! [`ClassBuilder`] describes a host class (constructor, instance and static
//! methods, accessors) and [`ClassBuilder::build`] registers it with the
//! engine: one class identity, one prototype carrying the instance members,
//! one constructor carrying the statics. Registration either completes or
//! leaves no handles behind.

use std::sync::Arc;

use hostlink_engine::{ClassDef, ClassId, PropertyFlags, Value};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::context::Context;
use crate::dispatch::{DispatchTag, Entry};
use crate::error::{Error, Result};
use crate::function::{Constructor, Getter, HostFunction, Setter};
use crate::handle::HandleId;
use crate::instance;

/// A method of a class under construction
#[derive(Clone)]
pub struct MethodEntry {
    pub name: String,
    pub func: HostFunction,
    pub is_static: bool,
    /// Declared arity; 0 accepts any number of arguments
    pub length: u32,
}

/// An accessor property of a class under construction
#[derive(Clone)]
pub struct AccessorEntry {
    pub name: String,
    pub getter: Option<Getter>,
    pub setter: Option<Setter>,
    pub is_static: bool,
}

impl AccessorEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            getter: None,
            setter: None,
            is_static: false,
        }
    }

    pub fn getter<G>(mut self, getter: G) -> Self
    where
        G: Fn(&Context, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    pub fn setter<S>(mut self, setter: S) -> Self
    where
        S: Fn(&Context, &Value, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn into_static(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Description of a host class
pub struct ClassBuilder {
    name: String,
    constructor: Option<Constructor>,
    methods: Vec<MethodEntry>,
    accessors: Vec<AccessorEntry>,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constructor: None,
            methods: Vec::new(),
            accessors: Vec::new(),
        }
    }

    /// The constructor receives `new_target` and must return the instance,
    /// normally from [`Context::create_instance`]
    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(f));
        self
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.method_with_length(name, 0, f)
    }

    pub fn method_with_length<F>(mut self, name: impl Into<String>, length: u32, f: F) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.push(MethodEntry {
            name: name.into(),
            func: Arc::new(f),
            is_static: false,
            length,
        });
        self
    }

    /// Method on the constructor; `this` is the constructor when called as
    /// `Class.name()`
    pub fn static_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.static_method_with_length(name, 0, f)
    }

    pub fn static_method_with_length<F>(
        mut self,
        name: impl Into<String>,
        length: u32,
        f: F,
    ) -> Self
    where
        F: Fn(&Context, &Value, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.push(MethodEntry {
            name: name.into(),
            func: Arc::new(f),
            is_static: true,
            length,
        });
        self
    }

    /// Read-only instance property
    pub fn getter<G>(self, name: impl Into<String>, getter: G) -> Self
    where
        G: Fn(&Context, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.add_accessor(AccessorEntry::new(name).getter(getter))
    }

    /// Read-write instance property
    pub fn accessor<G, S>(self, name: impl Into<String>, getter: G, setter: S) -> Self
    where
        G: Fn(&Context, &Value) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&Context, &Value, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.add_accessor(AccessorEntry::new(name).getter(getter).setter(setter))
    }

    /// Read-only property on the constructor
    pub fn static_getter<G>(self, name: impl Into<String>, getter: G) -> Self
    where
        G: Fn(&Context, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.add_accessor(AccessorEntry::new(name).getter(getter).into_static())
    }

    /// Read-write property on the constructor
    pub fn static_accessor<G, S>(self, name: impl Into<String>, getter: G, setter: S) -> Self
    where
        G: Fn(&Context, &Value) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&Context, &Value, &Value) -> Result<()> + Send + Sync + 'static,
    {
        self.add_accessor(
            AccessorEntry::new(name)
                .getter(getter)
                .setter(setter)
                .into_static(),
        )
    }

    pub fn add_method(mut self, method: MethodEntry) -> Self {
        self.methods.push(method);
        self
    }

    pub fn add_accessor(mut self, accessor: AccessorEntry) -> Self {
        self.accessors.push(accessor);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("class name must not be empty".into()));
        }
        if self.constructor.is_none() {
            return Err(Error::Validation(format!(
                "class {} has no constructor",
                self.name
            )));
        }

        let mut instance_names = FxHashSet::default();
        let mut static_names = FxHashSet::default();
        let members = self
            .methods
            .iter()
            .map(|m| (m.name.as_str(), m.is_static))
            .chain(self.accessors.iter().map(|a| (a.name.as_str(), a.is_static)));
        for (name, is_static) in members {
            if name.is_empty() {
                return Err(Error::Validation(format!(
                    "class {} has a member without a name",
                    self.name
                )));
            }
            let (side, names, reserved) = if is_static {
                ("static", &mut static_names, "prototype")
            } else {
                ("instance", &mut instance_names, "constructor")
            };
            if name == reserved {
                return Err(Error::Validation(format!(
                    "class {} cannot define {side} member `{name}`",
                    self.name
                )));
            }
            if !names.insert(name) {
                return Err(Error::Validation(format!(
                    "duplicate {side} member `{name}` in class {}",
                    self.name
                )));
            }
        }

        if let Some(empty) = self
            .accessors
            .iter()
            .find(|a| a.getter.is_none() && a.setter.is_none())
        {
            return Err(Error::Validation(format!(
                "accessor `{}` of class {} needs a getter or a setter",
                empty.name, self.name
            )));
        }
        Ok(())
    }

    /// Register the class in `ctx`.
    ///
    /// Returns the constructor and the class identity. On failure every
    /// handle allocated here is deleted and the partially built objects are
    /// dropped; an allocated class identity cannot be returned to the engine
    /// and stays reserved.
    pub fn build(self, ctx: &Context) -> Result<(Value, ClassId)> {
        self.validate()?;
        let ClassBuilder {
            name,
            constructor,
            methods,
            accessors,
        } = self;
        let Some(constructor) = constructor else {
            return Err(Error::Validation(format!("class {name} has no constructor")));
        };
        let engine = ctx.engine();

        let class_id = engine
            .new_class_id()
            .map_err(|e| Error::registration(format!("class identity for {name}"), e))?;
        engine
            .new_class(class_id, ClassDef::new(&name).with_finalizer(instance::finalizer()))
            .map_err(|e| Error::registration(format!("class definition for {name}"), e))?;

        let mut rollback = Rollback::new(ctx, &name, class_id);

        let proto = engine
            .new_object()
            .map_err(|e| Error::registration("prototype", e))?;

        let (statics, methods): (Vec<_>, Vec<_>) = methods.into_iter().partition(|m| m.is_static);
        let (static_accessors, accessors): (Vec<_>, Vec<_>) =
            accessors.into_iter().partition(|a| a.is_static);

        for method in &methods {
            rollback.define_method(&proto, method)?;
        }
        let mut bound = Vec::with_capacity(accessors.len());
        for accessor in &accessors {
            bound.push(rollback.define_accessor(&proto, accessor)?);
        }

        let entry = Arc::new(ClassEntry {
            name: name.clone(),
            class_id,
            constructor,
            accessors: bound,
        });
        let ctor = rollback.bind(&name, 0, DispatchTag::Constructor, Entry::Class(entry))?;
        engine
            .set_constructor(&ctor, &proto)
            .map_err(|e| Error::registration("constructor", e))?;
        engine
            .set_class_proto(class_id, &proto)
            .map_err(|e| Error::registration("class prototype", e))?;

        for method in &statics {
            rollback.define_method(&ctor, method)?;
        }
        for accessor in &static_accessors {
            rollback.define_accessor(&ctor, accessor)?;
        }

        let Some(ctor_id) = ctor.object_id() else {
            return Err(Error::type_mismatch("class constructor is not an object"));
        };
        ctx.shared().registry.register(ctor_id, class_id);
        let handles = rollback.commit();
        debug!(
            target: "hostlink",
            class = %name,
            class_id = %class_id,
            methods = methods.len() + statics.len(),
            accessors = accessors.len() + static_accessors.len(),
            handles,
            "class registered"
        );
        Ok((ctor, class_id))
    }
}

// ============================================================================
// Built Class
// ============================================================================

/// Accessor functions replayed onto every new instance
pub(crate) struct BoundAccessor {
    name: String,
    getter: Option<Value>,
    setter: Option<Value>,
}

/// What the constructor handle refers to once a class is built
pub(crate) struct ClassEntry {
    pub(crate) name: String,
    pub(crate) class_id: ClassId,
    pub(crate) constructor: Constructor,
    accessors: Vec<BoundAccessor>,
}

impl ClassEntry {
    /// Define the instance accessors as own properties of `instance`
    pub(crate) fn replay_accessors(&self, ctx: &Context, instance: &Value) -> Result<()> {
        for accessor in &self.accessors {
            ctx.engine().define_accessor(
                instance,
                &accessor.name,
                accessor.getter.as_ref(),
                accessor.setter.as_ref(),
                false,
            )?;
        }
        Ok(())
    }
}

// ============================================================================
// Rollback
// ============================================================================

/// Tracks the handles a registration allocated and deletes them unless the
/// registration commits
struct Rollback<'a> {
    ctx: &'a Context,
    class: &'a str,
    class_id: ClassId,
    handles: Vec<HandleId>,
    committed: bool,
}

impl<'a> Rollback<'a> {
    fn new(ctx: &'a Context, class: &'a str, class_id: ClassId) -> Self {
        Self {
            ctx,
            class,
            class_id,
            handles: Vec::new(),
            committed: false,
        }
    }

    fn bind(&mut self, name: &str, length: u32, tag: DispatchTag, entry: Entry) -> Result<Value> {
        let (id, function) = self
            .ctx
            .bind_native(name, length, tag, entry)
            .map_err(|e| match e {
                Error::Engine(source) | Error::Registration { source, .. } => {
                    Error::registration(format!("function `{name}`"), source)
                }
                other => other,
            })?;
        self.handles.push(id);
        Ok(function)
    }

    fn define_method(&mut self, target: &Value, method: &MethodEntry) -> Result<()> {
        let function = self.bind(
            &method.name,
            method.length,
            DispatchTag::Method,
            Entry::Method(Arc::clone(&method.func)),
        )?;
        self.ctx
            .engine()
            .define_value(target, &method.name, &function, PropertyFlags::HIDDEN)
            .map_err(|e| Error::registration(format!("method `{}`", method.name), e))
    }

    fn define_accessor(&mut self, target: &Value, accessor: &AccessorEntry) -> Result<BoundAccessor> {
        let getter = match &accessor.getter {
            Some(get) => Some(self.bind(
                &format!("get {}", accessor.name),
                0,
                DispatchTag::Getter,
                Entry::Getter(Arc::clone(get)),
            )?),
            None => None,
        };
        let setter = match &accessor.setter {
            Some(set) => Some(self.bind(
                &format!("set {}", accessor.name),
                1,
                DispatchTag::Setter,
                Entry::Setter(Arc::clone(set)),
            )?),
            None => None,
        };
        self.ctx
            .engine()
            .define_accessor(target, &accessor.name, getter.as_ref(), setter.as_ref(), false)
            .map_err(|e| Error::registration(format!("accessor `{}`", accessor.name), e))?;
        Ok(BoundAccessor {
            name: accessor.name.clone(),
            getter,
            setter,
        })
    }

    /// Keep everything; returns the number of handles the class owns
    fn commit(mut self) -> usize {
        self.committed = true;
        self.handles.len()
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let released = self
            .handles
            .iter()
            .filter(|&&id| self.ctx.state().handles.delete(id))
            .count();
        warn!(
            target: "hostlink",
            class = %self.class,
            class_id = %self.class_id,
            released,
            "class registration failed; class identity stays reserved"
        );
    }
}
