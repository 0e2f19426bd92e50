//! Contexts
//!
//! A [`Context`] is a realm: a global object and a set of intrinsic
//! prototypes inside a runtime. All object, property and call operations go
//! through a context. The context returned by
//! [`Runtime::new_context`](crate::Runtime::new_context) owns its realm and
//! closes it when dropped; clones, and the contexts handed to native
//! handlers and jobs, only borrow it.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::class::{ClassDef, ClassId};
use crate::error::{EngineError, ErrorKind, Exception, Result};
use crate::native::{NativeCall, NativeFunction, NativeKind};
use crate::object::{Lookup, ObjectData, ObjectId, ObjectKind, Property, PropertyFlags, RealmId};
use crate::promise::ResolvingFunction;
use crate::runtime::{Realm, RuntimeInner};
use crate::value::{HeapValue, Value};

enum Callee {
    Native(NativeFunction, RealmId),
    Resolving(ResolvingFunction),
    Derived(ObjectId),
    NotCallable,
}

/// A realm inside a runtime
pub struct Context {
    inner: Arc<RuntimeInner>,
    realm: RealmId,
    owned: bool,
    _not_send: PhantomData<*const ()>,
}

impl Context {
    pub(crate) fn owned(inner: Arc<RuntimeInner>, realm: RealmId) -> Self {
        Self {
            inner,
            realm,
            owned: true,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn borrowed(inner: Arc<RuntimeInner>, realm: RealmId) -> Self {
        Self {
            inner,
            realm,
            owned: false,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub(crate) fn realm(&self) -> RealmId {
        self.realm
    }

    /// Whether `value` is an immediate or an object of this runtime
    pub(crate) fn owns(&self, value: &Value) -> bool {
        value
            .runtime()
            .map_or(true, |rt| Arc::ptr_eq(rt, &self.inner))
    }

    pub(crate) fn lower(&self, value: &Value) -> Result<HeapValue> {
        if !self.owns(value) {
            return Err(EngineError::WrongRuntime);
        }
        Ok(value.to_heap())
    }

    /// Wrap a heap value whose count has already been taken
    pub(crate) fn lift(&self, value: HeapValue) -> Value {
        Value::adopt(&self.inner, value)
    }

    /// A new counted value for a live object id
    fn value_of(&self, id: ObjectId) -> Value {
        self.inner.heap.lock().retain(id);
        self.lift(HeapValue::Object(id))
    }

    pub(crate) fn intrinsic(&self, pick: impl FnOnce(&Realm) -> ObjectId) -> Result<ObjectId> {
        if self.inner.is_closed() {
            return Err(EngineError::RuntimeClosed);
        }
        let realms = self.inner.realms.lock();
        realms
            .get(self.realm.0 as usize)
            .and_then(Option::as_ref)
            .map(pick)
            .ok_or(EngineError::ContextClosed)
    }

    pub(crate) fn alloc(&self, data: ObjectData) -> Result<(ObjectId, Value)> {
        if self.inner.is_closed() {
            return Err(EngineError::RuntimeClosed);
        }
        let id = self.inner.heap.lock().alloc(data)?;
        Ok((id, self.lift(HeapValue::Object(id))))
    }

    fn in_realm(&self, realm: RealmId) -> Context {
        Context::borrowed(Arc::clone(&self.inner), realm)
    }

    fn object_of(&self, value: &Value) -> Result<ObjectId> {
        match value.object_id() {
            Some(_) if !self.owns(value) => Err(EngineError::WrongRuntime),
            Some(id) => Ok(id),
            None => Err(self.throw(
                ErrorKind::TypeError,
                format!("{} is not an object", value.type_name()),
            )),
        }
    }

    fn proto_arg(&self, proto: &Value) -> Result<Option<ObjectId>> {
        if proto.is_null() {
            return Ok(None);
        }
        match proto.object_id() {
            Some(_) => self.object_of(proto).map(Some),
            None => Err(self.throw(
                ErrorKind::TypeError,
                "object prototype may only be an object or null",
            )),
        }
    }

    fn callee(&self, id: ObjectId) -> Callee {
        let heap = self.inner.heap.lock();
        match heap.get(id) {
            Some(obj) => match &obj.kind {
                ObjectKind::Native(f) => Callee::Native(f.clone(), obj.realm),
                ObjectKind::Resolving(r) => Callee::Resolving(r.clone()),
                ObjectKind::Derived { base } => Callee::Derived(*base),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        }
    }

    // ===== Realm =====

    /// Whether the realm is still open
    pub fn is_open(&self) -> bool {
        !self.inner.is_closed() && self.inner.realm_open(self.realm)
    }

    /// Host data attached to this realm
    pub fn userdata(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.realm_data(self.realm)
    }

    /// Host data of the realm `value` was created in, if that realm is open
    pub fn realm_data_of(&self, value: &Value) -> Option<Arc<dyn Any + Send + Sync>> {
        let id = value.object_id()?;
        if !self.owns(value) {
            return None;
        }
        let realm = self.inner.heap.lock().get(id)?.realm;
        self.inner.realm_data(realm)
    }

    pub fn set_userdata(&self, data: Arc<dyn Any + Send + Sync>) -> Result<()> {
        let old = {
            let mut realms = self.inner.realms.lock();
            let realm = realms
                .get_mut(self.realm.0 as usize)
                .and_then(Option::as_mut)
                .ok_or(EngineError::ContextClosed)?;
            realm.userdata.replace(data)
        };
        drop(old);
        Ok(())
    }

    pub fn globals(&self) -> Result<Value> {
        let id = self.intrinsic(|realm| realm.global)?;
        Ok(self.value_of(id))
    }

    // ===== Classes =====

    pub fn new_class_id(&self) -> Result<ClassId> {
        self.inner.classes.write().allocate()
    }

    pub fn new_class(&self, id: ClassId, def: ClassDef) -> Result<()> {
        self.inner.classes.write().define(id, def)
    }

    /// Set the default prototype of `class_id` in this realm
    pub fn set_class_proto(&self, class_id: ClassId, proto: &Value) -> Result<()> {
        let proto_id = self.object_of(proto)?;
        if !self.inner.classes.read().is_defined(class_id) {
            return Err(EngineError::UnknownClass(class_id));
        }
        self.inner.heap.lock().retain(proto_id);
        let replaced = {
            let mut realms = self.inner.realms.lock();
            realms
                .get_mut(self.realm.0 as usize)
                .and_then(Option::as_mut)
                .map(|realm| realm.class_protos.insert(class_id, proto_id))
        };
        let mut heap = self.inner.heap.lock();
        match replaced {
            Some(previous) => {
                if let Some(previous) = previous {
                    heap.release(previous);
                }
                Ok(())
            }
            None => {
                heap.release(proto_id);
                Err(EngineError::ContextClosed)
            }
        }
    }

    pub fn class_proto(&self, class_id: ClassId) -> Option<Value> {
        let id = {
            let realms = self.inner.realms.lock();
            realms
                .get(self.realm.0 as usize)
                .and_then(Option::as_ref)
                .and_then(|realm| realm.class_protos.get(&class_id).copied())
        }?;
        Some(self.value_of(id))
    }

    // ===== Objects =====

    pub fn new_object(&self) -> Result<Value> {
        let proto = self.intrinsic(|realm| realm.object_proto)?;
        let (_, obj) = self.alloc(ObjectData::new(self.realm, Some(proto), ObjectKind::Ordinary))?;
        Ok(obj)
    }

    /// A plain object with `proto` (an object or null) as its prototype
    pub fn new_object_proto(&self, proto: &Value) -> Result<Value> {
        let proto = self.proto_arg(proto)?;
        let (_, obj) = self.alloc(ObjectData::new(self.realm, proto, ObjectKind::Ordinary))?;
        Ok(obj)
    }

    /// An instance of `class_id` with `proto` as its prototype and an empty opaque slot
    pub fn new_object_proto_class(&self, proto: &Value, class_id: ClassId) -> Result<Value> {
        if !self.inner.classes.read().is_defined(class_id) {
            return Err(EngineError::UnknownClass(class_id));
        }
        let proto = self.proto_arg(proto)?;
        let data = ObjectData::new(self.realm, proto, ObjectKind::Ordinary).with_class(class_id);
        let (_, obj) = self.alloc(data)?;
        Ok(obj)
    }

    /// A native function object dispatching to the runtime's handler
    pub fn new_native_function(&self, function: NativeFunction) -> Result<Value> {
        let proto = self.intrinsic(|realm| realm.function_proto)?;
        let name = Property::Data {
            value: HeapValue::String(Arc::from(function.name.as_str())),
            flags: PropertyFlags::READ_ONLY,
        };
        let length = Property::Data {
            value: HeapValue::Int(function.length.min(i32::MAX as u32) as i32),
            flags: PropertyFlags::READ_ONLY,
        };
        let data = ObjectData::new(self.realm, Some(proto), ObjectKind::Native(function))
            .with_property("name", name)
            .with_property("length", length);
        let (_, f) = self.alloc(data)?;
        Ok(f)
    }

    pub fn new_error(&self, kind: ErrorKind, message: impl Into<String>) -> Result<Value> {
        let proto = self.intrinsic(|realm| realm.error_proto)?;
        let data = ObjectData::new(self.realm, Some(proto), ObjectKind::Error)
            .with_property(
                "name",
                Property::Data {
                    value: HeapValue::String(Arc::from(kind.name())),
                    flags: PropertyFlags::HIDDEN,
                },
            )
            .with_property(
                "message",
                Property::Data {
                    value: HeapValue::String(Arc::from(message.into())),
                    flags: PropertyFlags::HIDDEN,
                },
            );
        let (_, err) = self.alloc(data)?;
        Ok(err)
    }

    pub fn is_error(&self, value: &Value) -> bool {
        let Some(id) = value.object_id() else {
            return false;
        };
        self.owns(value)
            && matches!(
                self.inner.heap.lock().get(id).map(|obj| &obj.kind),
                Some(ObjectKind::Error)
            )
    }

    pub fn class_id_of(&self, value: &Value) -> Option<ClassId> {
        let id = value.object_id()?;
        if !self.owns(value) {
            return None;
        }
        self.inner.heap.lock().get(id).and_then(|obj| obj.class_id)
    }

    /// Write the opaque slot of a class instance
    pub fn set_opaque(&self, obj: &Value, opaque: usize) -> Result<()> {
        let id = self.object_of(obj)?;
        let stored = {
            let mut heap = self.inner.heap.lock();
            match heap.get_mut(id) {
                Some(data) if data.class_id.is_some() => {
                    data.opaque = opaque;
                    true
                }
                _ => false,
            }
        };
        if stored {
            Ok(())
        } else {
            Err(self.throw(ErrorKind::TypeError, "object is not a class instance"))
        }
    }

    /// Read the opaque slot, only if `obj` is an instance of `class_id`
    pub fn opaque(&self, obj: &Value, class_id: ClassId) -> Option<usize> {
        let id = obj.object_id()?;
        if !self.owns(obj) {
            return None;
        }
        let heap = self.inner.heap.lock();
        let data = heap.get(id)?;
        (data.class_id == Some(class_id)).then_some(data.opaque)
    }

    /// `[[Prototype]]` of `obj`, `null` if it has none
    pub fn prototype_of(&self, obj: &Value) -> Result<Value> {
        let id = self.object_of(obj)?;
        let proto = {
            let mut heap = self.inner.heap.lock();
            let proto = heap.get(id).and_then(|data| data.proto);
            if let Some(proto) = proto {
                heap.retain(proto);
            }
            proto
        };
        Ok(match proto {
            Some(proto) => self.lift(HeapValue::Object(proto)),
            None => Value::null(),
        })
    }

    pub fn set_prototype_of(&self, obj: &Value, proto: &Value) -> Result<()> {
        let id = self.object_of(obj)?;
        let proto = self.proto_arg(proto)?;
        let linked = self.inner.heap.lock().set_proto(id, proto);
        if linked {
            Ok(())
        } else {
            Err(self.throw(ErrorKind::TypeError, "cyclic __proto__ value"))
        }
    }

    /// Link `ctor.prototype` and `proto.constructor`
    pub fn set_constructor(&self, ctor: &Value, proto: &Value) -> Result<()> {
        self.define_value(ctor, "prototype", proto, PropertyFlags::READ_ONLY)?;
        self.define_value(proto, "constructor", ctor, PropertyFlags::HIDDEN)
    }

    pub fn is_function(&self, value: &Value) -> bool {
        match value.object_id() {
            Some(id) if self.owns(value) => !matches!(self.callee(id), Callee::NotCallable),
            _ => false,
        }
    }

    pub fn is_constructor(&self, value: &Value) -> bool {
        match value.object_id() {
            Some(id) if self.owns(value) => match self.callee(id) {
                Callee::Native(f, _) => f.kind == NativeKind::Constructor,
                Callee::Derived(_) => true,
                _ => false,
            },
            _ => false,
        }
    }

    // ===== Properties =====

    /// `obj[key]`, invoking getters
    pub fn get(&self, obj: &Value, key: &str) -> Result<Value> {
        let Some(id) = obj.object_id() else {
            if obj.is_nullish() {
                return Err(self.throw(
                    ErrorKind::TypeError,
                    format!("cannot read property '{key}' of {obj}"),
                ));
            }
            return Ok(Value::undefined());
        };
        self.lower(obj)?;
        let found = {
            let mut heap = self.inner.heap.lock();
            let found = heap.lookup(id, key);
            match &found {
                Lookup::Data { value, .. } => heap.retain_value(value),
                Lookup::Accessor {
                    getter: Some(getter),
                    ..
                } => heap.retain(*getter),
                _ => {}
            }
            found
        };
        match found {
            Lookup::Missing | Lookup::Accessor { getter: None, .. } => Ok(Value::undefined()),
            Lookup::Data { value, .. } => Ok(self.lift(value)),
            Lookup::Accessor {
                getter: Some(getter),
                ..
            } => {
                let getter = self.lift(HeapValue::Object(getter));
                self.call(&getter, obj, &[])
            }
        }
    }

    /// `obj[key] = value`, invoking setters
    pub fn set(&self, obj: &Value, key: &str, value: &Value) -> Result<()> {
        enum Outcome {
            Done,
            Setter(ObjectId),
            NoSetter,
            ReadOnly,
        }

        let Some(id) = obj.object_id() else {
            if obj.is_nullish() {
                return Err(self.throw(
                    ErrorKind::TypeError,
                    format!("cannot set property '{key}' of {obj}"),
                ));
            }
            return Ok(());
        };
        self.lower(obj)?;
        let stored = self.lower(value)?;
        let outcome = {
            let mut heap = self.inner.heap.lock();
            match heap.lookup(id, key) {
                Lookup::Accessor {
                    setter: Some(setter),
                    ..
                } => {
                    heap.retain(setter);
                    Outcome::Setter(setter)
                }
                Lookup::Accessor { setter: None, .. } => Outcome::NoSetter,
                Lookup::Data { flags, .. } if !flags.writable => Outcome::ReadOnly,
                Lookup::Data {
                    flags, own: true, ..
                } => {
                    heap.put(id, key, Property::Data { value: stored, flags });
                    Outcome::Done
                }
                _ => {
                    heap.put(
                        id,
                        key,
                        Property::Data {
                            value: stored,
                            flags: PropertyFlags::DEFAULT,
                        },
                    );
                    Outcome::Done
                }
            }
        };
        match outcome {
            Outcome::Done => Ok(()),
            Outcome::Setter(setter) => {
                let setter = self.lift(HeapValue::Object(setter));
                self.call(&setter, obj, std::slice::from_ref(value))
                    .map(|_| ())
            }
            Outcome::NoSetter => Err(self.throw(
                ErrorKind::TypeError,
                format!("cannot set property '{key}' which has only a getter"),
            )),
            Outcome::ReadOnly => Err(self.throw(
                ErrorKind::TypeError,
                format!("cannot assign to read only property '{key}'"),
            )),
        }
    }

    /// Define an own data property, replacing whatever was there
    pub fn define_value(
        &self,
        obj: &Value,
        key: &str,
        value: &Value,
        flags: PropertyFlags,
    ) -> Result<()> {
        let id = self.object_of(obj)?;
        let value = self.lower(value)?;
        self.inner
            .heap
            .lock()
            .put(id, key, Property::Data { value, flags });
        Ok(())
    }

    /// Define an own accessor property
    pub fn define_accessor(
        &self,
        obj: &Value,
        key: &str,
        getter: Option<&Value>,
        setter: Option<&Value>,
        enumerable: bool,
    ) -> Result<()> {
        let id = self.object_of(obj)?;
        let getter = getter.map(|g| self.object_of(g)).transpose()?;
        let setter = setter.map(|s| self.object_of(s)).transpose()?;
        self.inner.heap.lock().put(
            id,
            key,
            Property::Accessor {
                getter,
                setter,
                enumerable,
            },
        );
        Ok(())
    }

    /// `key in obj`
    pub fn has_property(&self, obj: &Value, key: &str) -> Result<bool> {
        let id = self.object_of(obj)?;
        let found = self.inner.heap.lock().lookup(id, key);
        Ok(!matches!(found, Lookup::Missing))
    }

    pub fn has_own_property(&self, obj: &Value, key: &str) -> Result<bool> {
        let id = self.object_of(obj)?;
        let heap = self.inner.heap.lock();
        Ok(heap.get(id).map_or(false, |data| data.own(key).is_some()))
    }

    pub fn delete_property(&self, obj: &Value, key: &str) -> Result<bool> {
        let id = self.object_of(obj)?;
        Ok(self.inner.heap.lock().remove(id, key))
    }

    /// Enumerable own keys in definition order
    pub fn own_keys(&self, obj: &Value) -> Result<Vec<String>> {
        let id = self.object_of(obj)?;
        let heap = self.inner.heap.lock();
        Ok(heap
            .get(id)
            .map(|data| {
                data.properties
                    .iter()
                    .filter(|(_, prop)| prop.enumerable())
                    .map(|(key, _)| key.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    // ===== Calls =====

    /// `f.call(this, ...args)`
    pub fn call(&self, f: &Value, this: &Value, args: &[Value]) -> Result<Value> {
        let _frame = self.inner.enter()?;
        let Some(id) = f.object_id() else {
            return Err(self.throw(
                ErrorKind::TypeError,
                format!("{} is not a function", f.type_name()),
            ));
        };
        self.lower(f)?;
        match self.callee(id) {
            Callee::Native(native, realm) => {
                if native.kind == NativeKind::Constructor {
                    return Err(self.throw(
                        ErrorKind::TypeError,
                        format!(
                            "class constructor {} cannot be invoked without 'new'",
                            native.name
                        ),
                    ));
                }
                let ctx = self.in_realm(realm);
                self.inner.handler().call(
                    &ctx,
                    NativeCall {
                        kind: native.kind,
                        tag: native.tag,
                        magic: native.magic,
                        this,
                        new_target: None,
                        args,
                    },
                )
            }
            Callee::Resolving(resolving) => {
                let value = args.first().cloned().unwrap_or_default();
                self.run_resolving(resolving, &value)?;
                Ok(Value::undefined())
            }
            Callee::Derived(_) => Err(self.throw(
                ErrorKind::TypeError,
                "class constructor cannot be invoked without 'new'",
            )),
            Callee::NotCallable => Err(self.throw(ErrorKind::TypeError, "not a function")),
        }
    }

    /// `new f(...args)`
    pub fn construct(&self, f: &Value, args: &[Value]) -> Result<Value> {
        self.construct_with_new_target(f, args, f)
    }

    /// `Reflect.construct(f, args, new_target)`
    pub fn construct_with_new_target(
        &self,
        f: &Value,
        args: &[Value],
        new_target: &Value,
    ) -> Result<Value> {
        let _frame = self.inner.enter()?;
        let id = self.object_of(f)?;
        self.object_of(new_target)?;
        match self.callee(id) {
            Callee::Native(native, realm) if native.kind == NativeKind::Constructor => {
                let ctx = self.in_realm(realm);
                let instance = self.inner.handler().call(
                    &ctx,
                    NativeCall {
                        kind: native.kind,
                        tag: native.tag,
                        magic: native.magic,
                        this: new_target,
                        new_target: Some(new_target),
                        args,
                    },
                )?;
                if !instance.is_object() {
                    return Err(self.throw(
                        ErrorKind::TypeError,
                        format!("constructor {} did not return an object", native.name),
                    ));
                }
                Ok(instance)
            }
            Callee::Derived(base) => {
                let base = self.value_of(base);
                self.construct_with_new_target(&base, args, new_target)
            }
            _ => Err(self.throw(ErrorKind::TypeError, "not a constructor")),
        }
    }

    /// Create a script-level subclass of the constructor `base`.
    ///
    /// The result inherits statics from `base`, its `prototype` inherits from
    /// `base.prototype`, and constructing it runs `base` with the subclass as
    /// `new_target`.
    pub fn derive_class(&self, name: &str, base: &Value) -> Result<Value> {
        let base_id = self.object_of(base)?;
        if !self.is_constructor(base) {
            return Err(self.throw(
                ErrorKind::TypeError,
                "class extends value is not a constructor",
            ));
        }
        let base_proto = self.get(base, "prototype")?;
        let name = Property::Data {
            value: HeapValue::String(Arc::from(name)),
            flags: PropertyFlags::READ_ONLY,
        };
        let data = ObjectData::new(
            self.realm,
            Some(base_id),
            ObjectKind::Derived { base: base_id },
        )
        .with_property("name", name);
        let (_, ctor) = self.alloc(data)?;
        let proto = self.new_object_proto(&base_proto)?;
        self.set_constructor(&ctor, &proto)?;
        Ok(ctor)
    }

    // ===== Exceptions =====

    /// Build an error of `kind` and wrap it as a thrown exception
    pub fn throw(&self, kind: ErrorKind, message: impl Into<String>) -> EngineError {
        let message = message.into();
        match self.new_error(kind, message.clone()) {
            Ok(err) => EngineError::Exception(Exception::new(err, kind.name().to_string(), message)),
            Err(e) => e,
        }
    }

    /// Throw an arbitrary value
    pub fn throw_value(&self, value: Value) -> EngineError {
        let (name, message) = self.describe(&value);
        EngineError::Exception(Exception::new(value, name, message))
    }

    /// `name` and `message` of a thrown value, read without running getters
    fn describe(&self, value: &Value) -> (String, String) {
        let read = |key: &str| -> Option<String> {
            let id = value.object_id()?;
            if !self.owns(value) {
                return None;
            }
            match self.inner.heap.lock().lookup(id, key) {
                Lookup::Data {
                    value: HeapValue::String(s),
                    ..
                } => Some(s.to_string()),
                _ => None,
            }
        };
        let name = read("name").unwrap_or_default();
        let message = read("message").unwrap_or_else(|| value.to_string());
        (name, message)
    }
}

impl Clone for Context {
    /// Clones borrow the realm; only the original closes it
    fn clone(&self) -> Self {
        Context::borrowed(Arc::clone(&self.inner), self.realm)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.owned {
            self.inner.close_realm(self.realm);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeHandler;
    use crate::runtime::Runtime;

    /// Handler with fixed behavior per tag: 0 adds, 1 constructs, 2 reads `x`
    struct TestHandler;

    impl NativeHandler for TestHandler {
        fn call(&self, ctx: &Context, call: NativeCall<'_>) -> Result<Value> {
            match call.tag {
                0 => {
                    let a = call.arg(0).as_i32().unwrap_or(0);
                    let b = call.arg(1).as_i32().unwrap_or(0);
                    Ok(Value::from(a + b + call.magic))
                }
                1 => {
                    let target = call.new_target.cloned().unwrap_or_default();
                    let proto = ctx.get(&target, "prototype")?;
                    let obj = ctx.new_object_proto(&proto)?;
                    ctx.set(&obj, "x", &call.arg(0))?;
                    Ok(obj)
                }
                2 => ctx.get(call.this, "x"),
                _ => Err(ctx.throw(ErrorKind::TypeError, "unknown tag")),
            }
        }
    }

    fn setup() -> (Runtime, Context) {
        let rt = Runtime::new();
        rt.set_native_handler(Arc::new(TestHandler));
        let ctx = rt.new_context().unwrap();
        (rt, ctx)
    }

    #[test]
    fn test_native_call_receives_tag_and_magic() {
        let (_rt, ctx) = setup();
        let add = ctx
            .new_native_function(NativeFunction::new("add", NativeKind::Generic, 0, 10))
            .unwrap();
        let r = ctx
            .call(&add, &Value::undefined(), &[Value::from(2), Value::from(3)])
            .unwrap();
        assert_eq!(r.as_i32(), Some(15));
        assert_eq!(ctx.get(&add, "name").unwrap().as_str(), Some("add"));
    }

    #[test]
    fn test_constructor_requires_new() {
        let (_rt, ctx) = setup();
        let ctor = ctx
            .new_native_function(NativeFunction::new("Thing", NativeKind::Constructor, 1, 0))
            .unwrap();
        let err = ctx.call(&ctor, &Value::undefined(), &[]).unwrap_err();
        assert_eq!(err.exception().unwrap().name(), "TypeError");
    }

    #[test]
    fn test_construct_and_derive() {
        let (_rt, ctx) = setup();
        let ctor = ctx
            .new_native_function(NativeFunction::new("Thing", NativeKind::Constructor, 1, 0))
            .unwrap();
        let proto = ctx.new_object().unwrap();
        ctx.set_constructor(&ctor, &proto).unwrap();

        let derived = ctx.derive_class("SubThing", &ctor).unwrap();
        assert!(ctx.is_constructor(&derived));
        assert!(ctx.prototype_of(&derived).unwrap().same_object(&ctor));

        let obj = ctx.construct(&derived, &[Value::from(4)]).unwrap();
        let obj_proto = ctx.prototype_of(&obj).unwrap();
        assert!(obj_proto.same_object(&ctx.get(&derived, "prototype").unwrap()));
        assert!(ctx.prototype_of(&obj_proto).unwrap().same_object(&proto));
        assert_eq!(ctx.get(&obj, "x").unwrap().as_i32(), Some(4));
    }

    #[test]
    fn test_accessors() {
        let (_rt, ctx) = setup();
        let getter = ctx
            .new_native_function(NativeFunction::new("x", NativeKind::Getter, 2, 0))
            .unwrap();
        let view = ctx.new_object_proto(&Value::null()).unwrap();
        ctx.define_accessor(&view, "value", Some(&getter), None, false)
            .unwrap();

        // getter runs with the accessing object as `this`
        let child = ctx.new_object_proto(&view).unwrap();
        ctx.define_value(&child, "x", &Value::from(8), PropertyFlags::DEFAULT)
            .unwrap();
        assert_eq!(ctx.get(&child, "value").unwrap().as_i32(), Some(8));

        let err = ctx.set(&child, "value", &Value::from(1)).unwrap_err();
        assert_eq!(err.exception().unwrap().name(), "TypeError");
    }

    #[test]
    fn test_properties() {
        let (_rt, ctx) = setup();
        let obj = ctx.new_object().unwrap();
        ctx.set(&obj, "a", &Value::from(1)).unwrap();
        ctx.set(&obj, "b", &Value::from("two")).unwrap();
        ctx.define_value(&obj, "hidden", &Value::null(), PropertyFlags::HIDDEN)
            .unwrap();
        assert_eq!(ctx.own_keys(&obj).unwrap(), vec!["a", "b"]);
        assert!(ctx.has_property(&obj, "hidden").unwrap());
        assert!(ctx.delete_property(&obj, "a").unwrap());
        assert!(!ctx.delete_property(&obj, "a").unwrap());
        assert!(ctx.get(&obj, "a").unwrap().is_undefined());

        let err = ctx.get(&Value::undefined(), "a").unwrap_err();
        assert!(err.is_exception());
    }

    #[test]
    fn test_read_only_property() {
        let (_rt, ctx) = setup();
        let obj = ctx.new_object().unwrap();
        ctx.define_value(&obj, "k", &Value::from(1), PropertyFlags::READ_ONLY)
            .unwrap();
        assert!(ctx.set(&obj, "k", &Value::from(2)).is_err());
        assert_eq!(ctx.get(&obj, "k").unwrap().as_i32(), Some(1));
    }

    #[test]
    fn test_opaque_checks_class() {
        let (rt, ctx) = setup();
        let a = rt.new_class_id().unwrap();
        let b = rt.new_class_id().unwrap();
        rt.new_class(a, ClassDef::new("A")).unwrap();
        rt.new_class(b, ClassDef::new("B")).unwrap();
        let obj = ctx.new_object_proto_class(&Value::null(), a).unwrap();
        ctx.set_opaque(&obj, 99).unwrap();
        assert_eq!(ctx.opaque(&obj, a), Some(99));
        assert_eq!(ctx.opaque(&obj, b), None);
        assert_eq!(ctx.class_id_of(&obj), Some(a));

        let plain = ctx.new_object().unwrap();
        assert!(ctx.set_opaque(&plain, 1).is_err());
        assert_eq!(ctx.class_id_of(&plain), None);
    }

    #[test]
    fn test_class_proto_per_realm() {
        let (rt, ctx) = setup();
        let id = rt.new_class_id().unwrap();
        rt.new_class(id, ClassDef::new("P")).unwrap();
        let proto = ctx.new_object().unwrap();
        ctx.set_class_proto(id, &proto).unwrap();
        assert!(ctx.class_proto(id).unwrap().same_object(&proto));

        let other = rt.new_context().unwrap();
        assert!(other.class_proto(id).is_none());
    }

    #[test]
    fn test_realm_data_follows_the_creating_realm() {
        let (rt, a) = setup();
        let b = rt.new_context().unwrap();
        a.set_userdata(Arc::new("a")).unwrap();
        b.set_userdata(Arc::new("b")).unwrap();

        let obj = b.new_object().unwrap();
        let data = a.realm_data_of(&obj).unwrap();
        assert_eq!(data.downcast_ref::<&str>(), Some(&"b"));
        assert!(a.realm_data_of(&Value::from(1)).is_none());

        drop(b);
        assert!(a.realm_data_of(&obj).is_none());
    }

    #[test]
    fn test_thrown_values_keep_identity() {
        let (_rt, ctx) = setup();
        let payload = ctx.new_object().unwrap();
        let err = ctx.throw_value(payload.clone());
        assert!(err.exception().unwrap().value().same_object(&payload));

        let err = ctx.throw(ErrorKind::RangeError, "out of range");
        let ex = err.exception().unwrap();
        assert_eq!(ex.name(), "RangeError");
        assert!(ctx.is_error(ex.value()));
        assert_eq!(
            ctx.get(ex.value(), "message").unwrap().as_str(),
            Some("out of range")
        );
    }

    #[test]
    fn test_values_from_other_runtime_are_rejected() {
        let (_rt, ctx) = setup();
        let other_rt = Runtime::new();
        let other = other_rt.new_context().unwrap();
        let foreign = other.new_object().unwrap();
        assert!(matches!(
            ctx.set(&foreign, "a", &Value::from(1)),
            Err(EngineError::WrongRuntime)
        ));
    }

    #[test]
    fn test_call_depth_limit() {
        struct Recurse;
        impl NativeHandler for Recurse {
            fn call(&self, ctx: &Context, call: NativeCall<'_>) -> Result<Value> {
                let this = call.this.clone();
                ctx.call(&this, &this, &[])
            }
        }
        let rt = Runtime::with_options(crate::RuntimeOptions::new().with_max_call_depth(16));
        rt.set_native_handler(Arc::new(Recurse));
        let ctx = rt.new_context().unwrap();
        let f = ctx
            .new_native_function(NativeFunction::new("f", NativeKind::Generic, 0, 0))
            .unwrap();
        let err = ctx.call(&f, &f, &[]).unwrap_err();
        assert!(matches!(err, EngineError::StackOverflow { max: 16 }));
    }

    #[test]
    fn test_interrupt_handler() {
        let (rt, ctx) = setup();
        let add = ctx
            .new_native_function(NativeFunction::new("add", NativeKind::Generic, 0, 0))
            .unwrap();
        rt.set_interrupt_handler(|| true);
        assert!(matches!(
            ctx.call(&add, &Value::undefined(), &[]),
            Err(EngineError::Interrupted)
        ));
        rt.clear_interrupt_handler();
        assert!(ctx.call(&add, &Value::undefined(), &[]).is_ok());
    }
}
