//! Engine values
//!
//! A [`Value`] is either an immediate (undefined, null, boolean, number,
//! string) or a counted reference to a heap object. Cloning an object value
//! takes a reference and dropping it gives the reference back. When the last
//! reference goes away the object is queued for the owning thread's sweep, so
//! values may be cloned and dropped on any thread.

use std::fmt;
use std::sync::Arc;

use crate::object::ObjectId;
use crate::runtime::RuntimeInner;

/// A value as stored inside the heap: object references are bare ids whose
/// counts are owned by the containing object.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HeapValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(Arc<str>),
    Object(ObjectId),
}

impl HeapValue {
    pub(crate) fn object(&self) -> Option<ObjectId> {
        match self {
            HeapValue::Object(id) => Some(*id),
            _ => None,
        }
    }
}

/// Counted reference to a heap object
pub(crate) struct ObjectRef {
    id: ObjectId,
    rt: Arc<RuntimeInner>,
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.rt.retain(self.id);
        Self {
            id: self.id,
            rt: Arc::clone(&self.rt),
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        self.rt.release(self.id);
    }
}

#[derive(Clone)]
enum Repr {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    Float(f64),
    String(Arc<str>),
    Object(ObjectRef),
}

/// A script value
#[derive(Clone)]
pub struct Value {
    repr: Repr,
}

impl Value {
    /// `undefined`
    pub const fn undefined() -> Self {
        Self {
            repr: Repr::Undefined,
        }
    }

    /// `null`
    pub const fn null() -> Self {
        Self { repr: Repr::Null }
    }

    /// A boolean
    pub const fn bool(b: bool) -> Self {
        Self { repr: Repr::Bool(b) }
    }

    /// A 32-bit integer
    pub const fn int32(i: i32) -> Self {
        Self { repr: Repr::Int(i) }
    }

    /// A double
    pub const fn float64(f: f64) -> Self {
        Self {
            repr: Repr::Float(f),
        }
    }

    /// A string
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self {
            repr: Repr::String(s.into()),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self.repr, Repr::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Null)
    }

    /// `undefined` or `null`
    pub fn is_nullish(&self) -> bool {
        matches!(self.repr, Repr::Undefined | Repr::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.repr, Repr::Bool(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.repr, Repr::Int(_) | Repr::Float(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self.repr, Repr::String(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self.repr, Repr::Object(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.repr {
            Repr::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Integer view; doubles qualify only when they are integral and in range
    pub fn as_i32(&self) -> Option<i32> {
        match self.repr {
            Repr::Int(i) => Some(i),
            Repr::Float(f)
                if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 =>
            {
                Some(f as i32)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.repr {
            Repr::Int(i) => Some(i as f64),
            Repr::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.repr {
            Repr::String(s) => Some(s),
            _ => None,
        }
    }

    /// Identity of the referenced object
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.repr {
            Repr::Object(obj) => Some(obj.id),
            _ => None,
        }
    }

    /// Whether both values reference the same object
    pub fn same_object(&self, other: &Value) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Object(a), Repr::Object(b)) => a.id == b.id && Arc::ptr_eq(&a.rt, &b.rt),
            _ => false,
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (&self.repr, &other.repr) {
            (Repr::Undefined, Repr::Undefined) | (Repr::Null, Repr::Null) => true,
            (Repr::Bool(a), Repr::Bool(b)) => a == b,
            (Repr::String(a), Repr::String(b)) => a == b,
            (Repr::Object(_), Repr::Object(_)) => self.same_object(other),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// `typeof`-style type name
    pub fn type_name(&self) -> &'static str {
        match self.repr {
            Repr::Undefined => "undefined",
            Repr::Null => "null",
            Repr::Bool(_) => "boolean",
            Repr::Int(_) | Repr::Float(_) => "number",
            Repr::String(_) => "string",
            Repr::Object(_) => "object",
        }
    }

    pub(crate) fn to_heap(&self) -> HeapValue {
        match &self.repr {
            Repr::Undefined => HeapValue::Undefined,
            Repr::Null => HeapValue::Null,
            Repr::Bool(b) => HeapValue::Bool(*b),
            Repr::Int(i) => HeapValue::Int(*i),
            Repr::Float(f) => HeapValue::Float(*f),
            Repr::String(s) => HeapValue::String(Arc::clone(s)),
            Repr::Object(obj) => HeapValue::Object(obj.id),
        }
    }

    /// Wrap a heap value whose reference count was already taken for us.
    pub(crate) fn adopt(rt: &Arc<RuntimeInner>, value: HeapValue) -> Self {
        let repr = match value {
            HeapValue::Undefined => Repr::Undefined,
            HeapValue::Null => Repr::Null,
            HeapValue::Bool(b) => Repr::Bool(b),
            HeapValue::Int(i) => Repr::Int(i),
            HeapValue::Float(f) => Repr::Float(f),
            HeapValue::String(s) => Repr::String(s),
            HeapValue::Object(id) => Repr::Object(ObjectRef {
                id,
                rt: Arc::clone(rt),
            }),
        };
        Self { repr }
    }

    pub(crate) fn runtime(&self) -> Option<&Arc<RuntimeInner>> {
        match &self.repr {
            Repr::Object(obj) => Some(&obj.rt),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::undefined()
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::undefined()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::int32(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Undefined => f.write_str("undefined"),
            Repr::Null => f.write_str("null"),
            Repr::Bool(b) => write!(f, "{b}"),
            Repr::Int(i) => write!(f, "{i}"),
            Repr::Float(x) => write!(f, "{x}"),
            Repr::String(s) => write!(f, "{s:?}"),
            Repr::Object(obj) => write!(f, "Object({})", obj.id),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::String(s) => f.write_str(s),
            Repr::Object(_) => f.write_str("[object Object]"),
            Repr::Float(x) if x.is_nan() => f.write_str("NaN"),
            _ => fmt::Debug::fmt(self, f),
        }
    }
}
