//! Constructor registry
//!
//! Maps the object identity of every bridged class constructor to its class
//! identity. Object identities are generational, so an entry left behind by
//! a collected constructor can never match a later object; the dispatcher
//! still removes entries as soon as the engine reports the constructor freed.

use hostlink_engine::{self as engine, ClassId, ObjectId, Value};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

/// Upper bound on prototype-chain walks; chains this deep are cyclic or
/// pathological
const MAX_CHAIN_DEPTH: usize = 4096;

pub struct ConstructorRegistry {
    entries: RwLock<FxHashMap<ObjectId, ClassId>>,
}

impl ConstructorRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn register(&self, constructor: ObjectId, class_id: ClassId) {
        self.entries.write().insert(constructor, class_id);
    }

    /// Remove a constructor; unknown identities are ignored
    pub fn unregister(&self, constructor: ObjectId) -> Option<ClassId> {
        self.entries.write().remove(&constructor)
    }

    pub fn get(&self, constructor: ObjectId) -> Option<ClassId> {
        self.entries.read().get(&constructor).copied()
    }

    /// Find the class a `new_target` constructs.
    ///
    /// Script subclasses are not registered themselves; their `[[Prototype]]`
    /// chain leads back to the bridged base constructor.
    pub fn resolve(&self, ctx: &engine::Context, new_target: &Value) -> Option<ClassId> {
        let mut current = new_target.clone();
        for _ in 0..MAX_CHAIN_DEPTH {
            let id = current.object_id()?;
            if let Some(class_id) = self.get(id) {
                return Some(class_id);
            }
            current = ctx.prototype_of(&current).ok()?;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ConstructorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
