//! Object heap
//!
//! Objects live in a slab of generational slots. An [`ObjectId`] names a slot
//! together with the generation it was allocated in, so an id never aliases
//! a later object that reuses the slot.
//!
//! Every reference to an object, whether held by a [`Value`](crate::Value), by
//! another object or by a realm, contributes one count. A count that drops to
//! zero only queues the object; the owning thread frees queued objects in
//! [`Heap::free_pending`]. [`Heap::collect_cycles`] additionally reclaims
//! unreachable cycles by trial deletion: counts contributed by other heap
//! objects are subtracted, whatever still has external counts is a root, and
//! everything not reachable from a root is garbage.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::class::ClassId;
use crate::error::{EngineError, Result};
use crate::native::NativeFunction;
use crate::promise::{PromiseData, ResolvingFunction};
use crate::value::HeapValue;

/// Accounted size of one object against the memory limit
pub const OBJECT_COST: usize = 96;

/// Guard against runaway prototype chains
const MAX_PROTO_DEPTH: usize = 4096;

/// Generational identity of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    index: u32,
    generation: u32,
}

impl ObjectId {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

/// Index of a realm (context) inside its runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RealmId(pub(crate) u32);

/// Attributes of a data property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyFlags {
    pub enumerable: bool,
    pub writable: bool,
}

impl PropertyFlags {
    /// Plain assignment: enumerable and writable
    pub const DEFAULT: PropertyFlags = PropertyFlags {
        enumerable: true,
        writable: true,
    };
    /// Methods and internal links: writable but not enumerable
    pub const HIDDEN: PropertyFlags = PropertyFlags {
        enumerable: false,
        writable: true,
    };
    pub const READ_ONLY: PropertyFlags = PropertyFlags {
        enumerable: false,
        writable: false,
    };
}

#[derive(Debug, Clone)]
pub(crate) enum Property {
    Data {
        value: HeapValue,
        flags: PropertyFlags,
    },
    Accessor {
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
        enumerable: bool,
    },
}

impl Property {
    fn objects(&self, out: &mut Vec<ObjectId>) {
        match self {
            Property::Data { value, .. } => out.extend(value.object()),
            Property::Accessor { getter, setter, .. } => {
                out.extend(*getter);
                out.extend(*setter);
            }
        }
    }

    pub(crate) fn enumerable(&self) -> bool {
        match self {
            Property::Data { flags, .. } => flags.enumerable,
            Property::Accessor { enumerable, .. } => *enumerable,
        }
    }
}

pub(crate) enum ObjectKind {
    Ordinary,
    Error,
    Native(NativeFunction),
    /// Script-level subclass constructor
    Derived {
        base: ObjectId,
    },
    Promise(PromiseData),
    Resolving(ResolvingFunction),
}

pub(crate) struct ObjectData {
    pub(crate) refcount: u32,
    pub(crate) realm: RealmId,
    pub(crate) proto: Option<ObjectId>,
    pub(crate) class_id: Option<ClassId>,
    pub(crate) opaque: usize,
    pub(crate) properties: Vec<(Arc<str>, Property)>,
    pub(crate) kind: ObjectKind,
}

impl ObjectData {
    pub(crate) fn new(realm: RealmId, proto: Option<ObjectId>, kind: ObjectKind) -> Self {
        Self {
            refcount: 1,
            realm,
            proto,
            class_id: None,
            opaque: 0,
            properties: Vec::new(),
            kind,
        }
    }

    pub(crate) fn with_class(mut self, class_id: ClassId) -> Self {
        self.class_id = Some(class_id);
        self
    }

    /// Add a property to an object that has not been allocated yet
    pub(crate) fn with_property(mut self, key: &str, property: Property) -> Self {
        self.properties.push((Arc::from(key), property));
        self
    }

    pub(crate) fn own(&self, key: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, p)| p)
    }

    fn own_index(&self, key: &str) -> Option<usize> {
        self.properties.iter().position(|(k, _)| &**k == key)
    }

    /// Every object this one holds a count on
    pub(crate) fn children(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        out.extend(self.proto);
        for (_, prop) in &self.properties {
            prop.objects(&mut out);
        }
        match &self.kind {
            ObjectKind::Derived { base } => out.push(*base),
            ObjectKind::Promise(promise) => promise.objects(&mut out),
            ObjectKind::Resolving(resolving) => out.push(resolving.promise),
            ObjectKind::Ordinary | ObjectKind::Error | ObjectKind::Native(_) => {}
        }
        out
    }
}

/// Bookkeeping handed to finalizers and the native handler after a free
pub(crate) struct Freed {
    pub(crate) id: ObjectId,
    pub(crate) realm: RealmId,
    pub(crate) class_id: Option<ClassId>,
    pub(crate) opaque: usize,
    pub(crate) native: Option<NativeFunction>,
}

impl Freed {
    fn new(id: ObjectId, data: ObjectData) -> Self {
        let native = match data.kind {
            ObjectKind::Native(f) => Some(f),
            _ => None,
        };
        Self {
            id,
            realm: data.realm,
            class_id: data.class_id,
            opaque: data.opaque,
            native,
        }
    }
}

/// Result of a property lookup along the prototype chain
pub(crate) enum Lookup {
    Missing,
    Data {
        value: HeapValue,
        flags: PropertyFlags,
        own: bool,
    },
    Accessor {
        getter: Option<ObjectId>,
        setter: Option<ObjectId>,
    },
}

struct Slot {
    generation: u32,
    data: Option<ObjectData>,
}

pub(crate) struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    pending: Vec<ObjectId>,
    limit: Option<usize>,
    allocations: usize,
}

impl Heap {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            pending: Vec::new(),
            limit,
            allocations: 0,
        }
    }

    pub(crate) fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub(crate) fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn bytes(&self) -> usize {
        self.live * OBJECT_COST
    }

    /// Allocations since the last collection
    pub(crate) fn allocations(&self) -> usize {
        self.allocations
    }

    /// Allocate `data`, taking a count on every object it references.
    ///
    /// The new object starts with one count, owned by the caller.
    pub(crate) fn alloc(&mut self, mut data: ObjectData) -> Result<ObjectId> {
        if let Some(limit) = self.limit {
            if (self.live + 1) * OBJECT_COST > limit {
                return Err(EngineError::OutOfMemory { limit });
            }
        }
        for child in data.children() {
            self.retain(child);
        }
        data.refcount = 1;
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.data = Some(data);
                ObjectId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    data: Some(data),
                });
                ObjectId {
                    index,
                    generation: 0,
                }
            }
        };
        self.live += 1;
        self.allocations += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: ObjectId) -> Option<&ObjectData> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Option<&mut ObjectData> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.data.as_mut())
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn retain(&mut self, id: ObjectId) {
        if let Some(obj) = self.get_mut(id) {
            obj.refcount += 1;
        }
    }

    pub(crate) fn release(&mut self, id: ObjectId) {
        let Some(obj) = self.get_mut(id) else {
            return;
        };
        if obj.refcount == 0 {
            return;
        }
        obj.refcount -= 1;
        if obj.refcount == 0 {
            self.pending.push(id);
        }
    }

    pub(crate) fn retain_value(&mut self, value: &HeapValue) {
        if let Some(id) = value.object() {
            self.retain(id);
        }
    }

    /// Define or replace an own property. Returns `false` for a dead object.
    pub(crate) fn put(&mut self, id: ObjectId, key: &str, property: Property) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut added = Vec::new();
        property.objects(&mut added);
        for child in &added {
            self.retain(*child);
        }
        let Some(obj) = self.get_mut(id) else {
            return false;
        };
        let old = match obj.own_index(key) {
            Some(index) => Some(std::mem::replace(&mut obj.properties[index].1, property)),
            None => {
                obj.properties.push((Arc::from(key), property));
                None
            }
        };
        if let Some(old) = old {
            let mut removed = Vec::new();
            old.objects(&mut removed);
            for child in removed {
                self.release(child);
            }
        }
        true
    }

    /// Remove an own property; `false` when it did not exist
    pub(crate) fn remove(&mut self, id: ObjectId, key: &str) -> bool {
        let Some(obj) = self.get_mut(id) else {
            return false;
        };
        let Some(index) = obj.own_index(key) else {
            return false;
        };
        let (_, old) = obj.properties.remove(index);
        let mut removed = Vec::new();
        old.objects(&mut removed);
        for child in removed {
            self.release(child);
        }
        true
    }

    /// Find `key` on `id` or its prototype chain
    pub(crate) fn lookup(&self, id: ObjectId, key: &str) -> Lookup {
        let mut current = Some(id);
        let mut depth = 0;
        while let Some(cur) = current {
            let Some(obj) = self.get(cur) else {
                break;
            };
            if let Some(prop) = obj.own(key) {
                return match prop {
                    Property::Data { value, flags } => Lookup::Data {
                        value: value.clone(),
                        flags: *flags,
                        own: cur == id,
                    },
                    Property::Accessor { getter, setter, .. } => Lookup::Accessor {
                        getter: *getter,
                        setter: *setter,
                    },
                };
            }
            depth += 1;
            if depth > MAX_PROTO_DEPTH {
                break;
            }
            current = obj.proto;
        }
        Lookup::Missing
    }

    /// Replace the prototype of `id`. Returns `false` if it would form a cycle.
    pub(crate) fn set_proto(&mut self, id: ObjectId, proto: Option<ObjectId>) -> bool {
        let mut cursor = proto;
        let mut depth = 0;
        while let Some(cur) = cursor {
            if cur == id || depth > MAX_PROTO_DEPTH {
                return false;
            }
            cursor = self.get(cur).and_then(|obj| obj.proto);
            depth += 1;
        }
        if let Some(new) = proto {
            self.retain(new);
        }
        let old = match self.get_mut(id) {
            Some(obj) => std::mem::replace(&mut obj.proto, proto),
            None => return false,
        };
        if let Some(old) = old {
            self.release(old);
        }
        true
    }

    fn free_slot(&mut self, id: ObjectId) -> Option<ObjectData> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let data = slot.data.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(data)
    }

    fn live_ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.data.is_some())
            .map(|(index, slot)| ObjectId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    /// Free every queued object whose count is still zero, cascading into
    /// the objects it referenced.
    pub(crate) fn free_pending(&mut self) -> Vec<Freed> {
        let mut freed = Vec::new();
        while let Some(id) = self.pending.pop() {
            match self.get(id) {
                Some(obj) if obj.refcount == 0 => {}
                // resurrected or already gone
                _ => continue,
            }
            if let Some(data) = self.free_slot(id) {
                for child in data.children() {
                    self.release(child);
                }
                freed.push(Freed::new(id, data));
            }
        }
        freed
    }

    /// Free queued objects, then reclaim unreachable cycles.
    pub(crate) fn collect_cycles(&mut self) -> Vec<Freed> {
        let mut freed = self.free_pending();

        let ids = self.live_ids();
        let mut internal: FxHashMap<ObjectId, u32> = FxHashMap::default();
        for &id in &ids {
            if let Some(obj) = self.get(id) {
                for child in obj.children() {
                    if self.contains(child) {
                        *internal.entry(child).or_default() += 1;
                    }
                }
            }
        }

        let mut stack: Vec<ObjectId> = ids
            .iter()
            .copied()
            .filter(|id| {
                let refcount = self.get(*id).map_or(0, |obj| obj.refcount);
                refcount > internal.get(id).copied().unwrap_or(0)
            })
            .collect();
        let mut reachable: FxHashSet<ObjectId> = FxHashSet::default();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) {
                continue;
            }
            if let Some(obj) = self.get(id) {
                for child in obj.children() {
                    if self.contains(child) && !reachable.contains(&child) {
                        stack.push(child);
                    }
                }
            }
        }

        let garbage: FxHashSet<ObjectId> = ids
            .into_iter()
            .filter(|id| !reachable.contains(id))
            .collect();
        for &id in &garbage {
            if let Some(data) = self.free_slot(id) {
                for child in data.children() {
                    if !garbage.contains(&child) {
                        self.release(child);
                    }
                }
                freed.push(Freed::new(id, data));
            }
        }
        freed.extend(self.free_pending());
        self.allocations = 0;
        freed
    }

    /// Free every remaining object regardless of counts
    pub(crate) fn free_all(&mut self) -> Vec<Freed> {
        self.pending.clear();
        self.live_ids()
            .into_iter()
            .filter_map(|id| self.free_slot(id).map(|data| Freed::new(id, data)))
            .collect()
    }
}
