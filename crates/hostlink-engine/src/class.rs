//! Class identities
//!
//! A class identity tags objects whose opaque slot is meaningful. Identities
//! are allocated from a bounded space and, once defined, carry a name and an
//! optional finalizer that the collector runs for each freed instance.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{EngineError, Result};
use crate::object::ObjectId;

/// Upper bound (exclusive) of the class identity space
pub const MAX_CLASS_ID: u32 = 1 << 16;

/// Identity of a registered class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(u32);

impl ClassId {
    /// Raw identity value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a finalizer learns about the instance being freed
pub struct Finalized {
    /// The freed object; its id is dead by the time the finalizer runs
    pub object: ObjectId,
    pub class_id: ClassId,
    /// Contents of the opaque slot
    pub opaque: usize,
    /// Userdata of the context the instance was created in, if still open
    pub realm_data: Option<Arc<dyn Any + Send + Sync>>,
}

/// Per-class finalizer
pub type Finalizer = Arc<dyn Fn(Finalized) + Send + Sync>;

/// Definition registered for an allocated class identity
#[derive(Clone)]
pub struct ClassDef {
    pub name: String,
    pub finalizer: Option<Finalizer>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            finalizer: None,
        }
    }

    pub fn with_finalizer(mut self, finalizer: Finalizer) -> Self {
        self.finalizer = Some(finalizer);
        self
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Allocation and definition state of every class identity in a runtime
pub(crate) struct ClassTable {
    next: u32,
    defs: FxHashMap<ClassId, ClassDef>,
}

impl ClassTable {
    pub(crate) fn new() -> Self {
        // 0 stays reserved for "not a class instance"
        Self {
            next: 1,
            defs: FxHashMap::default(),
        }
    }

    pub(crate) fn allocate(&mut self) -> Result<ClassId> {
        if self.next >= MAX_CLASS_ID {
            return Err(EngineError::ClassLimit { max: MAX_CLASS_ID });
        }
        let id = ClassId(self.next);
        self.next += 1;
        Ok(id)
    }

    pub(crate) fn define(&mut self, id: ClassId, def: ClassDef) -> Result<()> {
        if id.0 == 0 || id.0 >= self.next {
            return Err(EngineError::UnknownClass(id));
        }
        if self.defs.contains_key(&id) {
            return Err(EngineError::ClassAlreadyDefined(id));
        }
        self.defs.insert(id, def);
        Ok(())
    }

    pub(crate) fn is_defined(&self, id: ClassId) -> bool {
        self.defs.contains_key(&id)
    }

    pub(crate) fn name(&self, id: ClassId) -> Option<&str> {
        self.defs.get(&id).map(|def| def.name.as_str())
    }

    pub(crate) fn finalizer(&self, id: ClassId) -> Option<Finalizer> {
        self.defs.get(&id).and_then(|def| def.finalizer.clone())
    }

    pub(crate) fn allocated(&self) -> usize {
        (self.next - 1) as usize
    }

    pub(crate) fn clear(&mut self) {
        self.defs.clear();
    }
}
