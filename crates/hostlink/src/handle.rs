//! Thread-safe handle table for host values
//!
//! Maps small positive integer IDs to host values so they can travel through
//! the engine's native boundary, which only carries a 32-bit `magic`. IDs
//! start at 1, grow monotonically and are never reused; 0 is reserved as
//! "no handle".

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use dashmap::DashMap;

/// Numeric handle of a stored host value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(i32);

impl HandleId {
    /// Interpret a raw engine integer; 0 and negatives are not handles
    pub fn from_raw(raw: i32) -> Option<HandleId> {
        (raw > 0).then_some(HandleId(raw))
    }

    /// Interpret an engine opaque slot
    pub fn from_opaque(opaque: usize) -> Option<HandleId> {
        i32::try_from(opaque).ok().and_then(HandleId::from_raw)
    }

    pub fn get(self) -> i32 {
        self.0
    }

    /// The value written into an instance's opaque slot
    pub fn as_opaque(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    /// Every positive 32-bit ID has been handed out
    #[error("handle ID space exhausted")]
    Overflow,
}

/// Thread-safe table mapping handle IDs to values.
///
/// Every method may be called from any thread.
pub struct HandleTable<V> {
    map: DashMap<i32, V>,
    next_id: AtomicI32,
}

impl<V: Clone + Send + Sync> HandleTable<V> {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: i32) -> Self {
        Self {
            map: DashMap::new(),
            next_id: AtomicI32::new(first),
        }
    }

    /// Store a value and return its handle.
    ///
    /// Once the counter reaches `i32::MAX` every further call fails; the
    /// counter never wraps back into IDs that may still be live.
    pub fn try_store(&self, value: V) -> Result<HandleId, HandleError> {
        let id = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                (id < i32::MAX).then(|| id + 1)
            })
            .map_err(|_| HandleError::Overflow)?;
        self.map.insert(id, value);
        Ok(HandleId(id))
    }

    /// Store a value, aborting the process if the ID space is exhausted.
    ///
    /// Continuing after an overflow would risk handing two live values the
    /// same ID, which the bridge cannot recover from.
    pub fn store(&self, value: V) -> HandleId {
        match self.try_store(value) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(target: "hostlink", live = self.map.len(), "{err}");
                std::process::abort();
            }
        }
    }

    /// Clone out the value behind `id`.
    pub fn load(&self, id: HandleId) -> Option<V> {
        self.map.get(&id.0).map(|entry| entry.value().clone())
    }

    /// Remove and return the value behind `id`.
    pub fn take(&self, id: HandleId) -> Option<V> {
        self.map.remove(&id.0).map(|(_, value)| value)
    }

    /// Remove `id`. Returns `false` if it was already gone.
    pub fn delete(&self, id: HandleId) -> bool {
        self.take(id).is_some()
    }

    /// Delete every live handle, returning how many were released.
    ///
    /// Values are dropped one by one outside the map's shard locks.
    pub fn clear(&self) -> usize {
        let ids: Vec<i32> = self.map.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.map.remove(id).is_some())
            .count()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.map.contains_key(&id.0)
    }

    /// Number of live handles.
    pub fn count(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<V: Clone + Send + Sync> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
