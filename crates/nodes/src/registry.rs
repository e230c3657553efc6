//! Process-local store for objects that cannot cross a serialisation
//! boundary (database handles, stateful agents, accumulators).
//!
//! The registry is a generation-checked arena.  A [`Handle`] names a slot
//! index, the generation the slot had when the object was stored, and the id
//! of the issuing registry.  Removing an object or clearing the registry bumps
//! the slot generation, so stale handles miss instead of aliasing whatever
//! object later reuses the slot.  Handles from another registry (another
//! process, or another test) always miss.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// What kind of object a handle refers to.  Purely descriptive: no category
/// gets special cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Connection,
    Agent,
    Accumulator,
    Other(String),
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => f.write_str("connection"),
            Self::Agent => f.write_str("agent"),
            Self::Accumulator => f.write_str("accumulator"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Opaque reference to an object held by an [`ObjectRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    registry: Uuid,
    index: u32,
    generation: u32,
    category: Category,
}

impl Handle {
    pub fn category(&self) -> &Category {
        &self.category
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}@{}", self.category, self.index, self.generation, self.registry.simple())
    }
}

struct Entry {
    category: Category,
    object: Arc<dyn Any + Send + Sync>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Thread-safe handle issuer.  Construct one per process (or per test) and
/// share it through an `Arc`.
pub struct ObjectRegistry {
    id: Uuid,
    arena: RwLock<Arena>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self { id: Uuid::new_v4(), arena: RwLock::new(Arena::default()) }
    }

    /// Store an object and return a handle to it.
    pub fn store<T: Any + Send + Sync>(&self, object: T, category: Category) -> Handle {
        self.store_arc(Arc::new(object), category)
    }

    /// Store an already shared object.
    pub fn store_arc<T: Any + Send + Sync>(&self, object: Arc<T>, category: Category) -> Handle {
        let mut arena = self.arena.write();
        let entry = Entry { category: category.clone(), object };

        let index = match arena.free.pop() {
            Some(index) => {
                arena.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                let index = arena.slots.len() as u32;
                arena.slots.push(Slot { generation: 0, entry: Some(entry) });
                index
            }
        };
        arena.live += 1;
        let generation = arena.slots[index as usize].generation;

        let handle = Handle { registry: self.id, index, generation, category };
        debug!(handle = %handle, "object stored");
        handle
    }

    /// Look an object up.  Unknown, foreign, stale and wrongly typed handles
    /// all return `None`; callers treat that as "rebuild and retry".
    pub fn get<T: Any + Send + Sync>(&self, handle: &Handle) -> Option<Arc<T>> {
        if handle.registry != self.id {
            return None;
        }
        let arena = self.arena.read();
        let slot = arena.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.as_ref()?;
        if entry.category != handle.category {
            return None;
        }
        Arc::clone(&entry.object).downcast::<T>().ok()
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        if handle.registry != self.id {
            return false;
        }
        let arena = self.arena.read();
        arena
            .slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    /// Drop the registry's reference to an object.  Returns `false` when the
    /// handle was already invalid.
    pub fn remove(&self, handle: &Handle) -> bool {
        if handle.registry != self.id {
            return false;
        }
        let mut arena = self.arena.write();
        let Some(slot) = arena.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(handle.index);
        arena.live -= 1;
        true
    }

    /// Invalidate every handle issued so far.
    pub fn clear(&self) {
        let mut arena = self.arena.write();
        let mut free = Vec::with_capacity(arena.slots.len());
        for (index, slot) in arena.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            free.push(index as u32);
        }
        arena.free = free;
        arena.live = 0;
        debug!(registry = %self.id, "registry cleared");
    }

    pub fn len(&self) -> usize {
        self.arena.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}
