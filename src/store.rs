//! Store adapters: uniform key→entity access over a keyed map or a single
//! slot, plus the mutation wrapper every store write is funneled through.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::entity::Entity;
use crate::error::StoreError;

/// Uniform `get`/`set`/`delete` access to the entities of one type.
///
/// Implementations use interior mutability so one store can be shared by
/// reference between a state machine and its readers. Locks are held only
/// for the duration of a single call and never across an `.await`.
pub trait StoreAdapter<E: Entity>: Send + Sync + 'static {
    /// Look up the entity stored under `id`.
    fn get(&self, id: &str) -> Option<E>;

    /// Store `entity` under `id`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Implementations may reject the write with [`StoreError`].
    fn set(&self, id: &str, entity: E) -> Result<(), StoreError>;

    /// Remove the entity stored under `id`. Removing an absent id is a no-op.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnsupportedOperation`] if the store cannot delete.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Whether this store holds exactly one implicit entity.
    ///
    /// Single stores ignore ids, so the pipeline looks them up without
    /// consulting the command payload.
    fn is_single(&self) -> bool {
        false
    }
}

/// Multi-entity store backed by a `HashMap` keyed by entity id.
///
/// `Clone` is cheap and yields a handle to the same map.
#[derive(Debug)]
pub struct KeyedStore<E> {
    entries: Arc<RwLock<HashMap<String, E>>>,
}

// Manual `Clone`: cloning shares the map and does not require `E: Clone`.
impl<E> Clone for KeyedStore<E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<E> Default for KeyedStore<E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<E: Entity> KeyedStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `entities`, keyed by their ids.
    pub fn with_entities(entities: impl IntoIterator<Item = E>) -> Self {
        let entries = entities
            .into_iter()
            .map(|entity| (entity.id().to_string(), entity))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Number of resident entities.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no entity is resident.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Returns `true` if an entity is stored under `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// The ids of all resident entities, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A point-in-time copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, E> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, E>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, E>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Entity> StoreAdapter<E> for KeyedStore<E> {
    fn get(&self, id: &str) -> Option<E> {
        self.read().get(id).cloned()
    }

    fn set(&self, id: &str, entity: E) -> Result<(), StoreError> {
        self.write().insert(id.to_string(), entity);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.write().remove(id);
        Ok(())
    }
}

/// Single-entity store: one implicit slot adapted to the keyed interface.
///
/// Ids are ignored by `get` and `set`. Deleting is rejected with
/// [`StoreError::UnsupportedOperation`].
#[derive(Debug)]
pub struct SingleStore<E> {
    slot: Arc<RwLock<E>>,
}

impl<E> Clone for SingleStore<E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<E: Entity> SingleStore<E> {
    /// Create a store holding `initial`.
    pub fn new(initial: E) -> Self {
        Self {
            slot: Arc::new(RwLock::new(initial)),
        }
    }

    /// A clone of the current entity.
    pub fn current(&self) -> E {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<E: Entity + Default> Default for SingleStore<E> {
    fn default() -> Self {
        Self::new(E::default())
    }
}

impl<E: Entity> StoreAdapter<E> for SingleStore<E> {
    fn get(&self, _id: &str) -> Option<E> {
        Some(self.current())
    }

    fn set(&self, _id: &str, entity: E) -> Result<(), StoreError> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = entity;
        Ok(())
    }

    fn delete(&self, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::UnsupportedOperation {
            operation: "delete",
            store: "single-entity",
        })
    }

    fn is_single(&self) -> bool {
        true
    }
}

/// Hook wrapping every individual store write.
///
/// The wrapper receives the write as a closure and must invoke it exactly
/// once. It lets an external runtime batch or schedule writes (for example
/// to coalesce change notifications); it is not a concurrency primitive.
pub type MutationWrapper = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// The default wrapper: invoke the write immediately.
pub fn direct() -> MutationWrapper {
    Arc::new(|write: &mut dyn FnMut()| write())
}

/// Run `write` through `wrapper` and return its result.
///
/// If the wrapper never invokes the closure the write did not happen, which
/// is reported as `None`.
pub(crate) fn wrapped<T>(wrapper: &MutationWrapper, write: impl FnOnce() -> T) -> Option<T> {
    let mut write = Some(write);
    let mut output = None;
    wrapper(&mut || {
        if let Some(write) = write.take() {
            output = Some(write());
        }
    });
    output
}
