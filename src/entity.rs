//! Entity trait and the `defined_entity` assertion.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::HandlerError;

/// A record owned by a state machine's store.
///
/// The implementing type is cloned for every snapshot, so it should be cheap
/// to clone or small. `Serialize`/`DeserializeOwned` are required because
/// pass-through (hydrate) commands carry the entity as a JSON payload.
///
/// # Contract
///
/// - [`id`](Entity::id) must be stable: an entity committed under an id is
///   looked up under the same id by later commands.
/// - Entities kept in a [`SingleStore`](crate::SingleStore) may return any
///   fixed value; the single store ignores ids.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The unique identifier of this entity within its store.
    fn id(&self) -> &str;
}

/// Assert that a handler received an entity.
///
/// Handlers for commands that only make sense against an existing entity
/// call this first and propagate the error with `?`. The pipeline treats
/// the error like any other handler failure and rolls back.
///
/// # Errors
///
/// Returns [`HandlerError::MissingEntity`] when `entity` is `None`.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{HandlerError, defined_entity};
///
/// assert_eq!(defined_entity(Some(3)).unwrap(), 3);
/// assert!(matches!(defined_entity::<u32>(None), Err(HandlerError::MissingEntity)));
/// ```
pub fn defined_entity<E>(entity: Option<E>) -> Result<E, HandlerError> {
    entity.ok_or(HandlerError::MissingEntity)
}
