//! Lifecycle events emitted by state machines and aggregate composers.
//!
//! These are plain data types shared by the pipeline, the command factory,
//! and the aggregate composer. No I/O occurs here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::HandlerError;

/// How a command's result is committed to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Replace the entity with the handler's result.
    Set,
    /// Transform the existing entity; inserts when none exists.
    #[default]
    Mutate,
    /// Remove the looked-up entity. Handlers are not invoked.
    Delete,
}

impl Operation {
    /// Lowercase name, as used in serialized events and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Mutate => "mutate",
            Self::Delete => "delete",
        }
    }
}

/// Processing status carried by a [`MachineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// An asynchronous handler is configured and has not run yet.
    Pending,
    /// Processing finished without a handler failure.
    Complete,
    /// A handler failed and the store was rolled back.
    Error,
}

/// The record of one processed command.
///
/// Handlers receive the event while it is being processed; subscribers
/// receive the final copy. `payload` is the command payload encoded as JSON
/// (`Null` for commands without arguments); use
/// [`payload_as`](MachineEvent::payload_as) to decode it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineEvent {
    /// Unique id of the command that produced this event.
    pub command_id: Uuid,
    /// Store operation requested by the command.
    pub operation: Operation,
    /// Name of the entity type the state machine manages.
    pub entity_name: String,
    /// Business action label (e.g. `"create"`, `"step"`).
    pub event_type: String,
    /// The original command payload.
    pub payload: Value,
    /// Processing status.
    pub status: EventStatus,
    /// Whether an entity existed in the store before processing.
    pub entity_in_store: bool,
    /// Free-form data attached at dispatch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplemental: Option<Value>,
}

impl MachineEvent {
    /// Decode the payload into the command's argument type.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Payload`] if the payload does not match `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, HandlerError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// The `id` carried by the payload, if any.
    pub fn payload_id(&self) -> Option<&str> {
        payload_id(&self.payload)
    }
}

/// Extract a string `id` field from a JSON payload.
pub(crate) fn payload_id(payload: &Value) -> Option<&str> {
    payload.get("id").and_then(Value::as_str)
}

/// One `(entity, event)` pair broadcast by a state machine per command.
///
/// `entity` is the committed value, the restored snapshot after a rollback,
/// or `None` when no entity remains (e.g. a rolled-back creation).
#[derive(Debug, Clone, PartialEq)]
pub struct Emission<E> {
    /// The entity after processing.
    pub entity: Option<E>,
    /// The lifecycle event.
    pub event: MachineEvent,
}

/// An entity event as seen by an aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEvent {
    /// Name of the aggregate that handled the event.
    pub aggregate_name: String,
    /// The upstream entity event.
    pub event: MachineEvent,
}

/// Broadcast by an aggregate composer after each fold step.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateUpdate<A> {
    /// Snapshot of the aggregate after the handler ran.
    pub aggregate: A,
    /// The event that was folded in.
    pub event: AggregateEvent,
}
