//! Per-entity command/event state machines with optimistic commits,
//! rollback, and cross-entity aggregates.
//!
//! A [`StateMachine`] owns the command pipeline for one entity type. Callers
//! obtain typed [`CommandFactory`] values from it and `dispatch` payloads;
//! each command runs an optional synchronous transform, commits to the
//! shared store, runs an optional asynchronous confirmation, and rolls the
//! store back if either phase fails. Every processed command is broadcast
//! as an [`Emission`], which an [`AggregateComposer`] can fold into a
//! cross-entity view.
//!
//! ```
//! use eventfold_bus::{Entity, Handlers, KeyedStore, Operation, StateMachine};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Pedometer {
//!     id: String,
//!     steps: u32,
//! }
//!
//! impl Entity for Pedometer {
//!     fn id(&self) -> &str {
//!         &self.id
//!     }
//! }
//!
//! #[derive(Serialize)]
//! struct Step {
//!     id: String,
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = KeyedStore::<Pedometer>::new();
//! let machine = StateMachine::builder("pedometer", store.clone()).spawn();
//! let step = machine.command_factory::<Step>(
//!     "step",
//!     Operation::Mutate,
//!     Handlers::sync(|entity, event| {
//!         let mut pedometer = entity.unwrap_or_else(|| Pedometer {
//!             id: event.payload_id().unwrap_or_default().to_string(),
//!             steps: 0,
//!         });
//!         pedometer.steps += 1;
//!         Ok(pedometer)
//!     }),
//! );
//!
//! let pedometer = step.dispatch(Step { id: "p-1".into() }).await.unwrap();
//! assert_eq!(pedometer.map(|p| p.steps), Some(1));
//! # }
//! ```

mod aggregate;
mod command;
mod entity;
mod error;
mod event;
mod machine;
mod pipeline;
mod store;
mod subscription;

pub use aggregate::{
    AggregateComposer, AggregateComposerBuilder, AggregateHandler, AggregateHandlers,
};
pub use command::{AsyncHandler, CommandFactory, HandlerFuture, Handlers, SyncHandler};
pub use entity::{Entity, defined_entity};
pub use error::{DispatchError, HandlerError, StoreError};
pub use event::{
    AggregateEvent, AggregateUpdate, Emission, EventStatus, MachineEvent, Operation,
};
pub use machine::{
    DEFAULT_BROADCAST_CAPACITY, MachineConfig, ProcessingMode, StateMachine, StateMachineBuilder,
};
pub use store::{KeyedStore, MutationWrapper, SingleStore, StoreAdapter, direct};
pub use subscription::Subscription;
