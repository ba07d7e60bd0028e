//! State machine handle, its builder, and configuration.
//!
//! A [`StateMachine`] owns nothing but channel endpoints: the store is shared
//! with the caller, and the pipeline runs as a spawned tokio task that lives
//! as long as any [`StateMachine`] or [`CommandFactory`] clone does.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::command::{Command, CommandFactory, Handlers};
use crate::entity::{Entity, defined_entity};
use crate::event::{Emission, MachineEvent, Operation};
use crate::pipeline::{Pipeline, run_pipeline};
use crate::store::{MutationWrapper, StoreAdapter, direct};
use crate::subscription::{Subscription, listen};

/// Default capacity of the emission and progress broadcast channels.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Whether command lifecycles may overlap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessingMode {
    /// One command at a time, in arrival order. Each lifecycle, including
    /// its awaited async phase, finishes before the next command starts.
    #[default]
    Serial,
    /// Lifecycles overlap; completions are unordered.
    Concurrent,
}

/// Configuration for a state machine.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{MachineConfig, ProcessingMode};
///
/// let config = MachineConfig {
///     mode: ProcessingMode::Concurrent,
///     ..MachineConfig::default()
/// };
/// assert_eq!(config.broadcast_capacity, 256);
/// ```
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Ordering between commands. Default: [`ProcessingMode::Serial`].
    pub mode: ProcessingMode,
    /// Buffer size of the outbound broadcast channels. Subscribers that
    /// fall further behind miss the oldest emissions.
    ///
    /// Default: 256.
    pub broadcast_capacity: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Serial,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Builder for a [`StateMachine`].
///
/// Created by [`StateMachine::builder`]; finish with
/// [`spawn`](StateMachineBuilder::spawn).
pub struct StateMachineBuilder<E: Entity> {
    entity_name: String,
    store: Arc<dyn StoreAdapter<E>>,
    config: MachineConfig,
    wrapper: MutationWrapper,
}

impl<E: Entity> StateMachineBuilder<E> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: MachineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the processing mode.
    pub fn mode(mut self, mode: ProcessingMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Shorthand for `mode(ProcessingMode::Concurrent)`.
    pub fn concurrent(self) -> Self {
        self.mode(ProcessingMode::Concurrent)
    }

    /// Set the outbound broadcast capacity.
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    /// Install a wrapper around every store write.
    ///
    /// The wrapper must invoke the closure it receives exactly once.
    pub fn wrapper<W>(mut self, wrapper: W) -> Self
    where
        W: Fn(&mut dyn FnMut()) + Send + Sync + 'static,
    {
        self.wrapper = Arc::new(wrapper);
        self
    }

    /// Start the pipeline task and return the machine handle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(self) -> StateMachine<E> {
        let capacity = self.config.broadcast_capacity.max(1);
        let (emissions, _) = broadcast::channel(capacity);
        let (progress, _) = broadcast::channel(capacity);
        let (sender, commands) = mpsc::unbounded_channel();
        let entity_name: Arc<str> = Arc::from(self.entity_name);

        let pipeline = Arc::new(Pipeline {
            entity_name: Arc::clone(&entity_name),
            store: self.store,
            wrapper: self.wrapper,
            emissions: emissions.clone(),
            progress: progress.clone(),
        });
        tokio::spawn(run_pipeline(pipeline, commands, self.config.mode));

        StateMachine {
            entity_name,
            mode: self.config.mode,
            sender,
            emissions,
            progress,
        }
    }
}

/// Handle to a running per-entity-type state machine.
///
/// Lightweight and cloneable. Build command factories from it, and
/// subscribe to its outbound `(entity, event)` stream.
pub struct StateMachine<E: Entity> {
    entity_name: Arc<str>,
    mode: ProcessingMode,
    sender: mpsc::UnboundedSender<Command<E>>,
    emissions: broadcast::Sender<Emission<E>>,
    progress: broadcast::Sender<MachineEvent>,
}

// Manual `Clone`: only channel endpoints are cloned.
impl<E: Entity> Clone for StateMachine<E> {
    fn clone(&self) -> Self {
        Self {
            entity_name: Arc::clone(&self.entity_name),
            mode: self.mode,
            sender: self.sender.clone(),
            emissions: self.emissions.clone(),
            progress: self.progress.clone(),
        }
    }
}

impl<E: Entity> std::fmt::Debug for StateMachine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("entity_name", &self.entity_name)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<E: Entity> StateMachine<E> {
    /// Start building a machine for `entity_name` over `store`.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_bus::{Entity, KeyedStore, StateMachine};
    /// # use serde::{Deserialize, Serialize};
    /// # #[derive(Clone, Serialize, Deserialize)]
    /// # struct Note { id: String }
    /// # impl Entity for Note { fn id(&self) -> &str { &self.id } }
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() {
    /// let store = KeyedStore::<Note>::new();
    /// let notes = StateMachine::builder("note", store.clone()).concurrent().spawn();
    /// assert_eq!(notes.entity_name(), "note");
    /// # }
    /// ```
    pub fn builder(
        entity_name: impl Into<String>,
        store: impl StoreAdapter<E>,
    ) -> StateMachineBuilder<E> {
        StateMachineBuilder {
            entity_name: entity_name.into(),
            store: Arc::new(store),
            config: MachineConfig::default(),
            wrapper: direct(),
        }
    }

    /// Name of the entity type this machine manages.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// The processing mode fixed at construction.
    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// Returns `true` while the pipeline task is accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Build a command factory bound to `event_type`, `operation`, and
    /// `handlers`.
    pub fn command_factory<P: Serialize>(
        &self,
        event_type: &str,
        operation: Operation,
        handlers: Handlers<E>,
    ) -> CommandFactory<E, P> {
        CommandFactory::new(self.sender.clone(), event_type, operation, Some(handlers))
    }

    /// Build a pass-through factory: each payload is written to the store
    /// as-is under its `id`.
    ///
    /// Payloads must serialize to an object with a string `id` and decode
    /// into `E`; dispatching one without an `id` fails with
    /// [`DispatchError::MissingId`](crate::DispatchError::MissingId).
    pub fn hydrate_factory<P: Serialize>(&self, event_type: &str) -> CommandFactory<E, P> {
        CommandFactory::new(self.sender.clone(), event_type, Operation::Set, None)
    }

    /// Build a factory that deletes the entity named by the payload's `id`.
    ///
    /// Deleting an absent entity is a no-op. On a single-entity store every
    /// dispatch fails with
    /// [`StoreError::UnsupportedOperation`](crate::StoreError::UnsupportedOperation).
    pub fn delete_factory<P: Serialize>(&self, event_type: &str) -> CommandFactory<E, P> {
        // Delete never invokes the transform; the handler only enables the
        // synchronous phase that performs the removal.
        let handlers = Handlers::sync(|entity, _| defined_entity(entity));
        CommandFactory::new(
            self.sender.clone(),
            event_type,
            Operation::Delete,
            Some(handlers),
        )
    }

    /// Subscribe to the outbound `(entity, event)` stream.
    ///
    /// Only emissions produced after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<Emission<E>> {
        self.emissions.subscribe()
    }

    /// Subscribe to provisional `pending` events, published when a command
    /// with an async handler enters processing.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<MachineEvent> {
        self.progress.subscribe()
    }

    /// The outbound stream as a [`Stream`]. Emissions missed by a lagging
    /// consumer are skipped with a warning.
    pub fn stream(&self) -> impl Stream<Item = Emission<E>> + Send + use<E> {
        let entity_name = Arc::clone(&self.entity_name);
        BroadcastStream::new(self.subscribe()).filter_map(move |item| match item {
            Ok(emission) => Some(emission),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(entity = %entity_name, skipped, "stream lagged");
                None
            }
        })
    }

    /// Invoke `callback` for every emission until the returned guard is
    /// dropped.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(Emission<E>) + Send + 'static,
    {
        listen(self.subscribe(), Arc::clone(&self.entity_name), callback)
    }
}
