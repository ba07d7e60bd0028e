//! Cross-entity aggregates folded from many state machines' emissions.
//!
//! An [`AggregateComposer`] owns one aggregate value and one fold task.
//! Each [`handle_entity`](AggregateComposer::handle_entity) call spawns a
//! forwarder that reads a machine's emission stream, drops event types with
//! no handler, and queues a fold job. The fold task applies jobs one at a
//! time, so handlers never race on the aggregate, and publishes an
//! [`AggregateUpdate`] after each. Subscribers attach to the composer's
//! single outbound channel and see every source, including sources
//! registered after they subscribed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::entity::Entity;
use crate::event::{AggregateEvent, AggregateUpdate, Emission, MachineEvent};
use crate::machine::DEFAULT_BROADCAST_CAPACITY;
use crate::store::{MutationWrapper, direct, wrapped};
use crate::subscription::{Subscription, listen};

/// Folds one entity event into the aggregate, in place.
///
/// Receives the entity as emitted (`None` after a rolled-back creation or a
/// delete of an absent entity) and the event that produced it.
pub type AggregateHandler<A, E> = Arc<dyn Fn(&mut A, Option<&E>, &MachineEvent) + Send + Sync>;

type FoldJob<A> = Box<dyn FnOnce(&mut A) -> AggregateEvent + Send>;

/// Event-type → handler table for one registered source.
///
/// # Examples
///
/// ```
/// use eventfold_bus::{AggregateHandlers, Entity};
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Serialize, Deserialize)]
/// # struct Note { id: String }
/// # impl Entity for Note { fn id(&self) -> &str { &self.id } }
///
/// let handlers = AggregateHandlers::<u64, Note>::new()
///     .on("note_created", |total, _note, _event| *total += 1)
///     .on("note_deleted", |total, _note, _event| *total -= 1);
/// assert_eq!(handlers.len(), 2);
/// ```
pub struct AggregateHandlers<A, E> {
    handlers: HashMap<String, AggregateHandler<A, E>>,
}

impl<A, E> Default for AggregateHandlers<A, E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<A, E> Clone for AggregateHandlers<A, E> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<A, E> std::fmt::Debug for AggregateHandlers<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut event_types: Vec<&String> = self.handlers.keys().collect();
        event_types.sort();
        f.debug_struct("AggregateHandlers")
            .field("event_types", &event_types)
            .finish()
    }
}

impl<A, E> AggregateHandlers<A, E> {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous one.
    pub fn on<F>(mut self, event_type: &str, handler: F) -> Self
    where
        F: Fn(&mut A, Option<&E>, &MachineEvent) + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.to_string(), Arc::new(handler));
        self
    }

    /// Number of handled event types.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no event type is handled.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, event_type: &str) -> Option<&AggregateHandler<A, E>> {
        self.handlers.get(event_type)
    }
}

impl<A, E> From<HashMap<String, AggregateHandler<A, E>>> for AggregateHandlers<A, E> {
    fn from(handlers: HashMap<String, AggregateHandler<A, E>>) -> Self {
        Self { handlers }
    }
}

/// Builder for an [`AggregateComposer`] with a custom wrapper or capacity.
pub struct AggregateComposerBuilder<A> {
    name: String,
    aggregate: Arc<RwLock<A>>,
    wrapper: MutationWrapper,
    broadcast_capacity: usize,
}

impl<A: Clone + Send + Sync + 'static> AggregateComposerBuilder<A> {
    /// Install a wrapper around every fold.
    ///
    /// The wrapper must invoke the closure it receives exactly once.
    pub fn wrapper<W>(mut self, wrapper: W) -> Self
    where
        W: Fn(&mut dyn FnMut()) + Send + Sync + 'static,
    {
        self.wrapper = Arc::new(wrapper);
        self
    }

    /// Set the outbound broadcast capacity. Default: 256.
    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Start the fold task and return the composer.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn build(self) -> AggregateComposer<A> {
        let (updates, _) = broadcast::channel(self.broadcast_capacity.max(1));
        let (jobs, queue) = mpsc::unbounded_channel();
        let name: Arc<str> = Arc::from(self.name);

        let fold = tokio::spawn(run_fold(
            Arc::clone(&name),
            Arc::clone(&self.aggregate),
            self.wrapper,
            queue,
            updates.clone(),
        ));

        AggregateComposer {
            name,
            aggregate: self.aggregate,
            jobs,
            updates,
            fold,
            forwarders: Mutex::new(Vec::new()),
        }
    }
}

/// Maintains one aggregate across any number of entity state machines.
///
/// Dropping the composer stops its fold and forwarder tasks.
pub struct AggregateComposer<A> {
    name: Arc<str>,
    aggregate: Arc<RwLock<A>>,
    jobs: mpsc::UnboundedSender<FoldJob<A>>,
    updates: broadcast::Sender<AggregateUpdate<A>>,
    fold: JoinHandle<()>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl<A> std::fmt::Debug for AggregateComposer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateComposer")
            .field("name", &self.name)
            .field("sources", &self.lock_forwarders().len())
            .finish()
    }
}

impl<A> AggregateComposer<A> {
    fn lock_forwarders(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.forwarders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A: Clone + Send + Sync + 'static> AggregateComposer<A> {
    /// Create a composer owning `aggregate`, with the direct wrapper and the
    /// default broadcast capacity.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(name: impl Into<String>, aggregate: A) -> Self {
        Self::builder(name, Arc::new(RwLock::new(aggregate))).build()
    }

    /// Start building a composer over a shared aggregate handle.
    pub fn builder(
        name: impl Into<String>,
        aggregate: Arc<RwLock<A>>,
    ) -> AggregateComposerBuilder<A> {
        AggregateComposerBuilder {
            name: name.into(),
            aggregate,
            wrapper: direct(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }

    /// Name stamped on every [`AggregateEvent`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register one more source of entity emissions.
    ///
    /// Emissions whose event type has no handler are dropped. Registration
    /// is permanent for the composer's lifetime; existing subscribers start
    /// receiving this source's updates immediately.
    pub fn handle_entity<E: Entity>(
        &self,
        source: broadcast::Receiver<Emission<E>>,
        handlers: AggregateHandlers<A, E>,
    ) {
        tracing::debug!(
            aggregate = %self.name,
            handlers = ?handlers,
            "registering entity source"
        );
        let task = tokio::spawn(forward(
            Arc::clone(&self.name),
            source,
            handlers,
            self.jobs.clone(),
        ));
        self.lock_forwarders().push(task);
    }

    /// Number of sources registered so far.
    pub fn source_count(&self) -> usize {
        self.lock_forwarders().len()
    }

    /// The shared aggregate handle.
    pub fn aggregate(&self) -> Arc<RwLock<A>> {
        Arc::clone(&self.aggregate)
    }

    /// A clone of the aggregate's current value.
    pub fn snapshot(&self) -> A {
        self.aggregate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to `(aggregate, event)` updates from every source.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregateUpdate<A>> {
        self.updates.subscribe()
    }

    /// Invoke `callback` for every update until the returned guard is dropped.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(AggregateUpdate<A>) + Send + 'static,
    {
        listen(self.subscribe(), Arc::clone(&self.name), callback)
    }
}

impl<A> Drop for AggregateComposer<A> {
    fn drop(&mut self) {
        for task in self.lock_forwarders().drain(..) {
            task.abort();
        }
        self.fold.abort();
    }
}

async fn forward<A, E>(
    aggregate_name: Arc<str>,
    mut source: broadcast::Receiver<Emission<E>>,
    handlers: AggregateHandlers<A, E>,
    jobs: mpsc::UnboundedSender<FoldJob<A>>,
) where
    A: Send + Sync + 'static,
    E: Entity,
{
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let emission = match source.recv().await {
            Ok(emission) => emission,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(aggregate = %aggregate_name, skipped, "aggregate source lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(handler) = handlers.get(&emission.event.event_type).cloned() else {
            continue;
        };

        let name = Arc::clone(&aggregate_name);
        let job: FoldJob<A> = Box::new(move |aggregate: &mut A| {
            handler(aggregate, emission.entity.as_ref(), &emission.event);
            AggregateEvent {
                aggregate_name: name.to_string(),
                event: emission.event,
            }
        });
        if jobs.send(job).is_err() {
            break;
        }
    }
    tracing::debug!(aggregate = %aggregate_name, "entity source closed");
}

async fn run_fold<A: Clone + Send + Sync + 'static>(
    name: Arc<str>,
    aggregate: Arc<RwLock<A>>,
    wrapper: MutationWrapper,
    mut queue: mpsc::UnboundedReceiver<FoldJob<A>>,
    updates: broadcast::Sender<AggregateUpdate<A>>,
) {
    while let Some(job) = queue.recv().await {
        let folded = wrapped(&wrapper, || {
            let mut guard = aggregate.write().unwrap_or_else(PoisonError::into_inner);
            let event = job(&mut *guard);
            (guard.clone(), event)
        });
        let Some((snapshot, event)) = folded else {
            tracing::warn!(aggregate = %name, "mutation wrapper skipped aggregate fold");
            continue;
        };
        tracing::trace!(
            aggregate = %name,
            event_type = %event.event.event_type,
            "aggregate folded"
        );
        // No subscribers is not an error.
        let _ = updates.send(AggregateUpdate {
            aggregate: snapshot,
            event,
        });
    }
}
