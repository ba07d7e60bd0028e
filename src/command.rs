//! Command records, entity handlers, and the typed command factory.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{DispatchError, HandlerError};
use crate::event::{MachineEvent, Operation, payload_id};

/// Synchronous handler: receives a clone of the looked-up entity (if any)
/// and the in-flight event, and returns the entity to commit.
pub type SyncHandler<E> =
    Arc<dyn Fn(Option<E>, &MachineEvent) -> Result<E, HandlerError> + Send + Sync>;

/// Boxed future returned by an [`AsyncHandler`].
pub type HandlerFuture<E> = Pin<Box<dyn Future<Output = Result<E, HandlerError>> + Send>>;

/// Asynchronous handler: confirms or overrides the synchronous result.
///
/// Always receives the pre-command entity, never the synchronous handler's
/// output.
pub type AsyncHandler<E> = Arc<dyn Fn(Option<E>, MachineEvent) -> HandlerFuture<E> + Send + Sync>;

/// Value sent back through a command's resolver.
pub(crate) type CommandResult<E> = Result<Option<E>, DispatchError>;

/// The handler pair bound to a command factory.
///
/// Every variant carries at least one handler, which is what commands
/// without an `id` in their payload require.
pub enum Handlers<E> {
    /// Optimistic synchronous transform only.
    Sync(SyncHandler<E>),
    /// Asynchronous transform only.
    Async(AsyncHandler<E>),
    /// Optimistic synchronous transform followed by asynchronous confirmation.
    Both {
        /// Runs first and commits immediately.
        sync: SyncHandler<E>,
        /// Runs after `sync` and commits its own result.
        confirm: AsyncHandler<E>,
    },
}

impl<E> Clone for Handlers<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Sync(sync) => Self::Sync(Arc::clone(sync)),
            Self::Async(confirm) => Self::Async(Arc::clone(confirm)),
            Self::Both { sync, confirm } => Self::Both {
                sync: Arc::clone(sync),
                confirm: Arc::clone(confirm),
            },
        }
    }
}

impl<E: Entity> Handlers<E> {
    /// A synchronous handler.
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(Option<E>, &MachineEvent) -> Result<E, HandlerError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(handler))
    }

    /// An asynchronous handler.
    pub fn async_fn<F, Fut>(handler: F) -> Self
    where
        F: Fn(Option<E>, MachineEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, HandlerError>> + Send + 'static,
    {
        Self::Async(box_async(handler))
    }

    /// A synchronous handler followed by an asynchronous confirmation.
    pub fn both<F, G, Fut>(sync: F, confirm: G) -> Self
    where
        F: Fn(Option<E>, &MachineEvent) -> Result<E, HandlerError> + Send + Sync + 'static,
        G: Fn(Option<E>, MachineEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<E, HandlerError>> + Send + 'static,
    {
        Self::Both {
            sync: Arc::new(sync),
            confirm: box_async(confirm),
        }
    }

    fn split(self) -> (Option<SyncHandler<E>>, Option<AsyncHandler<E>>) {
        match self {
            Self::Sync(sync) => (Some(sync), None),
            Self::Async(confirm) => (None, Some(confirm)),
            Self::Both { sync, confirm } => (Some(sync), Some(confirm)),
        }
    }
}

fn box_async<E, F, Fut>(handler: F) -> AsyncHandler<E>
where
    E: 'static,
    F: Fn(Option<E>, MachineEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<E, HandlerError>> + Send + 'static,
{
    Arc::new(move |entity: Option<E>, event: MachineEvent| {
        Box::pin(handler(entity, event)) as HandlerFuture<E>
    })
}

/// A request to act on one entity, as submitted to the pipeline.
///
/// Built once per [`CommandFactory::dispatch`] call and never modified.
pub(crate) struct Command<E> {
    pub command_id: Uuid,
    pub payload: Value,
    pub operation: Operation,
    pub event_type: String,
    pub sync_handler: Option<SyncHandler<E>>,
    pub async_handler: Option<AsyncHandler<E>>,
    pub supplemental: Option<Value>,
    pub resolve: oneshot::Sender<CommandResult<E>>,
}

/// Typed command-emitting function bound to an event type, an operation,
/// and a handler pair.
///
/// Obtained from [`StateMachine::command_factory`](crate::StateMachine::command_factory),
/// [`hydrate_factory`](crate::StateMachine::hydrate_factory), or
/// [`delete_factory`](crate::StateMachine::delete_factory). `Clone` is cheap;
/// clones submit to the same pipeline.
///
/// # Type Parameters
///
/// * `E` - The entity type of the owning state machine.
/// * `P` - The payload type accepted by [`dispatch`](CommandFactory::dispatch).
pub struct CommandFactory<E, P> {
    sender: mpsc::UnboundedSender<Command<E>>,
    event_type: Arc<str>,
    operation: Operation,
    sync_handler: Option<SyncHandler<E>>,
    async_handler: Option<AsyncHandler<E>>,
    _payload: PhantomData<fn(P)>,
}

impl<E, P> Clone for CommandFactory<E, P> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            event_type: Arc::clone(&self.event_type),
            operation: self.operation,
            sync_handler: self.sync_handler.clone(),
            async_handler: self.async_handler.clone(),
            _payload: PhantomData,
        }
    }
}

impl<E, P> std::fmt::Debug for CommandFactory<E, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFactory")
            .field("event_type", &self.event_type)
            .field("operation", &self.operation)
            .field("sync_handler", &self.sync_handler.is_some())
            .field("async_handler", &self.async_handler.is_some())
            .finish()
    }
}

impl<E: Entity, P: Serialize> CommandFactory<E, P> {
    pub(crate) fn new(
        sender: mpsc::UnboundedSender<Command<E>>,
        event_type: &str,
        operation: Operation,
        handlers: Option<Handlers<E>>,
    ) -> Self {
        let (sync_handler, async_handler) = handlers.map(Handlers::split).unwrap_or_default();
        Self {
            sender,
            event_type: Arc::from(event_type),
            operation,
            sync_handler,
            async_handler,
            _payload: PhantomData,
        }
    }

    /// The event type stamped on every command from this factory.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The store operation of every command from this factory.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Submit one command and wait for the pipeline to finish it.
    ///
    /// The command is enqueued before this method returns, so commands are
    /// received in call order even if the returned futures are awaited in a
    /// different order or not at all.
    ///
    /// # Returns
    ///
    /// The entity after processing: the committed value, the restored
    /// snapshot after a handler failure, or `None` when nothing remains.
    /// Handler failures still resolve `Ok`; inspect the emitted event's
    /// status to detect them.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::Encode`] -- the payload could not be serialized.
    /// * [`DispatchError::MissingId`] -- no handlers and no payload `id`.
    /// * [`DispatchError::Store`] -- the store rejected the write as misuse.
    /// * [`DispatchError::PipelineGone`] -- the pipeline task has exited.
    pub fn dispatch(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<Option<E>, DispatchError>> + Send + use<E, P> {
        resolved(self.submit(payload, None))
    }

    /// Like [`dispatch`](CommandFactory::dispatch), attaching `supplemental`
    /// to the emitted event.
    pub fn dispatch_with_supplemental(
        &self,
        payload: P,
        supplemental: Value,
    ) -> impl Future<Output = Result<Option<E>, DispatchError>> + Send + use<E, P> {
        resolved(self.submit(payload, Some(supplemental)))
    }

    fn submit(
        &self,
        payload: P,
        supplemental: Option<Value>,
    ) -> Result<oneshot::Receiver<CommandResult<E>>, DispatchError> {
        let payload = serde_json::to_value(payload).map_err(DispatchError::Encode)?;
        if self.sync_handler.is_none()
            && self.async_handler.is_none()
            && payload_id(&payload).is_none()
        {
            return Err(DispatchError::MissingId);
        }

        let (tx, rx) = oneshot::channel();
        let command = Command {
            command_id: Uuid::new_v4(),
            payload,
            operation: self.operation,
            event_type: self.event_type.to_string(),
            sync_handler: self.sync_handler.clone(),
            async_handler: self.async_handler.clone(),
            supplemental,
            resolve: tx,
        };
        self.sender
            .send(command)
            .map_err(|_| DispatchError::PipelineGone)?;
        Ok(rx)
    }
}

async fn resolved<E>(
    submitted: Result<oneshot::Receiver<CommandResult<E>>, DispatchError>,
) -> CommandResult<E> {
    match submitted {
        // A dropped resolver means the pipeline exited mid-command.
        Ok(rx) => rx.await.unwrap_or(Err(DispatchError::PipelineGone)),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entity::defined_entity;
    use crate::entity::test_fixtures::Pedometer;

    #[derive(Serialize)]
    struct Step {
        id: String,
    }

    fn step_handlers() -> Handlers<Pedometer> {
        Handlers::sync(|entity, _event| {
            let mut pedometer: Pedometer = defined_entity(entity)?;
            pedometer.step_count += 1;
            Ok(pedometer)
        })
    }

    #[tokio::test]
    async fn dispatch_submits_one_command_with_factory_settings() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Mutate, Some(step_handlers()));

        let pending = factory.dispatch(Step { id: "p-1".into() });

        let command = rx.try_recv().expect("command should be enqueued eagerly");
        assert_eq!(command.payload, json!({"id": "p-1"}));
        assert_eq!(command.operation, Operation::Mutate);
        assert_eq!(command.event_type, "step");
        assert!(command.sync_handler.is_some());
        assert!(command.async_handler.is_none());
        assert!(rx.try_recv().is_err(), "exactly one command per dispatch");

        command
            .resolve
            .send(Ok(Some(Pedometer::new("p-1"))))
            .unwrap_or_else(|_| panic!("caller should still be waiting"));
        let entity = pending.await.expect("dispatch should resolve");
        assert_eq!(entity, Some(Pedometer::new("p-1")));
    }

    #[tokio::test]
    async fn independent_dispatches_get_distinct_command_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Mutate, Some(step_handlers()));

        let _first = factory.dispatch(Step { id: "p-1".into() });
        let _second = factory.dispatch(Step { id: "p-1".into() });

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_ne!(a.command_id, b.command_id);
    }

    #[tokio::test]
    async fn handlerless_dispatch_without_id_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, ()> =
            CommandFactory::new(tx, "hydrate", Operation::Set, None);

        let result = factory.dispatch(()).await;

        assert!(
            matches!(result, Err(DispatchError::MissingId)),
            "expected MissingId, got: {result:?}"
        );
        assert!(rx.try_recv().is_err(), "nothing should be enqueued");
    }

    #[tokio::test]
    async fn dispatch_after_pipeline_exit_reports_pipeline_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Mutate, Some(step_handlers()));

        let result = factory.dispatch(Step { id: "p-1".into() }).await;
        assert!(matches!(result, Err(DispatchError::PipelineGone)));
    }

    #[tokio::test]
    async fn dropped_resolver_reports_pipeline_gone() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Mutate, Some(step_handlers()));

        let pending = factory.dispatch(Step { id: "p-1".into() });
        drop(rx.try_recv().unwrap());

        assert!(matches!(pending.await, Err(DispatchError::PipelineGone)));
    }

    #[tokio::test]
    async fn supplemental_is_carried_on_the_command() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Set, Some(step_handlers()));

        let _pending =
            factory.dispatch_with_supplemental(Step { id: "p-1".into() }, json!({"source": "ui"}));

        let command = rx.try_recv().unwrap();
        assert_eq!(command.supplemental, Some(json!({"source": "ui"})));
    }

    #[test]
    fn both_handlers_split_into_pair() {
        let handlers = Handlers::<Pedometer>::both(
            |entity, _| defined_entity(entity),
            |entity, _| async move { defined_entity(entity) },
        );
        let (sync, confirm) = handlers.split();
        assert!(sync.is_some() && confirm.is_some());
    }

    #[test]
    fn debug_hides_handler_bodies() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let factory: CommandFactory<Pedometer, Step> =
            CommandFactory::new(tx, "step", Operation::Mutate, Some(step_handlers()));
        let debug = format!("{factory:?}");
        assert!(debug.contains("step"));
        assert!(debug.contains("sync_handler: true"));
    }
}
