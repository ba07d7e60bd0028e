//! Processing pipeline: the task that owns command execution for one state
//! machine.
//!
//! The pipeline receives [`Command`]s from an unbounded `mpsc` channel and
//! runs each through its lifecycle:
//!
//! ```text
//! Received -> SyncPhase -> AsyncPhase -> Committed | RolledBack -> Resolved
//! ```
//!
//! In [`ProcessingMode::Serial`] each lifecycle completes before the next
//! command is received. In [`ProcessingMode::Concurrent`] lifecycles overlap
//! inside the same task, so completions are unordered. Either way every
//! store write is a single wrapped call on the store adapter.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::{broadcast, mpsc};
use tracing::Instrument;

use crate::command::{AsyncHandler, Command, SyncHandler};
use crate::entity::Entity;
use crate::error::{DispatchError, HandlerError, StoreError};
use crate::event::{Emission, EventStatus, MachineEvent, Operation, payload_id};
use crate::machine::ProcessingMode;
use crate::store::{MutationWrapper, StoreAdapter, wrapped};

/// Shared state the pipeline needs to process a command.
pub(crate) struct Pipeline<E: Entity> {
    pub entity_name: Arc<str>,
    pub store: Arc<dyn StoreAdapter<E>>,
    pub wrapper: MutationWrapper,
    pub emissions: broadcast::Sender<Emission<E>>,
    pub progress: broadcast::Sender<MachineEvent>,
}

/// Why a phase stopped before committing.
#[derive(Debug)]
enum PhaseFailure {
    Handler(HandlerError),
    Store(StoreError),
}

impl From<HandlerError> for PhaseFailure {
    fn from(err: HandlerError) -> Self {
        Self::Handler(err)
    }
}

impl From<StoreError> for PhaseFailure {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Per-command working state, discarded once the command is resolved.
struct Lifecycle<E> {
    /// Snapshot of the entity before any phase ran.
    original: Option<E>,
    /// The value resolved to the caller and emitted downstream.
    entity_result: Option<E>,
    event: MachineEvent,
    /// A store misuse error that must reach the caller.
    misuse: Option<StoreError>,
}

/// Runs the pipeline loop until every command sender has been dropped.
///
/// In concurrent mode, commands already in flight when the channel closes
/// are driven to completion before the loop returns.
pub(crate) async fn run_pipeline<E: Entity>(
    pipeline: Arc<Pipeline<E>>,
    mut commands: mpsc::UnboundedReceiver<Command<E>>,
    mode: ProcessingMode,
) {
    tracing::debug!(entity = %pipeline.entity_name, ?mode, "pipeline started");

    match mode {
        ProcessingMode::Serial => {
            while let Some(command) = commands.recv().await {
                pipeline.process(command).await;
            }
        }
        ProcessingMode::Concurrent => {
            let mut in_flight = FuturesUnordered::new();
            loop {
                tokio::select! {
                    received = commands.recv() => match received {
                        Some(command) => in_flight.push(pipeline.process(command)),
                        None => break,
                    },
                    Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
                }
            }
            while in_flight.next().await.is_some() {}
        }
    }

    tracing::debug!(entity = %pipeline.entity_name, "pipeline stopped");
}

impl<E: Entity> Pipeline<E> {
    /// Process one command end to end, inside its own tracing span.
    async fn process(&self, command: Command<E>) {
        let span = tracing::info_span!(
            "command",
            entity = %self.entity_name,
            event_type = %command.event_type,
            op = command.operation.as_str(),
            command_id = %command.command_id,
        );
        self.execute(command).instrument(span).await
    }

    async fn execute(&self, command: Command<E>) {
        let Command {
            command_id,
            payload,
            operation,
            event_type,
            sync_handler,
            async_handler,
            supplemental,
            resolve,
        } = command;

        // 1. Look up the target and snapshot it.
        let existing = if self.store.is_single() {
            self.store.get("")
        } else {
            payload_id(&payload).and_then(|id| self.store.get(id))
        };
        let mut lifecycle = Lifecycle {
            entity_result: existing.clone(),
            event: MachineEvent {
                command_id,
                operation,
                entity_name: self.entity_name.to_string(),
                event_type,
                payload,
                status: EventStatus::Complete,
                entity_in_store: existing.is_some(),
                supplemental,
            },
            original: existing,
            misuse: None,
        };

        // 2. Publish the provisional status before any phase runs.
        if async_handler.is_some() {
            lifecycle.event.status = EventStatus::Pending;
            let _ = self.progress.send(lifecycle.event.clone());
        }

        // 3. Optimistic synchronous phase.
        if let Some(handler) = &sync_handler
            && let Err(failure) = self.sync_phase(handler, &mut lifecycle)
        {
            self.recover(failure, "sync", &mut lifecycle);
        }

        // 4. Asynchronous confirmation, regardless of the sync outcome.
        if let Some(handler) = &async_handler {
            lifecycle.event.status = EventStatus::Complete;
            if let Err(failure) = self.async_phase(handler, &mut lifecycle).await {
                self.recover(failure, "async", &mut lifecycle);
            }
        }

        // 5. No handlers: write the payload through as-is.
        if sync_handler.is_none() && async_handler.is_none() {
            self.hydrate(&mut lifecycle);
        }

        // 6. Resolve the caller, then 7. emit downstream.
        let Lifecycle {
            entity_result,
            event,
            misuse,
            ..
        } = lifecycle;
        tracing::debug!(status = ?event.status, "command processed");

        let result = match misuse {
            Some(err) => Err(DispatchError::Store(err)),
            None => Ok(entity_result.clone()),
        };
        // The caller may have dropped its future; the command still counts.
        let _ = resolve.send(result);
        let _ = self.emissions.send(Emission {
            entity: entity_result,
            event,
        });
    }

    fn sync_phase(
        &self,
        handler: &SyncHandler<E>,
        lifecycle: &mut Lifecycle<E>,
    ) -> Result<(), PhaseFailure> {
        match lifecycle.event.operation {
            Operation::Set => {
                let entity = handler(lifecycle.original.clone(), &lifecycle.event)?;
                lifecycle.entity_result = Some(entity.clone());
                self.commit_set(&entity)?;
            }
            Operation::Delete => self.commit_delete(lifecycle.entity_result.as_ref())?,
            Operation::Mutate => {
                // The transform runs inside the wrapped write so a reactive
                // runtime observes the mutation and the insert as one change.
                let Lifecycle {
                    original, event, ..
                } = &*lifecycle;
                let outcome = wrapped(&self.wrapper, || -> Result<E, PhaseFailure> {
                    let entity = handler(original.clone(), event)?;
                    self.store.set(entity.id(), entity.clone())?;
                    Ok(entity)
                });
                match outcome {
                    Some(entity) => lifecycle.entity_result = Some(entity?),
                    None => tracing::warn!("mutation wrapper skipped a store write"),
                }
            }
        }
        Ok(())
    }

    async fn async_phase(
        &self,
        handler: &AsyncHandler<E>,
        lifecycle: &mut Lifecycle<E>,
    ) -> Result<(), PhaseFailure> {
        match lifecycle.event.operation {
            Operation::Set | Operation::Mutate => {
                let entity = handler(lifecycle.original.clone(), lifecycle.event.clone()).await?;
                lifecycle.entity_result = Some(entity.clone());
                self.commit_set(&entity)?;
            }
            Operation::Delete => self.commit_delete(lifecycle.entity_result.as_ref())?,
        }
        Ok(())
    }

    /// Pass-through write of a handler-less command's payload.
    fn hydrate(&self, lifecycle: &mut Lifecycle<E>) {
        let Some(id) = payload_id(&lifecycle.event.payload).map(str::to_owned) else {
            return;
        };
        match serde_json::from_value::<E>(lifecycle.event.payload.clone()) {
            Ok(entity) => match self.write(|| self.store.set(&id, entity.clone())) {
                Ok(()) => lifecycle.entity_result = Some(entity),
                Err(err) => {
                    tracing::warn!(error = %err, "store rejected hydrate write");
                    lifecycle.event.status = EventStatus::Error;
                    lifecycle.misuse = Some(err);
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "hydrate payload is not a valid entity");
                lifecycle.event.status = EventStatus::Error;
            }
        }
    }

    /// Mark the event failed and restore the pre-command snapshot.
    fn recover(&self, failure: PhaseFailure, phase: &'static str, lifecycle: &mut Lifecycle<E>) {
        lifecycle.event.status = EventStatus::Error;
        match failure {
            PhaseFailure::Handler(err) => {
                tracing::warn!(phase, error = %err, "handler failed, rolling back");
            }
            PhaseFailure::Store(err) => {
                tracing::warn!(phase, error = %err, "store rejected write, rolling back");
                lifecycle.misuse = Some(err);
            }
        }
        self.rollback(
            lifecycle.original.as_ref(),
            lifecycle.entity_result.as_ref(),
        );
        lifecycle.entity_result = lifecycle.original.clone();
    }

    /// Undo a phase's writes.
    ///
    /// No snapshot but a produced result: the phase inserted speculatively,
    /// so the result is deleted. A snapshot: it is written back verbatim.
    /// Neither (e.g. a delete with no target): nothing was written.
    fn rollback(&self, original: Option<&E>, produced: Option<&E>) {
        let restored = match (original, produced) {
            (None, Some(speculative)) => self.write(|| self.store.delete(speculative.id())),
            (Some(snapshot), _) => self.write(|| self.store.set(snapshot.id(), snapshot.clone())),
            (None, None) => Ok(()),
        };
        if let Err(err) = restored {
            tracing::warn!(error = %err, "rollback write failed");
        }
    }

    fn commit_set(&self, entity: &E) -> Result<(), StoreError> {
        self.write(|| self.store.set(entity.id(), entity.clone()))
    }

    fn commit_delete(&self, target: Option<&E>) -> Result<(), StoreError> {
        match target {
            Some(entity) => self.write(|| self.store.delete(entity.id())),
            None => {
                tracing::debug!("delete has no target, nothing to remove");
                Ok(())
            }
        }
    }

    /// Funnel one store write through the mutation wrapper.
    fn write(&self, write: impl FnOnce() -> Result<(), StoreError>) -> Result<(), StoreError> {
        wrapped(&self.wrapper, write).unwrap_or_else(|| {
            tracing::warn!("mutation wrapper skipped a store write");
            Ok(())
        })
    }
}
