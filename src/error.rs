//! Crate-level error types for store access, handlers, and command dispatch.

/// Error returned by a [`StoreAdapter`](crate::StoreAdapter) write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store does not support the requested operation.
    ///
    /// Raised when deleting from a single-entity store: the singleton slot
    /// can be replaced but never removed.
    #[error("`{operation}` is not supported by a {store} store")]
    UnsupportedOperation {
        /// The rejected operation (e.g. `"delete"`).
        operation: &'static str,
        /// The kind of store that rejected it (e.g. `"single-entity"`).
        store: &'static str,
    },
}

/// Error returned by a synchronous or asynchronous entity handler.
///
/// The pipeline never propagates these to the command issuer. A handler
/// error rolls the store back to its pre-command snapshot and marks the
/// emitted event with [`EventStatus::Error`](crate::EventStatus::Error).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler required an entity but none was in the store.
    ///
    /// Produced by [`defined_entity`](crate::defined_entity).
    #[error("entity does not exist")]
    MissingEntity,

    /// The command payload could not be decoded into the handler's type.
    #[error("invalid command payload: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler rejected the command for a business reason.
    #[error("{0}")]
    Rejected(String),

    /// Any other failure raised inside a handler.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Create a rejection with a human-readable reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }

    /// Wrap an arbitrary error raised inside a handler.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Error returned to the caller of
/// [`CommandFactory::dispatch`](crate::CommandFactory::dispatch).
///
/// Handler failures are *not* reported here; they surface only as an
/// `error` event. These variants cover misuse and infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The payload could not be serialized into the command record.
    #[error("failed to encode command payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// A command with no handlers was dispatched with a payload lacking an
    /// `id`, so it has nowhere to be written.
    #[error("command has no handlers and its payload carries no `id`")]
    MissingId,

    /// The store rejected a write as a programming-time misuse.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pipeline task has exited, so the command cannot be processed.
    #[error("state machine pipeline is no longer running")]
    PipelineGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("sensor offline")]
    struct SensorError;

    #[test]
    fn unsupported_operation_display() {
        let err = StoreError::UnsupportedOperation {
            operation: "delete",
            store: "single-entity",
        };
        assert_eq!(
            err.to_string(),
            "`delete` is not supported by a single-entity store"
        );
    }

    #[test]
    fn handler_error_missing_entity_display() {
        assert_eq!(
            HandlerError::MissingEntity.to_string(),
            "entity does not exist"
        );
    }

    #[test]
    fn handler_error_other_is_transparent() {
        let err = HandlerError::other(SensorError);
        assert_eq!(err.to_string(), "sensor offline");
    }

    #[test]
    fn handler_error_from_serde() {
        let serde_err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let err = HandlerError::from(serde_err);
        assert!(matches!(err, HandlerError::Payload(_)));
        assert!(err.to_string().starts_with("invalid command payload"));
    }

    #[test]
    fn dispatch_error_from_store_error() {
        let err = DispatchError::from(StoreError::UnsupportedOperation {
            operation: "delete",
            store: "single-entity",
        });
        assert!(matches!(err, DispatchError::Store(_)));
        assert!(err.to_string().contains("single-entity"));
    }

    #[test]
    fn dispatch_error_pipeline_gone_display() {
        assert_eq!(
            DispatchError::PipelineGone.to_string(),
            "state machine pipeline is no longer running"
        );
    }

    // Errors travel through `oneshot` channels and across spawned tasks.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StoreError>();
            assert_send_sync::<HandlerError>();
            assert_send_sync::<DispatchError>();
        }
    };
}
