//! Scoped subscriptions to broadcast streams.
//!
//! A [`Subscription`] owns a background listener task. Dropping the guard,
//! on any exit path, aborts the task, so a subscriber tied to a component's
//! lifetime can never outlive it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Guard for a running listener. Aborts the listener when dropped.
#[derive(Debug)]
#[must_use = "dropping a Subscription immediately stops delivery"]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Returns `true` while the listener is still receiving.
    ///
    /// Becomes `false` after [`unsubscribe`](Subscription::unsubscribe) or
    /// once the source stream has closed.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop receiving. Equivalent to dropping the guard.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Spawn a listener feeding every item of `rx` to `callback`.
///
/// Lagged items are skipped with a warning; the listener ends when the
/// source closes.
pub(crate) fn listen<T, F>(
    mut rx: broadcast::Receiver<T>,
    source: Arc<str>,
    mut callback: F,
) -> Subscription
where
    T: Clone + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(item) => callback(item),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(source = %source, skipped, "subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    Subscription { task: Some(task) }
}
