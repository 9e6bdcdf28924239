//! Resource watcher types.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use futures::StreamExt;

use crate::client::worker::{WatcherId, WorkerCommand};
use crate::resource::{DecodedResource, Resource};
use crate::subscription::UpdateFailureReason;

/// A handle the worker holds until the watcher has finished processing an
/// event. Dropping it (or calling [`ProcessingDone::ack`]) releases the
/// worker's backpressure wait for that event.
#[derive(Debug)]
pub struct ProcessingDone {
    tx: Option<oneshot::Sender<()>>,
}

impl ProcessingDone {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Acknowledge that the watcher has finished processing this event.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProcessingDone {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Events delivered to resource watchers.
#[derive(Debug)]
pub enum ResourceEvent<T> {
    /// The resource was added, or updated to a new version.
    Changed {
        /// The decoded resource.
        resource: Arc<T>,
        /// Acknowledge once this event has been fully processed.
        done: ProcessingDone,
    },
    /// The resource was removed — either explicitly by the server or
    /// implicitly through TTL expiry.
    Removed {
        /// Acknowledge once this event has been fully processed.
        done: ProcessingDone,
    },
    /// The update could not be applied, or the stream could not be
    /// (re-)established. Any previously delivered resource remains valid.
    AmbientError {
        /// Why the update failed.
        reason: UpdateFailureReason,
        /// A human-readable error message, if any.
        message: Option<String>,
    },
}

/// Unsubscribes the watcher from the worker when dropped.
struct UnwatchOnDrop {
    watcher_id: WatcherId,
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl Drop for UnwatchOnDrop {
    fn drop(&mut self) {
        let _ = self
            .command_tx
            .unbounded_send(WorkerCommand::Unwatch { watcher_id: self.watcher_id });
    }
}

/// A watcher for resources of type `T`.
///
/// Call [`next()`](Self::next) to receive resource events.
/// Dropping the watcher unsubscribes from the resource.
pub struct ResourceWatcher<T: Resource> {
    event_rx: mpsc::Receiver<ResourceEvent<DecodedResource>>,
    _unwatch: UnwatchOnDrop,
    _marker: PhantomData<T>,
}

impl<T: Resource> std::fmt::Debug for ResourceWatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWatcher").finish_non_exhaustive()
    }
}

impl<T: Resource> ResourceWatcher<T> {
    pub(crate) fn new(
        event_rx: mpsc::Receiver<ResourceEvent<DecodedResource>>,
        watcher_id: WatcherId,
        command_tx: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Self {
        Self {
            event_rx,
            _unwatch: UnwatchOnDrop { watcher_id, command_tx },
            _marker: PhantomData,
        }
    }

    /// Returns the next resource event.
    ///
    /// Returns `None` when the subscription is closed.
    ///
    /// # Example
    ///
    /// ```ignore
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::Changed { resource, done } => {
    ///             // handle `resource`
    ///             done.ack();
    ///         }
    ///         ResourceEvent::Removed { done } => { done.ack(); }
    ///         ResourceEvent::AmbientError { reason, message } => { /* handle */ }
    ///     }
    /// }
    /// ```
    pub async fn next(&mut self) -> Option<ResourceEvent<T>> {
        loop {
            let event = self.event_rx.next().await?;
            match event {
                ResourceEvent::Changed { resource, done } => {
                    if let Some(typed) = resource.downcast::<T>() {
                        return Some(ResourceEvent::Changed { resource: typed, done });
                    }
                    // Decoder/watcher type mismatch should not happen; skip.
                }
                ResourceEvent::Removed { done } => return Some(ResourceEvent::Removed { done }),
                ResourceEvent::AmbientError { reason, message } => {
                    return Some(ResourceEvent::AmbientError { reason, message })
                }
            }
        }
    }
}
