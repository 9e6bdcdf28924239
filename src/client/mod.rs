//! Client interface through which the user can watch and receive updates for xDS resources.

use futures::channel::mpsc;

use crate::client::config::ClientConfig;
use crate::client::watch::ResourceWatcher;
use crate::client::worker::{AdsWorker, WatcherId, WorkerCommand, WorkerConfig};
use crate::error::Result;
use crate::resource::{DecodeResult, DecodedResource};
use crate::resource::Resource;
use crate::runtime::Runtime;
use crate::transport::Transport;

pub mod config;
pub mod retry;
pub mod watch;
pub(crate) mod worker;

/// Channel depth for per-watcher resource events.
const WATCHER_CHANNEL_BUFFER: usize = 16;

/// Builder for [`XdsClient`].
#[derive(Debug)]
pub struct XdsClientBuilder {
    config: ClientConfig,
}

impl XdsClientBuilder {
    /// Create a new builder with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Build the client with the given transport and runtime.
    ///
    /// This starts the background worker that manages the ADS stream. The
    /// worker is spawned via `runtime` and runs until every [`XdsClient`]
    /// handle (and its clones) has been dropped.
    #[cfg(feature = "codegen-prost")]
    pub async fn build<T, R>(self, transport: T, runtime: R) -> Result<XdsClient>
    where
        T: Transport,
        R: Runtime,
    {
        let (command_tx, command_rx) = mpsc::unbounded();

        let worker_config = WorkerConfig {
            retry_policy: self.config.retry_policy.clone(),
            enable_heartbeats: self.config.enable_heartbeats,
        };

        let codec = crate::codec::prost::ProstCodec;
        let worker = AdsWorker::new(
            transport,
            codec,
            runtime.clone(),
            Some(self.config.node),
            worker_config,
            command_rx,
        );
        runtime.spawn(worker.run());

        Ok(XdsClient { command_tx })
    }
}

/// The xDS client.
///
/// This is a handle to the background worker that manages the ADS stream.
/// Cloning this handle creates a new reference to the same worker.
#[derive(Clone, Debug)]
pub struct XdsClient {
    command_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl XdsClient {
    /// Create a new builder.
    pub fn builder(config: ClientConfig) -> XdsClientBuilder {
        XdsClientBuilder::new(config)
    }

    /// Watch a resource by name.
    ///
    /// Returns a [`ResourceWatcher`] that receives events for this resource.
    /// Dropping the watcher automatically unsubscribes.
    ///
    /// Wildcard (empty-name) subscriptions are not supported; `name` must
    /// identify a concrete resource.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut watcher = client.watch::<Listener>("my-listener");
    /// while let Some(event) = watcher.next().await {
    ///     match event {
    ///         ResourceEvent::Changed { resource, done } => {
    ///             println!("listener updated: {}", resource.name());
    ///             done.ack();
    ///         }
    ///         ResourceEvent::Removed { done } => {
    ///             println!("listener removed");
    ///             done.ack();
    ///         }
    ///         ResourceEvent::AmbientError { reason, message } => {
    ///             println!("error watching listener: {reason:?} {message:?}");
    ///         }
    ///     }
    /// }
    /// ```
    pub fn watch<T: Resource>(&self, name: impl Into<String>) -> ResourceWatcher<T> {
        let (event_tx, event_rx) = mpsc::channel(WATCHER_CHANNEL_BUFFER);
        let watcher_id = WatcherId::new();

        let decoder = Box::new(|bytes| match crate::resource::decode::<T>(bytes) {
            DecodeResult::Success { name, resource } => {
                let decoded = DecodedResource::new::<T>(name.clone(), resource);
                DecodeResult::Success { name, resource: decoded }
            }
            DecodeResult::ResourceError { name, error } => DecodeResult::ResourceError { name, error },
            DecodeResult::TopLevelError(error) => DecodeResult::TopLevelError(error),
        });

        let _ = self.command_tx.unbounded_send(WorkerCommand::Watch {
            type_url: T::TYPE_URL.as_str(),
            name: name.into(),
            watcher_id,
            event_tx,
            decoder,
        });

        ResourceWatcher::new(event_rx, watcher_id, self.command_tx.clone())
    }
}
