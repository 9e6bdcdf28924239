//! ADS worker that manages the delta xDS stream.
//!
//! The worker runs as a background task, managing:
//! - The ADS stream lifecycle (connection, reconnection)
//! - One [`DeltaSubscription`] per type URL (add/remove interest, ack/nack)
//! - TTL-driven implicit removal via a [`DelayQueue`]
//! - Dispatching decoded resources to watchers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key as DelayKey;
use uuid::Uuid;

use tracing::{debug, info, warn};

use crate::client::retry::{Backoff, RetryPolicy};
use crate::client::watch::{ProcessingDone, ResourceEvent};
use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryRequest, ErrorDetail, Node};
use crate::resource::{DecodeResult, DecodedResource, DecoderFn};
use crate::runtime::Runtime;
use crate::subscription::{Ack, DeltaSubscription, UpdateFailureReason, WatchedResource, Watcher};
use crate::transport::{Transport, TransportStream};

/// Unique identifier for a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(Uuid);

impl WatcherId {
    /// Create a new unique watcher ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands sent from `XdsClient` to the worker.
pub(crate) enum WorkerCommand {
    /// Subscribe to a resource.
    Watch {
        /// The type URL of the resource.
        type_url: &'static str,
        /// The resource name. Wildcard ("") subscriptions are not supported
        /// by this client; names must be concrete.
        name: String,
        /// Unique identifier for this watcher.
        watcher_id: WatcherId,
        /// Channel to send resource events to the watcher.
        event_tx: mpsc::Sender<ResourceEvent<DecodedResource>>,
        /// Decoder function for this resource type.
        decoder: DecoderFn,
    },
    /// Unsubscribe a watcher.
    Unwatch {
        /// The watcher to remove.
        watcher_id: WatcherId,
    },
}

/// Per-watcher state.
struct WatcherEntry {
    /// Channel to send events to this watcher.
    event_tx: mpsc::Sender<ResourceEvent<DecodedResource>>,
    /// Resource name this watcher subscribed to.
    name: String,
}

/// Per-type_url state tracking.
struct TypeState {
    /// Decoder function for this resource type.
    decoder: DecoderFn,
    /// The delta subscription state machine for this type URL.
    subscription: DeltaSubscription,
    /// Active watchers for this type, keyed by watcher ID.
    watchers: HashMap<WatcherId, WatcherEntry>,
    /// Reference counts per subscribed name, so multiple watchers of the
    /// same name share one subscription slot.
    refcounts: HashMap<String, usize>,
    /// Key into the worker's TTL `DelayQueue`, if a timer is currently
    /// armed for this type.
    ttl_key: Option<DelayKey>,
}

impl TypeState {
    fn new(decoder: DecoderFn, type_url: &str, heartbeats_enabled: bool) -> Self {
        Self {
            decoder,
            subscription: DeltaSubscription::new(type_url, heartbeats_enabled),
            watchers: HashMap::new(),
            refcounts: HashMap::new(),
            ttl_key: None,
        }
    }

    /// Add a watcher for `name`. Registers new interest with the
    /// subscription when this is the first watcher for that name.
    fn add_watcher(&mut self, watcher_id: WatcherId, name: String, event_tx: mpsc::Sender<ResourceEvent<DecodedResource>>) {
        let count = self.refcounts.entry(name.clone()).or_insert(0);
        *count += 1;
        let is_new_interest = *count == 1;
        if is_new_interest {
            self.subscription.update_interest([name.clone()], []);
        }
        self.watchers.insert(watcher_id, WatcherEntry { event_tx, name });
    }

    /// Remove a watcher, withdrawing interest with the subscription when
    /// this dropped the last watcher for its name. Returns `None` if
    /// `watcher_id` was not registered.
    fn remove_watcher(&mut self, watcher_id: WatcherId) -> Option<()> {
        let entry = self.watchers.remove(&watcher_id)?;
        let count = self.refcounts.get_mut(&entry.name)?;
        *count -= 1;
        let interest_dropped = *count == 0;
        if interest_dropped {
            self.refcounts.remove(&entry.name);
            self.subscription.update_interest([], [entry.name]);
        }
        Some(())
    }
}

/// Configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Retry policy governing stream establishment backoff.
    pub retry_policy: RetryPolicy,
    /// Whether newly created subscriptions classify unchanged re-sends as
    /// heartbeats (spec §4.5).
    pub enable_heartbeats: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            enable_heartbeats: true,
        }
    }
}

/// Collects the synchronous outcome of a [`DeltaSubscription::handle_response`]
/// call so the worker can perform the actual (async, backpressured) dispatch
/// afterward. The subscription core itself never awaits anything.
struct ResponseCollector<'a> {
    decoder: &'a DecoderFn,
    decoded: Vec<(String, DecodedResource)>,
    resource_errors: Vec<(String, Error)>,
    removed: Vec<String>,
    failure: Option<(UpdateFailureReason, Option<ErrorDetail>)>,
}

impl<'a> ResponseCollector<'a> {
    fn new(decoder: &'a DecoderFn) -> Self {
        Self {
            decoder,
            decoded: Vec::new(),
            resource_errors: Vec::new(),
            removed: Vec::new(),
            failure: None,
        }
    }
}

impl<'a> Watcher for ResponseCollector<'a> {
    fn on_config_update(
        &mut self,
        added_or_updated: &[WatchedResource],
        removed: &[String],
        _version: &str,
    ) -> std::result::Result<(), String> {
        let mut top_level_errors = Vec::new();

        for resource in added_or_updated {
            let Some(payload) = &resource.payload else {
                continue;
            };
            match (self.decoder)(payload.value.clone()) {
                DecodeResult::Success { name, resource } => self.decoded.push((name, resource)),
                DecodeResult::ResourceError { name, error } => {
                    self.resource_errors.push((name, error))
                }
                DecodeResult::TopLevelError(error) => top_level_errors.push(error.to_string()),
            }
        }

        if !top_level_errors.is_empty() {
            return Err(top_level_errors.join("; "));
        }

        self.removed = removed.to_vec();
        Ok(())
    }

    fn on_update_failed(&mut self, reason: UpdateFailureReason, error: Option<&ErrorDetail>) {
        self.failure = Some((reason, error.cloned()));
    }
}

/// The ADS worker manages the xDS stream and dispatches resources to watchers.
pub(crate) struct AdsWorker<T, C, R> {
    /// Transport for creating streams.
    transport: T,
    /// Codec for encoding/decoding messages.
    codec: C,
    /// Runtime for spawning tasks and sleeping.
    runtime: R,
    /// Node identification.
    node: Option<Node>,
    /// Worker configuration.
    config: WorkerConfig,

    /// Receiver for commands from XdsClient.
    command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    /// Per-type_url state.
    type_states: HashMap<String, TypeState>,

    /// Reconnection backoff, reset on every successful stream establishment.
    backoff: Backoff,

    /// Shared TTL timer queue across all type URLs.
    ttl_queue: DelayQueue<String>,

    /// Whether the node has already been sent on the current stream.
    node_sent_this_stream: bool,
}

impl<T, C, R> AdsWorker<T, C, R>
where
    T: Transport,
    C: XdsCodec,
    R: Runtime,
{
    /// Create a new worker.
    pub(crate) fn new(
        transport: T,
        codec: C,
        runtime: R,
        node: Option<Node>,
        config: WorkerConfig,
        command_rx: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        let backoff = Backoff::new(config.retry_policy.clone());
        Self {
            transport,
            codec,
            runtime,
            node,
            backoff,
            config,
            command_rx,
            type_states: HashMap::new(),
            ttl_queue: DelayQueue::new(),
            node_sent_this_stream: false,
        }
    }

    /// Run the worker event loop.
    ///
    /// This method runs until all `XdsClient` handles are dropped
    /// (which closes the command channel).
    pub(crate) async fn run(mut self) {
        loop {
            // Wait for at least one subscription before connecting.
            // This prevents deadlock with servers that require a message before
            // sending response headers - we need something to send.
            while self.type_states.is_empty() {
                match self.command_rx.next().await {
                    Some(cmd) => self.handle_command_disconnected(cmd),
                    None => return,
                }
            }

            self.node_sent_this_stream = false;
            self.reset_subscriptions_for_new_stream();

            let initial_requests = self.build_initial_requests();

            let stream = match self.transport.new_stream(initial_requests).await {
                Ok(s) => {
                    info!(type_count = self.type_states.len(), "xds stream established");
                    self.backoff.reset();
                    s
                }
                Err(e) => {
                    self.notify_all_establishment_failure();
                    let Some(delay) = self.backoff.next_backoff() else {
                        warn!(error = %e, "xds stream establishment failed, retry attempts exhausted");
                        return;
                    };
                    warn!(error = %e, backoff = ?delay, "xds stream establishment failed, retrying");
                    self.runtime.sleep(delay).await;
                    continue;
                }
            };

            self.node_sent_this_stream = true;

            if self.run_connected(stream).await {
                return; // shutdown
            }
            // else: reconnect
        }
    }

    /// Reset every active subscription's stream-scoped state ahead of a
    /// `transport.new_stream()` attempt. Every gRPC stream is independent of
    /// whatever came before it — whether the previous stream ended cleanly,
    /// broke mid-read, or this is the very first connection attempt — so
    /// this must run unconditionally before each attempt, not only when the
    /// attempt fails (mirrors `node_sent_this_stream = false` above).
    fn reset_subscriptions_for_new_stream(&mut self) {
        for type_state in self.type_states.values_mut() {
            type_state.subscription.reset_for_new_stream();
        }
    }

    /// Build initial delta discovery requests for all active subscriptions,
    /// to be sent immediately when establishing the stream.
    fn build_initial_requests(&mut self) -> Vec<Bytes> {
        let mut requests = Vec::new();

        let type_urls: Vec<String> = self
            .type_states
            .iter()
            .filter(|(_, ts)| !ts.watchers.is_empty())
            .map(|(url, _)| url.clone())
            .collect();

        for type_url in type_urls {
            if let Some(bytes) = self.build_request(&type_url, None) {
                requests.push(bytes);
            }
        }

        requests
    }

    /// Build and encode the next request for `type_url`, if any, attaching
    /// `Node` only if it has not yet been sent on the current stream.
    fn build_request(&mut self, type_url: &str, ack: Option<Ack>) -> Option<Bytes> {
        let type_state = self.type_states.get_mut(type_url)?;
        let request = type_state.subscription.next_request(ack);
        type_state.subscription.mark_context_sent();
        self.resync_ttl_timer(type_url);

        let node = if self.node_sent_this_stream {
            None
        } else {
            self.node_sent_this_stream = true;
            self.node.clone()
        };

        let wire_request = DeltaDiscoveryRequest {
            type_url: request.type_url,
            node,
            initial_resource_versions: request.initial_resource_versions,
            resource_names_subscribe: request.resource_names_subscribe,
            resource_names_unsubscribe: request.resource_names_unsubscribe,
            response_nonce: request.response_nonce,
            error_detail: request.error_detail,
        };

        self.codec.encode_request(&wire_request).ok()
    }

    /// Handle a command while disconnected (just update state, can't send requests).
    fn handle_command_disconnected(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Watch {
                type_url,
                name,
                watcher_id,
                event_tx,
                decoder,
            } => {
                self.add_watcher(type_url, name, watcher_id, event_tx, decoder);
            }
            WorkerCommand::Unwatch { watcher_id } => {
                self.remove_watcher(watcher_id);
            }
        }
    }

    /// Run the main event loop while connected.
    ///
    /// Returns `true` if the worker should shut down, `false` to reconnect.
    async fn run_connected<S: TransportStream>(&mut self, mut stream: S) -> bool {
        loop {
            futures::select! {
                result = stream.recv().fuse() => {
                    match result {
                        Ok(Some(bytes)) => {
                            if self.handle_response(&mut stream, bytes).await.is_err() {
                                return false;
                            }
                        }
                        Ok(None) => return false,
                        Err(_e) => return false,
                    }
                }

                cmd = self.command_rx.next() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command(&mut stream, cmd).await.is_err() {
                                return false;
                            }
                        }
                        None => return true,
                    }
                }

                Some(expired) = self.ttl_queue.next() => {
                    if let Ok(expired) = expired {
                        let type_url = expired.into_inner();
                        if self.handle_ttl_expiry(&mut stream, &type_url).await.is_err() {
                            return false;
                        }
                    }
                }
            }
        }
    }

    /// Handle a command while connected.
    async fn handle_command<S: TransportStream>(
        &mut self,
        stream: &mut S,
        cmd: WorkerCommand,
    ) -> Result<()> {
        match cmd {
            WorkerCommand::Watch {
                type_url,
                name,
                watcher_id,
                event_tx,
                decoder,
            } => {
                self.handle_watch(stream, type_url, name, watcher_id, event_tx, decoder)
                    .await
            }
            WorkerCommand::Unwatch { watcher_id } => self.handle_unwatch(stream, watcher_id).await,
        }
    }

    /// Handle a Watch command.
    async fn handle_watch<S: TransportStream>(
        &mut self,
        stream: &mut S,
        type_url: &'static str,
        name: String,
        watcher_id: WatcherId,
        event_tx: mpsc::Sender<ResourceEvent<DecodedResource>>,
        decoder: DecoderFn,
    ) -> Result<()> {
        let type_url_string = type_url.to_string();
        let update_pending = self.add_watcher(type_url, name, watcher_id, event_tx, decoder);

        if update_pending {
            self.send_request(stream, &type_url_string).await?;
        }

        Ok(())
    }

    /// Handle an Unwatch command.
    async fn handle_unwatch<S: TransportStream>(
        &mut self,
        stream: &mut S,
        watcher_id: WatcherId,
    ) -> Result<()> {
        if let Some((type_url, update_pending)) = self.remove_watcher(watcher_id) {
            if update_pending {
                self.send_request(stream, &type_url).await?;
            }
        }
        Ok(())
    }

    /// Add a watcher to the state. Returns whether the subscription now has
    /// a request it needs to send (spec §4.3).
    fn add_watcher(
        &mut self,
        type_url: &'static str,
        name: String,
        watcher_id: WatcherId,
        event_tx: mpsc::Sender<ResourceEvent<DecodedResource>>,
        decoder: DecoderFn,
    ) -> bool {
        let heartbeats_enabled = self.config.enable_heartbeats;
        let type_state = self
            .type_states
            .entry(type_url.to_string())
            .or_insert_with(|| TypeState::new(decoder, type_url, heartbeats_enabled));

        type_state.add_watcher(watcher_id, name, event_tx);
        type_state.subscription.subscription_update_pending()
    }

    /// Remove a watcher from the state. Returns the type_url and whether
    /// the subscription now has a request it needs to send (spec §4.3).
    fn remove_watcher(&mut self, watcher_id: WatcherId) -> Option<(String, bool)> {
        let type_url = self
            .type_states
            .iter()
            .find(|(_, state)| state.watchers.contains_key(&watcher_id))
            .map(|(url, _)| url.clone())?;

        let type_state = self.type_states.get_mut(&type_url)?;
        type_state.remove_watcher(watcher_id)?;
        let update_pending = type_state.subscription.subscription_update_pending();

        if type_state.watchers.is_empty() {
            if let Some(type_state) = self.type_states.remove(&type_url) {
                if let Some(key) = type_state.ttl_key {
                    self.ttl_queue.remove(&key);
                }
            }
        }

        Some((type_url, update_pending))
    }

    /// Send a request for `type_url` reflecting whatever interest changes
    /// are currently pending, with no ack attached.
    async fn send_request<S: TransportStream>(&mut self, stream: &mut S, type_url: &str) -> Result<()> {
        match self.build_request(type_url, None) {
            Some(bytes) => stream.send(bytes).await,
            None => Ok(()),
        }
    }

    /// Handle a response from the server.
    async fn handle_response<S: TransportStream>(
        &mut self,
        stream: &mut S,
        bytes: Bytes,
    ) -> Result<()> {
        let response = self.codec.decode_response(bytes)?;
        let type_url = response.type_url.clone();

        let Some(type_state) = self.type_states.get_mut(&type_url) else {
            return Ok(());
        };

        let mut collector = ResponseCollector::new(&type_state.decoder);
        let now = Instant::now();
        let ack = type_state.subscription.handle_response(&mut collector, response, now);
        self.resync_ttl_timer(&type_url);

        if let Some((reason, error)) = collector.failure {
            warn!(type_url = %type_url, ?reason, "watcher rejected update, nacking");
            self.notify_watchers_failure(&type_url, reason, error).await;
        } else {
            debug!(
                type_url = %type_url,
                updated = collector.decoded.len(),
                removed = collector.removed.len(),
                nacked = ack.error.is_some(),
                "processed xds response"
            );
            self.dispatch_decoded(&type_url, collector.decoded, collector.resource_errors, collector.removed)
                .await;
        }

        self.send_ack(stream, &type_url, ack).await
    }

    /// Handle a TTL expiry for `type_url`: treat the expired names as
    /// removed, with no network I/O (spec §4.6).
    async fn handle_ttl_expiry<S: TransportStream>(&mut self, _stream: &mut S, type_url: &str) -> Result<()> {
        let Some(type_state) = self.type_states.get_mut(type_url) else {
            return Ok(());
        };

        let mut collector = ResponseCollector::new(&type_state.decoder);
        let now = Instant::now();
        type_state.subscription.expire_ttls(&mut collector, now);
        self.resync_ttl_timer(type_url);

        if !collector.removed.is_empty() {
            debug!(type_url = %type_url, expired = ?collector.removed, "resources expired via ttl");
        }
        self.dispatch_decoded(type_url, collector.decoded, collector.resource_errors, collector.removed)
            .await;

        Ok(())
    }

    /// Re-insert, reset, or remove this type's entry in the TTL queue to
    /// match its subscription's current earliest deadline.
    fn resync_ttl_timer(&mut self, type_url: &str) {
        let Some(type_state) = self.type_states.get_mut(type_url) else {
            return;
        };
        let deadline = type_state.subscription.next_ttl_deadline();

        match (type_state.ttl_key.take(), deadline) {
            (Some(key), Some(deadline)) => {
                self.ttl_queue.reset_at(&key, tokio::time::Instant::from_std(deadline));
                type_state.ttl_key = Some(key);
            }
            (Some(key), None) => {
                self.ttl_queue.remove(&key);
            }
            (None, Some(deadline)) => {
                let key = self
                    .ttl_queue
                    .insert_at(type_url.to_string(), tokio::time::Instant::from_std(deadline));
                type_state.ttl_key = Some(key);
            }
            (None, None) => {}
        }
    }

    /// Dispatch decoded resources, per-resource decode errors, and removals
    /// to the watchers interested in each name. Uses backpressure: waits if
    /// a watcher's channel is full.
    async fn dispatch_decoded(
        &mut self,
        type_url: &str,
        decoded: Vec<(String, DecodedResource)>,
        resource_errors: Vec<(String, Error)>,
        removed: Vec<String>,
    ) {
        let Some(type_state) = self.type_states.get(type_url) else {
            return;
        };

        let mut processing_done: Vec<oneshot::Receiver<()>> = Vec::new();

        for (name, resource) in decoded {
            let resource = Arc::new(resource);
            for entry in type_state.watchers.values() {
                if entry.name != name {
                    continue;
                }
                let (done, rx) = ProcessingDone::channel();
                let event = ResourceEvent::Changed {
                    resource: Arc::clone(&resource),
                    done,
                };
                let mut event_tx = entry.event_tx.clone();
                let _ = event_tx.send(event).await;
                processing_done.push(rx);
            }
        }

        for (name, error) in resource_errors {
            for entry in type_state.watchers.values() {
                if entry.name != name {
                    continue;
                }
                let mut event_tx = entry.event_tx.clone();
                let event = ResourceEvent::AmbientError {
                    reason: UpdateFailureReason::UpdateRejected,
                    message: Some(error.to_string()),
                };
                let _ = event_tx.send(event).await;
            }
        }

        for name in removed {
            for entry in type_state.watchers.values() {
                if entry.name != name {
                    continue;
                }
                let (done, rx) = ProcessingDone::channel();
                let mut event_tx = entry.event_tx.clone();
                let _ = event_tx.send(ResourceEvent::Removed { done }).await;
                processing_done.push(rx);
            }
        }

        for rx in processing_done {
            let _ = rx.await;
        }
    }

    /// Notify every watcher of `type_url` that the update failed (a NACK'd
    /// or rejected response).
    async fn notify_watchers_failure(
        &mut self,
        type_url: &str,
        reason: UpdateFailureReason,
        error: Option<ErrorDetail>,
    ) {
        let Some(type_state) = self.type_states.get(type_url) else {
            return;
        };

        for entry in type_state.watchers.values() {
            let mut event_tx = entry.event_tx.clone();
            let event = ResourceEvent::AmbientError {
                reason,
                message: error.as_ref().map(|e| e.message.clone()),
            };
            let _ = event_tx.send(event).await;
        }
    }

    /// Notify every watcher of every active type that the stream could not
    /// be (re-)established, and reset each subscription so the next
    /// successful connect resends a full snapshot (spec §4.6).
    fn notify_all_establishment_failure(&mut self) {
        let type_urls: Vec<String> = self.type_states.keys().cloned().collect();
        for type_url in type_urls {
            let Some(type_state) = self.type_states.get_mut(&type_url) else {
                continue;
            };
            let mut collector = ResponseCollector::new(&type_state.decoder);
            type_state.subscription.handle_establishment_failure(&mut collector);
            if let Some((reason, error)) = collector.failure {
                for entry in type_state.watchers.values() {
                    let mut event_tx = entry.event_tx.clone();
                    let event = ResourceEvent::AmbientError {
                        reason,
                        message: error.as_ref().map(|e| e.message.clone()),
                    };
                    let _ = event_tx.try_send(event);
                }
            }
        }
    }

    /// Send an ACK or NACK for a response.
    async fn send_ack<S: TransportStream>(&mut self, stream: &mut S, type_url: &str, ack: Ack) -> Result<()> {
        match self.build_request(type_url, Some(ack)) {
            Some(bytes) => stream.send(bytes).await,
            None => Ok(()),
        }
    }
}
