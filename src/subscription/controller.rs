//! The subscription controller (component F) — the per-type-URL delta xDS
//! state machine (spec §4.6, §4.7).
//!
//! `DeltaSubscription` is the only public entry point into the core. It
//! owns the resource table (A), the pending-delta buffer (B), and the TTL
//! tracker (C) privately, and exposes exactly the operations spec §4.6
//! names: `update_interest`, `next_request`, `handle_response`,
//! `handle_establishment_failure`, and TTL expiry handling.
//!
//! The controller performs no I/O and holds no clock of its own — all time
//! values (TTL deadlines, "now") are supplied by the caller, keeping this
//! module's behavior fully deterministic and unit-testable (spec §5:
//! "single-threaded cooperative ... synchronous").

use std::time::Instant;

use crate::message::{CODE_INTERNAL, DeltaDiscoveryResponse, ErrorDetail};
use crate::subscription::pending::PendingDelta;
use crate::subscription::request::{Ack, Request};
use crate::subscription::state::{ResourceState, ResourceTable};
use crate::subscription::ttl::TtlTracker;
use crate::subscription::watcher::{UpdateFailureReason, WatchedResource, Watcher};

/// Error detail messages sent back to the server are truncated to this many
/// bytes (spec §7: "always truncated to a bounded length").
pub const MAX_NACK_MESSAGE_LEN: usize = 1024;

/// The per-type-URL delta xDS subscription state machine.
///
/// One instance covers exactly one type URL (spec §3). Create it with
/// [`DeltaSubscription::new`] and drive it from the single dispatcher thread
/// that owns the surrounding stream; see module docs for the concurrency
/// contract.
#[derive(Debug)]
pub struct DeltaSubscription {
    type_url: String,
    table: ResourceTable,
    pending: PendingDelta,
    ttl: TtlTracker,
    any_request_sent_yet: bool,
    dynamic_context_changed: bool,
    heartbeats_enabled: bool,
}

impl DeltaSubscription {
    /// Create a new subscription for `type_url`.
    ///
    /// `heartbeats_enabled` is the runtime-queryable feature gate spec §6
    /// calls for; it can be changed later with
    /// [`DeltaSubscription::set_heartbeats_enabled`].
    pub fn new(type_url: impl Into<String>, heartbeats_enabled: bool) -> Self {
        Self {
            type_url: type_url.into(),
            table: ResourceTable::new(),
            pending: PendingDelta::new(),
            ttl: TtlTracker::new(),
            any_request_sent_yet: false,
            dynamic_context_changed: false,
            heartbeats_enabled,
        }
    }

    /// The type URL this subscription covers.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Enable or disable heartbeat classification at runtime (spec §6).
    pub fn set_heartbeats_enabled(&mut self, enabled: bool) {
        self.heartbeats_enabled = enabled;
    }

    /// Mark that observability labels the server should see have changed
    /// since the last request was sent. The next `next_request` call will
    /// be forced even if no subscription changes are pending (spec §4.3).
    pub fn mark_dynamic_context_changed(&mut self) {
        self.dynamic_context_changed = true;
    }

    /// Update the user's interest set (spec §4.2).
    ///
    /// For every added name: the table entry is reset to `Waiting`
    /// (discarding any cached version), it is dropped from
    /// `to_unsubscribe`, and added to `to_subscribe`.
    ///
    /// For every removed name: the table entry is deleted, it is dropped
    /// from `to_subscribe`, and added to `to_unsubscribe`.
    pub fn update_interest<A, R>(&mut self, added: A, removed: R)
    where
        A: IntoIterator<Item = String>,
        R: IntoIterator<Item = String>,
    {
        for name in added {
            self.table.set_waiting(&name);
            self.pending.subscribe(name);
        }
        for name in removed {
            self.table.remove(&name);
            self.pending.unsubscribe(name);
        }
    }

    /// Whether a request needs to be sent (spec §4.3).
    pub fn subscription_update_pending(&self) -> bool {
        !self.pending.is_empty() || !self.any_request_sent_yet || self.dynamic_context_changed
    }

    /// Build the next delta discovery request (spec §4.4).
    ///
    /// The caller is responsible for any outer framing (e.g. attaching
    /// `Node`) and for calling
    /// [`DeltaSubscription::mark_context_sent`] after a successful send.
    pub fn next_request(&mut self, ack: Option<Ack>) -> Request {
        let mut initial_resource_versions = std::collections::HashMap::new();

        if !self.any_request_sent_yet {
            for (name, state) in self.table.iter() {
                self.pending.subscribe(name.clone());
                if let ResourceState::Known { version } = state {
                    initial_resource_versions.insert(name.clone(), version.clone());
                }
            }
            self.pending.clear_unsubscribe();
            self.any_request_sent_yet = true;
        }

        let (resource_names_subscribe, resource_names_unsubscribe) = self.pending.drain();

        let (response_nonce, error_detail) = match ack {
            Some(ack) => (Some(ack.nonce), ack.error),
            None => (None, None),
        };

        Request {
            type_url: self.type_url.clone(),
            initial_resource_versions,
            resource_names_subscribe,
            resource_names_unsubscribe,
            response_nonce,
            error_detail,
        }
    }

    /// Clear the "dynamic context changed" flag after a successful send
    /// (spec §4.4 item 5).
    pub fn mark_context_sent(&mut self) {
        self.dynamic_context_changed = false;
    }

    /// Validate, apply, and acknowledge an incoming delta discovery
    /// response (spec §4.5).
    ///
    /// `now` is used to convert each resource's relative TTL into an
    /// absolute deadline; it is supplied by the caller rather than read
    /// from the system clock so the state machine stays deterministic.
    pub fn handle_response(
        &mut self,
        watcher: &mut dyn Watcher,
        response: DeltaDiscoveryResponse,
        now: Instant,
    ) -> Ack {
        if let Err(message) = validate_response(&response) {
            return self.reject(watcher, &response, message);
        }

        let heartbeat_flags: Vec<bool> = response
            .resources
            .iter()
            .map(|resource| self.is_heartbeat(resource))
            .collect();

        for (resource, is_heartbeat) in response.resources.iter().zip(&heartbeat_flags) {
            match resource.ttl {
                Some(ttl) => self.ttl.arm(resource.name.clone(), now + ttl),
                None => self.ttl.cancel(&resource.name),
            }
            if !is_heartbeat {
                self.table.set_known(resource.name.clone(), resource.version.clone());
            }
        }

        let added_or_updated: Vec<WatchedResource> = response
            .resources
            .iter()
            .zip(&heartbeat_flags)
            .filter(|(_, is_heartbeat)| !**is_heartbeat)
            .map(|(resource, _)| WatchedResource {
                name: resource.name.clone(),
                version: resource.version.clone(),
                aliases: resource.aliases.clone(),
                payload: resource.payload.clone(),
            })
            .collect();

        if let Err(message) = watcher.on_config_update(
            &added_or_updated,
            &response.removed_resources,
            &response.system_version_info,
        ) {
            return self.reject(watcher, &response, message);
        }

        for name in &response.removed_resources {
            if self.table.contains(name) {
                self.table.set_waiting(name.clone());
            }
        }

        Ack {
            nonce: response.nonce,
            type_url: response.type_url,
            error: None,
        }
    }

    /// Whether `resource` qualifies as a heartbeat (spec §4.5).
    fn is_heartbeat(&self, resource: &crate::message::DeltaResource) -> bool {
        self.heartbeats_enabled
            && resource.payload.is_none()
            && matches!(
                self.table.get(&resource.name),
                Some(ResourceState::Known { version }) if *version == resource.version
            )
    }

    /// Build a NACK, notify the watcher, and return the NACK ack. Table
    /// state is left exactly as it was before this call returns in the
    /// structural-validation-failure case (called before any mutation);
    /// in the watcher-rejection case, mutations already applied for this
    /// response are retained (spec §7 item 2).
    fn reject(&self, watcher: &mut dyn Watcher, response: &DeltaDiscoveryResponse, message: String) -> Ack {
        let message = truncate(&message, MAX_NACK_MESSAGE_LEN);
        let error = ErrorDetail {
            code: CODE_INTERNAL,
            message,
        };
        watcher.on_update_failed(UpdateFailureReason::UpdateRejected, Some(&error));
        Ack {
            nonce: response.nonce.clone(),
            type_url: response.type_url.clone(),
            error: Some(error),
        }
    }

    /// Notify the watcher that the stream could not be (re-)established
    /// (spec §4.6). Table state is unchanged. The next opportunity to send
    /// a request will resend a full snapshot.
    pub fn handle_establishment_failure(&mut self, watcher: &mut dyn Watcher) {
        watcher.on_update_failed(UpdateFailureReason::ConnectionFailure, None);
        self.reset_for_new_stream();
    }

    /// Reset stream-scoped state so the next `next_request` call resends a
    /// full snapshot (spec §4.4 item 1, §4.6). Every gRPC stream is
    /// independent — the server has no memory of a previous, now-closed
    /// stream, whether it ended cleanly or broke mid-read — so the caller
    /// must call this before attempting to (re-)establish a stream, not
    /// only on establishment failure. No watcher callback is invoked; this
    /// is plain bookkeeping, unlike [`handle_establishment_failure`](Self::handle_establishment_failure).
    pub fn reset_for_new_stream(&mut self) {
        self.any_request_sent_yet = false;
    }

    /// The earliest TTL deadline currently armed, for the caller to
    /// schedule a wakeup against.
    pub fn next_ttl_deadline(&self) -> Option<Instant> {
        self.ttl.next_deadline()
    }

    /// Expire any TTLs due at or before `now`, treating them as
    /// server-driven removals (spec §4.6) with no network I/O.
    pub fn expire_ttls(&mut self, watcher: &mut dyn Watcher, now: Instant) {
        let expired = self.ttl.expired_before(now);
        if !expired.is_empty() {
            self.on_ttl_expired(watcher, &expired);
        }
    }

    /// Treat `names` as implicitly removed by TTL expiry (spec §4.6).
    pub fn on_ttl_expired(&mut self, watcher: &mut dyn Watcher, names: &[String]) {
        for name in names {
            if self.table.contains(name) {
                self.table.set_waiting(name.clone());
            }
        }
        watcher.on_config_update(&[], names, "").ok();
    }
}

/// Structural validation of an incoming response (spec §4.5, V1-V3). Runs
/// before any mutation so the "atomic apply or NACK" invariant is
/// structural (spec §9's re-architecture note).
fn validate_response(response: &DeltaDiscoveryResponse) -> Result<(), String> {
    let mut seen = std::collections::HashSet::with_capacity(response.resources.len());
    for resource in &response.resources {
        if !seen.insert(resource.name.as_str()) {
            return Err(format!("duplicate resource name in response: {}", resource.name));
        }
    }

    for removed in &response.removed_resources {
        if seen.contains(removed.as_str()) {
            return Err(format!(
                "resource {removed} present in both resources and removed_resources"
            ));
        }
    }

    for resource in &response.resources {
        if let Some(payload) = &resource.payload {
            if payload.type_url != response.type_url {
                return Err(format!(
                    "resource {} payload type_url {} does not match response type_url {}",
                    resource.name, payload.type_url, response.type_url
                ));
            }
        }
    }

    Ok(())
}

/// Truncate `s` to at most `max_len` bytes on a char boundary.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeltaResource, ResourceAny};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingWatcher {
        updates: Vec<(Vec<WatchedResource>, Vec<String>, String)>,
        failures: Vec<(UpdateFailureReason, Option<ErrorDetail>)>,
        reject_next: bool,
    }

    impl Watcher for RecordingWatcher {
        fn on_config_update(
            &mut self,
            added_or_updated: &[WatchedResource],
            removed: &[String],
            version: &str,
        ) -> Result<(), String> {
            if self.reject_next {
                self.reject_next = false;
                return Err("watcher rejected".to_string());
            }
            self
                .updates
                .push((added_or_updated.to_vec(), removed.to_vec(), version.to_string()));
            Ok(())
        }

        fn on_update_failed(&mut self, reason: UpdateFailureReason, error: Option<&ErrorDetail>) {
            self.failures.push((reason, error.cloned()));
        }
    }

    fn resource(name: &str, version: &str, payload: bool) -> DeltaResource {
        DeltaResource {
            name: name.to_string(),
            version: version.to_string(),
            aliases: Vec::new(),
            ttl: None,
            payload: payload.then(|| ResourceAny {
                type_url: "type.googleapis.com/test.Widget".to_string(),
                value: bytes::Bytes::from_static(b"payload"),
            }),
        }
    }

    fn response(resources: Vec<DeltaResource>, removed: Vec<&str>, nonce: &str) -> DeltaDiscoveryResponse {
        DeltaDiscoveryResponse {
            type_url: "type.googleapis.com/test.Widget".to_string(),
            system_version_info: String::new(),
            nonce: nonce.to_string(),
            resources,
            removed_resources: removed.into_iter().map(str::to_string).collect(),
        }
    }

    // S1 — first request after interest.
    #[test]
    fn s1_first_request_after_interest() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string(), "b".to_string()], []);
        let req = sub.next_request(None);

        let mut expect_sub = req.resource_names_subscribe.clone();
        expect_sub.sort();
        assert_eq!(expect_sub, vec!["a".to_string(), "b".to_string()]);
        assert!(req.resource_names_unsubscribe.is_empty());
        assert!(req.initial_resource_versions.is_empty());
        assert_eq!(req.response_nonce, None);
    }

    // S2 — ack then incremental, then an unsubscribe.
    #[test]
    fn s2_ack_then_incremental() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string(), "b".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let now = Instant::now();
        let resp = response(vec![resource("a", "v1", true)], vec![], "n1");
        let ack = sub.handle_response(&mut watcher, resp, now);

        assert_eq!(watcher.updates.len(), 1);
        assert_eq!(watcher.updates[0].0.len(), 1);
        assert_eq!(watcher.updates[0].0[0].name, "a");
        assert!(watcher.updates[0].1.is_empty());
        assert_eq!(ack.nonce, "n1");
        assert!(ack.error.is_none());

        sub.update_interest([], ["b".to_string()]);
        let req = sub.next_request(Some(ack));
        assert!(req.resource_names_subscribe.is_empty());
        assert_eq!(req.resource_names_unsubscribe, vec!["b".to_string()]);
        assert!(req.initial_resource_versions.is_empty());
        assert_eq!(req.response_nonce, Some("n1".to_string()));
    }

    // S3 — stream reconnect preserves known versions.
    #[test]
    fn s3_reconnect_preserves_known_versions() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string(), "b".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let now = Instant::now();
        let resp = response(vec![resource("a", "v1", true)], vec![], "n1");
        let ack = sub.handle_response(&mut watcher, resp, now);
        sub.update_interest([], ["b".to_string()]);
        let _ = sub.next_request(Some(ack));

        sub.handle_establishment_failure(&mut watcher);
        assert_eq!(
            watcher.failures.last().unwrap().0,
            UpdateFailureReason::ConnectionFailure
        );

        let req = sub.next_request(None);
        assert_eq!(req.resource_names_subscribe, vec!["a".to_string()]);
        assert!(req.resource_names_unsubscribe.is_empty());
        assert_eq!(req.initial_resource_versions.get("a"), Some(&"v1".to_string()));
    }

    // S4 — duplicate name rejection.
    #[test]
    fn s4_duplicate_name_rejection() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let resp = response(
            vec![resource("a", "v1", true), resource("a", "v2", true)],
            vec![],
            "n1",
        );
        let ack = sub.handle_response(&mut watcher, resp, Instant::now());

        assert!(watcher.updates.is_empty());
        assert_eq!(
            watcher.failures[0].0,
            UpdateFailureReason::UpdateRejected
        );
        let error = ack.error.expect("nack expected");
        assert_eq!(error.code, CODE_INTERNAL);
        assert!(error.message.contains('a'));
        assert_eq!(sub.table.get("a"), Some(&ResourceState::Waiting));
    }

    // S5 — heartbeat suppression.
    #[test]
    fn s5_heartbeat_suppression() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let now = Instant::now();
        let first = response(vec![resource("a", "v1", true)], vec![], "n1");
        let _ = sub.handle_response(&mut watcher, first, now);
        assert_eq!(watcher.updates.len(), 1);

        let heartbeat = response(vec![resource("a", "v1", false)], vec![], "n2");
        let ack = sub.handle_response(&mut watcher, heartbeat, now);

        // The watcher still sees a call for the heartbeat response, but
        // with no resources attached — the heartbeat itself is suppressed.
        assert_eq!(watcher.updates.len(), 2);
        assert!(watcher.updates[1].0.is_empty());
        assert!(ack.error.is_none());
    }

    // S6 — TTL expiry.
    #[test]
    fn s6_ttl_expiry() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let now = Instant::now();
        let mut a = resource("a", "v1", true);
        a.ttl = Some(Duration::from_millis(100));
        let resp = response(vec![a], vec![], "n1");
        let _ = sub.handle_response(&mut watcher, resp, now);

        sub.expire_ttls(&mut watcher, now + Duration::from_millis(150));

        let (added, removed, version) = watcher.updates.last().unwrap();
        assert!(added.is_empty());
        assert_eq!(removed, &vec!["a".to_string()]);
        assert_eq!(version, "");
        assert_eq!(sub.table.get("a"), Some(&ResourceState::Waiting));
    }

    #[test]
    fn empty_response_still_acks() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        let mut watcher = RecordingWatcher::default();
        let resp = response(vec![], vec![], "n1");
        let ack = sub.handle_response(&mut watcher, resp, Instant::now());
        assert_eq!(watcher.updates.len(), 1);
        assert!(ack.error.is_none());
    }

    #[test]
    fn r1_noop_interest_update() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest([], []);
        assert!(sub.pending.is_empty());
        assert!(sub.table.is_empty());
    }

    #[test]
    fn watcher_rejection_retains_table_mutations_but_nacks() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher {
            reject_next: true,
            ..Default::default()
        };
        let resp = response(vec![resource("a", "v1", true)], vec![], "n1");
        let ack = sub.handle_response(&mut watcher, resp, Instant::now());

        assert!(ack.error.is_some());
        assert_eq!(
            watcher.failures[0].0,
            UpdateFailureReason::UpdateRejected
        );
        // Table mutation from this response is retained despite rejection.
        assert_eq!(
            sub.table.get("a"),
            Some(&ResourceState::Known { version: "v1".into() })
        );
    }

    #[test]
    fn alias_only_resource_forwarded() {
        let mut sub = DeltaSubscription::new("type.googleapis.com/test.Widget", true);
        sub.update_interest(["a".to_string()], []);
        let _ = sub.next_request(None);

        let mut watcher = RecordingWatcher::default();
        let mut res = resource("a", "v1", false);
        res.aliases = vec!["alias-a".to_string()];
        let resp = response(vec![res], vec![], "n1");
        let ack = sub.handle_response(&mut watcher, resp, Instant::now());

        assert_eq!(watcher.updates[0].0.len(), 1);
        assert_eq!(watcher.updates[0].0[0].aliases, vec!["alias-a".to_string()]);
        assert!(ack.error.is_none());
    }
}
