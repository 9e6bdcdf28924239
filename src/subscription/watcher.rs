//! Watcher interface (spec §6).
//!
//! The watcher is a borrowed, non-owning collaborator: [`DeltaSubscription`]
//! never stores it, it is passed in on every call. Its lifetime is a
//! precondition of the caller, not something the core tracks (spec §5,
//! §9's re-architecture note on the back-pointer).
//!
//! Watcher implementations must not call back into the same
//! `DeltaSubscription` from within a callback; re-entrancy is undefined
//! (spec §5).
//!
//! [`DeltaSubscription`]: crate::subscription::DeltaSubscription

use crate::message::ErrorDetail;

/// A single resource update forwarded to the watcher.
#[derive(Debug, Clone)]
pub struct WatchedResource {
    /// The resource name.
    pub name: String,
    /// The version this update carries.
    pub version: String,
    /// Alternate names this resource is also known by.
    pub aliases: Vec<String>,
    /// The resource body, or `None` for an alias-only entry (spec §4.5).
    pub payload: Option<crate::message::ResourceAny>,
}

/// Why an update was rejected or could not be applied (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFailureReason {
    /// The response failed validation, or the watcher itself rejected the
    /// update.
    UpdateRejected,
    /// The stream could not be (re-)established.
    ConnectionFailure,
    /// No response arrived within the expected window.
    FetchTimedOut,
}

/// The consumer of add/remove notifications and failure notifications from
/// a [`DeltaSubscription`](crate::subscription::DeltaSubscription).
pub trait Watcher {
    /// Called once per successfully-applied response (including responses
    /// with no resources and no removals — spec §8 "Empty response").
    ///
    /// `added_or_updated` never contains heartbeat resources (spec §8
    /// invariant 5). `version` is the response's `system_version_info`, or
    /// the empty string for TTL-driven synthetic removals (spec §4.6).
    ///
    /// Returning `Err` rejects the update: the caller converts it into a
    /// NACK carrying the error message (spec §7 item 2, "watcher-rejected
    /// update"). Table mutations already applied for this response are
    /// *not* rolled back — the watcher is expected to apply its own
    /// rollback semantics if it needs them (spec §9 open question).
    fn on_config_update(
        &mut self,
        added_or_updated: &[WatchedResource],
        removed: &[String],
        version: &str,
    ) -> Result<(), String>;

    /// Called when a response is rejected, or the stream could not be
    /// established.
    fn on_update_failed(&mut self, reason: UpdateFailureReason, error: Option<&ErrorDetail>);
}
