//! Request/ack types produced and consumed by the subscription controller
//! (spec §3, §6). These are deliberately narrower than
//! [`crate::message::DeltaDiscoveryRequest`]: the core subscription state
//! machine has no notion of `Node` (see `SPEC_FULL.md` §4.5) — the worker
//! layer fills that in when translating a [`Request`] into the wire-level
//! message.

use std::collections::HashMap;

use crate::message::ErrorDetail;

/// The next delta discovery request to send, as built by
/// [`DeltaSubscription::next_request`](crate::subscription::DeltaSubscription::next_request).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Type URL this subscription covers.
    pub type_url: String,
    /// Populated only on the first request of a stream (spec §4.4 item 1).
    pub initial_resource_versions: HashMap<String, String>,
    /// Names newly (re-)subscribed to since the last request.
    pub resource_names_subscribe: Vec<String>,
    /// Names unsubscribed from since the last request.
    pub resource_names_unsubscribe: Vec<String>,
    /// Nonce of the response being acknowledged, if any.
    pub response_nonce: Option<String>,
    /// Present iff this is a NACK.
    pub error_detail: Option<ErrorDetail>,
}

/// An acknowledgement produced by
/// [`DeltaSubscription::handle_response`](crate::subscription::DeltaSubscription::handle_response),
/// to be folded into the next [`Request`] (spec §3).
#[derive(Debug, Clone)]
pub struct Ack {
    /// Nonce copied verbatim from the triggering response.
    pub nonce: String,
    /// Type URL of the triggering response.
    pub type_url: String,
    /// `None` for an ACK, `Some` for a NACK.
    pub error: Option<ErrorDetail>,
}
