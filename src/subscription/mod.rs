//! The delta xDS subscription state machine — wire-agnostic, I/O-free, and
//! synchronous. This is the crate's core: everything else (transport,
//! codec, runtime, the async worker) exists to drive it.

mod controller;
mod pending;
mod request;
mod state;
mod ttl;
mod watcher;

pub use controller::{DeltaSubscription, MAX_NACK_MESSAGE_LEN};
pub use pending::PendingDelta;
pub use request::{Ack, Request};
pub use state::{ResourceState, ResourceTable};
pub use ttl::TtlTracker;
pub use watcher::{UpdateFailureReason, WatchedResource, Watcher};
