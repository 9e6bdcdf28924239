//! Crate-owned xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the delta xDS subscription state machine ([`crate::subscription`]) and
//! the codec layer. The codec converts these to/from the wire format (e.g.,
//! prost/envoy-types).
//!
//! Field shapes follow the `envoy.service.discovery.v3` delta discovery
//! protos (`DeltaDiscoveryRequest`/`DeltaDiscoveryResponse`/`Resource`).

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

/// A delta (incremental) discovery request to send to the xDS server.
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryRequest {
    /// Type URL of the resource being requested.
    pub type_url: String,
    /// The node making the request. Only populated on the first request of a
    /// stream; omitted afterward (see `SPEC_FULL.md` §4.5).
    pub node: Option<Node>,
    /// Resource versions known before the first request of this stream,
    /// keyed by resource name. Only populated on the first request per
    /// stream (spec §4.4 item 1).
    pub initial_resource_versions: HashMap<String, String>,
    /// Names newly (or re-)subscribed to since the last request.
    pub resource_names_subscribe: Vec<String>,
    /// Names unsubscribed from since the last request.
    pub resource_names_unsubscribe: Vec<String>,
    /// Nonce of the response this request acknowledges, if any.
    pub response_nonce: Option<String>,
    /// Present iff this request is a NACK for the response named by
    /// `response_nonce`.
    pub error_detail: Option<ErrorDetail>,
}

/// A delta (incremental) discovery response from the xDS server.
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryResponse {
    /// Type URL of the resources carried in this response.
    pub type_url: String,
    /// Opaque version of the overall response; forwarded to the watcher but
    /// not otherwise interpreted by the core.
    pub system_version_info: String,
    /// Nonce for this response, to be echoed back in the next request.
    pub nonce: String,
    /// Resources added or updated since the last response.
    pub resources: Vec<DeltaResource>,
    /// Names of resources removed since the last response.
    pub removed_resources: Vec<String>,
}

/// A single resource entry within a [`DeltaDiscoveryResponse`].
#[derive(Debug, Clone)]
pub struct DeltaResource {
    /// The resource name, unique within the response's `resources` list.
    pub name: String,
    /// The version the server assigns to this revision of the resource.
    pub version: String,
    /// Alternate names this resource is also known by. Carried through to
    /// the watcher; the core does not index by alias.
    pub aliases: Vec<String>,
    /// Time-to-live for this resource, if the server wants the client to
    /// implicitly remove it after a period of silence.
    pub ttl: Option<Duration>,
    /// The resource body. `None` for heartbeats and alias-only entries.
    pub payload: Option<ResourceAny>,
}

/// A resource body wrapped as `google.protobuf.Any`.
#[derive(Debug, Clone)]
pub struct ResourceAny {
    /// Type URL of the resource payload.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// Node identification for the client.
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality) can be set using builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details for NACK requests.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// gRPC status code (`google.rpc.Code`); `Internal` (13) for
    /// subscription-level validation failures per spec §7.
    pub code: i32,
    /// Error message, already truncated to a bounded length.
    pub message: String,
}

/// `google.rpc.Code::Internal`, used for the NACKs the subscription core
/// constructs itself (malformed response, rejected update).
pub const CODE_INTERNAL: i32 = 13;
