//! Prost-based codec using envoy-types.

use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use crate::codec::XdsCodec;
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, ResourceAny};

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

impl XdsCodec for ProstCodec {
    fn encode_request(&self, request: &DeltaDiscoveryRequest) -> Result<Bytes> {
        use envoy_types::pb::envoy::config::core::v3 as core;
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        use envoy_types::pb::google::rpc::Status;

        let proto_request = discovery::DeltaDiscoveryRequest {
            node: request.node.as_ref().map(|n| core::Node {
                id: n.id.clone().unwrap_or_default(),
                cluster: n.cluster.clone().unwrap_or_default(),
                locality: n.locality.as_ref().map(|l| core::Locality {
                    region: l.region.clone(),
                    zone: l.zone.clone(),
                    sub_zone: l.sub_zone.clone(),
                }),
                user_agent_name: n.user_agent_name.clone(),
                ..Default::default()
            }),
            type_url: request.type_url.clone(),
            resource_names_subscribe: request.resource_names_subscribe.clone(),
            resource_names_unsubscribe: request.resource_names_unsubscribe.clone(),
            initial_resource_versions: request.initial_resource_versions.clone(),
            response_nonce: request.response_nonce.clone().unwrap_or_default(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<DeltaDiscoveryResponse> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        let proto_response = discovery::DeltaDiscoveryResponse::decode(bytes).map_err(Error::Decode)?;

        let resources = proto_response
            .resources
            .into_iter()
            .map(|resource| DeltaResource {
                name: resource.name,
                version: resource.version,
                aliases: resource.aliases,
                ttl: resource.ttl.map(duration_from_proto),
                payload: resource.resource.map(|any| ResourceAny {
                    type_url: any.type_url,
                    value: any.value.into(),
                }),
            })
            .collect();

        Ok(DeltaDiscoveryResponse {
            type_url: proto_response.type_url,
            system_version_info: proto_response.system_version_info,
            nonce: proto_response.nonce,
            resources,
            removed_resources: proto_response.removed_resources,
        })
    }
}

fn duration_from_proto(d: envoy_types::pb::google::protobuf::Duration) -> Duration {
    Duration::new(d.seconds.max(0) as u64, d.nanos.max(0) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorDetail, Locality, Node};
    use std::collections::HashMap;

    #[test]
    fn encode_request_minimal() {
        let codec = ProstCodec;
        let request = DeltaDiscoveryRequest {
            type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
            resource_names_subscribe: vec!["listener-1".to_string()],
            ..Default::default()
        };

        let bytes = codec.encode_request(&request).unwrap();
        assert!(!bytes.is_empty());

        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        let decoded = discovery::DeltaDiscoveryRequest::decode(bytes).unwrap();
        assert_eq!(decoded.type_url, request.type_url);
        assert_eq!(decoded.resource_names_subscribe, request.resource_names_subscribe);
    }

    #[test]
    fn encode_request_with_node_and_initial_versions() {
        let codec = ProstCodec;
        let mut initial_resource_versions = HashMap::new();
        initial_resource_versions.insert("cluster-1".to_string(), "v1".to_string());

        let request = DeltaDiscoveryRequest {
            type_url: "type.googleapis.com/envoy.config.cluster.v3.Cluster".to_string(),
            node: Some(Node {
                id: Some("node-1".to_string()),
                cluster: Some("cluster-1".to_string()),
                locality: Some(Locality {
                    region: "us-west".to_string(),
                    zone: "us-west-1a".to_string(),
                    sub_zone: "rack-1".to_string(),
                }),
                ..Default::default()
            }),
            initial_resource_versions,
            ..Default::default()
        };

        let bytes = codec.encode_request(&request).unwrap();

        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        let decoded = discovery::DeltaDiscoveryRequest::decode(bytes).unwrap();
        let node = decoded.node.unwrap();
        assert_eq!(node.id, "node-1");
        assert_eq!(node.cluster, "cluster-1");
        assert_eq!(
            decoded.initial_resource_versions.get("cluster-1"),
            Some(&"v1".to_string())
        );
    }

    #[test]
    fn decode_response_with_ttl_and_removed() {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        use envoy_types::pb::google::protobuf::Any;

        let proto_response = discovery::DeltaDiscoveryResponse {
            system_version_info: "1".to_string(),
            type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
            nonce: "nonce-1".to_string(),
            resources: vec![discovery::Resource {
                name: "listener-1".to_string(),
                version: "v1".to_string(),
                resource: Some(Any {
                    type_url: "type.googleapis.com/envoy.config.listener.v3.Listener".to_string(),
                    value: b"fake-listener-bytes".to_vec(),
                }),
                ttl: Some(envoy_types::pb::google::protobuf::Duration {
                    seconds: 30,
                    nanos: 0,
                }),
                ..Default::default()
            }],
            removed_resources: vec!["listener-2".to_string()],
        };

        let bytes: Bytes = proto_response.encode_to_vec().into();

        let codec = ProstCodec;
        let response = codec.decode_response(bytes).unwrap();

        assert_eq!(response.system_version_info, "1");
        assert_eq!(response.nonce, "nonce-1");
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.resources[0].name, "listener-1");
        assert_eq!(response.resources[0].ttl, Some(Duration::from_secs(30)));
        assert_eq!(response.removed_resources, vec!["listener-2".to_string()]);
    }

    #[test]
    fn nack_roundtrip() {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        let codec = ProstCodec;

        let request = DeltaDiscoveryRequest {
            type_url: "type.googleapis.com/test.Resource".to_string(),
            resource_names_subscribe: vec!["res-1".to_string(), "res-2".to_string()],
            response_nonce: Some("nonce-abc".to_string()),
            error_detail: Some(ErrorDetail {
                code: 3, // INVALID_ARGUMENT
                message: "validation failed".to_string(),
            }),
            ..Default::default()
        };

        let request_bytes = codec.encode_request(&request).unwrap();

        let proto_request = discovery::DeltaDiscoveryRequest::decode(request_bytes).unwrap();
        assert_eq!(proto_request.response_nonce, "nonce-abc");
        let error = proto_request.error_detail.unwrap();
        assert_eq!(error.code, 3);
        assert_eq!(error.message, "validation failed");
    }
}
