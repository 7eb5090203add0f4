//! Fixtures for reconciler tests

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_net_api::ServiceExport;
use fleet_net_core::condition::{conflict_condition, valid_condition};
use fleet_net_core::{FleetMetrics, MemberAgentConfig, MemoryStore};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::context::MemberContext;

pub const MEMBER_CLUSTER_ID: &str = "bravelion";
pub const HUB_NAMESPACE: &str = "bravelion";
pub const FLEET_SYSTEM_NAMESPACE: &str = "fleet-system";

pub fn context() -> Arc<MemberContext<MemoryStore>> {
    let config = MemberAgentConfig {
        member_cluster_id: MEMBER_CLUSTER_ID.to_string(),
        hub_namespace: HUB_NAMESPACE.to_string(),
        fleet_system_namespace: FLEET_SYSTEM_NAMESPACE.to_string(),
        ..Default::default()
    };
    Arc::new(MemberContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryStore::new()),
        &config,
        FleetMetrics::new().expect("Failed to create metrics"),
    ))
}

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// A ClusterIP Service with `(name, protocol, port)` ports
pub fn service(namespace: &str, name: &str, ports: &[(&str, &str, i32)]) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, protocol, port)| ServicePort {
                        name: Some(name.to_string()),
                        protocol: Some(protocol.to_string()),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        status: None,
    }
}

/// An IPv4 EndpointSlice of Service `service` with `(address, ready)` endpoints and one TCP port
pub fn endpoint_slice(
    namespace: &str,
    name: &str,
    service: &str,
    endpoints: &[(&str, Option<bool>)],
) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            labels: labels(&[("kubernetes.io/service-name", service)]),
            ..meta(namespace, name)
        },
        address_type: "IPv4".to_string(),
        endpoints: endpoints
            .iter()
            .map(|(address, ready)| Endpoint {
                addresses: vec![address.to_string()],
                conditions: Some(EndpointConditions {
                    ready: *ready,
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ports: Some(vec![EndpointPort {
            name: Some("http".to_string()),
            port: Some(80),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
    }
}

/// A ServiceExport already marked valid and free of conflicts
pub fn exported_service_export(namespace: &str, name: &str) -> ServiceExport {
    let mut export = ServiceExport::new(namespace, name);
    let conditions = export.conditions_mut();
    conditions.push(valid_condition(1, namespace, name));
    conditions.push(conflict_condition(false, 1, namespace, name));
    export
}
