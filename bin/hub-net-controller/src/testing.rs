//! Fixtures for hub reconciler tests

use std::sync::Arc;

use chrono::Utc;
use fleet_net_api::{
    ExportedObjectReference, InternalServiceExport, InternalServiceExportSpec, InternalServiceImport,
    InternalServiceImportSpec, ServicePort,
};
use fleet_net_core::objectmeta::hub_namespace_for;
use fleet_net_core::{FleetMetrics, HubAgentConfig, MemoryStore};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::context::HubContext;

pub fn context() -> Arc<HubContext<MemoryStore>> {
    Arc::new(HubContext::new(
        Arc::new(MemoryStore::new()),
        &HubAgentConfig::default(),
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

/// Reference to object `namespace/name` exported or imported by `cluster`
pub fn reference(cluster: &str, kind: &str, namespace: &str, name: &str) -> ExportedObjectReference {
    ExportedObjectReference {
        cluster_id: cluster.to_string(),
        api_version: "v1".to_string(),
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        resource_version: "1".to_string(),
        generation: 1,
        uid: format!("{cluster}-{namespace}-{name}"),
        namespaced_name: format!("{namespace}/{name}"),
        exported_since: Some(Utc::now()),
    }
}

pub fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: name.to_string(),
        protocol: "TCP".to_string(),
        port,
        ..Default::default()
    }
}

/// Export of Service `namespace/name` from `cluster`, placed in the cluster's hub namespace
pub fn internal_service_export(cluster: &str, namespace: &str, name: &str, ports: Vec<ServicePort>) -> InternalServiceExport {
    InternalServiceExport {
        metadata: meta(&hub_namespace_for(cluster), &format!("{namespace}-{name}")),
        spec: InternalServiceExportSpec {
            ports,
            service_reference: reference(cluster, "Service", namespace, name),
            service_type: Some("ClusterIP".to_string()),
        },
        status: None,
    }
}

/// Import request of ServiceImport `namespace/name` from `cluster`
pub fn internal_service_import(cluster: &str, namespace: &str, name: &str) -> InternalServiceImport {
    InternalServiceImport {
        metadata: meta(&hub_namespace_for(cluster), &format!("{namespace}-{name}")),
        spec: InternalServiceImportSpec {
            service_import_reference: reference(cluster, "ServiceImport", namespace, name),
        },
        status: None,
    }
}
