use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// MultiClusterService asks for a fleet Service to be imported into this member cluster.
/// Once the import has been granted, the object is labelled with the name of the derived
/// Service created in the fleet-system namespace.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "MultiClusterService",
    plural = "multiclusterservices",
    shortname = "mcs",
    namespaced,
    derive = "Default",
    status = "MultiClusterServiceStatus",
    printcolumn = r#"{"name":"Service-Import","type":"string","jsonPath":".spec.serviceImport.name"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceSpec {
    pub service_import: ServiceImportRef,
}

/// Name of a ServiceImport in the same namespace
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceImportRef {
    pub name: String,
}

/// Status of a MultiClusterService
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceStatus {
    /// Load balancer of the derived Service
    #[serde(default)]
    pub load_balancer: LoadBalancerStatus,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadBalancerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadBalancerIngress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl MultiClusterService {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}
