use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ExportedObjectReference;

/// EndpointSliceExport is the hub-side snapshot of the ready endpoints of one exported
/// EndpointSlice. It is named by the unique name assigned to the source EndpointSlice.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "EndpointSliceExport",
    plural = "endpointsliceexports",
    namespaced,
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSliceExportSpec {
    /// Only IPv4 is exported
    pub address_type: String,

    #[serde(default)]
    pub endpoints: Vec<ExportedEndpoint>,

    #[serde(default)]
    pub ports: Vec<ExportedEndpointPort>,

    pub endpoint_slice_reference: ExportedObjectReference,

    pub owner_service_reference: OwnerServiceReference,
}

/// EndpointSliceImport is an EndpointSliceExport distributed into the hub namespace of a
/// member cluster that has claimed the owning Service.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "EndpointSliceImport",
    plural = "endpointsliceimports",
    namespaced,
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSliceImportSpec {
    pub address_type: String,

    #[serde(default)]
    pub endpoints: Vec<ExportedEndpoint>,

    #[serde(default)]
    pub ports: Vec<ExportedEndpointPort>,

    pub endpoint_slice_reference: ExportedObjectReference,

    pub owner_service_reference: OwnerServiceReference,
}

impl From<&EndpointSliceExportSpec> for EndpointSliceImportSpec {
    fn from(spec: &EndpointSliceExportSpec) -> Self {
        Self {
            address_type: spec.address_type.clone(),
            endpoints: spec.endpoints.clone(),
            ports: spec.ports.clone(),
            endpoint_slice_reference: spec.endpoint_slice_reference.clone(),
            owner_service_reference: spec.owner_service_reference.clone(),
        }
    }
}

/// A ready endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExportedEndpoint {
    pub addresses: Vec<String>,
}

/// A port of an exported EndpointSlice
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEndpointPort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
}

/// The Service owning an exported EndpointSlice, in the EndpointSlice's namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OwnerServiceReference {
    pub namespace: String,
    pub name: String,
    pub namespaced_name: String,
}

impl OwnerServiceReference {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            namespaced_name: format!("{namespace}/{name}"),
        }
    }
}
