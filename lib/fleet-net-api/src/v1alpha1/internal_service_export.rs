use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{Condition, ExportedObjectReference, ServicePort};

/// InternalServiceExport is the hub-side mirror of a Service exported by a member cluster.
/// It lives in the member's reserved hub namespace and is named `{namespace}-{name}`.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "InternalServiceExport",
    plural = "internalserviceexports",
    namespaced,
    derive = "Default",
    status = "InternalServiceExportStatus",
    printcolumn = r#"{"name":"Service","type":"string","jsonPath":".spec.serviceReference.namespacedName"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct InternalServiceExportSpec {
    /// Ports exposed by the exported Service
    #[serde(default)]
    pub ports: Vec<ServicePort>,

    /// Reference to the exported Service in its origin cluster
    pub service_reference: ExportedObjectReference,

    /// Type of the exported Service
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
}

/// Status of an InternalServiceExport
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InternalServiceExportStatus {
    /// Conflict condition computed by the hub
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl InternalServiceExport {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}
