use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{ExportedObjectReference, ServiceImportStatus};

/// InternalServiceImport is a member cluster's request, mirrored into its hub namespace, to
/// import a Service from the fleet.
///
/// `service_import_reference` is written once when the mirror is created and identifies the
/// claimant (cluster ID plus the namespace and name of the member's ServiceImport).
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "networking.fleet.azure.com",
    version = "v1alpha1",
    kind = "InternalServiceImport",
    plural = "internalserviceimports",
    namespaced,
    derive = "Default",
    status = "ServiceImportStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct InternalServiceImportSpec {
    pub service_import_reference: ExportedObjectReference,
}

impl InternalServiceImport {
    pub fn status_or_default(&self) -> ServiceImportStatus {
        self.status.clone().unwrap_or_default()
    }
}
