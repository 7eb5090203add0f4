/// API version v1alpha1 for fleet networking CRDs

pub mod common;
pub mod endpoint_slice_export;
pub mod internal_service_export;
pub mod internal_service_import;
pub mod multi_cluster_service;
pub mod service_export;
pub mod service_import;

pub use common::{
    ClusterStatus, Condition, ConditionStatus, ExportedObjectReference, ServiceImportStatus,
    ServiceInUseBy, ServicePort, TargetPort,
};
pub use endpoint_slice_export::{
    EndpointSliceExport, EndpointSliceExportSpec, EndpointSliceImport, EndpointSliceImportSpec,
    ExportedEndpoint, ExportedEndpointPort, OwnerServiceReference,
};
pub use internal_service_export::{
    InternalServiceExport, InternalServiceExportSpec, InternalServiceExportStatus,
};
pub use internal_service_import::{InternalServiceImport, InternalServiceImportSpec};
pub use multi_cluster_service::{
    LoadBalancerIngress, LoadBalancerStatus, MultiClusterService, MultiClusterServiceSpec,
    MultiClusterServiceStatus, ServiceImportRef,
};
pub use service_export::{ServiceExport, ServiceExportStatus};
pub use service_import::ServiceImport;

/// API group for fleet networking resources
pub const API_GROUP: &str = "networking.fleet.azure.com";
/// API version for fleet networking resources
pub const API_VERSION: &str = "v1alpha1";

/// Condition type reporting whether a ServiceExport refers to an exportable Service.
pub const SERVICE_EXPORT_VALID: &str = "Valid";
/// Condition type reporting the fleet-wide conflict resolution result of a ServiceExport.
pub const SERVICE_EXPORT_CONFLICT: &str = "Conflict";
/// Condition type reporting whether a MultiClusterService found its ServiceImport.
pub const MULTI_CLUSTER_SERVICE_VALID: &str = "Valid";
/// Import type of a ServiceImport served through a cluster-set virtual IP.
pub const CLUSTER_SET_IP: &str = "ClusterSetIP";
