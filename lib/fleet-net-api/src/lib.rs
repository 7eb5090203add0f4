//! Fleet networking API types and CRDs
//!
//! This library defines the resources exchanged between member clusters and the hub:
//! - ServiceExport / ServiceImport: user-facing intent objects in member clusters
//! - InternalServiceExport / InternalServiceImport: hub-side mirrors, one namespace per member
//! - EndpointSliceExport / EndpointSliceImport: hub-side snapshots of ready endpoints
//! - MultiClusterService: import request carrying the derived Service label
//! - MemberCluster / InternalMemberCluster: fleet membership, watched for departure

pub mod v1alpha1;
pub mod v1beta1;

pub use v1alpha1::{
    ClusterStatus, Condition, ConditionStatus, EndpointSliceExport, EndpointSliceExportSpec,
    EndpointSliceImport, EndpointSliceImportSpec, ExportedEndpoint, ExportedEndpointPort,
    ExportedObjectReference, InternalServiceExport, InternalServiceExportSpec,
    InternalServiceExportStatus, InternalServiceImport, InternalServiceImportSpec,
    LoadBalancerIngress, LoadBalancerStatus, MultiClusterService, MultiClusterServiceSpec,
    MultiClusterServiceStatus, OwnerServiceReference, ServiceExport,
    ServiceExportStatus, ServiceImport, ServiceImportRef, ServiceImportStatus, ServiceInUseBy,
    ServicePort, TargetPort,
};
pub use v1beta1::{
    AgentStatus, ClusterState, InternalMemberCluster, InternalMemberClusterSpec, MemberCluster,
    MemberClusterSpec,
};
