//! Fleet membership types consumed by the networking controllers

pub mod internal_member_cluster;
pub mod member_cluster;

pub use internal_member_cluster::{
    AgentStatus, ClusterState, InternalMemberCluster, InternalMemberClusterSpec,
    InternalMemberClusterStatus, AGENT_JOINED, MULTI_CLUSTER_SERVICE_AGENT,
    SERVICE_EXPORT_IMPORT_AGENT,
};
pub use member_cluster::{MemberCluster, MemberClusterSpec};
