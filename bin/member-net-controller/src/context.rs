//! Handles shared by the member reconcilers

use std::sync::Arc;

use fleet_net_core::{FleetMetrics, MemberAgentConfig, ObjectStore};

/// Member and hub stores plus this member's identity in the fleet.
pub struct MemberContext<S> {
    /// Store of this member cluster
    pub member: Arc<S>,
    /// Store of the hub cluster, used only within `hub_namespace`
    pub hub: Arc<S>,
    pub member_cluster_id: String,
    pub hub_namespace: String,
    pub fleet_system_namespace: String,
    pub metrics: FleetMetrics,
}

impl<S: ObjectStore> MemberContext<S> {
    pub fn new(member: Arc<S>, hub: Arc<S>, config: &MemberAgentConfig, metrics: FleetMetrics) -> Self {
        Self {
            member,
            hub,
            member_cluster_id: config.member_cluster_id.clone(),
            hub_namespace: config.hub_namespace.clone(),
            fleet_system_namespace: config.fleet_system_namespace.clone(),
            metrics,
        }
    }
}
