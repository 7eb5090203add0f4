use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::v1alpha1::Condition;

/// Agent type reported by the part of the member agent that imports Services.
pub const MULTI_CLUSTER_SERVICE_AGENT: &str = "MultiClusterServiceAgent";
/// Agent type reported by the part of the member agent that exports Services.
pub const SERVICE_EXPORT_IMPORT_AGENT: &str = "ServiceExportImportAgent";
/// Condition type reporting whether an agent has joined the fleet.
pub const AGENT_JOINED: &str = "Joined";

/// Desired membership of a member cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ClusterState {
    #[default]
    Join,
    Leave,
}

/// InternalMemberCluster lives in the member's reserved hub namespace. The hub sets its state;
/// the member agents report heartbeats and join/leave progress in its status.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.kubernetes-fleet.io",
    version = "v1beta1",
    kind = "InternalMemberCluster",
    plural = "internalmemberclusters",
    namespaced,
    derive = "Default",
    status = "InternalMemberClusterStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct InternalMemberClusterSpec {
    pub state: ClusterState,

    /// How often agents report a heartbeat while joined
    #[serde(default)]
    pub heartbeat_period_seconds: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InternalMemberClusterStatus {
    #[serde(default)]
    pub agent_status: Vec<AgentStatus>,
}

/// Status reported by one agent of the member cluster
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    #[serde(rename = "type")]
    pub agent_type: String,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_received_heartbeat: Option<DateTime<Utc>>,
}

impl InternalMemberCluster {
    /// Status of `agent_type`, created empty if the agent has not reported yet.
    pub fn agent_status_mut(&mut self, agent_type: &str) -> &mut AgentStatus {
        let statuses = &mut self.status.get_or_insert_with(Default::default).agent_status;
        match statuses.iter().position(|s| s.agent_type == agent_type) {
            Some(i) => &mut statuses[i],
            None => {
                statuses.push(AgentStatus {
                    agent_type: agent_type.to_string(),
                    ..Default::default()
                });
                let last = statuses.len() - 1;
                &mut statuses[last]
            }
        }
    }

    pub fn agent_status(&self, agent_type: &str) -> Option<&AgentStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.agent_status.iter().find(|a| a.agent_type == agent_type))
    }
}
