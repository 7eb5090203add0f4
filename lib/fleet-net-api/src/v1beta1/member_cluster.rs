use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// MemberCluster is a cluster-scoped object on the hub representing one member of the fleet.
/// Only its deletion timestamp matters to the networking controllers.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.kubernetes-fleet.io",
    version = "v1beta1",
    kind = "MemberCluster",
    plural = "memberclusters",
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct MemberClusterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_period_seconds: Option<i32>,
}
