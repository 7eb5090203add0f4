//! InternalMemberCluster controller: reports the member agent's membership to the hub.
//!
//! While the cluster is joined the agent heartbeats on the InternalMemberCluster of its hub
//! namespace. When the hub asks the cluster to leave, every MultiClusterService and ServiceExport
//! of the member cluster is deleted, and the agent reports that it has left once their cleanup
//! has finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_net_api::v1beta1::{MULTI_CLUSTER_SERVICE_AGENT, SERVICE_EXPORT_IMPORT_AGENT};
use fleet_net_api::{ClusterState, InternalMemberCluster, MultiClusterService, ServiceExport};
use fleet_net_core::condition::{agent_joined_condition, set_condition};
use fleet_net_core::objectmeta::is_deleting;
use fleet_net_core::{
    ignore_not_found, ListOptions, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result,
    StoreObject,
};
use rand::Rng;
use tracing::{debug, info};

use crate::context::MemberContext;

/// Agent types this agent reports on the InternalMemberCluster
const AGENT_TYPES: [&str; 2] = [MULTI_CLUSTER_SERVICE_AGENT, SERVICE_EXPORT_IMPORT_AGENT];

const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Poll interval while waiting for member objects to be cleaned up on leave
pub const LEAVE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Retry delay after losing a status write to a concurrent writer
const CONFLICT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

fn heartbeat_period(imc: &InternalMemberCluster) -> Duration {
    match u64::try_from(imc.spec.heartbeat_period_seconds) {
        Ok(seconds) if seconds > 0 => Duration::from_secs(seconds),
        _ => DEFAULT_HEARTBEAT_PERIOD,
    }
}

/// `period` spread by up to 5% either way, so agents do not heartbeat in lockstep.
fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.95..=1.05);
    period.mul_f64(factor)
}

pub struct InternalMemberClusterReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> InternalMemberClusterReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    pub async fn reconcile_at(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(imc) = self
            .ctx
            .hub
            .try_get::<InternalMemberCluster>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        match imc.spec.state {
            ClusterState::Join => self.join(imc, now).await,
            ClusterState::Leave => self.leave(imc).await,
        }
    }

    async fn join(&self, mut imc: InternalMemberCluster, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let generation = imc.metadata.generation.unwrap_or_default();
        for agent_type in AGENT_TYPES {
            let status = imc.agent_status_mut(agent_type);
            set_condition(&mut status.conditions, agent_joined_condition(true, generation));
            status.last_received_heartbeat = Some(now);
        }
        if !self.write_status(&imc).await? {
            return Ok(ReconcileOutcome::RequeueAfter(CONFLICT_RETRY_INTERVAL));
        }
        debug!(internal_member_cluster = %ObjectKey::of(&imc), "Sent heartbeat");
        Ok(ReconcileOutcome::RequeueAfter(jittered(heartbeat_period(&imc))))
    }

    async fn leave(&self, mut imc: InternalMemberCluster) -> Result<ReconcileOutcome> {
        let remaining = self.delete_all::<MultiClusterService>().await? + self.delete_all::<ServiceExport>().await?;
        if remaining > 0 {
            debug!(remaining, "Waiting for member objects to be cleaned up before leaving");
            return Ok(ReconcileOutcome::RequeueAfter(LEAVE_POLL_INTERVAL));
        }

        let generation = imc.metadata.generation.unwrap_or_default();
        for agent_type in AGENT_TYPES {
            let status = imc.agent_status_mut(agent_type);
            set_condition(&mut status.conditions, agent_joined_condition(false, generation));
        }
        if !self.write_status(&imc).await? {
            return Ok(ReconcileOutcome::RequeueAfter(CONFLICT_RETRY_INTERVAL));
        }
        info!(internal_member_cluster = %ObjectKey::of(&imc), "Left the fleet");
        Ok(ReconcileOutcome::Done)
    }

    /// Deletes every `K` of the member cluster not already being deleted. Returns how many are
    /// still present.
    async fn delete_all<K: StoreObject>(&self) -> Result<usize> {
        let member = &self.ctx.member;
        let objects = member.list::<K>(&ListOptions::all()).await?;
        for obj in objects.iter().filter(|obj| !is_deleting(*obj)) {
            let key = ObjectKey::of(obj);
            ignore_not_found(member.delete::<K>(&key.namespace, &key.name).await)?;
            info!(kind = %K::kind(&()), object = %key, "Deleted on leave");
        }
        Ok(objects.len())
    }

    /// Writes the agent status. Returns false when another writer got there first.
    async fn write_status(&self, imc: &InternalMemberCluster) -> Result<bool> {
        match self.ctx.hub.update_status(imc).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_conflict() => {
                debug!(internal_member_cluster = %ObjectKey::of(imc), "Status changed concurrently, retrying");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InternalMemberClusterReconciler<S> {
    fn name(&self) -> &'static str {
        "internalmembercluster"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        self.reconcile_at(key, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, HUB_NAMESPACE, MEMBER_CLUSTER_ID};
    use fleet_net_api::v1beta1::AGENT_JOINED;
    use fleet_net_api::{ConditionStatus, InternalMemberClusterSpec, MultiClusterServiceSpec};
    use fleet_net_core::condition::find_condition;
    use fleet_net_core::objectmeta::{add_finalizer, SERVICE_EXPORT_CLEANUP_FINALIZER};

    fn key() -> ObjectKey {
        ObjectKey::new(HUB_NAMESPACE, MEMBER_CLUSTER_ID)
    }

    fn internal_member_cluster(state: ClusterState) -> InternalMemberCluster {
        let mut imc = InternalMemberCluster::new(
            MEMBER_CLUSTER_ID,
            InternalMemberClusterSpec {
                state,
                heartbeat_period_seconds: 60,
            },
        );
        imc.metadata.namespace = Some(HUB_NAMESPACE.to_string());
        imc
    }

    fn joined(imc: &InternalMemberCluster, agent_type: &str) -> Option<ConditionStatus> {
        imc.agent_status(agent_type)
            .and_then(|s| find_condition(&s.conditions, AGENT_JOINED))
            .map(|c| c.status)
    }

    #[tokio::test]
    async fn test_join_sends_heartbeat() {
        let ctx = context();
        ctx.hub.create(&internal_member_cluster(ClusterState::Join)).await.unwrap();
        let now = Utc::now();

        let outcome = InternalMemberClusterReconciler::new(ctx.clone())
            .reconcile_at(&key(), now)
            .await
            .unwrap();
        let ReconcileOutcome::RequeueAfter(delay) = outcome else {
            panic!("expected a heartbeat requeue, got {outcome:?}");
        };
        assert!(delay >= Duration::from_secs(57) && delay <= Duration::from_secs(63));

        let imc: InternalMemberCluster = ctx.hub.get(HUB_NAMESPACE, MEMBER_CLUSTER_ID).await.unwrap();
        for agent_type in AGENT_TYPES {
            assert_eq!(joined(&imc, agent_type), Some(ConditionStatus::True));
            assert_eq!(imc.agent_status(agent_type).unwrap().last_received_heartbeat, Some(now));
        }
    }

    #[tokio::test]
    async fn test_leave_waits_for_cleanup() {
        let ctx = context();
        ctx.hub.create(&internal_member_cluster(ClusterState::Leave)).await.unwrap();
        let mut mcs = MultiClusterService::new("app", MultiClusterServiceSpec::default());
        mcs.metadata.namespace = Some("work".to_string());
        ctx.member.create(&mcs).await.unwrap();
        let mut export = ServiceExport::new("work", "app");
        add_finalizer(&mut export, SERVICE_EXPORT_CLEANUP_FINALIZER);
        ctx.member.create(&export).await.unwrap();
        let reconciler = InternalMemberClusterReconciler::new(ctx.clone());

        assert_eq!(
            reconciler.reconcile_at(&key(), Utc::now()).await.unwrap(),
            ReconcileOutcome::RequeueAfter(LEAVE_POLL_INTERVAL)
        );
        assert_eq!(ctx.member.count::<MultiClusterService>(), 0);
        let export: ServiceExport = ctx.member.get("work", "app").await.unwrap();
        assert!(is_deleting(&export));
        let imc: InternalMemberCluster = ctx.hub.get(HUB_NAMESPACE, MEMBER_CLUSTER_ID).await.unwrap();
        assert_eq!(joined(&imc, SERVICE_EXPORT_IMPORT_AGENT), None);

        // the export controller finishes its cleanup
        let mut export = export;
        export.metadata.finalizers = None;
        ctx.member.update(&export).await.unwrap();

        assert_eq!(
            reconciler.reconcile_at(&key(), Utc::now()).await.unwrap(),
            ReconcileOutcome::Done
        );
        let imc: InternalMemberCluster = ctx.hub.get(HUB_NAMESPACE, MEMBER_CLUSTER_ID).await.unwrap();
        for agent_type in AGENT_TYPES {
            assert_eq!(joined(&imc, agent_type), Some(ConditionStatus::False));
        }
    }

    #[tokio::test]
    async fn test_missing_internal_member_cluster() {
        let ctx = context();
        let outcome = InternalMemberClusterReconciler::new(ctx)
            .reconcile_at(&key(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }
}
