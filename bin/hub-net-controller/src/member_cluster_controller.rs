//! Releases the hub-side leftovers of a member cluster that has been leaving the fleet for longer
//! than the force-delete grace period

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_net_api::{
    EndpointSliceExport, EndpointSliceImport, InternalServiceExport, InternalServiceImport,
    MemberCluster,
};
use fleet_net_core::objectmeta::hub_namespace_for;
use fleet_net_core::{ListOptions, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result, StoreObject};
use futures::future::try_join_all;
use kube::Resource;
use tracing::{debug, info};

use crate::context::HubContext;

/// Strips all finalizers from the objects of kind `K` in `namespace`. Returns how many were released.
async fn release_all<K: StoreObject, S: ObjectStore>(hub: &S, namespace: &str) -> Result<usize> {
    let held: Vec<K> = hub
        .list::<K>(&ListOptions::namespaced(namespace))
        .await?
        .into_iter()
        .filter(|obj| obj.meta().finalizers.as_ref().is_some_and(|f| !f.is_empty()))
        .collect();
    let released = held.len();
    try_join_all(held.into_iter().map(|mut obj| async move {
        obj.meta_mut().finalizers = None;
        hub.update(&obj).await
    }))
    .await?;
    if released > 0 {
        debug!(namespace, kind = %K::kind(&()), released, "Removed finalizers");
    }
    Ok(released)
}

pub struct MemberClusterReconciler<S> {
    ctx: Arc<HubContext<S>>,
}

impl<S: ObjectStore> MemberClusterReconciler<S> {
    pub fn new(ctx: Arc<HubContext<S>>) -> Self {
        Self { ctx }
    }

    /// Reconciles as of `now`.
    pub async fn reconcile_at(&self, key: &ObjectKey, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(cluster) = self.ctx.hub.try_get::<MemberCluster>("", &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        let Some(deleted_at) = cluster.metadata.deletion_timestamp.as_ref().map(|t| t.0) else {
            return Ok(ReconcileOutcome::Done);
        };

        let elapsed = (now - deleted_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed < self.ctx.force_delete_wait {
            let remaining = self.ctx.force_delete_wait - elapsed;
            debug!(member_cluster = %key, remaining_secs = remaining.as_secs(), "Member cluster is leaving");
            return Ok(ReconcileOutcome::RequeueAfter(remaining));
        }

        let hub = &*self.ctx.hub;
        let namespace = hub_namespace_for(&key.name);
        let released = release_all::<EndpointSliceImport, S>(hub, &namespace).await?
            + release_all::<EndpointSliceExport, S>(hub, &namespace).await?
            + release_all::<InternalServiceImport, S>(hub, &namespace).await?
            + release_all::<InternalServiceExport, S>(hub, &namespace).await?;
        info!(
            member_cluster = %key,
            namespace = %namespace,
            released,
            "Member cluster left without cleaning up; released its hub objects"
        );
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for MemberClusterReconciler<S> {
    fn name(&self) -> &'static str {
        "membercluster"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        self.reconcile_at(key, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, internal_service_export, internal_service_import, tcp_port};
    use fleet_net_core::objectmeta::{
        INTERNAL_SERVICE_EXPORT_FINALIZER, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER,
    };
    use fleet_net_core::MemoryStore;

    async fn leaving_member(ctx: &HubContext<MemoryStore>) -> DateTime<Utc> {
        let mut cluster = MemberCluster::new("bravelion", Default::default());
        cluster.metadata.finalizers = Some(vec!["kubernetes-fleet.io/member-cluster-finalizer".to_string()]);
        ctx.hub.create(&cluster).await.unwrap();
        ctx.hub.delete::<MemberCluster>("", "bravelion").await.unwrap();
        let cluster: MemberCluster = ctx.hub.get("", "bravelion").await.unwrap();
        cluster.metadata.deletion_timestamp.unwrap().0
    }

    async fn stuck_objects(ctx: &HubContext<MemoryStore>) {
        let mut ise = internal_service_export("bravelion", "work", "app", vec![tcp_port("http", 80)]);
        ise.metadata.finalizers = Some(vec![INTERNAL_SERVICE_EXPORT_FINALIZER.to_string()]);
        ctx.hub.create(&ise).await.unwrap();
        ctx.hub
            .delete::<InternalServiceExport>(&hub_namespace_for("bravelion"), "work-app")
            .await
            .unwrap();

        let mut isi = internal_service_import("bravelion", "work", "app");
        isi.metadata.finalizers = Some(vec![INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER.to_string()]);
        ctx.hub.create(&isi).await.unwrap();
        ctx.hub
            .delete::<InternalServiceImport>(&hub_namespace_for("bravelion"), "work-app")
            .await
            .unwrap();

        // another member is untouched
        let mut other = internal_service_import("smartfish", "work", "app");
        other.metadata.finalizers = Some(vec![INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER.to_string()]);
        ctx.hub.create(&other).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_grace_period() {
        let ctx = context();
        let deleted_at = leaving_member(&ctx).await;
        stuck_objects(&ctx).await;

        let reconciler = MemberClusterReconciler::new(ctx.clone());
        let key = ObjectKey::cluster_scoped("bravelion");
        let outcome = reconciler
            .reconcile_at(&key, deleted_at + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::RequeueAfter(ctx.force_delete_wait - Duration::from_secs(300))
        );
        assert_eq!(ctx.hub.count::<InternalServiceExport>(), 1);
        assert_eq!(ctx.hub.count::<InternalServiceImport>(), 2);
    }

    #[tokio::test]
    async fn test_release_after_grace_period() {
        let ctx = context();
        let deleted_at = leaving_member(&ctx).await;
        stuck_objects(&ctx).await;

        let reconciler = MemberClusterReconciler::new(ctx.clone());
        let key = ObjectKey::cluster_scoped("bravelion");
        let now = deleted_at + chrono::Duration::from_std(ctx.force_delete_wait).unwrap();
        assert_eq!(reconciler.reconcile_at(&key, now).await.unwrap(), ReconcileOutcome::Done);

        assert_eq!(ctx.hub.count::<InternalServiceExport>(), 0);
        let remaining: Vec<InternalServiceImport> = ctx.hub.list(&ListOptions::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].metadata.namespace.as_deref(), Some("fleet-member-smartfish"));
    }

    #[tokio::test]
    async fn test_member_not_leaving_is_ignored() {
        let ctx = context();
        ctx.hub
            .create(&MemberCluster::new("bravelion", Default::default()))
            .await
            .unwrap();
        let outcome = MemberClusterReconciler::new(ctx.clone())
            .reconcile(&ObjectKey::cluster_scoped("bravelion"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
    }
}
