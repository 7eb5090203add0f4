//! ServiceImport spec resolver: picks the ports of a fleet-wide imported Service from its exports

use std::sync::Arc;

use async_trait::async_trait;
use fleet_net_api::v1alpha1::CLUSTER_SET_IP;
use fleet_net_api::{ClusterStatus, InternalServiceExport, ServiceImport, ServiceImportStatus};
use fleet_net_core::objectmeta::{has_finalizer, is_deleting, INTERNAL_SERVICE_EXPORT_FINALIZER};
use fleet_net_core::store::SERVICE_REFERENCE_INDEX;
use fleet_net_core::{
    ignore_not_found, ListOptions, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result,
};
use tracing::{debug, info};

use crate::context::HubContext;
use crate::internal_service_export_controller::mark_conflict;

pub struct ServiceImportReconciler<S> {
    ctx: Arc<HubContext<S>>,
}

impl<S: ObjectStore> ServiceImportReconciler<S> {
    pub fn new(ctx: Arc<HubContext<S>>) -> Self {
        Self { ctx }
    }

    async fn delete_import(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        ignore_not_found(self.ctx.hub.delete::<ServiceImport>(&key.namespace, &key.name).await)?;
        info!(service_import = %key, "No service is exported under this name; deleted service import");
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for ServiceImportReconciler<S> {
    fn name(&self) -> &'static str {
        "serviceimport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let hub = &*self.ctx.hub;
        let Some(mut import) = hub.try_get::<ServiceImport>(&key.namespace, &key.name).await? else {
            return Ok(ReconcileOutcome::Done);
        };
        if import.is_resolved() {
            return Ok(ReconcileOutcome::Done);
        }

        let options = ListOptions::all().with_field(SERVICE_REFERENCE_INDEX, &key.to_string());
        let exports: Vec<InternalServiceExport> = hub
            .list::<InternalServiceExport>(&options)
            .await?
            .into_iter()
            .filter(|ise| !is_deleting(ise) && has_finalizer(ise, INTERNAL_SERVICE_EXPORT_FINALIZER))
            .collect();
        let Some(resolved_ports) = exports.first().map(|ise| ise.spec.ports.clone()) else {
            return self.delete_import(key).await;
        };
        let (matching, conflicting): (Vec<_>, Vec<_>) = exports
            .into_iter()
            .partition(|ise| ise.spec.ports == resolved_ports);

        let mut clusters = Vec::with_capacity(matching.len());
        for ise in matching {
            let cluster = ise.spec.service_reference.cluster_id.clone();
            match mark_conflict(hub, ise, false).await {
                Ok(()) => clusters.push(ClusterStatus { cluster }),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        if clusters.is_empty() {
            return Ok(ReconcileOutcome::RequeueAfter(self.ctx.service_import_spec_wait));
        }
        for ise in conflicting {
            debug!(service_import = %key, cluster = %ise.spec.service_reference.cluster_id, "Exported service conflicts with the resolved spec");
            ignore_not_found(mark_conflict(hub, ise, true).await)?;
        }

        import.status = Some(ServiceImportStatus {
            import_type: Some(CLUSTER_SET_IP.to_string()),
            ports: resolved_ports,
            clusters,
        });
        hub.update_status(&import).await?;
        info!(service_import = %key, "Resolved service import spec");
        Ok(ReconcileOutcome::Done)
    }
}
