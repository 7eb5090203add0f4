//! Export conflict resolver: admits each exported Service into the fleet-wide ServiceImport when its
//! ports agree with the resolved ones, and marks it conflicting otherwise

use std::sync::Arc;

use async_trait::async_trait;
use fleet_net_api::v1alpha1::SERVICE_EXPORT_CONFLICT;
use fleet_net_api::{ClusterStatus, InternalServiceExport, ServiceImport, ServiceImportStatus};
use fleet_net_core::condition::{conflict_condition, equal_condition, find_condition, set_condition};
use fleet_net_core::objectmeta::{
    add_finalizer, has_finalizer, is_deleting, remove_finalizer, INTERNAL_SERVICE_EXPORT_FINALIZER,
};
use fleet_net_core::{ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use tracing::{debug, info};

use crate::context::HubContext;

/// Drops `cluster` from the import status; an import left without clusters loses its spec too.
pub fn remove_cluster(status: &mut ServiceImportStatus, cluster: &str) {
    status.clusters.retain(|c| c.cluster != cluster);
    if status.clusters.is_empty() {
        *status = ServiceImportStatus::default();
    }
}

pub fn add_cluster(status: &mut ServiceImportStatus, cluster: &str) {
    if !status.clusters.iter().any(|c| c.cluster == cluster) {
        status.clusters.push(ClusterStatus {
            cluster: cluster.to_string(),
        });
    }
}

/// Writes the Conflict condition onto `ise` unless it already holds.
pub async fn mark_conflict<S: ObjectStore>(hub: &S, mut ise: InternalServiceExport, conflict: bool) -> Result<()> {
    let reference = &ise.spec.service_reference;
    let desired = conflict_condition(conflict, reference.generation, &reference.namespace, &reference.name);
    if equal_condition(find_condition(ise.conditions(), SERVICE_EXPORT_CONFLICT), Some(&desired)) {
        return Ok(());
    }
    set_condition(ise.conditions_mut(), desired);
    hub.update_status(&ise).await?;
    Ok(())
}

/// Writes `status` onto `import` if it differs from what is stored.
async fn update_import_status<S: ObjectStore>(hub: &S, mut import: ServiceImport, status: ServiceImportStatus) -> Result<()> {
    if import.status_or_default() == status {
        return Ok(());
    }
    import.status = Some(status);
    hub.update_status(&import).await?;
    Ok(())
}

pub struct InternalServiceExportReconciler<S> {
    ctx: Arc<HubContext<S>>,
}

impl<S: ObjectStore> InternalServiceExportReconciler<S> {
    pub fn new(ctx: Arc<HubContext<S>>) -> Self {
        Self { ctx }
    }

    async fn handle_delete(&self, mut ise: InternalServiceExport) -> Result<()> {
        let hub = &*self.ctx.hub;
        let reference = &ise.spec.service_reference;
        if let Some(import) = hub
            .try_get::<ServiceImport>(&reference.namespace, &reference.name)
            .await?
        {
            let mut status = import.status_or_default();
            remove_cluster(&mut status, &reference.cluster_id);
            update_import_status(hub, import, status).await?;
            info!(
                internal_service_export = %ObjectKey::of(&ise),
                cluster = %reference.cluster_id,
                "Removed exported service from service import"
            );
        }
        remove_finalizer(&mut ise, INTERNAL_SERVICE_EXPORT_FINALIZER);
        hub.update(&ise).await?;
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InternalServiceExportReconciler<S> {
    fn name(&self) -> &'static str {
        "internalserviceexport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let hub = &*self.ctx.hub;
        let Some(mut ise) = hub
            .try_get::<InternalServiceExport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&ise) {
            if has_finalizer(&ise, INTERNAL_SERVICE_EXPORT_FINALIZER) {
                self.handle_delete(ise).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if add_finalizer(&mut ise, INTERNAL_SERVICE_EXPORT_FINALIZER) {
            ise = hub.update(&ise).await?;
        }

        let reference = ise.spec.service_reference.clone();
        let import = match hub
            .try_get::<ServiceImport>(&reference.namespace, &reference.name)
            .await?
        {
            Some(import) => import,
            None => {
                info!(service_import = %reference.namespaced_name, "Creating service import");
                hub.create(&ServiceImport::new(&reference.namespace, &reference.name))
                    .await?
            }
        };

        let mut status = import.status_or_default();
        if status.ports.is_empty() {
            debug!(internal_service_export = %key, service_import = %reference.namespaced_name, "Service import spec is not resolved yet");
            return Ok(ReconcileOutcome::RequeueAfter(self.ctx.service_import_spec_wait));
        }

        if status.ports != ise.spec.ports {
            remove_cluster(&mut status, &reference.cluster_id);
            let resolved = !status.ports.is_empty();
            update_import_status(hub, import, status).await?;
            if !resolved {
                return Ok(ReconcileOutcome::RequeueAfter(self.ctx.service_import_spec_wait));
            }
            info!(internal_service_export = %key, cluster = %reference.cluster_id, "Exported service conflicts with the service import spec");
            mark_conflict(hub, ise, true).await?;
            return Ok(ReconcileOutcome::Done);
        }

        add_cluster(&mut status, &reference.cluster_id);
        update_import_status(hub, import, status).await?;
        mark_conflict(hub, ise, false).await?;
        Ok(ReconcileOutcome::Done)
    }
}
