//! EndpointSlice distributor: copies each EndpointSliceExport into the hub namespace of the
//! member cluster that has claimed its Service

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_net_api::{EndpointSliceExport, EndpointSliceImport, EndpointSliceImportSpec, ServiceImport, ServiceInUseBy};
use fleet_net_core::objectmeta::{
    add_finalizer, annotation, has_finalizer, is_deleting, remove_finalizer,
    ENDPOINT_SLICE_EXPORT_CLEANUP_FINALIZER, SERVICE_IN_USE_BY_ANNOTATION,
};
use fleet_net_core::store::NAME_INDEX;
use fleet_net_core::{
    ignore_not_found, ListOptions, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result,
};
use tracing::{debug, error, info};

use crate::context::HubContext;

/// Requeue delay while the owning ServiceImport is missing or unresolved
pub const DISTRIBUTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct EndpointSliceExportReconciler<S> {
    ctx: Arc<HubContext<S>>,
}

impl<S: ObjectStore> EndpointSliceExportReconciler<S> {
    pub fn new(ctx: Arc<HubContext<S>>) -> Self {
        Self { ctx }
    }

    /// Distributed copies of `export`, which share its name
    async fn distributed(&self, export: &EndpointSliceExport) -> Result<Vec<EndpointSliceImport>> {
        let name = export.metadata.name.as_deref().unwrap_or_default();
        self.ctx
            .hub
            .list::<EndpointSliceImport>(&ListOptions::all().with_field(NAME_INDEX, name))
            .await
    }

    async fn withdraw(&self, import: &EndpointSliceImport) -> Result<()> {
        let key = ObjectKey::of(import);
        ignore_not_found(
            self.ctx
                .hub
                .delete::<EndpointSliceImport>(&key.namespace, &key.name)
                .await,
        )?;
        debug!(endpoint_slice_import = %key, "Withdrew endpoint slice");
        Ok(())
    }

    /// Withdraws every copy of `export`, then lets `export` go.
    async fn withdraw_all(&self, mut export: EndpointSliceExport) -> Result<()> {
        for import in self.distributed(&export).await? {
            self.withdraw(&import).await?;
        }
        if remove_finalizer(&mut export, ENDPOINT_SLICE_EXPORT_CLEANUP_FINALIZER) {
            self.ctx.hub.update(&export).await?;
        }
        Ok(())
    }

    async fn create_or_update(&self, export: &EndpointSliceExport, namespace: &str) -> Result<()> {
        let name = export.metadata.name.clone().unwrap_or_default();
        let spec = EndpointSliceImportSpec::from(&export.spec);
        match self
            .ctx
            .hub
            .try_get::<EndpointSliceImport>(namespace, &name)
            .await?
        {
            Some(mut import) => {
                if import.spec == spec {
                    return Ok(());
                }
                import.spec = spec;
                self.ctx.hub.update(&import).await?;
                debug!(endpoint_slice_import = %ObjectKey::of(&import), "Updated distributed endpoint slice");
            }
            None => {
                let mut import = EndpointSliceImport::new(&name, spec);
                import.metadata.namespace = Some(namespace.to_string());
                self.ctx.hub.create(&import).await?;
                info!(endpoint_slice_import = %ObjectKey::of(&import), "Distributed endpoint slice");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for EndpointSliceExportReconciler<S> {
    fn name(&self) -> &'static str {
        "endpointsliceexport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let hub = &self.ctx.hub;
        let Some(mut export) = hub
            .try_get::<EndpointSliceExport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&export) {
            if has_finalizer(&export, ENDPOINT_SLICE_EXPORT_CLEANUP_FINALIZER) {
                info!(endpoint_slice_export = %key, "Endpoint slice export deleted; withdrawing distributed copies");
                self.withdraw_all(export).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if add_finalizer(&mut export, ENDPOINT_SLICE_EXPORT_CLEANUP_FINALIZER) {
            export = hub.update(&export).await?;
        }

        let owner = &export.spec.owner_service_reference;
        let import = hub
            .try_get::<ServiceImport>(&owner.namespace, &owner.name)
            .await?;
        let Some(import) = import.filter(ServiceImport::is_resolved) else {
            debug!(endpoint_slice_export = %key, service_import = %owner.namespaced_name, "Service import is missing or not resolved yet");
            return Ok(ReconcileOutcome::RequeueAfter(DISTRIBUTION_RETRY_INTERVAL));
        };

        let Some(data) = annotation(&import, SERVICE_IN_USE_BY_ANNOTATION) else {
            debug!(endpoint_slice_export = %key, service_import = %owner.namespaced_name, "Service is not imported by any member cluster");
            self.withdraw_all(export).await?;
            return Ok(ReconcileOutcome::Done);
        };
        let in_use_by = match ServiceInUseBy::from_annotation(data) {
            Ok(in_use_by) => in_use_by,
            Err(e) => {
                // rewritten annotations trigger a new reconcile
                error!(
                    endpoint_slice_export = %key,
                    service_import = %owner.namespaced_name,
                    error = %e,
                    data = %data,
                    "Malformed service-in-use-by annotation"
                );
                return Ok(ReconcileOutcome::Done);
            }
        };

        for import in self.distributed(&export).await? {
            let namespace = import.metadata.namespace.as_deref().unwrap_or_default();
            if !in_use_by.member_clusters.contains_key(namespace) && !is_deleting(&import) {
                self.withdraw(&import).await?;
            }
        }
        for namespace in in_use_by.member_clusters.keys() {
            self.create_or_update(&export, namespace).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}
