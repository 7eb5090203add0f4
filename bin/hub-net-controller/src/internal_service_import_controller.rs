//! Import claim resolver: grants a ServiceImport to at most one requesting member cluster at a time
//!
//! The claim lives in the `ServiceInUseBy` annotation of the hub ServiceImport. It is written with a
//! resource-version-conditional update, so of two racing requests only one lands; the loser observes
//! the claim on its next reconcile and backs off. Dropping a claim when its request goes away makes the
//! ServiceImport claimable again, which is how a waiting request takes over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_net_api::{InternalServiceImport, ServiceImport, ServiceImportStatus, ServiceInUseBy};
use fleet_net_core::objectmeta::{
    add_finalizer, annotation, has_finalizer, is_deleting, remove_annotation, remove_finalizer,
    set_annotation, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER, SERVICE_IMPORT_CLEANUP_FINALIZER,
    SERVICE_IN_USE_BY_ANNOTATION,
};
use fleet_net_core::metrics::{CLAIM_CONFLICT, CLAIM_GRANTED, CLAIM_RELEASED};
use fleet_net_core::{ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use tracing::{debug, info, warn};

use crate::context::HubContext;

/// Requeue delay while the requested ServiceImport has no resolved spec
pub const CLAIM_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Current claims on `import`. A malformed annotation counts as no claim.
pub fn service_in_use_by(import: &ServiceImport) -> ServiceInUseBy {
    let Some(data) = annotation(import, SERVICE_IN_USE_BY_ANNOTATION) else {
        return ServiceInUseBy::default();
    };
    ServiceInUseBy::from_annotation(data).unwrap_or_else(|e| {
        warn!(service_import = %ObjectKey::of(import), error = %e, data = %data, "Malformed service-in-use-by annotation");
        ServiceInUseBy::default()
    })
}

pub struct InternalServiceImportReconciler<S> {
    ctx: Arc<HubContext<S>>,
}

impl<S: ObjectStore> InternalServiceImportReconciler<S> {
    pub fn new(ctx: Arc<HubContext<S>>) -> Self {
        Self { ctx }
    }

    /// Drops any claim this request may hold and empties its status.
    async fn clear(&self, mut isi: InternalServiceImport) -> Result<()> {
        if remove_finalizer(&mut isi, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER) {
            isi = self.ctx.hub.update(&isi).await?;
        }
        if is_deleting(&isi) || isi.status_or_default().is_empty() {
            return Ok(());
        }
        isi.status = Some(ServiceImportStatus::default());
        self.ctx.hub.update_status(&isi).await?;
        Ok(())
    }

    /// Releases the claim held by `isi` on `import`, then lets `isi` go.
    async fn withdraw(&self, mut import: ServiceImport, mut isi: InternalServiceImport) -> Result<()> {
        let cluster_namespace = isi.metadata.namespace.clone().unwrap_or_default();
        let mut in_use_by = service_in_use_by(&import);
        if in_use_by.member_clusters.remove(&cluster_namespace).is_some() {
            if in_use_by.member_clusters.is_empty() {
                remove_annotation(&mut import, SERVICE_IN_USE_BY_ANNOTATION);
                remove_finalizer(&mut import, SERVICE_IMPORT_CLEANUP_FINALIZER);
            } else {
                set_annotation(&mut import, SERVICE_IN_USE_BY_ANNOTATION, in_use_by.to_annotation()?);
            }
            self.ctx.hub.update(&import).await?;
            info!(service_import = %ObjectKey::of(&import), cluster_namespace = %cluster_namespace, "Released service import claim");
            self.ctx.metrics.observe_claim(CLAIM_RELEASED);
        }

        remove_finalizer(&mut isi, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER);
        self.ctx.hub.update(&isi).await?;
        Ok(())
    }

    /// Copies the resolved ServiceImport status onto the request.
    async fn fulfill(&self, import: &ServiceImport, mut isi: InternalServiceImport) -> Result<()> {
        let status = import.status_or_default();
        if isi.status_or_default() == status {
            return Ok(());
        }
        isi.status = Some(status);
        self.ctx.hub.update_status(&isi).await?;
        debug!(internal_service_import = %ObjectKey::of(&isi), "Fulfilled service import request");
        Ok(())
    }

    /// Writes the claim of `isi` into `import`. The write is conditional on the resource version
    /// `import` was read at, so a concurrent claim makes it fail with a conflict.
    async fn claim(&self, mut import: ServiceImport, mut isi: InternalServiceImport) -> Result<()> {
        let hub = &self.ctx.hub;
        if add_finalizer(&mut isi, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER) {
            isi = hub.update(&isi).await?;
        }

        let reference = &isi.spec.service_import_reference;
        let cluster_namespace = isi.metadata.namespace.clone().unwrap_or_default();
        let mut in_use_by = service_in_use_by(&import);
        in_use_by
            .member_clusters
            .insert(cluster_namespace, reference.cluster_id.clone());
        set_annotation(&mut import, SERVICE_IN_USE_BY_ANNOTATION, in_use_by.to_annotation()?);
        add_finalizer(&mut import, SERVICE_IMPORT_CLEANUP_FINALIZER);
        let import = match hub.update(&import).await {
            Ok(import) => import,
            Err(e) if e.is_conflict() => {
                debug!(internal_service_import = %ObjectKey::of(&isi), "Lost the race to claim service import");
                self.ctx.metrics.observe_claim(CLAIM_CONFLICT);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        info!(
            internal_service_import = %ObjectKey::of(&isi),
            service_import = %reference.namespaced_name,
            cluster = %reference.cluster_id,
            "Claimed service import"
        );
        self.ctx.metrics.observe_claim(CLAIM_GRANTED);

        self.fulfill(&import, isi).await
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InternalServiceImportReconciler<S> {
    fn name(&self) -> &'static str {
        "internalserviceimport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let hub = &self.ctx.hub;
        let Some(isi) = hub
            .try_get::<InternalServiceImport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let reference = isi.spec.service_import_reference.clone();
        let import = hub
            .try_get::<ServiceImport>(&reference.namespace, &reference.name)
            .await?;
        let Some(import) = import else {
            debug!(internal_service_import = %key, service_import = %reference.namespaced_name, "No such service import");
            self.clear(isi).await?;
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&isi) || is_deleting(&import) {
            if has_finalizer(&isi, INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER) {
                self.withdraw(import, isi).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if !import.is_resolved() {
            debug!(internal_service_import = %key, service_import = %reference.namespaced_name, "Service import is not resolved yet");
            return Ok(ReconcileOutcome::RequeueAfter(CLAIM_RETRY_INTERVAL));
        }

        let in_use_by = service_in_use_by(&import);
        if !in_use_by.member_clusters.is_empty() {
            if in_use_by.member_clusters.contains_key(&key.namespace) {
                self.fulfill(&import, isi).await?;
            } else {
                debug!(
                    internal_service_import = %key,
                    service_import = %reference.namespaced_name,
                    claimed_by = ?in_use_by.member_clusters,
                    "Service import is claimed by another member cluster"
                );
                self.clear(isi).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        self.claim(import, isi).await?;
        Ok(ReconcileOutcome::Done)
    }
}
