//! ServiceImport controller: publishes this member's import requests to the hub

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_net_api::{
    ExportedObjectReference, InternalServiceImport, InternalServiceImportSpec, ServiceImport,
};
use fleet_net_core::objectmeta::{
    add_finalizer, has_finalizer, is_deleting, remove_finalizer, SERVICE_IMPORT_CLEANUP_FINALIZER,
};
use fleet_net_core::{
    ignore_not_found, LinkState, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler,
    Result,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::context::MemberContext;

pub fn internal_service_import_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}

fn created_at(import: &ServiceImport) -> DateTime<Utc> {
    import
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|ts| ts.0)
        .unwrap_or_else(Utc::now)
}

pub struct ServiceImportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> ServiceImportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    async fn withdraw(&self, mut import: ServiceImport) -> Result<()> {
        let key = ObjectKey::of(&import);
        let isi_name = internal_service_import_name(&key.namespace, &key.name);
        let hub = &self.ctx.hub;
        let replica_exists = hub
            .try_get::<InternalServiceImport>(&self.ctx.hub_namespace, &isi_name)
            .await?
            .is_some();
        let state = LinkState::observe(
            has_finalizer(&import, SERVICE_IMPORT_CLEANUP_FINALIZER),
            replica_exists,
            true,
        );
        if state == LinkState::Unlinked {
            return Ok(());
        }

        let state = state.advance(LinkState::Unlinking)?;
        if replica_exists {
            ignore_not_found(
                hub.delete::<InternalServiceImport>(&self.ctx.hub_namespace, &isi_name)
                    .await,
            )?;
            info!(service_import = %key, internal_service_import = %isi_name, "Withdrew service import request");
        }

        state.advance(LinkState::Unlinked)?;
        remove_finalizer(&mut import, SERVICE_IMPORT_CLEANUP_FINALIZER);
        self.ctx.member.update(&import).await?;
        Ok(())
    }

    /// Creates or refreshes the InternalServiceImport requesting `import` from the hub.
    async fn publish(&self, import: &ServiceImport) -> Result<()> {
        let hub = &self.ctx.hub;
        let key = ObjectKey::of(import);
        let isi_name = internal_service_import_name(&key.namespace, &key.name);
        let existing = hub
            .try_get::<InternalServiceImport>(&self.ctx.hub_namespace, &isi_name)
            .await?;
        let state = LinkState::observe(
            has_finalizer(import, SERVICE_IMPORT_CLEANUP_FINALIZER),
            existing.is_some(),
            is_deleting(import),
        );
        state.advance(LinkState::Linked)?;

        match existing {
            None => {
                let isi = InternalServiceImport {
                    metadata: ObjectMeta {
                        namespace: Some(self.ctx.hub_namespace.clone()),
                        name: Some(isi_name.clone()),
                        ..Default::default()
                    },
                    spec: InternalServiceImportSpec {
                        service_import_reference: ExportedObjectReference::from_object(
                            &self.ctx.member_cluster_id,
                            import,
                            created_at(import),
                        ),
                    },
                    status: None,
                };
                hub.create(&isi).await?;
                info!(service_import = %key, internal_service_import = %isi_name, "Published service import request");
            }
            Some(existing) => {
                let mut desired = existing.clone();
                desired
                    .spec
                    .service_import_reference
                    .update_from_object(import, created_at(import));
                if desired.spec != existing.spec {
                    hub.update(&desired).await?;
                    debug!(service_import = %key, internal_service_import = %isi_name, "Refreshed service import request");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for ServiceImportReconciler<S> {
    fn name(&self) -> &'static str {
        "serviceimport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let member = &self.ctx.member;
        let Some(mut import) = member
            .try_get::<ServiceImport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&import) {
            if has_finalizer(&import, SERVICE_IMPORT_CLEANUP_FINALIZER) {
                self.withdraw(import).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        if add_finalizer(&mut import, SERVICE_IMPORT_CLEANUP_FINALIZER) {
            import = member.update(&import).await?;
        }
        self.publish(&import).await?;
        Ok(ReconcileOutcome::Done)
    }
}
