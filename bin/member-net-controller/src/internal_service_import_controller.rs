//! Reports the import status resolved by the hub back to the member ServiceImport

use std::sync::Arc;

use async_trait::async_trait;
use fleet_net_api::{InternalServiceImport, ServiceImport};
use fleet_net_core::{ignore_not_found, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use tracing::{debug, info};

use crate::context::MemberContext;

pub struct InternalServiceImportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> InternalServiceImportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InternalServiceImportReconciler<S> {
    fn name(&self) -> &'static str {
        "internalserviceimport-reporter"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(isi) = self
            .ctx
            .hub
            .try_get::<InternalServiceImport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let reference = &isi.spec.service_import_reference;
        let import = self
            .ctx
            .member
            .try_get::<ServiceImport>(&reference.namespace, &reference.name)
            .await?;
        let Some(mut import) = import else {
            ignore_not_found(
                self.ctx
                    .hub
                    .delete::<InternalServiceImport>(&key.namespace, &key.name)
                    .await,
            )?;
            info!(internal_service_import = %key, service_import = %reference.namespaced_name, "Service import is gone; deleted its request");
            return Ok(ReconcileOutcome::Done);
        };

        if import.status_or_default() == isi.status_or_default() {
            return Ok(ReconcileOutcome::Done);
        }

        debug!(internal_service_import = %key, service_import = %reference.namespaced_name, "Reporting back service import status");
        import.status = isi.status.clone();
        self.ctx.member.update_status(&import).await?;
        Ok(ReconcileOutcome::Done)
    }
}
