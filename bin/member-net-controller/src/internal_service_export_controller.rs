//! Reports the conflict resolution result of the hub back to the member ServiceExport

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleet_net_api::v1alpha1::SERVICE_EXPORT_CONFLICT;
use fleet_net_api::{ConditionStatus, InternalServiceExport, ServiceExport};
use fleet_net_core::condition::{find_condition, set_condition};
use fleet_net_core::objectmeta::{annotation, set_annotation, LAST_OBSERVED_GENERATION_ANNOTATION};
use fleet_net_core::{ignore_not_found, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use tracing::{debug, info, warn};

use crate::context::MemberContext;

pub struct InternalServiceExportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> InternalServiceExportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    /// Copies the hub Conflict condition onto the ServiceExport. Returns whether the hub has
    /// reached a result at all.
    async fn report_back_conflict(&self, mut export: ServiceExport, ise: &InternalServiceExport) -> Result<bool> {
        let Some(resolved) = find_condition(ise.conditions(), SERVICE_EXPORT_CONFLICT) else {
            debug!(internal_service_export = %ObjectKey::of(ise), "No conflict resolution result yet");
            return Ok(false);
        };
        if find_condition(export.conditions(), SERVICE_EXPORT_CONFLICT) == Some(resolved) {
            return Ok(true);
        }

        let key = ObjectKey::of(&export);
        match resolved.status {
            ConditionStatus::True => warn!(service_export = %key, "Service is in conflict with other exported services"),
            ConditionStatus::False => info!(service_export = %key, "Service is exported without conflict"),
            ConditionStatus::Unknown => {}
        }
        set_condition(export.conditions_mut(), resolved.clone());
        self.ctx.member.update_status(&export).await?;
        Ok(true)
    }

    /// Observes the export latency once per exported Service generation.
    async fn observe_metrics(&self, mut ise: InternalServiceExport) -> Result<()> {
        let generation = ise.spec.service_reference.generation.to_string();
        if annotation(&ise, LAST_OBSERVED_GENERATION_ANNOTATION) == Some(generation.as_str()) {
            return Ok(());
        }
        let exported_since = ise.spec.service_reference.exported_since;

        set_annotation(&mut ise, LAST_OBSERVED_GENERATION_ANNOTATION, generation);
        self.ctx.hub.update(&ise).await?;

        let now = Utc::now();
        self.ctx.metrics.observe_service_export(
            &self.ctx.member_cluster_id,
            exported_since.unwrap_or(now),
            now,
        );
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for InternalServiceExportReconciler<S> {
    fn name(&self) -> &'static str {
        "internalserviceexport-reporter"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(ise) = self
            .ctx
            .hub
            .try_get::<InternalServiceExport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let reference = &ise.spec.service_reference;
        let export = self
            .ctx
            .member
            .try_get::<ServiceExport>(&reference.namespace, &reference.name)
            .await?;
        let Some(export) = export else {
            ignore_not_found(
                self.ctx
                    .hub
                    .delete::<InternalServiceExport>(&key.namespace, &key.name)
                    .await,
            )?;
            info!(internal_service_export = %key, service_export = %reference.namespaced_name, "Service export is gone; deleted its hub mirror");
            return Ok(ReconcileOutcome::Done);
        };

        if self.report_back_conflict(export, &ise).await? {
            self.observe_metrics(ise).await?;
        }
        Ok(ReconcileOutcome::Done)
    }
}
