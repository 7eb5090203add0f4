//! Sweeps EndpointSliceExports in the hub namespace whose source EndpointSlice is gone or no
//! longer claims them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_net_api::EndpointSliceExport;
use fleet_net_core::objectmeta::{annotation, UNIQUE_NAME_ANNOTATION};
use fleet_net_core::{ignore_not_found, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tracing::{debug, info};

use crate::context::MemberContext;

/// Exports are re-checked periodically to catch slices deleted before they were withdrawn.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct EndpointSliceExportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> EndpointSliceExportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    async fn withdraw(&self, key: &ObjectKey, reason: &str) -> Result<ReconcileOutcome> {
        ignore_not_found(
            self.ctx
                .hub
                .delete::<EndpointSliceExport>(&key.namespace, &key.name)
                .await,
        )?;
        info!(endpoint_slice_export = %key, reason, "Deleted orphaned endpoint slice export");
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for EndpointSliceExportReconciler<S> {
    fn name(&self) -> &'static str {
        "endpointsliceexport-sweeper"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(ese) = self
            .ctx
            .hub
            .try_get::<EndpointSliceExport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        let reference = &ese.spec.endpoint_slice_reference;
        let slice = self
            .ctx
            .member
            .try_get::<EndpointSlice>(&reference.namespace, &reference.name)
            .await?;
        let Some(slice) = slice else {
            return self.withdraw(key, "endpoint slice not found").await;
        };

        if annotation(&slice, UNIQUE_NAME_ANNOTATION) != Some(key.name.as_str()) {
            return self.withdraw(key, "endpoint slice no longer claims this name").await;
        }

        debug!(endpoint_slice_export = %key, "Endpoint slice export is in use");
        Ok(ReconcileOutcome::RequeueAfter(SWEEP_INTERVAL))
    }
}
