//! ServiceExport controller: validates exported Services and publishes them to the hub

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use fleet_net_api::v1alpha1::SERVICE_EXPORT_CONFLICT;
use fleet_net_api::{
    Condition, ExportedObjectReference, InternalServiceExport, InternalServiceExportSpec, ServiceExport,
    ServicePort, TargetPort,
};
use fleet_net_core::condition::{
    equal_condition, equal_condition_with_message, find_condition, ineligible_condition,
    not_found_condition, pending_conflict_condition, remove_condition, set_condition,
    valid_condition,
};
use fleet_net_core::objectmeta::{
    add_finalizer, annotation, has_finalizer, is_deleting, remove_finalizer, set_annotation,
    LAST_SEEN_RESOURCE_VERSION_ANNOTATION, LAST_SEEN_TIMESTAMP_ANNOTATION,
    SERVICE_EXPORT_CLEANUP_FINALIZER,
};
use fleet_net_core::{
    ignore_not_found, LinkState, ObjectKey, ObjectStore, ReconcileOutcome,
    Reconciler, Result,
};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info, warn};

use crate::context::MemberContext;

/// Requeue delay after withdrawing an export that belonged to a re-created Service
const REEXPORT_DELAY: Duration = Duration::from_secs(1);

/// Name of the InternalServiceExport mirroring `namespace/name`
pub fn internal_service_export_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}

/// Headless and ExternalName Services cannot be exported.
pub fn is_service_eligible(service: &Service) -> bool {
    let Some(spec) = service.spec.as_ref() else {
        return true;
    };
    spec.type_.as_deref() != Some("ExternalName") && spec.cluster_ip.as_deref() != Some("None")
}

pub fn extract_service_ports(service: &Service) -> Vec<ServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| ServicePort {
                    name: port.name.clone().unwrap_or_default(),
                    protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    app_protocol: port.app_protocol.clone(),
                    port: port.port,
                    target_port: port.target_port.as_ref().map(|target| match target {
                        IntOrString::Int(number) => TargetPort::Number(*number),
                        IntOrString::String(name) => TargetPort::Name(name.clone()),
                    }),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct ServiceExportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> ServiceExportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    /// Withdraws the InternalServiceExport, then releases the finalizer.
    async fn unexport(&self, export: &mut ServiceExport) -> Result<()> {
        let key = ObjectKey::of(export);
        let ise_name = internal_service_export_name(&key.namespace, &key.name);
        let hub = &self.ctx.hub;
        let replica_exists = hub
            .try_get::<InternalServiceExport>(&self.ctx.hub_namespace, &ise_name)
            .await?
            .is_some();
        let state = LinkState::observe(
            has_finalizer(export, SERVICE_EXPORT_CLEANUP_FINALIZER),
            replica_exists,
            false,
        );
        if state == LinkState::Unlinked {
            return Ok(());
        }

        let state = state.advance(LinkState::Unlinking)?;
        if replica_exists {
            ignore_not_found(
                hub.delete::<InternalServiceExport>(&self.ctx.hub_namespace, &ise_name)
                    .await,
            )?;
            info!(service = %key, internal_service_export = %ise_name, "Unexported service");
        }

        state.advance(LinkState::Unlinked)?;
        if remove_finalizer(export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
            *export = self.ctx.member.update(export).await?;
        }
        Ok(())
    }

    async fn mark_invalid(&self, mut export: ServiceExport, desired: Condition) -> Result<()> {
        let conditions = export.conditions();
        let has_conflict = find_condition(conditions, SERVICE_EXPORT_CONFLICT).is_some();
        if equal_condition(find_condition(conditions, &desired.condition_type), Some(&desired))
            && !has_conflict
        {
            return Ok(());
        }

        debug!(service = %ObjectKey::of(&export), reason = %desired.reason, "Marking service export as invalid");
        set_condition(export.conditions_mut(), desired);
        remove_condition(export.conditions_mut(), SERVICE_EXPORT_CONFLICT);
        self.ctx.member.update_status(&export).await?;
        Ok(())
    }

    /// Marks the export valid and, if no conflict resolution result is known, pending.
    async fn mark_valid(&self, mut export: ServiceExport) -> Result<ServiceExport> {
        let key = ObjectKey::of(&export);
        let generation = export.metadata.generation.unwrap_or_default();
        let desired = valid_condition(generation, &key.namespace, &key.name);

        let mut changed = false;
        if !equal_condition_with_message(
            find_condition(export.conditions(), &desired.condition_type),
            Some(&desired),
        ) {
            set_condition(export.conditions_mut(), desired);
            changed = true;
        }
        if find_condition(export.conditions(), SERVICE_EXPORT_CONFLICT).is_none() {
            set_condition(
                export.conditions_mut(),
                pending_conflict_condition(generation, &key.namespace, &key.name),
            );
            changed = true;
        }

        if !changed {
            return Ok(export);
        }
        debug!(service = %key, "Marking service export as valid");
        self.ctx.member.update_status(&export).await
    }

    /// Returns when the current state of the Service was first seen, stamping the export with
    /// the Service's resource version and a fresh timestamp when the stored pair is stale.
    async fn last_seen_timestamp(
        &self,
        service: &Service,
        export: &mut ServiceExport,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let service_version = service.metadata.resource_version.clone().unwrap_or_default();
        let seen_version = annotation(export, LAST_SEEN_RESOURCE_VERSION_ANNOTATION);
        let seen_at = annotation(export, LAST_SEEN_TIMESTAMP_ANNOTATION)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        if let (Some(version), Some(seen_at)) = (seen_version, seen_at) {
            if version == service_version && seen_at <= now {
                return Ok(seen_at);
            }
        }

        let now = now.trunc_subsecs(0);
        set_annotation(export, LAST_SEEN_RESOURCE_VERSION_ANNOTATION, service_version);
        set_annotation(export, LAST_SEEN_TIMESTAMP_ANNOTATION, now.to_rfc3339());
        *export = self.ctx.member.update(export).await?;
        Ok(now)
    }

    async fn export(
        &self,
        export: &mut ServiceExport,
        service: &Service,
        exported_since: DateTime<Utc>,
    ) -> Result<ReconcileOutcome> {
        let key = ObjectKey::of(export);
        let ise_name = internal_service_export_name(&key.namespace, &key.name);
        let ports = extract_service_ports(service);
        let service_type = service.spec.as_ref().and_then(|spec| spec.type_.clone());
        let hub = &self.ctx.hub;

        let existing = hub
            .try_get::<InternalServiceExport>(&self.ctx.hub_namespace, &ise_name)
            .await?;
        let state = LinkState::observe(
            has_finalizer(export, SERVICE_EXPORT_CLEANUP_FINALIZER),
            existing.is_some(),
            is_deleting(export),
        );

        let Some(existing) = existing else {
            state.advance(LinkState::Linked)?;
            let ise = InternalServiceExport {
                metadata: ObjectMeta {
                    namespace: Some(self.ctx.hub_namespace.clone()),
                    name: Some(ise_name.clone()),
                    ..Default::default()
                },
                spec: InternalServiceExportSpec {
                    ports,
                    service_reference: ExportedObjectReference::from_object(
                        &self.ctx.member_cluster_id,
                        service,
                        exported_since,
                    ),
                    service_type,
                },
                status: None,
            };
            hub.create(&ise).await?;
            info!(service = %key, internal_service_export = %ise_name, "Exported service");
            return Ok(ReconcileOutcome::Done);
        };

        if !existing
            .spec
            .service_reference
            .is_linked_to(service.metadata.uid.as_deref())
        {
            // the Service was deleted and re-created under the same name
            warn!(
                service = %key,
                internal_service_export = %ise_name,
                old_uid = %existing.spec.service_reference.uid,
                "Exported service belongs to another service instance; re-exporting"
            );
            self.unexport(export).await?;
            return Ok(ReconcileOutcome::RequeueAfter(REEXPORT_DELAY));
        }

        state.advance(LinkState::Linked)?;
        let mut desired = existing.clone();
        desired.spec.ports = ports;
        desired.spec.service_type = service_type;
        desired
            .spec
            .service_reference
            .update_from_object(service, exported_since);
        if desired.spec != existing.spec {
            hub.update(&desired).await?;
            debug!(service = %key, internal_service_export = %ise_name, "Updated exported service");
        }
        Ok(ReconcileOutcome::Done)
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for ServiceExportReconciler<S> {
    fn name(&self) -> &'static str {
        "serviceexport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let member = &self.ctx.member;
        let Some(mut export) = member
            .try_get::<ServiceExport>(&key.namespace, &key.name)
            .await?
        else {
            debug!(service = %key, "Service export is not found");
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&export) {
            if has_finalizer(&export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
                self.unexport(&mut export).await?;
            }
            return Ok(ReconcileOutcome::Done);
        }

        let generation = export.metadata.generation.unwrap_or_default();
        let service = match member.try_get::<Service>(&key.namespace, &key.name).await? {
            Some(service) if !is_deleting(&service) => service,
            _ => {
                if has_finalizer(&export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
                    self.unexport(&mut export).await?;
                }
                let condition = not_found_condition(generation, &key.namespace, &key.name);
                self.mark_invalid(export, condition).await?;
                return Ok(ReconcileOutcome::Done);
            }
        };

        if !is_service_eligible(&service) {
            if has_finalizer(&export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
                self.unexport(&mut export).await?;
            }
            let condition = ineligible_condition(generation, &key.namespace, &key.name);
            self.mark_invalid(export, condition).await?;
            return Ok(ReconcileOutcome::Done);
        }

        // the finalizer must be in place before anything reaches the hub
        if add_finalizer(&mut export, SERVICE_EXPORT_CLEANUP_FINALIZER) {
            debug!(service = %key, "Adding cleanup finalizer to service export");
            export = member.update(&export).await?;
        }
        let mut export = self.mark_valid(export).await?;

        let now = Utc::now();
        let exported_since = match self.last_seen_timestamp(&service, &mut export, now).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(service = %key, error = %e, "Failed to annotate last seen resource version and timestamp");
                now
            }
        };

        self.export(&mut export, &service, exported_since).await
    }
}
