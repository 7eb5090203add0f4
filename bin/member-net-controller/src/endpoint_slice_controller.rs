//! EndpointSlice controller: exports the ready endpoints of exported Services to the hub

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use fleet_net_api::{
    EndpointSliceExport, EndpointSliceExportSpec, ExportedEndpoint, ExportedEndpointPort,
    ExportedObjectReference, OwnerServiceReference, ServiceExport,
};
use fleet_net_core::condition::is_valid_without_conflict;
use fleet_net_core::objectmeta::{
    annotation, is_deleting, label, remove_annotation, set_annotation,
    LAST_SEEN_GENERATION_ANNOTATION, LAST_SEEN_TIMESTAMP_ANNOTATION, SERVICE_NAME_LABEL,
    UNIQUE_NAME_ANNOTATION,
};
use fleet_net_core::uniquename::{
    fleet_scoped_unique_name, random_lowercase_name, NameFormat, FALLBACK_NAME_LENGTH,
};
use fleet_net_core::{ignore_not_found, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::context::MemberContext;

const IPV4: &str = "IPv4";

/// What to do with an EndpointSlice
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceAction {
    Skip,
    Export,
    Unexport,
}

/// Endpoints whose readiness is true or unknown.
pub fn extract_ready_endpoints(slice: &EndpointSlice) -> Vec<ExportedEndpoint> {
    slice
        .endpoints
        .iter()
        .filter(|endpoint| {
            endpoint
                .conditions
                .as_ref()
                .and_then(|conditions| conditions.ready)
                .unwrap_or(true)
        })
        .map(|endpoint| ExportedEndpoint {
            addresses: endpoint.addresses.clone(),
        })
        .collect()
}

pub fn extract_ports(slice: &EndpointSlice) -> Vec<ExportedEndpointPort> {
    slice
        .ports
        .iter()
        .flatten()
        .map(|port| ExportedEndpointPort {
            name: port.name.clone(),
            protocol: port.protocol.clone(),
            port: port.port,
            app_protocol: port.app_protocol.clone(),
        })
        .collect()
}

fn has_valid_unique_name(slice: &EndpointSlice) -> Option<&str> {
    annotation(slice, UNIQUE_NAME_ANNOTATION).filter(|name| NameFormat::Dns1123Subdomain.is_valid(name))
}

pub struct EndpointSliceReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> EndpointSliceReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    /// A slice is exported only while it belongs to a valid, unconflicted ServiceExport. A slice
    /// that carries a unique name may have been exported before and is withdrawn instead of
    /// skipped once it stops qualifying.
    pub async fn decide(&self, slice: &EndpointSlice) -> Result<SliceAction> {
        if slice.address_type != IPV4 {
            return Ok(SliceAction::Skip);
        }

        let withdraw = if annotation(slice, UNIQUE_NAME_ANNOTATION).is_some() {
            SliceAction::Unexport
        } else {
            SliceAction::Skip
        };

        let Some(service_name) = label(slice, SERVICE_NAME_LABEL) else {
            return Ok(withdraw);
        };
        let namespace = slice.metadata.namespace.as_deref().unwrap_or_default();
        let Some(export) = self
            .ctx
            .member
            .try_get::<ServiceExport>(namespace, service_name)
            .await?
        else {
            return Ok(withdraw);
        };

        if is_deleting(&export) || !is_valid_without_conflict(export.conditions()) || is_deleting(slice) {
            return Ok(withdraw);
        }
        Ok(SliceAction::Export)
    }

    /// Deletes the EndpointSliceExport named by the slice's unique name, but only when it still
    /// belongs to this slice, then drops the unique name.
    async fn unexport(&self, slice: &mut EndpointSlice) -> Result<()> {
        let key = ObjectKey::of(slice);
        if let Some(unique_name) = has_valid_unique_name(slice) {
            let hub = &self.ctx.hub;
            let existing = hub
                .try_get::<EndpointSliceExport>(&self.ctx.hub_namespace, unique_name)
                .await?;
            match existing {
                Some(ese)
                    if ese
                        .spec
                        .endpoint_slice_reference
                        .is_linked_to(slice.metadata.uid.as_deref()) =>
                {
                    ignore_not_found(
                        hub.delete::<EndpointSliceExport>(&self.ctx.hub_namespace, unique_name)
                            .await,
                    )?;
                    info!(endpoint_slice = %key, endpoint_slice_export = %unique_name, "Unexported endpoint slice");
                }
                Some(_) => {
                    debug!(endpoint_slice = %key, endpoint_slice_export = %unique_name, "Export belongs to another endpoint slice; leaving it in place");
                }
                None => {}
            }
        }

        remove_annotation(slice, UNIQUE_NAME_ANNOTATION);
        *slice = self.ctx.member.update(slice).await?;
        Ok(())
    }

    async fn assign_unique_name(&self, slice: &mut EndpointSlice) -> Result<String> {
        let key = ObjectKey::of(slice);
        let unique_name = fleet_scoped_unique_name(
            NameFormat::Dns1123Subdomain,
            &self.ctx.member_cluster_id,
            &key.namespace,
            &key.name,
        )
        .unwrap_or_else(|e| {
            warn!(endpoint_slice = %key, error = %e, "Failed to format unique name; falling back to a random name");
            random_lowercase_name(FALLBACK_NAME_LENGTH)
        });

        set_annotation(slice, UNIQUE_NAME_ANNOTATION, unique_name.clone());
        *slice = self.ctx.member.update(slice).await?;
        debug!(endpoint_slice = %key, unique_name = %unique_name, "Assigned unique name");
        Ok(unique_name)
    }

    /// Returns when the current generation of the slice was first seen.
    async fn last_seen_timestamp(&self, slice: &mut EndpointSlice, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let generation = slice.metadata.generation.unwrap_or_default().to_string();
        let seen_at = annotation(slice, LAST_SEEN_TIMESTAMP_ANNOTATION)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        if let (Some(seen_generation), Some(seen_at)) =
            (annotation(slice, LAST_SEEN_GENERATION_ANNOTATION), seen_at)
        {
            if seen_generation == generation && seen_at <= now {
                return Ok(seen_at);
            }
        }

        let now = now.trunc_subsecs(0);
        set_annotation(slice, LAST_SEEN_GENERATION_ANNOTATION, generation);
        set_annotation(slice, LAST_SEEN_TIMESTAMP_ANNOTATION, now.to_rfc3339());
        *slice = self.ctx.member.update(slice).await?;
        Ok(now)
    }

    fn desired_spec(&self, slice: &EndpointSlice, reference: ExportedObjectReference) -> EndpointSliceExportSpec {
        let namespace = slice.metadata.namespace.as_deref().unwrap_or_default();
        let service_name = label(slice, SERVICE_NAME_LABEL).unwrap_or_default();
        EndpointSliceExportSpec {
            address_type: IPV4.to_string(),
            endpoints: extract_ready_endpoints(slice),
            ports: extract_ports(slice),
            endpoint_slice_reference: reference,
            owner_service_reference: OwnerServiceReference::new(namespace, service_name),
        }
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for EndpointSliceReconciler<S> {
    fn name(&self) -> &'static str {
        "endpointslice"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let member = &self.ctx.member;
        let hub = &self.ctx.hub;
        let Some(mut slice) = member
            .try_get::<EndpointSlice>(&key.namespace, &key.name)
            .await?
        else {
            // a slice removed before it was withdrawn is swept from the hub separately
            debug!(endpoint_slice = %key, "Endpoint slice is not found");
            return Ok(ReconcileOutcome::Done);
        };

        match self.decide(&slice).await? {
            SliceAction::Skip => return Ok(ReconcileOutcome::Done),
            SliceAction::Unexport => {
                self.unexport(&mut slice).await?;
                return Ok(ReconcileOutcome::Done);
            }
            SliceAction::Export => {}
        }

        let unique_name = match has_valid_unique_name(&slice).map(str::to_string) {
            Some(name) => name,
            None => self.assign_unique_name(&mut slice).await?,
        };

        let now = Utc::now();
        let exported_since = match self.last_seen_timestamp(&mut slice, now).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(endpoint_slice = %key, error = %e, "Failed to annotate last seen generation and timestamp");
                now
            }
        };

        let existing = hub
            .try_get::<EndpointSliceExport>(&self.ctx.hub_namespace, &unique_name)
            .await?;
        let Some(existing) = existing else {
            let reference =
                ExportedObjectReference::from_object(&self.ctx.member_cluster_id, &slice, exported_since);
            let ese = EndpointSliceExport {
                metadata: ObjectMeta {
                    namespace: Some(self.ctx.hub_namespace.clone()),
                    name: Some(unique_name.clone()),
                    ..Default::default()
                },
                spec: self.desired_spec(&slice, reference),
            };
            hub.create(&ese).await?;
            info!(endpoint_slice = %key, endpoint_slice_export = %unique_name, "Exported endpoint slice");
            return Ok(ReconcileOutcome::Done);
        };

        if !existing
            .spec
            .endpoint_slice_reference
            .is_linked_to(slice.metadata.uid.as_deref())
        {
            // the unique name is taken by another slice; drop it so a fresh one is assigned
            warn!(endpoint_slice = %key, endpoint_slice_export = %unique_name, "Unique name is in use by another endpoint slice");
            remove_annotation(&mut slice, UNIQUE_NAME_ANNOTATION);
            member.update(&slice).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let mut reference = existing.spec.endpoint_slice_reference.clone();
        reference.update_from_object(&slice, exported_since);
        let spec = self.desired_spec(&slice, reference);
        if spec != existing.spec {
            let mut desired = existing;
            desired.spec = spec;
            hub.update(&desired).await?;
            debug!(endpoint_slice = %key, endpoint_slice_export = %unique_name, "Updated exported endpoint slice");
        }
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, endpoint_slice, exported_service_export, HUB_NAMESPACE};
    use fleet_net_core::condition::conflict_condition;
    use fleet_net_core::{ListOptions, MemoryStore};

    async fn setup(ctx: &MemberContext<MemoryStore>) {
        ctx.member
            .create(&exported_service_export("work", "app"))
            .await
            .unwrap();
        ctx.member
            .create(&endpoint_slice(
                "work",
                "app-slice-1",
                "app",
                &[("10.0.0.1", Some(true)), ("10.0.0.2", None), ("10.0.0.3", Some(false))],
            ))
            .await
            .unwrap();
    }

    async fn slice(ctx: &MemberContext<MemoryStore>, name: &str) -> EndpointSlice {
        ctx.member.get("work", name).await.unwrap()
    }

    async fn hub_exports(ctx: &MemberContext<MemoryStore>) -> Vec<EndpointSliceExport> {
        ctx.hub
            .list(&ListOptions::namespaced(HUB_NAMESPACE))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_export_ready_endpoints() {
        let ctx = context();
        setup(&ctx).await;
        let reconciler = EndpointSliceReconciler::new(ctx.clone());
        reconciler
            .reconcile(&ObjectKey::new("work", "app-slice-1"))
            .await
            .unwrap();

        let slice = slice(&ctx, "app-slice-1").await;
        let unique_name = annotation(&slice, UNIQUE_NAME_ANNOTATION).unwrap();
        assert!(unique_name.starts_with("bravelion-work-app-slice-1-"));
        assert_eq!(annotation(&slice, LAST_SEEN_GENERATION_ANNOTATION), Some("1"));

        let ese: EndpointSliceExport = ctx.hub.get(HUB_NAMESPACE, unique_name).await.unwrap();
        assert_eq!(ese.spec.address_type, "IPv4");
        let addresses: Vec<_> = ese
            .spec
            .endpoints
            .iter()
            .flat_map(|e| e.addresses.clone())
            .collect();
        assert_eq!(addresses, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(ese.spec.ports.len(), 1);
        assert_eq!(ese.spec.owner_service_reference.namespaced_name, "work/app");
        assert!(ese
            .spec
            .endpoint_slice_reference
            .is_linked_to(slice.metadata.uid.as_deref()));
        assert!(ese.spec.endpoint_slice_reference.exported_since.is_some());

        // converged: nothing is rewritten
        let before = ese.metadata.resource_version.clone();
        reconciler
            .reconcile(&ObjectKey::new("work", "app-slice-1"))
            .await
            .unwrap();
        let ese: EndpointSliceExport = ctx.hub.get(HUB_NAMESPACE, unique_name).await.unwrap();
        assert_eq!(ese.metadata.resource_version, before);
    }

    #[tokio::test]
    async fn test_skip_unexported_service() {
        let ctx = context();
        ctx.member
            .create(&endpoint_slice("work", "app-slice-1", "app", &[("10.0.0.1", None)]))
            .await
            .unwrap();
        let reconciler = EndpointSliceReconciler::new(ctx.clone());
        let slice = slice(&ctx, "app-slice-1").await;
        assert_eq!(reconciler.decide(&slice).await.unwrap(), SliceAction::Skip);

        let mut ipv6 = endpoint_slice("work", "v6", "app", &[]);
        ipv6.address_type = "IPv6".to_string();
        assert_eq!(reconciler.decide(&ipv6).await.unwrap(), SliceAction::Skip);

        reconciler
            .reconcile(&ObjectKey::new("work", "app-slice-1"))
            .await
            .unwrap();
        assert!(hub_exports(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_unexport_on_conflict() {
        let ctx = context();
        setup(&ctx).await;
        let reconciler = EndpointSliceReconciler::new(ctx.clone());
        let key = ObjectKey::new("work", "app-slice-1");
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(hub_exports(&ctx).await.len(), 1);

        let mut export: ServiceExport = ctx.member.get("work", "app").await.unwrap();
        fleet_net_core::condition::set_condition(
            export.conditions_mut(),
            conflict_condition(true, 1, "work", "app"),
        );
        ctx.member.update_status(&export).await.unwrap();

        let slice = slice(&ctx, "app-slice-1").await;
        assert_eq!(reconciler.decide(&slice).await.unwrap(), SliceAction::Unexport);
        reconciler.reconcile(&key).await.unwrap();

        assert!(hub_exports(&ctx).await.is_empty());
        let slice = self::slice(&ctx, "app-slice-1").await;
        assert!(annotation(&slice, UNIQUE_NAME_ANNOTATION).is_none());
    }

    #[tokio::test]
    async fn test_unlabelled_exported_slice_is_withdrawn() {
        let ctx = context();
        setup(&ctx).await;
        let reconciler = EndpointSliceReconciler::new(ctx.clone());
        let key = ObjectKey::new("work", "app-slice-1");
        reconciler.reconcile(&key).await.unwrap();

        let mut slice = slice(&ctx, "app-slice-1").await;
        slice.metadata.labels = None;
        ctx.member.update(&slice).await.unwrap();
        reconciler.reconcile(&key).await.unwrap();

        assert!(hub_exports(&ctx).await.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_unique_name_leaves_other_export_alone() {
        let ctx = context();
        setup(&ctx).await;
        ctx.member
            .create(&endpoint_slice("work", "app-slice-2", "app", &[("10.0.1.1", None)]))
            .await
            .unwrap();
        let reconciler = EndpointSliceReconciler::new(ctx.clone());
        let first = ObjectKey::new("work", "app-slice-1");
        let second = ObjectKey::new("work", "app-slice-2");
        reconciler.reconcile(&first).await.unwrap();
        reconciler.reconcile(&second).await.unwrap();

        let first_slice = slice(&ctx, "app-slice-1").await;
        let first_name = annotation(&first_slice, UNIQUE_NAME_ANNOTATION).unwrap().to_string();
        let mut second_slice = slice(&ctx, "app-slice-2").await;
        let second_name = annotation(&second_slice, UNIQUE_NAME_ANNOTATION).unwrap().to_string();

        // point the second slice at the first slice's export
        set_annotation(&mut second_slice, UNIQUE_NAME_ANNOTATION, first_name.clone());
        ctx.member.update(&second_slice).await.unwrap();

        reconciler.reconcile(&second).await.unwrap();
        let second_slice = slice(&ctx, "app-slice-2").await;
        assert!(annotation(&second_slice, UNIQUE_NAME_ANNOTATION).is_none());

        reconciler.reconcile(&second).await.unwrap();
        let second_slice = slice(&ctx, "app-slice-2").await;
        let new_name = annotation(&second_slice, UNIQUE_NAME_ANNOTATION).unwrap();
        assert_ne!(new_name, first_name);
        assert_ne!(new_name, second_name);

        let untouched: EndpointSliceExport = ctx.hub.get(HUB_NAMESPACE, &first_name).await.unwrap();
        assert!(untouched
            .spec
            .endpoint_slice_reference
            .is_linked_to(first_slice.metadata.uid.as_deref()));
        let replacement: EndpointSliceExport = ctx.hub.get(HUB_NAMESPACE, new_name).await.unwrap();
        assert!(replacement
            .spec
            .endpoint_slice_reference
            .is_linked_to(second_slice.metadata.uid.as_deref()));
    }

    #[tokio::test]
    async fn test_malformed_unique_name_is_replaced() {
        let ctx = context();
        setup(&ctx).await;
        let mut bad = slice(&ctx, "app-slice-1").await;
        set_annotation(&mut bad, UNIQUE_NAME_ANNOTATION, "Bad_Name");
        ctx.member.update(&bad).await.unwrap();

        EndpointSliceReconciler::new(ctx.clone())
            .reconcile(&ObjectKey::new("work", "app-slice-1"))
            .await
            .unwrap();

        let renamed = slice(&ctx, "app-slice-1").await;
        let unique_name = annotation(&renamed, UNIQUE_NAME_ANNOTATION).unwrap();
        assert_ne!(unique_name, "Bad_Name");
        assert!(NameFormat::Dns1123Subdomain.is_valid(unique_name));

        let exports = hub_exports(&ctx).await;
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].metadata.name.as_deref(), Some(unique_name));
        assert!(ctx
            .hub
            .try_get::<EndpointSliceExport>(HUB_NAMESPACE, "Bad_Name")
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_extract_ready_endpoints() {
        let slice = endpoint_slice(
            "work",
            "app-slice-1",
            "app",
            &[("10.0.0.1", Some(false)), ("10.0.0.2", None)],
        );
        assert_eq!(
            extract_ready_endpoints(&slice),
            vec![ExportedEndpoint {
                addresses: vec!["10.0.0.2".to_string()]
            }]
        );
    }
}
