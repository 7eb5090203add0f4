//! EndpointSliceImport controller: materializes endpoints distributed by the hub as
//! EndpointSlices of the derived Service in the fleet-system namespace

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleet_net_api::{EndpointSliceImport, MultiClusterService};
use fleet_net_core::objectmeta::{
    add_finalizer, annotation, has_finalizer, is_deleting, label, remove_finalizer, set_annotation,
    DERIVED_SERVICE_LABEL, ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER, ENDPOINT_SLICE_IMPORT_MANAGER,
    LAST_OBSERVED_GENERATION_ANNOTATION, MANAGED_BY_LABEL, SERVICE_NAME_LABEL,
};
use fleet_net_core::store::SERVICE_IMPORT_NAME_INDEX;
use fleet_net_core::uniquename::is_dns1035_label;
use fleet_net_core::{
    ignore_not_found, ListOptions, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result,
};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use crate::context::MemberContext;

/// Retry interval while the derived Service is not ready
pub const IMPORT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The derived Service name labelled on the first live MultiClusterService, if any.
fn derived_service_name(services: &[MultiClusterService]) -> Option<String> {
    services
        .iter()
        .filter(|mcs| !is_deleting(*mcs))
        .find_map(|mcs| label(mcs, DERIVED_SERVICE_LABEL).map(str::to_string))
}

fn format_endpoint_slice(slice: &mut EndpointSlice, derived_service: &str, import: &EndpointSliceImport) {
    slice.metadata.labels = Some(
        [
            (SERVICE_NAME_LABEL.to_string(), derived_service.to_string()),
            (MANAGED_BY_LABEL.to_string(), ENDPOINT_SLICE_IMPORT_MANAGER.to_string()),
        ]
        .into(),
    );
    slice.address_type = import.spec.address_type.clone();
    slice.endpoints = import
        .spec
        .endpoints
        .iter()
        .map(|endpoint| Endpoint {
            addresses: endpoint.addresses.clone(),
            ..Default::default()
        })
        .collect();
    slice.ports = Some(
        import
            .spec
            .ports
            .iter()
            .map(|port| EndpointPort {
                name: port.name.clone(),
                protocol: port.protocol.clone(),
                port: port.port,
                app_protocol: port.app_protocol.clone(),
            })
            .collect(),
    );
}

pub struct EndpointSliceImportReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> EndpointSliceImportReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    async fn unimport(&self, mut import: EndpointSliceImport) -> Result<()> {
        if !has_finalizer(&import, ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER) {
            return Ok(());
        }
        let key = ObjectKey::of(&import);
        ignore_not_found(
            self.ctx
                .member
                .delete::<EndpointSlice>(&self.ctx.fleet_system_namespace, &key.name)
                .await,
        )?;
        info!(endpoint_slice_import = %key, "Removed imported endpoint slice");

        remove_finalizer(&mut import, ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER);
        self.ctx.hub.update(&import).await?;
        Ok(())
    }

    /// The derived Service must have a valid name and exist, not being deleted, in the
    /// fleet-system namespace.
    async fn is_derived_service_ready(&self, name: &str) -> Result<bool> {
        if !is_dns1035_label(name) {
            return Ok(false);
        }
        let service = self
            .ctx
            .member
            .try_get::<Service>(&self.ctx.fleet_system_namespace, name)
            .await?;
        Ok(service.is_some_and(|service| !is_deleting(&service)))
    }

    async fn create_or_update_slice(&self, derived_service: &str, import: &EndpointSliceImport) -> Result<()> {
        let member = &self.ctx.member;
        let name = import.metadata.name.clone().unwrap_or_default();
        match member
            .try_get::<EndpointSlice>(&self.ctx.fleet_system_namespace, &name)
            .await?
        {
            Some(existing) => {
                let mut desired = existing.clone();
                format_endpoint_slice(&mut desired, derived_service, import);
                if desired != existing {
                    member.update(&desired).await?;
                    debug!(endpoint_slice = %ObjectKey::of(&desired), "Updated imported endpoint slice");
                }
            }
            None => {
                let mut slice = EndpointSlice {
                    metadata: ObjectMeta {
                        namespace: Some(self.ctx.fleet_system_namespace.clone()),
                        name: Some(name),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                format_endpoint_slice(&mut slice, derived_service, import);
                let created = member.create(&slice).await?;
                info!(endpoint_slice = %ObjectKey::of(&created), derived_service, "Imported endpoint slice");
            }
        }
        Ok(())
    }

    /// Observes the export-to-import latency once per source generation. The generation is
    /// recorded before observing so a failed write never double counts.
    async fn observe_metrics(&self, mut import: EndpointSliceImport) -> Result<()> {
        let reference = &import.spec.endpoint_slice_reference;
        let generation = reference.generation.to_string();
        if annotation(&import, LAST_OBSERVED_GENERATION_ANNOTATION) == Some(generation.as_str()) {
            return Ok(());
        }
        let origin = reference.cluster_id.clone();
        let exported_since = reference.exported_since;

        set_annotation(&mut import, LAST_OBSERVED_GENERATION_ANNOTATION, generation);
        self.ctx.hub.update(&import).await?;

        let now = Utc::now();
        self.ctx.metrics.observe_endpoint_slice_export_import(
            &origin,
            &self.ctx.member_cluster_id,
            exported_since.unwrap_or(now),
            now,
        );
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for EndpointSliceImportReconciler<S> {
    fn name(&self) -> &'static str {
        "endpointsliceimport"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(mut import) = self
            .ctx
            .hub
            .try_get::<EndpointSliceImport>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&import) {
            self.unimport(import).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let owner = &import.spec.owner_service_reference;
        let options = ListOptions::namespaced(&owner.namespace).with_field(SERVICE_IMPORT_NAME_INDEX, &owner.name);
        let services: Vec<MultiClusterService> = self.ctx.member.list(&options).await?;
        if services.is_empty() {
            debug!(endpoint_slice_import = %key, service = %owner.namespaced_name, "No multi-cluster service imports this service");
            return Ok(ReconcileOutcome::Done);
        }

        let derived_service = derived_service_name(&services).unwrap_or_default();
        if !self.is_derived_service_ready(&derived_service).await? {
            debug!(endpoint_slice_import = %key, derived_service = %derived_service, "Derived service is not ready; retrying later");
            return Ok(ReconcileOutcome::RequeueAfter(IMPORT_RETRY_INTERVAL));
        }

        if add_finalizer(&mut import, ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER) {
            import = self.ctx.hub.update(&import).await?;
        }

        self.create_or_update_slice(&derived_service, &import).await?;
        self.observe_metrics(import).await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, labels, meta, service, FLEET_SYSTEM_NAMESPACE, HUB_NAMESPACE};
    use chrono::Duration as ChronoDuration;
    use fleet_net_api::{
        EndpointSliceImportSpec, ExportedEndpoint, ExportedEndpointPort, ExportedObjectReference,
        MultiClusterServiceSpec, OwnerServiceReference, ServiceImportRef,
    };
    use fleet_net_core::MemoryStore;

    const IMPORT_NAME: &str = "smartfish-work-app-slice-1-a1b2c";

    fn endpoint_slice_import() -> EndpointSliceImport {
        EndpointSliceImport {
            metadata: meta(HUB_NAMESPACE, IMPORT_NAME),
            spec: EndpointSliceImportSpec {
                address_type: "IPv4".to_string(),
                endpoints: vec![ExportedEndpoint {
                    addresses: vec!["10.0.0.1".to_string()],
                }],
                ports: vec![ExportedEndpointPort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: Some(80),
                    app_protocol: None,
                }],
                endpoint_slice_reference: ExportedObjectReference {
                    cluster_id: "smartfish".to_string(),
                    generation: 1,
                    exported_since: Some(Utc::now() - ChronoDuration::seconds(2)),
                    ..Default::default()
                },
                owner_service_reference: OwnerServiceReference::new("work", "app"),
            },
        }
    }

    fn multi_cluster_service(derived: Option<&str>) -> MultiClusterService {
        let mut mcs = MultiClusterService::new(
            "app",
            MultiClusterServiceSpec {
                service_import: ServiceImportRef {
                    name: "app".to_string(),
                },
            },
        );
        mcs.metadata.namespace = Some("work".to_string());
        if let Some(derived) = derived {
            mcs.metadata.labels = labels(&[(DERIVED_SERVICE_LABEL, derived)]);
        }
        mcs
    }

    async fn setup(ctx: &MemberContext<MemoryStore>) {
        ctx.hub.create(&endpoint_slice_import()).await.unwrap();
        ctx.member
            .create(&multi_cluster_service(Some("derived-app")))
            .await
            .unwrap();
        ctx.member
            .create(&service(FLEET_SYSTEM_NAMESPACE, "derived-app", &[("http", "TCP", 80)]))
            .await
            .unwrap();
    }

    fn observed(ctx: &MemberContext<MemoryStore>) -> u64 {
        ctx.metrics
            .endpoint_slice_export_import_duration
            .with_label_values(&["smartfish", "bravelion"])
            .get_sample_count()
    }

    #[tokio::test]
    async fn test_import_endpoint_slice() {
        let ctx = context();
        setup(&ctx).await;
        let reconciler = EndpointSliceImportReconciler::new(ctx.clone());
        let key = ObjectKey::new(HUB_NAMESPACE, IMPORT_NAME);

        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileOutcome::Done);

        let slice: EndpointSlice = ctx.member.get(FLEET_SYSTEM_NAMESPACE, IMPORT_NAME).await.unwrap();
        assert_eq!(label(&slice, SERVICE_NAME_LABEL), Some("derived-app"));
        assert_eq!(label(&slice, MANAGED_BY_LABEL), Some(ENDPOINT_SLICE_IMPORT_MANAGER));
        assert_eq!(slice.address_type, "IPv4");
        assert_eq!(slice.endpoints[0].addresses, vec!["10.0.0.1"]);
        assert_eq!(slice.ports.as_ref().unwrap()[0].port, Some(80));

        let import: EndpointSliceImport = ctx.hub.get(HUB_NAMESPACE, IMPORT_NAME).await.unwrap();
        assert!(has_finalizer(&import, ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER));
        assert_eq!(annotation(&import, LAST_OBSERVED_GENERATION_ANNOTATION), Some("1"));
        assert_eq!(observed(&ctx), 1);

        // the same generation is observed only once
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(observed(&ctx), 1);
    }

    #[tokio::test]
    async fn test_requeue_until_derived_service_exists() {
        let ctx = context();
        ctx.hub.create(&endpoint_slice_import()).await.unwrap();
        ctx.member.create(&multi_cluster_service(None)).await.unwrap();
        let reconciler = EndpointSliceImportReconciler::new(ctx.clone());
        let key = ObjectKey::new(HUB_NAMESPACE, IMPORT_NAME);

        assert_eq!(
            reconciler.reconcile(&key).await.unwrap(),
            ReconcileOutcome::RequeueAfter(IMPORT_RETRY_INTERVAL)
        );
        assert_eq!(ctx.member.count::<EndpointSlice>(), 0);

        let mut mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        mcs.metadata.labels = labels(&[(DERIVED_SERVICE_LABEL, "derived-app")]);
        ctx.member.update(&mcs).await.unwrap();
        assert_eq!(
            reconciler.reconcile(&key).await.unwrap(),
            ReconcileOutcome::RequeueAfter(IMPORT_RETRY_INTERVAL)
        );

        ctx.member
            .create(&service(FLEET_SYSTEM_NAMESPACE, "derived-app", &[("http", "TCP", 80)]))
            .await
            .unwrap();
        assert_eq!(reconciler.reconcile(&key).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(ctx.member.count::<EndpointSlice>(), 1);
    }

    #[tokio::test]
    async fn test_no_multi_cluster_service() {
        let ctx = context();
        ctx.hub.create(&endpoint_slice_import()).await.unwrap();
        let outcome = EndpointSliceImportReconciler::new(ctx.clone())
            .reconcile(&ObjectKey::new(HUB_NAMESPACE, IMPORT_NAME))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(ctx.member.count::<EndpointSlice>(), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_import_removes_slice() {
        let ctx = context();
        setup(&ctx).await;
        let reconciler = EndpointSliceImportReconciler::new(ctx.clone());
        let key = ObjectKey::new(HUB_NAMESPACE, IMPORT_NAME);
        reconciler.reconcile(&key).await.unwrap();
        assert_eq!(ctx.member.count::<EndpointSlice>(), 1);

        ctx.hub
            .delete::<EndpointSliceImport>(HUB_NAMESPACE, IMPORT_NAME)
            .await
            .unwrap();
        reconciler.reconcile(&key).await.unwrap();

        assert_eq!(ctx.member.count::<EndpointSlice>(), 0);
        assert_eq!(ctx.hub.count::<EndpointSliceImport>(), 0);
    }
}
