//! MultiClusterService controller: imports a fleet Service into this member cluster
//!
//! The MultiClusterService owns a ServiceImport of the same namespace, which the ServiceImport
//! controller publishes to the hub. Once the hub grants the import, a LoadBalancer Service is
//! derived in the fleet-system namespace from the resolved ports, and its name is recorded in
//! the `derived-service` label so the imported EndpointSlices can attach to it. Both labels are
//! written before the objects they name, so an interrupted reconcile never leaks them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_net_api::v1alpha1::MULTI_CLUSTER_SERVICE_VALID;
use fleet_net_api::{
    LoadBalancerIngress, LoadBalancerStatus, MultiClusterService, ServiceImport, ServicePort,
    TargetPort,
};
use fleet_net_core::condition::{equal_condition, find_condition, service_import_condition, set_condition};
use fleet_net_core::objectmeta::{
    add_finalizer, has_finalizer, is_deleting, label, remove_finalizer, remove_label, set_label,
    DERIVED_SERVICE_LABEL, MULTI_CLUSTER_SERVICE_FINALIZER, MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL,
    MULTI_CLUSTER_SERVICE_NAME_LABEL, SERVICE_IMPORT_LABEL,
};
use fleet_net_core::uniquename::{is_dns1035_label, random_lowercase_name, FALLBACK_NAME_LENGTH};
use fleet_net_core::{ignore_not_found, ObjectKey, ObjectStore, ReconcileOutcome, Reconciler, Result};
use k8s_openapi::api::core::v1::{Service, ServicePort as KubeServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::context::MemberContext;

/// Requeue delay while the ServiceImport is owned by another MultiClusterService
pub const MCS_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const LOAD_BALANCER: &str = "LoadBalancer";

/// Name of the derived Service for `mcs`. Falls back to a random name when `{namespace}-{name}`
/// is not a DNS-1035 label.
fn generate_derived_service_name(mcs: &MultiClusterService) -> String {
    let name = format!("{}-{}", mcs.namespace().unwrap_or_default(), mcs.name_any());
    if is_dns1035_label(&name) {
        name
    } else {
        random_lowercase_name(FALLBACK_NAME_LENGTH)
    }
}

/// Whether another MultiClusterService is the controller of `import`.
fn is_owned_by_other(mcs: &MultiClusterService, import: &ServiceImport) -> bool {
    let kind = MultiClusterService::kind(&());
    let api_version = MultiClusterService::api_version(&());
    import.owner_references().iter().any(|owner| {
        owner.controller == Some(true)
            && owner.kind == kind
            && owner.api_version == api_version
            && owner.name != mcs.name_any()
    })
}

fn to_service_port(port: &ServicePort) -> KubeServicePort {
    KubeServicePort {
        name: (!port.name.is_empty()).then(|| port.name.clone()),
        protocol: Some(port.protocol.clone()),
        app_protocol: port.app_protocol.clone(),
        port: port.port,
        target_port: port.target_port.as_ref().map(|target| match target {
            TargetPort::Number(number) => IntOrString::Int(*number),
            TargetPort::Name(name) => IntOrString::String(name.clone()),
        }),
        ..Default::default()
    }
}

fn load_balancer_of(service: &Service) -> LoadBalancerStatus {
    let ingress = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .map(|i| LoadBalancerIngress {
                    ip: i.ip.clone(),
                    hostname: i.hostname.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    LoadBalancerStatus { ingress }
}

fn format_derived_service(service: &mut Service, mcs: &MultiClusterService, import: &ServiceImport) {
    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.ports = Some(import.status_or_default().ports.iter().map(to_service_port).collect());
    spec.type_ = Some(LOAD_BALANCER.to_string());
    set_label(service, MULTI_CLUSTER_SERVICE_NAME_LABEL, &mcs.name_any());
    set_label(
        service,
        MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL,
        &mcs.namespace().unwrap_or_default(),
    );
}

pub struct MultiClusterServiceReconciler<S> {
    ctx: Arc<MemberContext<S>>,
}

impl<S: ObjectStore> MultiClusterServiceReconciler<S> {
    pub fn new(ctx: Arc<MemberContext<S>>) -> Self {
        Self { ctx }
    }

    async fn handle_delete(&self, mut mcs: MultiClusterService) -> Result<()> {
        if !has_finalizer(&mcs, MULTI_CLUSTER_SERVICE_FINALIZER) {
            return Ok(());
        }
        let key = ObjectKey::of(&mcs);
        let member = &self.ctx.member;
        if let Some(derived) = label(&mcs, DERIVED_SERVICE_LABEL) {
            ignore_not_found(
                member
                    .delete::<Service>(&self.ctx.fleet_system_namespace, derived)
                    .await,
            )?;
        }
        if let Some(import) = label(&mcs, SERVICE_IMPORT_LABEL) {
            ignore_not_found(member.delete::<ServiceImport>(&key.namespace, import).await)?;
        }
        info!(multi_cluster_service = %key, "Unimported service");

        remove_finalizer(&mut mcs, MULTI_CLUSTER_SERVICE_FINALIZER);
        member.update(&mcs).await?;
        Ok(())
    }

    /// Persists label `key` on `mcs` when it changes.
    async fn persist_label(&self, mcs: &mut MultiClusterService, key: &str, value: &str) -> Result<()> {
        if set_label(mcs, key, value) {
            *mcs = self.ctx.member.update(mcs).await?;
        }
        Ok(())
    }

    async fn update_status(
        &self,
        mcs: &mut MultiClusterService,
        found: bool,
        load_balancer: LoadBalancerStatus,
    ) -> Result<()> {
        let desired = service_import_condition(found, mcs.metadata.generation.unwrap_or_default());
        let current = find_condition(mcs.conditions(), MULTI_CLUSTER_SERVICE_VALID);
        let current_lb = mcs.status.as_ref().map(|s| &s.load_balancer);
        if equal_condition(current, Some(&desired)) && current_lb == Some(&load_balancer) {
            return Ok(());
        }

        let status = mcs.status.get_or_insert_with(Default::default);
        status.load_balancer = load_balancer;
        set_condition(&mut status.conditions, desired);
        debug!(multi_cluster_service = %ObjectKey::of(mcs), found, "Updating multi-cluster service status");
        *mcs = self.ctx.member.update_status(mcs).await?;
        Ok(())
    }

    /// Resets the status and withdraws the derived Service while the import is not usable.
    async fn handle_invalid_import(&self, mcs: &mut MultiClusterService) -> Result<()> {
        self.update_status(mcs, false, LoadBalancerStatus::default()).await?;
        let Some(derived) = label(mcs, DERIVED_SERVICE_LABEL).map(str::to_string) else {
            return Ok(());
        };
        ignore_not_found(
            self.ctx
                .member
                .delete::<Service>(&self.ctx.fleet_system_namespace, &derived)
                .await,
        )?;
        info!(multi_cluster_service = %ObjectKey::of(mcs), derived_service = %derived, "Removed derived service");
        remove_label(mcs, DERIVED_SERVICE_LABEL);
        *mcs = self.ctx.member.update(mcs).await?;
        Ok(())
    }

    /// Creates the ServiceImport `name` controlled by `mcs`, or adopts an existing one.
    /// Returns `None` when another MultiClusterService controls it.
    async fn ensure_service_import(&self, mcs: &MultiClusterService, name: &str) -> Result<Option<ServiceImport>> {
        let member = &self.ctx.member;
        let namespace = mcs.namespace().unwrap_or_default();
        let owner = mcs.controller_owner_ref(&());
        match member.try_get::<ServiceImport>(&namespace, name).await? {
            None => {
                let mut import = ServiceImport::new(&namespace, name);
                import.metadata.owner_references = owner.map(|owner| vec![owner]);
                let import = member.create(&import).await?;
                info!(multi_cluster_service = %ObjectKey::of(mcs), service_import = %ObjectKey::of(&import), "Created service import");
                Ok(Some(import))
            }
            Some(import) if is_owned_by_other(mcs, &import) => Ok(None),
            Some(mut import) => {
                let Some(owner) = owner else {
                    return Ok(Some(import));
                };
                if import.owner_references().iter().any(|o| o.uid == owner.uid) {
                    return Ok(Some(import));
                }
                let references = import.metadata.owner_references.get_or_insert_with(Vec::new);
                references.retain(|o| o.controller != Some(true));
                references.push(owner);
                Ok(Some(member.update(&import).await?))
            }
        }
    }

    async fn create_or_update_derived_service(
        &self,
        mcs: &MultiClusterService,
        import: &ServiceImport,
        name: &str,
    ) -> Result<Service> {
        let member = &self.ctx.member;
        let namespace = &self.ctx.fleet_system_namespace;
        match member.try_get::<Service>(namespace, name).await? {
            Some(existing) => {
                let mut desired = existing.clone();
                format_derived_service(&mut desired, mcs, import);
                if desired == existing {
                    return Ok(existing);
                }
                debug!(multi_cluster_service = %ObjectKey::of(mcs), derived_service = %name, "Updating derived service");
                member.update(&desired).await
            }
            None => {
                let mut service = Service {
                    metadata: ObjectMeta {
                        namespace: Some(namespace.clone()),
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                format_derived_service(&mut service, mcs, import);
                let service = member.create(&service).await?;
                info!(multi_cluster_service = %ObjectKey::of(mcs), derived_service = %name, "Created derived service");
                Ok(service)
            }
        }
    }
}

#[async_trait]
impl<S: ObjectStore> Reconciler for MultiClusterServiceReconciler<S> {
    fn name(&self) -> &'static str {
        "multiclusterservice"
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let member = &self.ctx.member;
        let Some(mut mcs) = member
            .try_get::<MultiClusterService>(&key.namespace, &key.name)
            .await?
        else {
            return Ok(ReconcileOutcome::Done);
        };

        if is_deleting(&mcs) {
            self.handle_delete(mcs).await?;
            return Ok(ReconcileOutcome::Done);
        }

        if add_finalizer(&mut mcs, MULTI_CLUSTER_SERVICE_FINALIZER) {
            mcs = member.update(&mcs).await?;
        }

        let import_name = mcs.spec.service_import.name.clone();
        if let Some(previous) = label(&mcs, SERVICE_IMPORT_LABEL).filter(|name| *name != import_name) {
            ignore_not_found(member.delete::<ServiceImport>(&key.namespace, previous).await)?;
            info!(multi_cluster_service = %key, service_import = %previous, "Removed previous service import");
        }
        self.persist_label(&mut mcs, SERVICE_IMPORT_LABEL, &import_name).await?;

        let Some(import) = self.ensure_service_import(&mcs, &import_name).await? else {
            debug!(multi_cluster_service = %key, service_import = %import_name, "Service import is owned by another multi-cluster service");
            self.handle_invalid_import(&mut mcs).await?;
            return Ok(ReconcileOutcome::RequeueAfter(MCS_RETRY_INTERVAL));
        };

        if !import.is_resolved() {
            debug!(multi_cluster_service = %key, service_import = %import_name, "Service import has not been granted yet");
            self.handle_invalid_import(&mut mcs).await?;
            return Ok(ReconcileOutcome::Done);
        }

        let derived = label(&mcs, DERIVED_SERVICE_LABEL)
            .map(str::to_string)
            .unwrap_or_else(|| generate_derived_service_name(&mcs));
        self.persist_label(&mut mcs, DERIVED_SERVICE_LABEL, &derived).await?;

        let service = self.create_or_update_derived_service(&mcs, &import, &derived).await?;
        self.update_status(&mut mcs, true, load_balancer_of(&service)).await?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, labels, service, FLEET_SYSTEM_NAMESPACE};
    use fleet_net_api::{ClusterStatus, ConditionStatus, MultiClusterServiceSpec, ServiceImportRef, ServiceImportStatus};
    use fleet_net_core::MemoryStore;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress as KubeLoadBalancerIngress, LoadBalancerStatus as KubeLoadBalancerStatus,
        ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn key() -> ObjectKey {
        ObjectKey::new("work", "app")
    }

    fn multi_cluster_service(import: &str) -> MultiClusterService {
        let mut mcs = MultiClusterService::new(
            "app",
            MultiClusterServiceSpec {
                service_import: ServiceImportRef {
                    name: import.to_string(),
                },
            },
        );
        mcs.metadata.namespace = Some("work".to_string());
        mcs
    }

    async fn grant(ctx: &MemberContext<MemoryStore>, name: &str) {
        let mut import: ServiceImport = ctx.member.get("work", name).await.unwrap();
        import.status = Some(ServiceImportStatus {
            import_type: Some("ClusterSetIP".to_string()),
            ports: vec![ServicePort {
                name: "http".to_string(),
                protocol: "TCP".to_string(),
                port: 80,
                ..Default::default()
            }],
            clusters: vec![ClusterStatus {
                cluster: "smartfish".to_string(),
            }],
        });
        ctx.member.update_status(&import).await.unwrap();
    }

    fn valid_status(mcs: &MultiClusterService) -> Option<ConditionStatus> {
        find_condition(mcs.conditions(), MULTI_CLUSTER_SERVICE_VALID).map(|c| c.status)
    }

    #[tokio::test]
    async fn test_import_and_derive_service() {
        let ctx = context();
        ctx.member.create(&multi_cluster_service("app")).await.unwrap();
        let reconciler = MultiClusterServiceReconciler::new(ctx.clone());

        assert_eq!(reconciler.reconcile(&key()).await.unwrap(), ReconcileOutcome::Done);
        let import: ServiceImport = ctx.member.get("work", "app").await.unwrap();
        let owner = &import.owner_references()[0];
        assert_eq!(owner.name, "app");
        assert_eq!(owner.controller, Some(true));
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        assert!(has_finalizer(&mcs, MULTI_CLUSTER_SERVICE_FINALIZER));
        assert_eq!(label(&mcs, SERVICE_IMPORT_LABEL), Some("app"));
        assert_eq!(label(&mcs, DERIVED_SERVICE_LABEL), None);
        assert_eq!(valid_status(&mcs), Some(ConditionStatus::Unknown));

        grant(&ctx, "app").await;
        assert_eq!(reconciler.reconcile(&key()).await.unwrap(), ReconcileOutcome::Done);
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        assert_eq!(label(&mcs, DERIVED_SERVICE_LABEL), Some("work-app"));
        assert_eq!(valid_status(&mcs), Some(ConditionStatus::True));

        let derived: Service = ctx.member.get(FLEET_SYSTEM_NAMESPACE, "work-app").await.unwrap();
        let spec = derived.spec.clone().unwrap_or_default();
        assert_eq!(spec.type_.as_deref(), Some(LOAD_BALANCER));
        let ports = spec.ports.unwrap_or_default();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 80);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(label(&derived, MULTI_CLUSTER_SERVICE_NAME_LABEL), Some("app"));
        assert_eq!(label(&derived, MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL), Some("work"));

        // the load balancer of the derived Service is reported back
        let mut derived = derived;
        derived.status = Some(ServiceStatus {
            load_balancer: Some(KubeLoadBalancerStatus {
                ingress: Some(vec![KubeLoadBalancerIngress {
                    ip: Some("20.1.2.3".to_string()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });
        ctx.member.update_status(&derived).await.unwrap();
        reconciler.reconcile(&key()).await.unwrap();
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        let ingress = mcs.status.unwrap_or_default().load_balancer.ingress;
        assert_eq!(ingress[0].ip.as_deref(), Some("20.1.2.3"));
    }

    #[tokio::test]
    async fn test_service_import_owned_by_other() {
        let ctx = context();
        let mut import = ServiceImport::new("work", "app");
        import.metadata.owner_references = Some(vec![OwnerReference {
            api_version: MultiClusterService::api_version(&()).into_owned(),
            kind: MultiClusterService::kind(&()).into_owned(),
            name: "other".to_string(),
            uid: "other-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);
        ctx.member.create(&import).await.unwrap();
        ctx.member.create(&multi_cluster_service("app")).await.unwrap();

        let outcome = MultiClusterServiceReconciler::new(ctx.clone())
            .reconcile(&key())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::RequeueAfter(MCS_RETRY_INTERVAL));
        let import: ServiceImport = ctx.member.get("work", "app").await.unwrap();
        assert_eq!(import.owner_references()[0].name, "other");
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        assert_eq!(valid_status(&mcs), Some(ConditionStatus::Unknown));
    }

    #[tokio::test]
    async fn test_switch_service_import() {
        let ctx = context();
        ctx.member.create(&ServiceImport::new("work", "old")).await.unwrap();
        let mut mcs = multi_cluster_service("app");
        mcs.metadata.labels = labels(&[(SERVICE_IMPORT_LABEL, "old")]);
        ctx.member.create(&mcs).await.unwrap();

        MultiClusterServiceReconciler::new(ctx.clone())
            .reconcile(&key())
            .await
            .unwrap();
        assert!(ctx.member.try_get::<ServiceImport>("work", "old").await.unwrap().is_none());
        assert!(ctx.member.try_get::<ServiceImport>("work", "app").await.unwrap().is_some());
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        assert_eq!(label(&mcs, SERVICE_IMPORT_LABEL), Some("app"));
    }

    #[tokio::test]
    async fn test_withdrawn_import_removes_derived_service() {
        let ctx = context();
        ctx.member.create(&multi_cluster_service("app")).await.unwrap();
        let reconciler = MultiClusterServiceReconciler::new(ctx.clone());
        reconciler.reconcile(&key()).await.unwrap();
        grant(&ctx, "app").await;
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(ctx.member.count::<Service>(), 1);

        // the hub no longer serves the import
        let mut import: ServiceImport = ctx.member.get("work", "app").await.unwrap();
        import.status = Some(ServiceImportStatus::default());
        ctx.member.update_status(&import).await.unwrap();

        assert_eq!(reconciler.reconcile(&key()).await.unwrap(), ReconcileOutcome::Done);
        assert_eq!(ctx.member.count::<Service>(), 0);
        let mcs: MultiClusterService = ctx.member.get("work", "app").await.unwrap();
        assert_eq!(label(&mcs, DERIVED_SERVICE_LABEL), None);
        assert_eq!(valid_status(&mcs), Some(ConditionStatus::Unknown));
    }

    #[tokio::test]
    async fn test_delete_removes_owned_objects() {
        let ctx = context();
        ctx.member.create(&multi_cluster_service("app")).await.unwrap();
        let reconciler = MultiClusterServiceReconciler::new(ctx.clone());
        reconciler.reconcile(&key()).await.unwrap();
        grant(&ctx, "app").await;
        reconciler.reconcile(&key()).await.unwrap();
        // an unrelated Service in fleet-system stays
        ctx.member
            .create(&service(FLEET_SYSTEM_NAMESPACE, "other", &[("http", "TCP", 80)]))
            .await
            .unwrap();

        ctx.member.delete::<MultiClusterService>("work", "app").await.unwrap();
        reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(ctx.member.count::<MultiClusterService>(), 0);
        assert_eq!(ctx.member.count::<ServiceImport>(), 0);
        assert!(ctx.member.try_get::<Service>(FLEET_SYSTEM_NAMESPACE, "work-app").await.unwrap().is_none());
        assert!(ctx.member.try_get::<Service>(FLEET_SYSTEM_NAMESPACE, "other").await.unwrap().is_some());
    }

    #[test]
    fn test_derived_service_name_falls_back_to_random() {
        let mut mcs = multi_cluster_service("app");
        assert_eq!(generate_derived_service_name(&mcs), "work-app");
        mcs.metadata.namespace = Some("1work".to_string());
        let name = generate_derived_service_name(&mcs);
        assert_eq!(name.len(), FALLBACK_NAME_LENGTH);
        assert!(is_dns1035_label(&name));
    }
}
