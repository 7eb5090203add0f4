use std::sync::Arc;

use anyhow::Result;
use fleet_net_api::{
    EndpointSliceExport, EndpointSliceImport, InternalMemberCluster, InternalServiceExport,
    InternalServiceImport, MultiClusterService, ServiceExport, ServiceImport,
};
use fleet_net_core::controller::object_ref;
use fleet_net_core::objectmeta::{
    label, MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL, MULTI_CLUSTER_SERVICE_NAME_LABEL, SERVICE_NAME_LABEL,
};
use fleet_net_core::{run_controller, serve_metrics, FleetMetrics, KubeStore, MemberAgentConfig, ObjectKey};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::config::KubeConfigOptions;
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod context;
mod endpoint_slice_controller;
mod endpoint_slice_export_controller;
mod endpoint_slice_import_controller;
mod internal_member_cluster_controller;
mod internal_service_export_controller;
mod internal_service_import_controller;
mod multi_cluster_service_controller;
mod service_export_controller;
mod service_import_controller;

#[cfg(test)]
mod testing;

use context::MemberContext;
use endpoint_slice_controller::EndpointSliceReconciler;
use endpoint_slice_export_controller::EndpointSliceExportReconciler;
use endpoint_slice_import_controller::EndpointSliceImportReconciler;
use internal_member_cluster_controller::InternalMemberClusterReconciler;
use internal_service_export_controller::InternalServiceExportReconciler;
use internal_service_import_controller::InternalServiceImportReconciler;
use multi_cluster_service_controller::MultiClusterServiceReconciler;
use service_export_controller::{internal_service_export_name, ServiceExportReconciler};
use service_import_controller::{internal_service_import_name, ServiceImportReconciler};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Client for the hub cluster, from a named kubeconfig context when one is configured.
async fn hub_client(config: &MemberAgentConfig) -> Result<Client> {
    let Some(context) = config.hub_kubeconfig_context.clone() else {
        return Ok(Client::try_default().await?);
    };
    let options = KubeConfigOptions {
        context: Some(context),
        ..Default::default()
    };
    let kube_config = kube::Config::from_kubeconfig(&options).await?;
    Ok(Client::try_from(kube_config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = MemberAgentConfig::from_env()?;
    init_tracing(config.log_json);

    info!(
        member_cluster = %config.member_cluster_id,
        hub_namespace = %config.hub_namespace,
        "Starting member-net-controller..."
    );

    let member_client = Client::try_default().await?;
    let hub_client = hub_client(&config).await?;
    let metrics = FleetMetrics::new()?;
    let ctx = Arc::new(MemberContext::new(
        Arc::new(KubeStore::new(member_client.clone())),
        Arc::new(KubeStore::new(hub_client.clone())),
        &config,
        metrics.clone(),
    ));

    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_addr, metrics).await {
            error!(error = %e, "Metrics server error");
        }
    });

    let resync = config.resync_period;
    let hub_namespace = config.hub_namespace.clone();
    let watch = watcher::Config::default;

    // ServiceExport, re-triggered by changes of the Service it exports
    let service_exports = Controller::new(Api::<ServiceExport>::all(member_client.clone()), watch())
        .watches(Api::<Service>::all(member_client.clone()), watch(), |service| {
            Some(object_ref::<ServiceExport>(&ObjectKey::of(&service)))
        });

    // EndpointSlice, re-triggered for every slice of a Service whose export changes
    let endpoint_slices = Controller::new(Api::<EndpointSlice>::all(member_client.clone()), watch());
    let slice_store = endpoint_slices.store();
    let endpoint_slices = endpoint_slices.watches(
        Api::<ServiceExport>::all(member_client.clone()),
        watch(),
        move |export| {
            let namespace = export.namespace();
            let name = export.name_any();
            slice_store
                .state()
                .into_iter()
                .filter(|slice| {
                    slice.namespace() == namespace && label(slice.as_ref(), SERVICE_NAME_LABEL) == Some(name.as_str())
                })
                .map(|slice| ObjectRef::from_obj(slice.as_ref()))
                .collect::<Vec<_>>()
        },
    );

    let endpoint_slice_exports = Controller::new(
        Api::<EndpointSliceExport>::namespaced(hub_client.clone(), &hub_namespace),
        watch(),
    );

    let endpoint_slice_imports = Controller::new(
        Api::<EndpointSliceImport>::namespaced(hub_client.clone(), &hub_namespace),
        watch(),
    );

    let service_imports = Controller::new(Api::<ServiceImport>::all(member_client.clone()), watch());

    // hub mirrors, re-triggered by changes of their member source
    let ise_namespace = hub_namespace.clone();
    let internal_service_exports = Controller::new(
        Api::<InternalServiceExport>::namespaced(hub_client.clone(), &hub_namespace),
        watch(),
    )
    .watches(Api::<ServiceExport>::all(member_client.clone()), watch(), move |export| {
        let name = internal_service_export_name(&export.namespace().unwrap_or_default(), &export.name_any());
        Some(object_ref::<InternalServiceExport>(&ObjectKey::new(ise_namespace.clone(), name)))
    });

    let isi_namespace = hub_namespace.clone();
    let internal_service_imports = Controller::new(
        Api::<InternalServiceImport>::namespaced(hub_client.clone(), &hub_namespace),
        watch(),
    )
    .watches(Api::<ServiceImport>::all(member_client.clone()), watch(), move |import| {
        let name = internal_service_import_name(&import.namespace().unwrap_or_default(), &import.name_any());
        Some(object_ref::<InternalServiceImport>(&ObjectKey::new(isi_namespace.clone(), name)))
    });

    // MultiClusterService, re-triggered by its ServiceImport and by its derived Service
    let multi_cluster_services = Controller::new(Api::<MultiClusterService>::all(member_client.clone()), watch())
        .owns(Api::<ServiceImport>::all(member_client.clone()), watch())
        .watches(
            Api::<Service>::namespaced(member_client.clone(), &config.fleet_system_namespace),
            watch(),
            |service| {
                let name = label(&service, MULTI_CLUSTER_SERVICE_NAME_LABEL)?;
                let namespace = label(&service, MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL)?;
                Some(object_ref::<MultiClusterService>(&ObjectKey::new(namespace, name)))
            },
        );

    let internal_member_clusters = Controller::new(
        Api::<InternalMemberCluster>::namespaced(hub_client.clone(), &hub_namespace),
        watch(),
    );

    tokio::join!(
        run_controller(service_exports, Arc::new(ServiceExportReconciler::new(ctx.clone())), resync),
        run_controller(endpoint_slices, Arc::new(EndpointSliceReconciler::new(ctx.clone())), resync),
        run_controller(
            endpoint_slice_exports,
            Arc::new(EndpointSliceExportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(
            endpoint_slice_imports,
            Arc::new(EndpointSliceImportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(service_imports, Arc::new(ServiceImportReconciler::new(ctx.clone())), resync),
        run_controller(
            internal_service_exports,
            Arc::new(InternalServiceExportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(
            internal_service_imports,
            Arc::new(InternalServiceImportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(
            multi_cluster_services,
            Arc::new(MultiClusterServiceReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(
            internal_member_clusters,
            Arc::new(InternalMemberClusterReconciler::new(ctx.clone())),
            resync,
        ),
    );

    info!("Shutdown signal received, exiting...");
    Ok(())
}
