use std::sync::Arc;

use anyhow::Result;
use fleet_net_api::{
    EndpointSliceExport, InternalServiceExport, InternalServiceImport, MemberCluster, ServiceImport,
};
use fleet_net_core::controller::object_ref;
use fleet_net_core::{run_controller, serve_metrics, FleetMetrics, HubAgentConfig, KubeStore, ObjectKey};
use kube::{Api, Client, ResourceExt};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{watcher, Controller};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod context;
mod endpoint_slice_export_controller;
mod internal_service_export_controller;
mod internal_service_import_controller;
mod member_cluster_controller;
mod service_import_controller;

#[cfg(test)]
mod testing;

use context::HubContext;
use endpoint_slice_export_controller::EndpointSliceExportReconciler;
use internal_service_export_controller::InternalServiceExportReconciler;
use internal_service_import_controller::InternalServiceImportReconciler;
use member_cluster_controller::MemberClusterReconciler;
use service_import_controller::ServiceImportReconciler;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = HubAgentConfig::from_env()?;
    init_tracing(config.log_json);

    info!(
        force_delete_wait_secs = config.force_delete_wait.as_secs(),
        "Starting hub-net-controller..."
    );

    let client = Client::try_default().await?;
    let metrics = FleetMetrics::new()?;
    let ctx = Arc::new(HubContext::new(
        Arc::new(KubeStore::new(client.clone())),
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
    let watch = watcher::Config::default;

    // import requests, re-triggered by changes of the ServiceImport they ask for
    let internal_service_imports = Controller::new(Api::<InternalServiceImport>::all(client.clone()), watch());
    let isi_store = internal_service_imports.store();
    let internal_service_imports = internal_service_imports.watches(
        Api::<ServiceImport>::all(client.clone()),
        watch(),
        move |import| {
            let namespaced_name = ObjectKey::of(&import).to_string();
            isi_store
                .state()
                .into_iter()
                .filter(|isi| isi.spec.service_import_reference.namespaced_name == namespaced_name)
                .map(|isi| ObjectRef::from_obj(isi.as_ref()))
                .collect::<Vec<_>>()
        },
    );

    let internal_service_exports = Controller::new(Api::<InternalServiceExport>::all(client.clone()), watch());

    // ServiceImport, re-triggered by changes of the exports it is resolved from
    let service_imports = Controller::new(Api::<ServiceImport>::all(client.clone()), watch()).watches(
        Api::<InternalServiceExport>::all(client.clone()),
        watch(),
        |ise| {
            let reference = &ise.spec.service_reference;
            Some(object_ref::<ServiceImport>(&ObjectKey::new(
                reference.namespace.clone(),
                reference.name.clone(),
            )))
        },
    );

    // EndpointSliceExport, re-triggered when the claim on its ServiceImport changes
    let endpoint_slice_exports = Controller::new(Api::<EndpointSliceExport>::all(client.clone()), watch());
    let ese_store = endpoint_slice_exports.store();
    let endpoint_slice_exports = endpoint_slice_exports.watches(
        Api::<ServiceImport>::all(client.clone()),
        watch(),
        move |import| {
            let namespace = import.namespace().unwrap_or_default();
            let name = import.name_any();
            ese_store
                .state()
                .into_iter()
                .filter(|ese| {
                    let owner = &ese.spec.owner_service_reference;
                    owner.namespace == namespace && owner.name == name
                })
                .map(|ese| ObjectRef::from_obj(ese.as_ref()))
                .collect::<Vec<_>>()
        },
    );

    let member_clusters = Controller::new(Api::<MemberCluster>::all(client.clone()), watch());

    tokio::join!(
        run_controller(
            internal_service_imports,
            Arc::new(InternalServiceImportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(
            internal_service_exports,
            Arc::new(InternalServiceExportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(service_imports, Arc::new(ServiceImportReconciler::new(ctx.clone())), resync),
        run_controller(
            endpoint_slice_exports,
            Arc::new(EndpointSliceExportReconciler::new(ctx.clone())),
            resync,
        ),
        run_controller(member_clusters, Arc::new(MemberClusterReconciler::new(ctx.clone())), resync),
    );

    info!("Shutdown signal received, exiting...");
    Ok(())
}
