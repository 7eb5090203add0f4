//! Handles shared by the hub reconcilers

use std::sync::Arc;
use std::time::Duration;

use fleet_net_core::{FleetMetrics, HubAgentConfig, ObjectStore};

pub struct HubContext<S> {
    pub hub: Arc<S>,
    pub metrics: FleetMetrics,
    /// Grace period before the leftovers of a departing member cluster are released
    pub force_delete_wait: Duration,
    /// Requeue delay while a ServiceImport has no resolved spec
    pub service_import_spec_wait: Duration,
}

impl<S: ObjectStore> HubContext<S> {
    pub fn new(hub: Arc<S>, config: &HubAgentConfig, metrics: FleetMetrics) -> Self {
        Self {
            hub,
            metrics,
            force_delete_wait: config.force_delete_wait,
            service_import_spec_wait: config.service_import_spec_wait,
        }
    }
}
