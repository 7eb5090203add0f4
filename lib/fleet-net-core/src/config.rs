//! Agent configuration read from the environment

use std::net::SocketAddr;
use std::time::Duration;

use crate::objectmeta::hub_namespace_for;
use crate::{FleetError, Result};

const DEFAULT_FLEET_SYSTEM_NAMESPACE: &str = "fleet-system";
const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(300);
const DEFAULT_FORCE_DELETE_WAIT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_SERVICE_IMPORT_SPEC_WAIT: Duration = Duration::from_secs(2);

/// Member agent configuration
#[derive(Clone, Debug, PartialEq)]
pub struct MemberAgentConfig {
    /// ID of this member cluster in the fleet
    pub member_cluster_id: String,
    /// Namespace reserved for this member in the hub
    pub hub_namespace: String,
    /// Namespace holding the derived Services and imported EndpointSlices
    pub fleet_system_namespace: String,
    /// Period of the full resync of every controller
    pub resync_period: Duration,
    pub metrics_addr: SocketAddr,
    /// Kubeconfig context of the hub cluster; the current context when unset
    pub hub_kubeconfig_context: Option<String>,
    pub log_json: bool,
}

impl Default for MemberAgentConfig {
    fn default() -> Self {
        Self {
            member_cluster_id: String::new(),
            hub_namespace: String::new(),
            fleet_system_namespace: DEFAULT_FLEET_SYSTEM_NAMESPACE.to_string(),
            resync_period: DEFAULT_RESYNC_PERIOD,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            hub_kubeconfig_context: None,
            log_json: false,
        }
    }
}

impl MemberAgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from a variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let member_cluster_id = lookup("FLEET_MEMBER_CLUSTER_ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                FleetError::InvalidConfiguration("FLEET_MEMBER_CLUSTER_ID is required".to_string())
            })?;
        let hub_namespace = lookup("FLEET_HUB_NAMESPACE")
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| hub_namespace_for(&member_cluster_id));

        Ok(Self {
            member_cluster_id,
            hub_namespace,
            fleet_system_namespace: lookup("FLEET_SYSTEM_NAMESPACE")
                .unwrap_or(defaults.fleet_system_namespace),
            resync_period: parse_seconds(&lookup, "FLEET_RESYNC_SECONDS")?
                .unwrap_or(defaults.resync_period),
            metrics_addr: parse_addr(&lookup, "FLEET_METRICS_ADDR")?.unwrap_or(defaults.metrics_addr),
            hub_kubeconfig_context: lookup("FLEET_HUB_KUBECONFIG_CONTEXT"),
            log_json: parse_bool(&lookup, "FLEET_LOG_JSON")?.unwrap_or(defaults.log_json),
        })
    }
}

/// Hub agent configuration
#[derive(Clone, Debug, PartialEq)]
pub struct HubAgentConfig {
    /// Grace period after a member cluster starts leaving before its leftovers are released
    pub force_delete_wait: Duration,
    /// Requeue delay while a ServiceImport spec has not been resolved yet
    pub service_import_spec_wait: Duration,
    pub resync_period: Duration,
    pub metrics_addr: SocketAddr,
    pub log_json: bool,
}

impl Default for HubAgentConfig {
    fn default() -> Self {
        Self {
            force_delete_wait: DEFAULT_FORCE_DELETE_WAIT,
            service_import_spec_wait: DEFAULT_SERVICE_IMPORT_SPEC_WAIT,
            resync_period: DEFAULT_RESYNC_PERIOD,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_json: false,
        }
    }
}

impl HubAgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            force_delete_wait: parse_seconds(&lookup, "FLEET_FORCE_DELETE_WAIT_SECONDS")?
                .unwrap_or(defaults.force_delete_wait),
            service_import_spec_wait: parse_seconds(&lookup, "FLEET_SERVICE_IMPORT_SPEC_WAIT_SECONDS")?
                .unwrap_or(defaults.service_import_spec_wait),
            resync_period: parse_seconds(&lookup, "FLEET_RESYNC_SECONDS")?
                .unwrap_or(defaults.resync_period),
            metrics_addr: parse_addr(&lookup, "FLEET_METRICS_ADDR")?.unwrap_or(defaults.metrics_addr),
            log_json: parse_bool(&lookup, "FLEET_LOG_JSON")?.unwrap_or(defaults.log_json),
        })
    }
}

fn parse_seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    lookup(key)
        .map(|value| {
            value.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                FleetError::InvalidConfiguration(format!("{key}={value} is not a number of seconds: {e}"))
            })
        })
        .transpose()
}

fn parse_addr(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<SocketAddr>> {
    lookup(key)
        .map(|value| {
            value.parse::<SocketAddr>().map_err(|e| {
                FleetError::InvalidConfiguration(format!("{key}={value} is not a socket address: {e}"))
            })
        })
        .transpose()
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(FleetError::InvalidConfiguration(format!("{key}={value} is not a boolean"))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_member_config_defaults() {
        let config = MemberAgentConfig::from_lookup(lookup(&[("FLEET_MEMBER_CLUSTER_ID", "bravelion")])).unwrap();
        assert_eq!(config.member_cluster_id, "bravelion");
        assert_eq!(config.hub_namespace, "fleet-member-bravelion");
        assert_eq!(config.fleet_system_namespace, "fleet-system");
        assert_eq!(config.resync_period, DEFAULT_RESYNC_PERIOD);
        assert!(!config.log_json);
    }

    #[test]
    fn test_member_config_requires_cluster_id() {
        let err = MemberAgentConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_member_config_overrides() {
        let config = MemberAgentConfig::from_lookup(lookup(&[
            ("FLEET_MEMBER_CLUSTER_ID", "bravelion"),
            ("FLEET_HUB_NAMESPACE", "bravelion"),
            ("FLEET_RESYNC_SECONDS", "30"),
            ("FLEET_METRICS_ADDR", "127.0.0.1:9000"),
            ("FLEET_LOG_JSON", "true"),
        ]))
        .unwrap();
        assert_eq!(config.hub_namespace, "bravelion");
        assert_eq!(config.resync_period, Duration::from_secs(30));
        assert_eq!(config.metrics_addr, "127.0.0.1:9000".parse().unwrap());
        assert!(config.log_json);
    }

    #[test]
    fn test_hub_config() {
        let config = HubAgentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, HubAgentConfig::default());

        let config =
            HubAgentConfig::from_lookup(lookup(&[("FLEET_FORCE_DELETE_WAIT_SECONDS", "60")])).unwrap();
        assert_eq!(config.force_delete_wait, Duration::from_secs(60));

        let err = HubAgentConfig::from_lookup(lookup(&[("FLEET_FORCE_DELETE_WAIT_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfiguration(_)));
    }
}
