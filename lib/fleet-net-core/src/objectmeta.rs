//! Well-known annotations, labels and finalizers, plus helpers to manipulate object metadata

use std::fmt;

use kube::Resource;

/// Finalizer on a ServiceExport guarding its InternalServiceExport.
pub const SERVICE_EXPORT_CLEANUP_FINALIZER: &str = "networking.fleet.azure.com/svc-export-cleanup";
/// Finalizer on an InternalServiceExport guarding its entry in the ServiceImport status.
pub const INTERNAL_SERVICE_EXPORT_FINALIZER: &str =
    "networking.fleet.azure.com/internal-svc-export-cleanup";
/// Finalizer on a member ServiceImport guarding its InternalServiceImport, and on a hub
/// ServiceImport guarding its ServiceInUseBy annotation.
pub const SERVICE_IMPORT_CLEANUP_FINALIZER: &str = "networking.fleet.azure.com/serviceimport-cleanup";
/// Finalizer on an InternalServiceImport guarding its claim on the ServiceImport.
pub const INTERNAL_SERVICE_IMPORT_CLEANUP_FINALIZER: &str =
    "networking.fleet.azure.com/internalsvcimport-cleanup";
/// Finalizer on an EndpointSliceExport guarding the distributed EndpointSliceImports.
pub const ENDPOINT_SLICE_EXPORT_CLEANUP_FINALIZER: &str =
    "networking.fleet.azure.com/endpointsliceexport-cleanup";
/// Finalizer on an EndpointSliceImport guarding the imported EndpointSlice.
pub const ENDPOINT_SLICE_IMPORT_CLEANUP_FINALIZER: &str =
    "networking.fleet.azure.com/endpointsliceimport-cleanup";
/// Finalizer on a MultiClusterService guarding its derived Service and ServiceImport.
pub const MULTI_CLUSTER_SERVICE_FINALIZER: &str =
    "networking.fleet.azure.com/service-resources-cleanup";

/// Unique name assigned to an exported EndpointSlice.
pub const UNIQUE_NAME_ANNOTATION: &str = "networking.fleet.azure.com/fleet-unique-name";
/// JSON-encoded ServiceInUseBy on a hub ServiceImport.
pub const SERVICE_IN_USE_BY_ANNOTATION: &str = "networking.fleet.azure.com/service-in-use-by";
/// Name of the derived Service granted to a MultiClusterService.
pub const DERIVED_SERVICE_LABEL: &str = "networking.fleet.azure.com/derived-service";
/// Name of the ServiceImport created for a MultiClusterService.
pub const SERVICE_IMPORT_LABEL: &str = "networking.fleet.azure.com/service-import";
/// Name and namespace of the MultiClusterService a derived Service belongs to.
pub const MULTI_CLUSTER_SERVICE_NAME_LABEL: &str =
    "networking.fleet.azure.com/multi-cluster-service-name";
pub const MULTI_CLUSTER_SERVICE_NAMESPACE_LABEL: &str =
    "networking.fleet.azure.com/multi-cluster-service-namespace";

pub const LAST_SEEN_GENERATION_ANNOTATION: &str = "networking.fleet.azure.com/last-seen-generation";
pub const LAST_SEEN_RESOURCE_VERSION_ANNOTATION: &str =
    "networking.fleet.azure.com/last-seen-resource-version";
pub const LAST_SEEN_TIMESTAMP_ANNOTATION: &str = "networking.fleet.azure.com/last-seen-timestamp";
pub const LAST_OBSERVED_GENERATION_ANNOTATION: &str =
    "networking.fleet.azure.com/last-observed-generation";

/// Label naming the Service an EndpointSlice belongs to.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
/// Label naming the controller managing an EndpointSlice.
pub const MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";
/// `MANAGED_BY_LABEL` value on EndpointSlices imported from the fleet
pub const ENDPOINT_SLICE_IMPORT_MANAGER: &str = "endpointsliceimport-controller.networking.fleet.azure.com";

/// Format of a member cluster's reserved namespace in the hub.
pub fn hub_namespace_for(member_cluster: &str) -> String {
    format!("fleet-member-{member_cluster}")
}

/// Namespace and name of an object. Cluster-scoped objects use an empty namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new(String::new(), name)
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Adds `finalizer`; returns false if it was already present.
pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Removes `finalizer`; returns false if it was absent.
pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) -> bool {
    let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

pub fn annotation<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn set_annotation<K: Resource>(obj: &mut K, key: &str, value: impl Into<String>) {
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.into());
}

/// Removes annotation `key`; returns false if it was absent.
pub fn remove_annotation<K: Resource>(obj: &mut K, key: &str) -> bool {
    obj.meta_mut()
        .annotations
        .as_mut()
        .and_then(|a| a.remove(key))
        .is_some()
}

/// Sets label `key`; returns false if it already had `value`.
pub fn set_label<K: Resource>(obj: &mut K, key: &str, value: &str) -> bool {
    let labels = obj.meta_mut().labels.get_or_insert_with(Default::default);
    if labels.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    labels.insert(key.to_string(), value.to_string());
    true
}

/// Removes label `key`; returns false if it was absent.
pub fn remove_label<K: Resource>(obj: &mut K, key: &str) -> bool {
    obj.meta_mut()
        .labels
        .as_mut()
        .and_then(|l| l.remove(key))
        .is_some()
}

pub fn label<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    #[test]
    fn test_finalizer_helpers() {
        let mut svc = Service::default();
        assert!(!has_finalizer(&svc, SERVICE_EXPORT_CLEANUP_FINALIZER));
        assert!(add_finalizer(&mut svc, SERVICE_EXPORT_CLEANUP_FINALIZER));
        assert!(!add_finalizer(&mut svc, SERVICE_EXPORT_CLEANUP_FINALIZER));
        assert_eq!(svc.metadata.finalizers.as_ref().map(Vec::len), Some(1));
        assert!(remove_finalizer(&mut svc, SERVICE_EXPORT_CLEANUP_FINALIZER));
        assert!(!remove_finalizer(&mut svc, SERVICE_EXPORT_CLEANUP_FINALIZER));
    }

    #[test]
    fn test_annotation_helpers() {
        let mut svc = Service::default();
        assert_eq!(annotation(&svc, UNIQUE_NAME_ANNOTATION), None);
        set_annotation(&mut svc, UNIQUE_NAME_ANNOTATION, "a-b-c-12345");
        assert_eq!(annotation(&svc, UNIQUE_NAME_ANNOTATION), Some("a-b-c-12345"));
        assert!(remove_annotation(&mut svc, UNIQUE_NAME_ANNOTATION));
        assert!(!remove_annotation(&mut svc, UNIQUE_NAME_ANNOTATION));
    }

    #[test]
    fn test_label_helpers() {
        let mut svc = Service::default();
        assert!(set_label(&mut svc, DERIVED_SERVICE_LABEL, "work-app"));
        assert!(!set_label(&mut svc, DERIVED_SERVICE_LABEL, "work-app"));
        assert_eq!(label(&svc, DERIVED_SERVICE_LABEL), Some("work-app"));
        assert!(set_label(&mut svc, DERIVED_SERVICE_LABEL, "other"));
        assert!(remove_label(&mut svc, DERIVED_SERVICE_LABEL));
        assert!(!remove_label(&mut svc, DERIVED_SERVICE_LABEL));
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("work", "app").to_string(), "work/app");
        assert_eq!(ObjectKey::cluster_scoped("bravelion").to_string(), "bravelion");
        assert_eq!(hub_namespace_for("bravelion"), "fleet-member-bravelion");
    }
}
