//! Object store abstraction used by the reconcilers
//!
//! Reconcilers read and write cluster objects only through [`ObjectStore`]. In production the
//! store is backed by the Kubernetes API ([`KubeStore`]); tests use [`MemoryStore`], which
//! keeps the API server semantics the controllers depend on: not-found and already-exists
//! errors, optimistic concurrency on resource versions, generation bumps on spec changes,
//! finalizer-gated deletion and status as a separate subresource.

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use fleet_net_api::{
    EndpointSliceExport, EndpointSliceImport, InternalMemberCluster, InternalServiceExport,
    InternalServiceImport, MemberCluster, MultiClusterService, ServiceExport, ServiceImport,
};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::objectmeta::label;
use crate::Result;

pub mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// Index of MultiClusterServices by the name of the ServiceImport they request
pub const SERVICE_IMPORT_NAME_INDEX: &str = ".spec.serviceImport.name";
/// Index of InternalServiceImports by the `namespace/name` of the imported Service
pub const SERVICE_IMPORT_REFERENCE_INDEX: &str = ".spec.serviceImportReference.namespacedName";
/// Index of InternalServiceExports by the `namespace/name` of the exported Service
pub const SERVICE_REFERENCE_INDEX: &str = ".spec.serviceReference.namespacedName";
/// Index of EndpointSliceExports and EndpointSliceImports by owner Service `namespace/name`
pub const OWNER_SERVICE_REFERENCE_INDEX: &str = ".spec.ownerServiceReference.namespacedName";
/// Index of any object by name
pub const NAME_INDEX: &str = ".metadata.name";

/// An object the store can hold.
pub trait StoreObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Value of a spec field index for this object, if the type supports `key`.
    fn field_index(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Value of field index `key` for `obj`; the name index applies to every type.
pub fn index_value<K: StoreObject>(obj: &K, key: &str) -> Option<String> {
    if key == NAME_INDEX {
        return obj.meta().name.clone();
    }
    obj.field_index(key)
}

impl StoreObject for Service {}
impl StoreObject for EndpointSlice {}
impl StoreObject for ServiceExport {}
impl StoreObject for ServiceImport {}
impl StoreObject for MemberCluster {}
impl StoreObject for InternalMemberCluster {}

impl StoreObject for MultiClusterService {
    fn field_index(&self, key: &str) -> Option<String> {
        (key == SERVICE_IMPORT_NAME_INDEX).then(|| self.spec.service_import.name.clone())
    }
}

impl StoreObject for InternalServiceImport {
    fn field_index(&self, key: &str) -> Option<String> {
        (key == SERVICE_IMPORT_REFERENCE_INDEX)
            .then(|| self.spec.service_import_reference.namespaced_name.clone())
    }
}

impl StoreObject for InternalServiceExport {
    fn field_index(&self, key: &str) -> Option<String> {
        (key == SERVICE_REFERENCE_INDEX).then(|| self.spec.service_reference.namespaced_name.clone())
    }
}

impl StoreObject for EndpointSliceExport {
    fn field_index(&self, key: &str) -> Option<String> {
        (key == OWNER_SERVICE_REFERENCE_INDEX)
            .then(|| self.spec.owner_service_reference.namespaced_name.clone())
    }
}

impl StoreObject for EndpointSliceImport {
    fn field_index(&self, key: &str) -> Option<String> {
        (key == OWNER_SERVICE_REFERENCE_INDEX)
            .then(|| self.spec.owner_service_reference.namespaced_name.clone())
    }
}

/// Filter for [`ObjectStore::list`]. An unset namespace lists across all namespaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub field: Option<(String, String)>,
}

impl ListOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn namespaced(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_field(mut self, index: &str, value: &str) -> Self {
        self.field = Some((index.to_string(), value.to_string()));
        self
    }

    /// Kubernetes label selector for the label filter
    pub fn label_selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    pub fn matches<K: StoreObject>(&self, obj: &K) -> bool {
        if let Some(namespace) = &self.namespace {
            if obj.meta().namespace.as_deref().unwrap_or_default() != namespace {
                return false;
            }
        }
        if self
            .labels
            .iter()
            .any(|(k, v)| label(obj, k) != Some(v.as_str()))
        {
            return false;
        }
        match &self.field {
            Some((key, value)) => index_value(obj, key).as_deref() == Some(value.as_str()),
            None => true,
        }
    }
}

/// Typed access to the objects of one cluster.
///
/// `get` and `delete` return [`crate::FleetError::NotFound`] for absent objects; `create`
/// returns [`crate::FleetError::AlreadyExists`] for taken names; `update` and
/// `update_status` return [`crate::FleetError::Conflict`] when the object carries a stale
/// resource version. `update` never changes status and `update_status` changes nothing else.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K>;

    async fn list<K: StoreObject>(&self, options: &ListOptions) -> Result<Vec<K>>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;

    /// Like `get`, with not-found mapped to `None`.
    async fn try_get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        match self.get::<K>(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
