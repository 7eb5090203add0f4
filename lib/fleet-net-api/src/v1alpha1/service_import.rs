use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};

use super::{ServiceImportStatus, API_GROUP, API_VERSION};

/// ServiceImport describes a Service imported from the fleet.
///
/// In a member cluster it is the import request written by users; in the hub it is the
/// fleet-wide record for an exported Service, living in the Service's own namespace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceImport {
    pub metadata: ObjectMeta,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceImportStatus>,
}

impl ServiceImport {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    /// Status with an absent status treated as empty.
    pub fn status_or_default(&self) -> ServiceImportStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Whether the spec of the imported Service has been resolved by the hub.
    pub fn is_resolved(&self) -> bool {
        self.status.as_ref().is_some_and(|s| !s.clusters.is_empty())
    }
}

impl Resource for ServiceImport {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("ServiceImport")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(API_GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(API_VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("serviceimports")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
