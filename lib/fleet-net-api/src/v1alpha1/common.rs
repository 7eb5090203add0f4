use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ExportedObjectReference records where a replicated object came from.
///
/// Once set on creation, `uid` never changes; it is the only field used to decide whether a
/// replica still belongs to the source object that names it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportedObjectReference {
    /// ID of the member cluster the object was exported from
    pub cluster_id: String,
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// Resource version of the source object observed at export time
    #[serde(default)]
    pub resource_version: String,
    /// Generation of the source object observed at export time
    #[serde(default)]
    pub generation: i64,
    /// UID of the source object
    pub uid: String,
    /// `namespace/name` of the source object, kept for field indexing
    pub namespaced_name: String,
    /// When the current state of the source object became eligible for export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported_since: Option<DateTime<Utc>>,
}

impl ExportedObjectReference {
    /// Builds a reference to `obj` as exported from cluster `cluster_id`.
    pub fn from_object<K>(cluster_id: &str, obj: &K, exported_since: DateTime<Utc>) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = obj.meta();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let name = meta.name.clone().unwrap_or_default();
        Self {
            cluster_id: cluster_id.to_string(),
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespaced_name: format!("{namespace}/{name}"),
            namespace,
            name,
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            generation: meta.generation.unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
            exported_since: Some(exported_since),
        }
    }

    /// Refreshes the mutable part of the reference. Identity fields are left untouched.
    pub fn update_from_object<K>(&mut self, obj: &K, exported_since: DateTime<Utc>)
    where
        K: Resource<DynamicType = ()>,
    {
        let meta = obj.meta();
        self.resource_version = meta.resource_version.clone().unwrap_or_default();
        self.generation = meta.generation.unwrap_or_default();
        self.exported_since = Some(exported_since);
    }

    /// Whether this reference points at the object with the given UID.
    pub fn is_linked_to(&self, uid: Option<&str>) -> bool {
        matches!(uid, Some(uid) if !uid.is_empty() && uid == self.uid)
    }
}

/// Target port of an exported Service port, either a number or a named container port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

/// A port exposed by an exported Service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// TCP, UDP or SCTP
    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,

    pub port: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<TargetPort>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Status of a condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Condition for fleet networking object status
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    pub status: ConditionStatus,

    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation of the object the condition was computed against
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// A member cluster that currently serves an imported Service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterStatus {
    pub cluster: String,
}

/// Discovery information of an imported Service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceImportStatus {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub import_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<ClusterStatus>,
}

impl ServiceImportStatus {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Member cluster namespaces on the hub that have claimed a ServiceImport, keyed by namespace
/// with the claiming cluster ID as value. Serialized as JSON into an annotation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInUseBy {
    #[serde(rename = "MemberClusters", default)]
    pub member_clusters: BTreeMap<String, String>,
}

impl ServiceInUseBy {
    pub fn from_annotation(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    pub fn to_annotation(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
