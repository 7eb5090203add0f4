//! Kubernetes API backed object store

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::ErrorResponse;
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::{ListOptions, ObjectStore, StoreObject};
use crate::objectmeta::ObjectKey;
use crate::{FleetError, Result};

/// Object store talking to one cluster's API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        }
    }
}

fn to_dynamic<K: StoreObject>(obj: &K) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".to_string(), Value::from(K::api_version(&()).into_owned()));
        map.insert("kind".to_string(), Value::from(K::kind(&()).into_owned()));
    }
    Ok(serde_json::from_value(value)?)
}

fn from_dynamic<K: StoreObject>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn map_error<K: StoreObject>(err: kube::Error, key: &ObjectKey) -> FleetError {
    let kind = K::kind(&());
    match &err {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => FleetError::not_found(kind, key.to_string()),
        kube::Error::Api(ErrorResponse {
            code: 409, reason, ..
        }) if reason == "AlreadyExists" => FleetError::already_exists(kind, key.to_string()),
        kube::Error::Api(ErrorResponse {
            code: 409, message, ..
        }) => FleetError::conflict(kind, key.to_string(), message.clone()),
        _ => FleetError::KubernetesError(err),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        let key = ObjectKey::new(namespace, name);
        let obj = self
            .api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| map_error::<K>(e, &key))?;
        from_dynamic(obj)
    }

    async fn list<K: StoreObject>(&self, options: &ListOptions) -> Result<Vec<K>> {
        let namespace = options.namespace.clone().unwrap_or_default();
        let mut params = ListParams::default();
        if let Some(selector) = options.label_selector() {
            params = params.labels(&selector);
        }
        let list = self.api::<K>(&namespace).list(&params).await?;

        let mut objects = Vec::with_capacity(list.items.len());
        for item in list.items {
            let obj: K = from_dynamic(item)?;
            // custom field indexes are not served by the API server
            if options.matches(&obj) {
                objects.push(obj);
            }
        }
        debug!(kind = %K::kind(&()), namespace = %namespace, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let created = self
            .api::<K>(&key.namespace)
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error::<K>(e, &key))?;
        from_dynamic(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let updated = self
            .api::<K>(&key.namespace)
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_error::<K>(e, &key))?;
        from_dynamic(updated)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let data = serde_json::to_vec(&to_dynamic(obj)?)?;
        let updated = self
            .api::<K>(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| map_error::<K>(e, &key))?;
        from_dynamic(updated)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::new(namespace, name);
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_error::<K>(e, &key))?;
        Ok(())
    }
}
