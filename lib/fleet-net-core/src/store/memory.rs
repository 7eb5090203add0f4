//! In-memory object store

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde_json::Value;
use uuid::Uuid;

use super::{ListOptions, ObjectStore, StoreObject};
use crate::objectmeta::ObjectKey;
use crate::{FleetError, Result};

/// (apiVersion/kind, namespace, name)
type StoreKey = (String, String, String);

/// A single cluster held in memory, with the API server behaviours reconcilers rely on.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<StoreKey, Value>>,
    resource_version: AtomicU64,
}

fn type_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn store_key<K: StoreObject>(namespace: &str, name: &str) -> StoreKey {
    (type_key::<K>(), namespace.to_string(), name.to_string())
}

/// Everything but metadata and status
fn spec_part(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
        map.remove("apiVersion");
        map.remove("kind");
    }
    value
}

fn set_status(value: &mut Value, status: Option<&Value>) {
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) => {
                map.insert("status".to_string(), status.clone());
            }
            None => {
                map.remove("status");
            }
        }
    }
}

fn check_resource_version<K: StoreObject>(obj: &K, stored: &K, key: &ObjectKey) -> Result<()> {
    match obj.meta().resource_version.as_deref() {
        Some(rv) if !rv.is_empty() && Some(rv) != stored.meta().resource_version.as_deref() => {
            Err(FleetError::conflict(
                K::kind(&()),
                key.to_string(),
                "the object has been modified; please apply your changes to the latest version",
            ))
        }
        _ => Ok(()),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<StoreKey, Value>>> {
        self.objects
            .lock()
            .map_err(|e| FleetError::Internal(format!("memory store poisoned: {e}")))
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Number of objects of kind `K`, across namespaces.
    pub fn count<K: StoreObject>(&self) -> usize {
        let type_key = type_key::<K>();
        self.lock()
            .map(|objects| objects.keys().filter(|(t, _, _)| *t == type_key).count())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<K> {
        let objects = self.lock()?;
        match objects.get(&store_key::<K>(namespace, name)) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(FleetError::not_found(
                K::kind(&()),
                ObjectKey::new(namespace, name).to_string(),
            )),
        }
    }

    async fn list<K: StoreObject>(&self, options: &ListOptions) -> Result<Vec<K>> {
        let type_key = type_key::<K>();
        let objects = self.lock()?;
        let mut result = Vec::new();
        for ((t, _, _), value) in objects.iter() {
            if *t != type_key {
                continue;
            }
            let obj: K = serde_json::from_value(value.clone())?;
            if options.matches(&obj) {
                result.push(obj);
            }
        }
        Ok(result)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        if key.name.is_empty() {
            return Err(FleetError::Internal(format!("{} without a name", K::kind(&()))));
        }
        let mut objects = self.lock()?;
        let store_key = store_key::<K>(&key.namespace, &key.name);
        if objects.contains_key(&store_key) {
            return Err(FleetError::already_exists(K::kind(&()), key.to_string()));
        }

        let mut created = obj.clone();
        let meta = created.meta_mut();
        meta.uid = Some(Uuid::new_v4().to_string());
        meta.resource_version = Some(self.next_resource_version());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        objects.insert(store_key, serde_json::to_value(&created)?);
        Ok(created)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock()?;
        let store_key = store_key::<K>(&key.namespace, &key.name);
        let Some(stored_value) = objects.get(&store_key).cloned() else {
            return Err(FleetError::not_found(K::kind(&()), key.to_string()));
        };
        let stored: K = serde_json::from_value(stored_value.clone())?;
        check_resource_version(obj, &stored, &key)?;

        let spec_changed = spec_part(&serde_json::to_value(obj)?) != spec_part(&stored_value);
        let mut updated = obj.clone();
        let old = stored.meta();
        let meta = updated.meta_mut();
        meta.uid = old.uid.clone();
        meta.creation_timestamp = old.creation_timestamp.clone();
        meta.deletion_timestamp = old.deletion_timestamp.clone();
        meta.generation = match old.generation {
            Some(generation) if spec_changed => Some(generation + 1),
            generation => generation,
        };
        meta.resource_version = Some(self.next_resource_version());

        let released = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().map_or(true, Vec::is_empty);

        let mut value = serde_json::to_value(&updated)?;
        set_status(&mut value, stored_value.get("status"));
        let updated: K = serde_json::from_value(value.clone())?;

        if released {
            objects.remove(&store_key);
        } else {
            objects.insert(store_key, value);
        }
        Ok(updated)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock()?;
        let store_key = store_key::<K>(&key.namespace, &key.name);
        let Some(stored_value) = objects.get(&store_key).cloned() else {
            return Err(FleetError::not_found(K::kind(&()), key.to_string()));
        };
        let stored: K = serde_json::from_value(stored_value.clone())?;
        check_resource_version(obj, &stored, &key)?;

        let mut updated = stored;
        updated.meta_mut().resource_version = Some(self.next_resource_version());
        let mut value = serde_json::to_value(&updated)?;
        set_status(&mut value, serde_json::to_value(obj)?.get("status"));

        let updated: K = serde_json::from_value(value.clone())?;
        objects.insert(store_key, value);
        Ok(updated)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut objects = self.lock()?;
        let store_key = store_key::<K>(namespace, name);
        let Some(stored_value) = objects.get(&store_key).cloned() else {
            return Err(FleetError::not_found(
                K::kind(&()),
                ObjectKey::new(namespace, name).to_string(),
            ));
        };
        let mut stored: K = serde_json::from_value(stored_value.clone())?;
        let finalized = stored
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if !finalized {
            objects.remove(&store_key);
            return Ok(());
        }
        if stored.meta().deletion_timestamp.is_none() {
            let meta = stored.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(self.next_resource_version());
            let mut value = serde_json::to_value(&stored)?;
            set_status(&mut value, stored_value.get("status"));
            objects.insert(store_key, value);
        }
        Ok(())
    }
}
