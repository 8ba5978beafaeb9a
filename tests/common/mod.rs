//! Shared fixtures for integration tests
//!
//! [`MemoryStore`] behaves like a single API server for the purposes of the
//! harness: it assigns resource versions, rejects duplicate creates and
//! enforces optimistic concurrency on updates and patches.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::Value;

use lattice_harness::Error;
use lattice_harness::client::{
    EventStream, ListQuery, ObjectStore, ResourceType, RetryClient, StaticDiscovery,
};
use lattice_harness::error::api_error;
use lattice_harness::object::{ObjectKey, gvk_display, gvk_of, object_key, resource_id};

type StoreKey = (String, Option<String>, String);

fn store_key(gvk: &GroupVersionKind, key: &ObjectKey) -> StoreKey {
    (gvk_display(gvk), key.namespace.clone(), key.name.clone())
}

/// In-memory object store with server-assigned resource versions
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<StoreKey, DynamicObject>>,
    version: AtomicU64,
    /// Number of `patch` calls that should fail with a Conflict before
    /// patches start succeeding
    pub conflicts_to_inject: AtomicUsize,
    /// Calls per operation name
    pub calls: Mutex<BTreeMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current stored copy of `obj`'s identity
    pub fn stored(&self, obj: &DynamicObject) -> Option<DynamicObject> {
        let key = store_key(&gvk_of(obj).ok()?, &object_key(obj));
        self.objects.lock().unwrap().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn call_count(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or_default()
    }

    /// Remove an object without going through the API
    pub fn remove(&self, obj: &DynamicObject) {
        let key = store_key(&gvk_of(obj).unwrap(), &object_key(obj));
        self.objects.lock().unwrap().remove(&key);
    }

    fn record(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn key_of(obj: &DynamicObject) -> Result<StoreKey, Error> {
        Ok(store_key(&gvk_of(obj)?, &object_key(obj)))
    }

    fn not_found(obj: &DynamicObject) -> Error {
        api_error(404, "NotFound", format!("{} not found", resource_id(obj)))
    }

    fn conflict(obj: &DynamicObject) -> Error {
        api_error(
            409,
            "Conflict",
            format!(
                "Operation cannot be fulfilled on {}: the object has been modified",
                resource_id(obj)
            ),
        )
    }

    fn check_version(stored: &DynamicObject, requested: Option<&str>) -> Result<(), Error> {
        match requested {
            Some(version) if Some(version) != stored.metadata.resource_version.as_deref() => {
                Err(Self::conflict(stored))
            }
            _ => Ok(()),
        }
    }

    fn apply_patch(
        &self,
        obj: &DynamicObject,
        patch: &Value,
        status_only: bool,
    ) -> Result<DynamicObject, Error> {
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get(&key).ok_or_else(|| Self::not_found(obj))?;

        if !status_only
            && self
                .conflicts_to_inject
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(Self::conflict(stored));
        }

        let requested = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        Self::check_version(stored, requested)?;

        let mut doc = serde_json::to_value(stored).unwrap();
        let patch = if status_only {
            serde_json::json!({ "status": patch.get("status").cloned().unwrap_or(Value::Null) })
        } else {
            patch.clone()
        };
        merge(&mut doc, &patch);

        let mut updated: DynamicObject = serde_json::from_value(doc).unwrap();
        updated.metadata.resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

/// RFC 7386 merge: `null` removes, objects recurse, anything else replaces
fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn in_query(obj: &DynamicObject, query: &ListQuery) -> bool {
    let namespace_ok = query
        .namespace
        .as_deref()
        .is_none_or(|ns| obj.metadata.namespace.as_deref() == Some(ns));
    let labels_ok = query.label_selector.as_deref().is_none_or(|selector| {
        let labels = obj.metadata.labels.clone().unwrap_or_default();
        selector.split(',').filter(|s| !s.is_empty()).all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(term),
        })
    });
    namespace_ok && labels_ok
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, Error> {
        self.record("get");
        self.objects
            .lock()
            .unwrap()
            .get(&store_key(gvk, key))
            .cloned()
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {} not found", gvk.kind, key)))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<Vec<DynamicObject>, Error> {
        self.record("list");
        let kind = gvk_display(gvk);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _, _), obj)| *k == kind && in_query(obj, query))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.record("create");
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("{} already exists", resource_id(obj)),
            ));
        }
        let mut created = obj.clone();
        created.metadata.resource_version = Some(self.next_version());
        created.metadata.uid = Some(format!("uid-{}", key.2));
        objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.record("update");
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get(&key).ok_or_else(|| Self::not_found(obj))?;
        Self::check_version(stored, obj.metadata.resource_version.as_deref())?;

        let mut updated = obj.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch(&self, obj: &DynamicObject, patch: &Value) -> Result<DynamicObject, Error> {
        self.record("patch");
        self.apply_patch(obj, patch, false)
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), Error> {
        self.record("delete");
        let key = Self::key_of(obj)?;
        self.objects
            .lock()
            .unwrap()
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(obj))
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, query: &ListQuery) -> Result<(), Error> {
        self.record("delete_all_of");
        let kind = gvk_display(gvk);
        self.objects
            .lock()
            .unwrap()
            .retain(|(k, _, _), obj| !(*k == kind && in_query(obj, query)));
        Ok(())
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.record("update_status");
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let stored = objects.get(&key).ok_or_else(|| Self::not_found(obj))?;
        Self::check_version(stored, obj.metadata.resource_version.as_deref())?;

        // Replace: status becomes exactly what the caller sent
        let mut updated = stored.clone();
        let data = updated.data.as_object_mut().unwrap();
        match obj.data.get("status") {
            Some(status) => data.insert("status".to_string(), status.clone()),
            None => data.remove("status"),
        };
        updated.metadata.resource_version = Some(self.next_version());
        objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch_status(
        &self,
        obj: &DynamicObject,
        patch: &Value,
    ) -> Result<DynamicObject, Error> {
        self.record("patch_status");
        self.apply_patch(obj, patch, true)
    }

    async fn watch(&self, _resource: &ResourceType, key: &ObjectKey) -> Result<EventStream, Error> {
        self.record("watch");
        Err(Error::internal_with_context(
            "watch",
            format!("watch of {key} is not supported in memory"),
        ))
    }
}

/// Group/version/kind of the test custom resource
pub fn widget_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("example.dev", "v1", "Widget")
}

/// Discovery with the built-in kinds plus the namespaced Widget
pub fn discovery() -> Arc<StaticDiscovery> {
    let discovery = StaticDiscovery::with_defaults();
    discovery.register(&widget_gvk(), true);
    Arc::new(discovery)
}

/// Retrying client over a fresh in-memory store
pub fn client() -> (RetryClient, Arc<MemoryStore>, Arc<StaticDiscovery>) {
    let store = MemoryStore::new();
    let discovery = discovery();
    let client = RetryClient::new(store.clone(), discovery.clone());
    (client, store, discovery)
}
