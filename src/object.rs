//! Helpers for untyped Kubernetes objects
//!
//! Everything the harness sends to or reads from the API server is a
//! [`DynamicObject`]: identity lives in `types` + `metadata`, the rest of the
//! document (spec, status, data, ...) in `data`.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use serde_json::Value;

use crate::Error;

/// Annotation the Deployment controller bumps on every rollout
const DEPLOYMENT_REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Name and (for namespaced kinds) namespace of an object
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Object name
    pub name: String,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Split an apiVersion into (group, version); the core group is ""
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Render a GVK the way API server messages do
pub fn gvk_display(gvk: &GroupVersionKind) -> String {
    format!("{}, Kind={}", gvk.api_version(), gvk.kind)
}

/// The object's key, with an empty namespace treated as cluster scope
pub fn object_key(obj: &DynamicObject) -> ObjectKey {
    ObjectKey {
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: obj
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty()),
    }
}

/// The object's group/version/kind
///
/// Fails for documents without `apiVersion`/`kind`.
pub fn gvk_of(obj: &DynamicObject) -> Result<GroupVersionKind, Error> {
    let types = obj
        .types
        .as_ref()
        .filter(|t| !t.kind.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "object {} has no apiVersion/kind",
                object_key(obj)
            ))
        })?;
    let (group, version) = parse_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(&group, &version, &types.kind))
}

/// Human readable `Kind:namespace/name`
pub fn resource_id(obj: &DynamicObject) -> String {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    format!(
        "{}:{}/{}",
        kind,
        obj.metadata.namespace.as_deref().unwrap_or(""),
        obj.metadata.name.as_deref().unwrap_or("")
    )
}

/// Build a bare object with only identity set
pub fn new_resource(api_version: &str, kind: &str, name: &str, namespace: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: (!namespace.is_empty()).then(|| namespace.to_string()),
            ..Default::default()
        },
        data: Value::Object(Default::default()),
    }
}

/// Copy of `obj` placed in `namespace`, regardless of scope
///
/// Use [`crate::client::namespaced`] when the kind's scope matters.
pub fn with_namespace(obj: &DynamicObject, namespace: &str) -> DynamicObject {
    let mut copy = obj.clone();
    copy.metadata.namespace = Some(namespace.to_string());
    copy
}

/// Copy of `obj` with the top-level `key` (e.g. "spec", "status") replaced
pub fn with_key_value(obj: &DynamicObject, key: &str, value: Value) -> DynamicObject {
    let mut copy = obj.clone();
    if !copy.data.is_object() {
        copy.data = Value::Object(Default::default());
    }
    if let Some(map) = copy.data.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    copy
}

/// Copy of `obj` with its labels replaced
pub fn with_labels(obj: &DynamicObject, labels: BTreeMap<String, String>) -> DynamicObject {
    let mut copy = obj.clone();
    copy.metadata.labels = Some(labels);
    copy
}

/// Copy of `obj` with its annotations replaced
pub fn with_annotations(
    obj: &DynamicObject,
    annotations: BTreeMap<String, String>,
) -> DynamicObject {
    let mut copy = obj.clone();
    copy.metadata.annotations = Some(annotations);
    copy
}

/// Copy of `obj` with one annotation set
pub fn set_annotation(obj: &DynamicObject, key: &str, value: &str) -> DynamicObject {
    let mut copy = obj.clone();
    copy.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    copy
}

/// Whether `obj` is exactly one of `kinds` (group, version and kind)
pub fn matches_kind(obj: &DynamicObject, kinds: &[GroupVersionKind]) -> bool {
    match gvk_of(obj) {
        Ok(gvk) => kinds.iter().any(|k| *k == gvk),
        Err(_) => false,
    }
}

/// Carry the server-observed resourceVersion onto the desired object
///
/// The desired object's own resourceVersion is never trusted.
pub fn copy_resource_version(actual: &DynamicObject, expected: &mut DynamicObject) {
    expected.metadata.resource_version = actual.metadata.resource_version.clone();
}

/// Strip server-managed metadata before serializing or diffing
///
/// Removes resourceVersion, creationTimestamp, selfLink, uid, generation,
/// managedFields and the deployment revision annotation.
pub fn clean_for_marshalling(obj: &DynamicObject) -> DynamicObject {
    let mut copy = obj.clone();
    let meta = &mut copy.metadata;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.self_link = None;
    meta.uid = None;
    meta.generation = None;
    meta.managed_fields = None;

    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(DEPLOYMENT_REVISION_ANNOTATION);
    }
    if meta.annotations.as_ref().is_some_and(|a| a.is_empty()) {
        meta.annotations = None;
    }
    copy
}

/// JSON merge patch turning `current` into `desired`
///
/// Only fields `desired` sets and that differ from `current` are emitted;
/// fields missing from `desired` are never deleted, so server-populated state
/// (status, uid, timestamps) survives.
pub fn merge_patch(current: &Value, desired: &Value) -> Value {
    match (current, desired) {
        (Value::Object(cur), Value::Object(des)) => {
            let mut patch = serde_json::Map::new();
            for (key, want) in des {
                match cur.get(key) {
                    Some(have) if have == want => {}
                    Some(have) if have.is_object() && want.is_object() => {
                        patch.insert(key.clone(), merge_patch(have, want));
                    }
                    _ => {
                        patch.insert(key.clone(), want.clone());
                    }
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}
