//! Object store seam
//!
//! [`ObjectStore`] is the raw CRUD surface of the API server. It does no
//! retrying of its own; [`super::RetryClient`] layers the retry policy on top.

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::{DynamicObject, WatchEvent};
use kube::core::GroupVersionKind;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use super::discovery::ResourceType;
use crate::Error;
use crate::object::ObjectKey;

/// Event stream for a single watched object
///
/// Ends when the server closes the watch; nothing reconnects it.
pub type EventStream = BoxStream<'static, Result<WatchEvent<DynamicObject>, Error>>;

/// Scope of a list or delete-collection call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Restrict to one namespace; `None` spans all namespaces
    pub namespace: Option<String>,
    /// Label selector in API server syntax (e.g. `app=web,tier!=db`)
    pub label_selector: Option<String>,
}

impl ListQuery {
    /// Query every object of a kind
    pub fn all() -> Self {
        Self::default()
    }

    /// Query one namespace
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            label_selector: None,
        }
    }

    /// Add a label selector
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// CRUD access to the API server
///
/// Errors from the server are reported as [`Error::Kube`] so the classifiers in
/// [`crate::error`] can recognize NotFound, AlreadyExists and Conflict.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read one object by identity
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, Error>;

    /// List objects of a kind
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<Vec<DynamicObject>, Error>;

    /// Create a new object; fails with AlreadyExists if the identity is taken
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace an object; its resourceVersion must match the stored one
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Apply a JSON merge patch to `obj`'s identity
    ///
    /// A `metadata.resourceVersion` inside the patch is a precondition.
    async fn patch(&self, obj: &DynamicObject, patch: &Value) -> Result<DynamicObject, Error>;

    /// Delete one object
    async fn delete(&self, obj: &DynamicObject) -> Result<(), Error>;

    /// Delete every object of a kind matching `query`
    async fn delete_all_of(&self, gvk: &GroupVersionKind, query: &ListQuery) -> Result<(), Error>;

    /// Replace the status subresource
    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Merge-patch the status subresource
    async fn patch_status(
        &self,
        obj: &DynamicObject,
        patch: &Value,
    ) -> Result<DynamicObject, Error>;

    /// Open an event stream for the single object `key`
    ///
    /// A watch the server refuses is an error here, not an item of the stream.
    async fn watch(&self, resource: &ResourceType, key: &ObjectKey) -> Result<EventStream, Error>;
}
