//! API server backed store and discovery
//!
//! [`KubeStore`] speaks to a real API server through `kube::Client` using
//! untyped `DynamicObject`s. [`KubeDiscovery`] resolves kinds lazily and
//! caches the answers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{Scope, pinned_kind};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info};

use super::discovery::{DiscoveryClient, ResourceType};
use super::store::{EventStream, ListQuery, ObjectStore};
use crate::Error;
use crate::object::{ObjectKey, gvk_display, gvk_of, object_key, resource_id};

/// Default connection timeout for kube clients (5s is plenty for a local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
///
/// Without a path the configuration is inferred (in-cluster or `$KUBECONFIG`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Discovery against the API server, cached per kind
///
/// Only successful lookups are cached: a kind that is missing now (e.g. a CRD
/// still being established) is looked up again on the next call.
pub struct KubeDiscovery {
    client: Client,
    entries: DashMap<GroupVersionKind, ResourceType>,
}

impl KubeDiscovery {
    /// Discovery with an empty cache
    pub fn new(client: Client) -> Self {
        Self {
            client,
            entries: DashMap::new(),
        }
    }

    /// Drop every cached mapping
    pub fn invalidate(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscovery {
    async fn resource_type(&self, gvk: &GroupVersionKind) -> Result<ResourceType, Error> {
        if let Some(entry) = self.entries.get(gvk) {
            return Ok(entry.value().clone());
        }

        let (api_resource, capabilities) = pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| Error::discovery(gvk_display(gvk), e.to_string()))?;

        let resource = ResourceType {
            api_resource,
            namespaced: matches!(capabilities.scope, Scope::Namespaced),
        };
        info!(
            resource = %gvk_display(gvk),
            plural = %resource.api_resource.plural,
            namespaced = resource.namespaced,
            "discovered resource type"
        );
        self.entries.insert(gvk.clone(), resource.clone());
        Ok(resource)
    }
}

/// [`ObjectStore`] over a `kube::Client`
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    discovery: Arc<dyn DiscoveryClient>,
}

impl KubeStore {
    /// Store resolving kinds through `discovery`
    pub fn new(client: Client, discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self { client, discovery }
    }

    /// Store with its own [`KubeDiscovery`]
    pub fn from_client(client: Client) -> Self {
        let discovery = Arc::new(KubeDiscovery::new(client.clone()));
        Self::new(client, discovery)
    }

    /// The discovery this store resolves kinds with
    pub fn discovery(&self) -> Arc<dyn DiscoveryClient> {
        self.discovery.clone()
    }

    /// Api addressing a single object
    ///
    /// A namespaced kind without a namespace falls back to the client's
    /// default namespace.
    async fn object_api(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<Api<DynamicObject>, Error> {
        let resource = self.discovery.resource_type(gvk).await?;
        Ok(scoped_api(&self.client, &resource, key.namespace.as_deref(), false))
    }

    /// Api for collection calls; a namespaced kind without a namespace spans all namespaces
    async fn collection_api(
        &self,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<Api<DynamicObject>, Error> {
        let resource = self.discovery.resource_type(gvk).await?;
        Ok(scoped_api(&self.client, &resource, query.namespace.as_deref(), true))
    }

    async fn api_for(&self, obj: &DynamicObject) -> Result<(Api<DynamicObject>, String), Error> {
        let gvk = gvk_of(obj)?;
        let key = object_key(obj);
        let api = self.object_api(&gvk, &key).await?;
        Ok((api, key.name))
    }
}

fn scoped_api(
    client: &Client,
    resource: &ResourceType,
    namespace: Option<&str>,
    all_when_unset: bool,
) -> Api<DynamicObject> {
    let ar = &resource.api_resource;
    match (resource.namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, ar),
        (true, None) if !all_when_unset => Api::default_namespaced_with(client.clone(), ar),
        _ => Api::all_with(client.clone(), ar),
    }
}

fn list_params(query: &ListQuery) -> ListParams {
    let mut params = ListParams::default();
    if let Some(selector) = &query.label_selector {
        params = params.labels(selector);
    }
    params
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<DynamicObject, Error> {
        let api = self.object_api(gvk, key).await?;
        Ok(api.get(&key.name).await?)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<Vec<DynamicObject>, Error> {
        let api = self.collection_api(gvk, query).await?;
        Ok(api.list(&list_params(query)).await?.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let (api, _) = self.api_for(obj).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let (api, name) = self.api_for(obj).await?;
        Ok(api.replace(&name, &PostParams::default(), obj).await?)
    }

    async fn patch(&self, obj: &DynamicObject, patch: &Value) -> Result<DynamicObject, Error> {
        let (api, name) = self.api_for(obj).await?;
        Ok(api
            .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, obj: &DynamicObject) -> Result<(), Error> {
        let (api, name) = self.api_for(obj).await?;
        api.delete(&name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_all_of(&self, gvk: &GroupVersionKind, query: &ListQuery) -> Result<(), Error> {
        let api = self.collection_api(gvk, query).await?;
        api.delete_collection(&DeleteParams::default(), &list_params(query))
            .await?;
        Ok(())
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let (api, name) = self.api_for(obj).await?;
        let body = serde_json::to_vec(obj)
            .map_err(|e| Error::serialization_for_kind(resource_id(obj), e.to_string()))?;
        Ok(api.replace_status(&name, &PostParams::default(), body).await?)
    }

    async fn patch_status(
        &self,
        obj: &DynamicObject,
        patch: &Value,
    ) -> Result<DynamicObject, Error> {
        let (api, name) = self.api_for(obj).await?;
        Ok(api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn watch(&self, resource: &ResourceType, key: &ObjectKey) -> Result<EventStream, Error> {
        let api = scoped_api(&self.client, resource, key.namespace.as_deref(), false);
        let params = WatchParams::default().fields(&format!("metadata.name={}", key.name));
        debug!(resource = %resource.api_resource.kind, object = %key, "opening watch");

        // One request from the current state; a dropped connection ends the stream
        let events = api.watch(&params, "0").await?;
        Ok(events.map_err(Error::from).boxed())
    }
}
