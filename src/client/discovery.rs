//! Resource type discovery
//!
//! Maps a group/version/kind to the REST resource that serves it and whether
//! it is namespaced.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::DynamicObject;
use kube::core::{ApiResource, GroupVersionKind};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;
use crate::object::{ObjectKey, gvk_display, gvk_of, object_key};

/// Resolved REST mapping for a kind
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceType {
    /// Group, version, kind and plural of the resource
    pub api_resource: ApiResource,
    /// Whether objects of this kind live in a namespace
    pub namespaced: bool,
}

impl ResourceType {
    /// Mapping for a namespaced kind
    pub fn namespaced(api_resource: ApiResource) -> Self {
        Self {
            api_resource,
            namespaced: true,
        }
    }

    /// Mapping for a cluster-scoped kind
    pub fn cluster(api_resource: ApiResource) -> Self {
        Self {
            api_resource,
            namespaced: false,
        }
    }
}

/// Source of resource type mappings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Resolve `gvk`, failing with [`Error::Discovery`] when the server doesn't serve it
    async fn resource_type(&self, gvk: &GroupVersionKind) -> Result<ResourceType, Error>;
}

/// Kinds every cluster serves, with their scope
const DEFAULT_TYPES: &[(&str, &str, &str, bool)] = &[
    ("", "v1", "Pod", true),
    ("", "v1", "Namespace", false),
    ("", "v1", "Service", true),
    ("apps", "v1", "StatefulSet", true),
    ("apps", "v1", "Deployment", true),
    ("batch", "v1", "Job", true),
    ("batch", "v1", "CronJob", true),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", false),
];

/// In-process discovery with a fixed set of kinds
///
/// Seeded with the common built-in kinds; more can be added with
/// [`StaticDiscovery::register`]. Useful when no API server is reachable.
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    entries: DashMap<GroupVersionKind, ResourceType>,
}

impl StaticDiscovery {
    /// Discovery knowing no kinds at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// Discovery seeded with Pod, Namespace, Service, StatefulSet,
    /// Deployment, Job, CronJob and CustomResourceDefinition
    pub fn with_defaults() -> Self {
        let discovery = Self::empty();
        for (group, version, kind, namespaced) in DEFAULT_TYPES {
            discovery.register(&GroupVersionKind::gvk(group, version, kind), *namespaced);
        }
        discovery
    }

    /// Add (or replace) a kind
    pub fn register(&self, gvk: &GroupVersionKind, namespaced: bool) {
        let api_resource = ApiResource::from_gvk(gvk);
        debug!(
            resource = %gvk_display(gvk),
            plural = %api_resource.plural,
            namespaced,
            "registering resource type"
        );
        self.entries.insert(
            gvk.clone(),
            ResourceType {
                api_resource,
                namespaced,
            },
        );
    }

    /// Forget a kind
    pub fn unregister(&self, gvk: &GroupVersionKind) {
        self.entries.remove(gvk);
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn resource_type(&self, gvk: &GroupVersionKind) -> Result<ResourceType, Error> {
        self.entries
            .get(gvk)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::discovery(
                    gvk_display(gvk),
                    format!(
                        "no matches for kind {:?} in version {:?}",
                        gvk.kind,
                        gvk.api_version()
                    ),
                )
            })
    }
}

/// Place `obj` in `namespace` if its kind is namespaced and it has none yet
///
/// Cluster-scoped kinds and objects with an explicit namespace are left
/// alone. Returns the object's resulting key.
pub async fn namespaced(
    discovery: &dyn DiscoveryClient,
    obj: &mut DynamicObject,
    namespace: &str,
) -> Result<ObjectKey, Error> {
    let gvk = gvk_of(obj)?;
    let resource = discovery.resource_type(&gvk).await?;

    let unset = obj.metadata.namespace.as_deref().is_none_or(str::is_empty);
    if resource.namespaced && unset {
        obj.metadata.namespace = Some(namespace.to_string());
    }

    Ok(object_key(obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::new_resource;

    #[tokio::test]
    async fn test_defaults_know_core_kinds() {
        let discovery = StaticDiscovery::with_defaults();

        let pod = discovery
            .resource_type(&GroupVersionKind::gvk("", "v1", "Pod"))
            .await
            .unwrap();
        assert!(pod.namespaced);
        assert_eq!(pod.api_resource.plural, "pods");

        let ns = discovery
            .resource_type(&GroupVersionKind::gvk("", "v1", "Namespace"))
            .await
            .unwrap();
        assert!(!ns.namespaced);

        let crd = discovery
            .resource_type(&GroupVersionKind::gvk(
                "apiextensions.k8s.io",
                "v1",
                "CustomResourceDefinition",
            ))
            .await
            .unwrap();
        assert_eq!(crd.api_resource.plural, "customresourcedefinitions");
    }

    #[tokio::test]
    async fn test_unknown_kind_is_discovery_error() {
        let discovery = StaticDiscovery::with_defaults();
        let err = discovery
            .resource_type(&GroupVersionKind::gvk("example.dev", "v1", "Widget"))
            .await
            .unwrap_err();
        match err {
            Error::Discovery { resource, .. } => {
                assert_eq!(resource, "example.dev/v1, Kind=Widget")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let discovery = StaticDiscovery::empty();
        let gvk = GroupVersionKind::gvk("example.dev", "v1", "Widget");

        discovery.register(&gvk, true);
        assert!(discovery.resource_type(&gvk).await.is_ok());

        discovery.unregister(&gvk);
        assert!(discovery.resource_type(&gvk).await.is_err());
    }

    #[tokio::test]
    async fn test_namespaced_fills_only_namespaced_kinds() {
        let discovery = StaticDiscovery::with_defaults();

        let mut pod = new_resource("v1", "Pod", "web", "");
        let key = namespaced(&discovery, &mut pod, "team-a").await.unwrap();
        assert_eq!(key, ObjectKey::namespaced("team-a", "web"));

        let mut ns = new_resource("v1", "Namespace", "team-a", "");
        let key = namespaced(&discovery, &mut ns, "default").await.unwrap();
        assert_eq!(key, ObjectKey::cluster("team-a"));
        assert!(ns.metadata.namespace.is_none());
    }

    #[tokio::test]
    async fn test_namespaced_keeps_explicit_namespace() {
        let discovery = StaticDiscovery::with_defaults();
        let mut svc = new_resource("v1", "Service", "api", "prod");
        let key = namespaced(&discovery, &mut svc, "default").await.unwrap();
        assert_eq!(key.namespace.as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_namespaced_propagates_discovery_error() {
        let mut discovery = MockDiscoveryClient::new();
        discovery
            .expect_resource_type()
            .returning(|gvk| Err(Error::discovery(gvk_display(gvk), "server unavailable")));

        let mut widget = new_resource("example.dev/v1", "Widget", "w", "");
        let result = namespaced(&discovery, &mut widget, "default").await;
        assert!(matches!(result, Err(Error::Discovery { .. })));
        assert!(widget.metadata.namespace.is_none());
    }
}
