//! Retrying client over the object store
//!
//! [`RetryClient`] is what test steps talk to. Every read and write goes
//! through [`crate::retry::retry`] tolerating only malformed-response parse
//! errors; on top of that it provides create-or-update, single-object watches
//! and the deletion and CRD-availability waits.

pub mod discovery;
pub mod kube;
pub mod store;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ::kube::api::DynamicObject;
use ::kube::core::GroupVersionKind;
use serde_json::Value;
use tracing::{debug, info};

pub use discovery::{DiscoveryClient, ResourceType, StaticDiscovery, namespaced};
pub use store::{EventStream, ListQuery, ObjectStore};

use crate::Error;
use crate::context::Context;
use crate::error::{is_already_exists, is_conflict, is_json_syntax_error, is_not_found};
use crate::manifest;
use crate::object::{
    ObjectKey, copy_resource_version, gvk_display, gvk_of, matches_kind, merge_patch, object_key,
    resource_id,
};
use crate::polling::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT, poll_immediate};
use crate::retry::{ErrorClassifier, retry};
use crate::scheme::{APIEXTENSIONS_GROUP, CRD_KIND};

/// Namespace given to namespaced manifests that don't name one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Manifest file extensions picked up by [`RetryClient::install_manifests`]
const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Result of [`RetryClient::create_or_update`]
#[derive(Clone, Debug)]
pub enum ReconcileOutcome {
    /// The object did not exist and was created
    Created(DynamicObject),
    /// The object existed and was patched
    Updated(DynamicObject),
}

impl ReconcileOutcome {
    /// Whether an existing object was updated
    pub fn updated(&self) -> bool {
        matches!(self, ReconcileOutcome::Updated(_))
    }

    /// The object as the server returned it
    pub fn object(&self) -> &DynamicObject {
        match self {
            ReconcileOutcome::Created(obj) | ReconcileOutcome::Updated(obj) => obj,
        }
    }

    /// Take the object as the server returned it
    pub fn into_object(self) -> DynamicObject {
        match self {
            ReconcileOutcome::Created(obj) | ReconcileOutcome::Updated(obj) => obj,
        }
    }
}

/// Object store access with the harness retry policy
#[derive(Clone)]
pub struct RetryClient {
    store: Arc<dyn ObjectStore>,
    discovery: Arc<dyn DiscoveryClient>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl RetryClient {
    /// Wrap a store and the discovery it uses
    pub fn new(store: Arc<dyn ObjectStore>, discovery: Arc<dyn DiscoveryClient>) -> Self {
        Self {
            store,
            discovery,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Override the cadence and bound of the deletion and CRD waits
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Discovery used for scope and watch resolution
    pub fn discovery(&self) -> &Arc<dyn DiscoveryClient> {
        &self.discovery
    }

    /// Run one store call under the read/write retry policy
    async fn call<T, F, Fut>(&self, ctx: &Context, op: F) -> Result<T, Error>
    where
        F: Fn(Arc<dyn ObjectStore>) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        retry(ctx, |_| op(store.clone()), &[is_json_syntax_error]).await
    }

    /// Read one object
    pub async fn get(
        &self,
        ctx: &Context,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, Error> {
        self.call(ctx, |store| {
            let (gvk, key) = (gvk.clone(), key.clone());
            async move { store.get(&gvk, &key).await }
        })
        .await
    }

    /// List objects of a kind
    pub async fn list(
        &self,
        ctx: &Context,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<Vec<DynamicObject>, Error> {
        self.call(ctx, |store| {
            let (gvk, query) = (gvk.clone(), query.clone());
            async move { store.list(&gvk, &query).await }
        })
        .await
    }

    /// Create an object
    pub async fn create(&self, ctx: &Context, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.call(ctx, |store| {
            let obj = obj.clone();
            async move { store.create(&obj).await }
        })
        .await
    }

    /// Replace an object
    pub async fn update(&self, ctx: &Context, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.call(ctx, |store| {
            let obj = obj.clone();
            async move { store.update(&obj).await }
        })
        .await
    }

    /// Merge-patch an object
    pub async fn patch(
        &self,
        ctx: &Context,
        obj: &DynamicObject,
        patch: &Value,
    ) -> Result<DynamicObject, Error> {
        self.call(ctx, |store| {
            let (obj, patch) = (obj.clone(), patch.clone());
            async move { store.patch(&obj, &patch).await }
        })
        .await
    }

    /// Delete an object
    pub async fn delete(&self, ctx: &Context, obj: &DynamicObject) -> Result<(), Error> {
        self.call(ctx, |store| {
            let obj = obj.clone();
            async move { store.delete(&obj).await }
        })
        .await
    }

    /// Delete every object of a kind matching `query`
    pub async fn delete_all_of(
        &self,
        ctx: &Context,
        gvk: &GroupVersionKind,
        query: &ListQuery,
    ) -> Result<(), Error> {
        self.call(ctx, |store| {
            let (gvk, query) = (gvk.clone(), query.clone());
            async move { store.delete_all_of(&gvk, &query).await }
        })
        .await
    }

    /// Writer for the status subresource, under the same retry policy
    pub fn status(&self) -> StatusWriter<'_> {
        StatusWriter { client: self }
    }

    /// Open an event stream for `obj`
    ///
    /// Not retried: a failed watch is returned as is, since reconnecting would
    /// lose event ordering.
    pub async fn watch(&self, ctx: &Context, obj: &DynamicObject) -> Result<EventStream, Error> {
        let gvk = gvk_of(obj)?;
        let key = object_key(obj);
        let resource = self.discovery.resource_type(&gvk).await?;
        debug!(resource = %resource_id(obj), "watching object");

        tokio::select! {
            biased;
            _ = ctx.done() => Err(ctx.err().map(Error::from).unwrap_or_else(|| {
                Error::internal_with_context("watch", "context finished without a reason")
            })),
            stream = self.store.watch(&resource, &key) => stream,
        }
    }

    /// Create `obj`, or patch it into place if it already exists
    ///
    /// Each attempt re-reads the object, so an update always carries the
    /// resourceVersion the server just reported. AlreadyExists (a concurrent
    /// creator won) is always retried; Conflict only when `retry_on_conflict`.
    pub async fn create_or_update(
        &self,
        ctx: &Context,
        obj: &DynamicObject,
        retry_on_conflict: bool,
    ) -> Result<ReconcileOutcome, Error> {
        let gvk = gvk_of(obj)?;
        let key = object_key(obj);
        let desired = obj.clone();

        let mut classifiers: Vec<ErrorClassifier> = Vec::with_capacity(3);
        classifiers.push(is_already_exists);
        classifiers.push(is_json_syntax_error);
        if retry_on_conflict {
            classifiers.push(is_conflict);
        }

        let store = self.store.clone();
        retry(
            ctx,
            |_| {
                let store = store.clone();
                let (gvk, key) = (gvk.clone(), key.clone());
                let mut expected = desired.clone();
                async move {
                    let actual = match store.get(&gvk, &key).await {
                        Ok(actual) => actual,
                        Err(e) if is_not_found(&e) => {
                            let created = store.create(&expected).await?;
                            return Ok(ReconcileOutcome::Created(created));
                        }
                        Err(e) => return Err(e),
                    };

                    copy_resource_version(&actual, &mut expected);
                    let patch = upsert_patch(&actual, &expected)?;
                    let updated = store.patch(&actual, &patch).await?;
                    Ok(ReconcileOutcome::Updated(updated))
                }
            },
            &classifiers,
        )
        .await
    }

    /// Wait until every object in `objs` reads as NotFound
    ///
    /// Any other read error ends the wait with that error; an object still
    /// present when the poll bound elapses ends it with a timeout.
    pub async fn wait_for_delete(
        &self,
        ctx: &Context,
        objs: &[DynamicObject],
    ) -> Result<(), Error> {
        let targets = objs
            .iter()
            .map(|obj| Ok((gvk_of(obj)?, object_key(obj))))
            .collect::<Result<Vec<_>, Error>>()?;

        let targets = &targets;
        poll_immediate(
            "objects to be deleted",
            self.poll_interval,
            self.poll_timeout,
            move || async move {
                for (gvk, key) in targets {
                    match self.get(ctx, gvk, key).await {
                        Ok(_) => return Ok(false),
                        Err(e) if is_not_found(&e) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            },
        )
        .await
    }

    /// Wait until discovery serves every kind the given CRDs define
    ///
    /// Rejects anything that isn't a CustomResourceDefinition before polling.
    /// Lookup failures while polling only mean "not yet".
    pub async fn wait_for_crds(&self, crds: &[DynamicObject]) -> Result<(), Error> {
        let mut waiting_for = Vec::new();
        for crd in crds {
            waiting_for.extend(crd_kinds(crd)?);
        }

        let waiting_for = &waiting_for;
        let discovery = &self.discovery;
        poll_immediate(
            "CRD types to be served",
            self.poll_interval,
            self.poll_timeout,
            move || async move {
                for gvk in waiting_for {
                    if discovery.resource_type(gvk).await.is_err() {
                        info!(resource = %gvk_display(gvk), "Waiting for resource...");
                        return Ok(false);
                    }
                }
                Ok(true)
            },
        )
        .await
    }

    /// Upsert every manifest under `dir` whose kind is in `kinds`
    ///
    /// Walks `dir` recursively in lexical order and loads `.yaml`, `.yml` and
    /// `.json` files. An empty `kinds` accepts everything. Namespaced objects
    /// without a namespace go to [`DEFAULT_NAMESPACE`]. Conflicts are retried.
    /// An empty `dir` installs nothing. A failed upsert is reported as
    /// [`Error::Resource`] naming the object.
    pub async fn install_manifests(
        &self,
        ctx: &Context,
        dir: impl AsRef<Path>,
        kinds: &[GroupVersionKind],
    ) -> Result<Vec<DynamicObject>, Error> {
        let dir = dir.as_ref();
        let mut installed = Vec::new();
        if dir.as_os_str().is_empty() {
            return Ok(installed);
        }

        for path in manifest_files(dir)? {
            for mut obj in manifest::load_yaml_from_file(&path)? {
                if !kinds.is_empty() && !matches_kind(&obj, kinds) {
                    continue;
                }

                let key = namespaced(self.discovery.as_ref(), &mut obj, DEFAULT_NAMESPACE).await?;
                let outcome = self
                    .create_or_update(ctx, &obj, true)
                    .await
                    .map_err(|e| Error::resource(resource_id(&obj), e))?;
                let action = if outcome.updated() { "updated" } else { "created" };
                info!(
                    resource = %resource_id(&obj),
                    object = %key,
                    file = %path.display(),
                    action,
                    "installed manifest"
                );
                installed.push(outcome.into_object());
            }
        }

        Ok(installed)
    }
}

/// Status subresource writes through a [`RetryClient`]
pub struct StatusWriter<'a> {
    client: &'a RetryClient,
}

impl StatusWriter<'_> {
    /// Replace the status of `obj`; its resourceVersion must be current
    pub async fn update(&self, ctx: &Context, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        self.client
            .call(ctx, |store| {
                let obj = obj.clone();
                async move { store.update_status(&obj).await }
            })
            .await
    }

    /// Merge-patch the status of `obj`
    pub async fn patch(
        &self,
        ctx: &Context,
        obj: &DynamicObject,
        patch: &Value,
    ) -> Result<DynamicObject, Error> {
        self.client
            .call(ctx, |store| {
                let (obj, patch) = (obj.clone(), patch.clone());
                async move { store.patch_status(&obj, &patch).await }
            })
            .await
    }
}

/// Merge patch from the server's copy to the desired one
///
/// Always carries the server-observed resourceVersion so a concurrent write
/// in between turns into a Conflict instead of a lost update.
fn upsert_patch(actual: &DynamicObject, expected: &DynamicObject) -> Result<Value, Error> {
    let to_json = |obj: &DynamicObject| {
        serde_json::to_value(obj)
            .map_err(|e| Error::serialization_for_kind(resource_id(obj), e.to_string()))
    };
    let mut patch = merge_patch(&to_json(actual)?, &to_json(expected)?);

    if let Some(map) = patch.as_object_mut() {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert(
                "resourceVersion".to_string(),
                actual
                    .metadata
                    .resource_version
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            );
        }
    }
    Ok(patch)
}

/// Kinds a CustomResourceDefinition document defines
///
/// `apiextensions.k8s.io/v1beta1` documents name one `spec.version`; `v1`
/// documents list `spec.versions`, of which only served ones count.
fn crd_kinds(crd: &DynamicObject) -> Result<Vec<GroupVersionKind>, Error> {
    let gvk = gvk_of(crd)?;
    if gvk.group != APIEXTENSIONS_GROUP || gvk.kind != CRD_KIND {
        return Err(Error::validation(format!(
            "the following passed object does not match {}/{}: {}",
            APIEXTENSIONS_GROUP,
            CRD_KIND,
            resource_id(crd)
        )));
    }

    let id = resource_id(crd);
    let spec = crd
        .data
        .get("spec")
        .ok_or_else(|| Error::validation_for_field("spec", format!("{id} has no spec")))?;
    let field = |path: &str, value: Option<&Value>| {
        value
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::validation_for_field(path, format!("{id} is missing {path}")))
    };

    let group = field("spec.group", spec.get("group"))?;
    let kind = field("spec.names.kind", spec.pointer("/names/kind"))?;

    let versions = match spec.get("versions").and_then(Value::as_array) {
        Some(versions) if !versions.is_empty() => versions
            .iter()
            .filter(|v| v.get("served").and_then(Value::as_bool).unwrap_or(true))
            .map(|v| field("spec.versions[].name", v.get("name")))
            .collect::<Result<Vec<_>, Error>>()?,
        _ => vec![field("spec.version", spec.get("version"))?],
    };

    Ok(versions
        .into_iter()
        .map(|version| GroupVersionKind::gvk(&group, &version, &kind))
        .collect())
}

/// Manifest files under `dir`, recursively, in lexical order
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|e| Error::io(dir, e))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::io(dir, e))?;
    entries.sort();

    let mut files = Vec::new();
    for path in entries {
        if path.is_dir() {
            files.extend(manifest_files(&path)?);
        } else if path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
        {
            files.push(path);
        }
    }
    Ok(files)
}
