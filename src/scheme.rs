//! Registry of known document kinds
//!
//! Manifests are always read untyped. The [`Scheme`] maps `{group, kind}` to a
//! decoder so callers that know a kind can get the typed form back through
//! [`Scheme::convert`]; kinds nobody registered stay untyped.
//!
//! The process-wide scheme is built exactly once, by an explicit call to
//! [`init`] (or [`init_with`]) from the process entry point. Nothing
//! initializes it implicitly on first use.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::Error;
use crate::object::{parse_api_version, resource_id};

/// API group of CustomResourceDefinitions
pub const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";

/// Kind name of CustomResourceDefinitions
pub const CRD_KIND: &str = "CustomResourceDefinition";

static SCHEME: OnceLock<Scheme> = OnceLock::new();

/// Typed value produced by a decoder
pub type TypedObject = Box<dyn Any + Send + Sync>;

/// Turns an untyped object into its typed form
///
/// Returning `Ok(None)` leaves the object untyped (e.g. an API version the
/// decoder doesn't understand).
pub type Decoder = Box<dyn Fn(&DynamicObject) -> Result<Option<TypedObject>, Error> + Send + Sync>;

/// Registry key: API group plus kind
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GroupKind {
    /// API group ("" for core)
    pub group: String,
    /// Kind name
    pub kind: String,
}

impl GroupKind {
    /// Build a key
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }

    fn of(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        let (group, _) = parse_api_version(&types.api_version);
        Some(Self::new(group, types.kind.clone()))
    }
}

/// A document after conversion
pub enum Document {
    /// A registered kind, with its typed form
    Typed {
        /// The original untyped object
        object: DynamicObject,
        /// The decoded value
        value: TypedObject,
    },
    /// A kind no decoder claimed
    Untyped(DynamicObject),
}

impl Document {
    /// The untyped object, whichever variant this is
    pub fn object(&self) -> &DynamicObject {
        match self {
            Document::Typed { object, .. } => object,
            Document::Untyped(object) => object,
        }
    }

    /// The typed value, if this is a `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Document::Typed { value, .. } => value.downcast_ref::<T>(),
            Document::Untyped(_) => None,
        }
    }

    /// Whether a decoder claimed this document
    pub fn is_typed(&self) -> bool {
        matches!(self, Document::Typed { .. })
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Document::Typed { object, .. } => {
                f.debug_tuple("Typed").field(&resource_id(object)).finish()
            }
            Document::Untyped(object) => {
                f.debug_tuple("Untyped").field(&resource_id(object)).finish()
            }
        }
    }
}

/// Mapping of `{group, kind}` to decoders
#[derive(Default)]
pub struct Scheme {
    decoders: HashMap<GroupKind, Decoder>,
}

impl Scheme {
    /// An empty scheme
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheme with the harness's built-in kinds
    ///
    /// Registers `apiextensions.k8s.io/v1` CustomResourceDefinitions; older
    /// CRD versions stay untyped.
    pub fn with_builtins() -> Self {
        let mut scheme = Self::new();
        scheme.register_with(
            GroupKind::new(APIEXTENSIONS_GROUP, CRD_KIND),
            Box::new(|obj: &DynamicObject| {
                let is_v1 = obj
                    .types
                    .as_ref()
                    .is_some_and(|t| t.api_version == "apiextensions.k8s.io/v1");
                if !is_v1 {
                    return Ok(None);
                }
                decode::<CustomResourceDefinition>(obj).map(Some)
            }),
        );
        scheme
    }

    /// Register `T` as the typed form of `{group, kind}`
    ///
    /// A later registration for the same key replaces the earlier one.
    pub fn register<T>(&mut self, group: &str, kind: &str)
    where
        T: DeserializeOwned + Any + Send + Sync,
    {
        self.register_with(
            GroupKind::new(group, kind),
            Box::new(|obj: &DynamicObject| decode::<T>(obj).map(Some)),
        );
    }

    /// Register a custom decoder for `key`
    pub fn register_with(&mut self, key: GroupKind, decoder: Decoder) {
        debug!(group = %key.group, kind = %key.kind, "registering document kind");
        self.decoders.insert(key, decoder);
    }

    /// Whether a decoder exists for `{group, kind}`
    pub fn is_registered(&self, group: &str, kind: &str) -> bool {
        self.decoders.contains_key(&GroupKind::new(group, kind))
    }

    /// Convert to the registered typed form, or keep untyped
    pub fn convert(&self, object: DynamicObject) -> Result<Document, Error> {
        let decoder = GroupKind::of(&object).and_then(|key| self.decoders.get(&key));
        let Some(decoder) = decoder else {
            return Ok(Document::Untyped(object));
        };

        match decoder(&object)? {
            Some(value) => Ok(Document::Typed { object, value }),
            None => Ok(Document::Untyped(object)),
        }
    }
}

fn decode<T>(obj: &DynamicObject) -> Result<TypedObject, Error>
where
    T: DeserializeOwned + Any + Send + Sync,
{
    let id = resource_id(obj);
    let value = serde_json::to_value(obj).map_err(|e| {
        Error::serialization_for_kind(id.clone(), format!("error converting to unstructured: {e}"))
    })?;
    let typed: T = serde_json::from_value(value).map_err(|e| {
        Error::serialization_for_kind(id, format!("error converting from unstructured: {e}"))
    })?;
    Ok(Box::new(typed))
}

/// Build the process-wide scheme with the built-in kinds
///
/// Runs at most once; later calls return the scheme built by the first.
pub fn init() -> &'static Scheme {
    init_with(|_| {})
}

/// Build the process-wide scheme, letting `extend` register extra kinds
///
/// Only the first call's `extend` runs.
pub fn init_with(extend: impl FnOnce(&mut Scheme)) -> &'static Scheme {
    SCHEME.get_or_init(|| {
        let mut scheme = Scheme::with_builtins();
        extend(&mut scheme);
        scheme
    })
}

/// The process-wide scheme
///
/// Fails if [`init`] has not run yet.
pub fn global() -> Result<&'static Scheme, Error> {
    SCHEME
        .get()
        .ok_or_else(|| Error::internal_with_context("scheme", "scheme has not been initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{new_resource, with_key_value};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct TestStep {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
        #[serde(default)]
        index: i64,
    }

    #[test]
    fn test_unregistered_kind_stays_untyped() {
        let scheme = Scheme::new();
        let doc = scheme
            .convert(new_resource("v1", "Pod", "p", "ns"))
            .unwrap();
        assert!(!doc.is_typed());
        assert_eq!(doc.object().metadata.name.as_deref(), Some("p"));
    }

    #[test]
    fn test_registered_kind_decodes() {
        let mut scheme = Scheme::new();
        scheme.register::<TestStep>("kuttl.dev", "TestStep");

        let obj = new_resource("kuttl.dev/v1beta1", "TestStep", "step", "");
        let obj = with_key_value(&obj, "index", json!(2));
        let doc = scheme.convert(obj).unwrap();

        let step = doc.downcast_ref::<TestStep>().expect("typed TestStep");
        assert_eq!(step.index, 2);
        assert_eq!(step.metadata.name.as_deref(), Some("step"));
    }

    #[test]
    fn test_registry_is_keyed_by_group() {
        let mut scheme = Scheme::new();
        scheme.register::<TestStep>("kuttl.dev", "TestStep");
        assert!(scheme.is_registered("kuttl.dev", "TestStep"));
        assert!(!scheme.is_registered("other.dev", "TestStep"));

        let doc = scheme
            .convert(new_resource("other.dev/v1", "TestStep", "s", ""))
            .unwrap();
        assert!(!doc.is_typed());
    }

    #[test]
    fn test_decode_failure_names_resource() {
        let mut scheme = Scheme::new();
        scheme.register::<TestStep>("kuttl.dev", "TestStep");

        let obj = with_key_value(
            &new_resource("kuttl.dev/v1beta1", "TestStep", "bad", ""),
            "index",
            json!("not a number"),
        );
        let err = scheme.convert(obj).unwrap_err();
        assert!(err.to_string().contains("error converting from unstructured"));
        match err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("TestStep:/bad")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_builtin_crd_only_types_v1() {
        let scheme = Scheme::with_builtins();

        let v1 = with_key_value(
            &new_resource("apiextensions.k8s.io/v1", CRD_KIND, "widgets.example.dev", ""),
            "spec",
            json!({
                "group": "example.dev",
                "names": {"kind": "Widget", "plural": "widgets"},
                "scope": "Namespaced",
                "versions": [{"name": "v1", "served": true, "storage": true}]
            }),
        );
        let doc = scheme.convert(v1).unwrap();
        let crd = doc.downcast_ref::<CustomResourceDefinition>().expect("typed CRD");
        assert_eq!(crd.spec.names.kind, "Widget");

        let v1beta1 = new_resource("apiextensions.k8s.io/v1beta1", CRD_KIND, "old", "");
        assert!(!scheme.convert(v1beta1).unwrap().is_typed());
    }

    #[test]
    fn test_init_runs_once() {
        let first = init_with(|s| s.register::<TestStep>("kuttl.dev", "TestStep"));
        let second = init();
        assert!(std::ptr::eq(first, second));
        assert!(global().is_ok());
        assert!(second.is_registered(APIEXTENSIONS_GROUP, CRD_KIND));
    }
}
