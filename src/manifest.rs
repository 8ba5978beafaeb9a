//! Manifest loading
//!
//! Reads multi-document YAML (or JSON, which is valid YAML) into untyped
//! objects. Typing is left to [`crate::scheme`].

use std::path::Path;

use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::Error;
use crate::scheme::{Document, Scheme};

/// Parse every document in `text` into an object
///
/// `label` names the source (usually a file path) in errors and logs. Empty
/// documents and documents without a `kind` are skipped.
pub fn load_yaml(label: &str, text: &str) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            Error::serialization_for_kind(
                label,
                format!("error decoding yaml document {index}: {e}"),
            )
        })?;

        if value.is_null() {
            continue;
        }
        if value.get("kind").and_then(Value::as_str).is_none_or(str::is_empty) {
            warn!(file = %label, document = index, "skipping document without kind");
            continue;
        }

        let obj: DynamicObject = serde_json::from_value(value).map_err(|e| {
            Error::serialization_for_kind(label, format!("error converting document {index}: {e}"))
        })?;
        objects.push(obj);
    }

    debug!(file = %label, count = objects.len(), "loaded manifests");
    Ok(objects)
}

/// Read and parse a manifest file
pub fn load_yaml_from_file(path: impl AsRef<Path>) -> Result<Vec<DynamicObject>, Error> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    load_yaml(&path.display().to_string(), &text)
}

/// Parse `text` and convert each object through `scheme`
pub fn load_documents(scheme: &Scheme, label: &str, text: &str) -> Result<Vec<Document>, Error> {
    load_yaml(label, text)?
        .into_iter()
        .map(|obj| scheme.convert(obj))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::resource_id;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    const MULTI: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: web
  namespace: team-a
spec:
  containers:
    - name: nginx
      image: nginx:1.27
---
---
apiVersion: example.dev/v1
kind: Widget
metadata:
  name: a
spec:
  size: 3
"#;

    #[test]
    fn test_load_multi_document() {
        let objs = load_yaml("multi.yaml", MULTI).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(resource_id(&objs[0]), "Pod:team-a/web");
        assert_eq!(resource_id(&objs[1]), "Widget:/a");
        assert_eq!(objs[1].data["spec"]["size"], 3);
        assert_eq!(objs[0].data["spec"]["containers"][0]["image"], "nginx:1.27");
    }

    #[test]
    fn test_load_json() {
        let json = r#"{"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "team-b"}}"#;
        let objs = load_yaml("ns.json", json).unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(resource_id(&objs[0]), "Namespace:/team-b");
    }

    #[test]
    fn test_documents_without_kind_are_skipped() {
        let text = "foo: bar\n---\napiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n";
        let objs = load_yaml("mixed.yaml", text).unwrap();
        assert_eq!(objs.len(), 1);
    }

    #[test]
    fn test_malformed_yaml_names_source() {
        let err = load_yaml("broken.yaml", "apiVersion: v1\nkind: [Pod\n").unwrap_err();
        match err {
            Error::Serialization { kind, message } => {
                assert_eq!(kind.as_deref(), Some("broken.yaml"));
                assert!(message.contains("error decoding yaml"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("widgets.yaml");
        std::fs::write(&path, MULTI).unwrap();

        assert_eq!(load_yaml_from_file(&path).unwrap().len(), 2);
        assert!(matches!(
            load_yaml_from_file(dir.path().join("missing.yaml")),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_load_documents_types_registered_kinds() {
        let text = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.dev
spec:
  group: example.dev
  names:
    kind: Widget
    plural: widgets
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
---
apiVersion: example.dev/v1
kind: Widget
metadata:
  name: a
"#;
        let docs = load_documents(&Scheme::with_builtins(), "crds.yaml", text).unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs[0].downcast_ref::<CustomResourceDefinition>().is_some());
        assert!(!docs[1].is_typed());
    }
}
