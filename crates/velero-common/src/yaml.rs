//! Manifest stream parsing using yaml-rust2
//!
//! `velero install --dry-run -o yaml` prints a multi-document YAML stream.
//! Documents are converted to `serde_json::Value` so they can be fed to the
//! cluster API or deserialized into typed structs.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::Error;

/// Parse a multi-document YAML stream into one Value per document.
///
/// Empty documents (a bare `---` or a trailing separator) are dropped.
pub fn parse_yaml_multi(input: &str) -> Result<Vec<Value>, Error> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::serialization(format!("invalid YAML: {}", e)))?;
    docs.into_iter()
        .filter(|doc| !doc.is_null())
        .map(yaml_to_json)
        .collect()
}

/// Keep only the documents whose `kind` equals `kind`, preserving order
pub fn documents_of_kind(docs: Vec<Value>, kind: &str) -> Vec<Value> {
    docs.into_iter()
        .filter(|doc| doc.get("kind").and_then(Value::as_str) == Some(kind))
        .collect()
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, Error> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| Error::serialization(e.to_string()))?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(Error::serialization("unsupported YAML key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::serialization("YAML aliases not supported")),
        Yaml::BadValue => Err(Error::serialization("bad YAML value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CRDS: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: backups.velero.io
spec:
  group: velero.io
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: restores.velero.io
---
apiVersion: v1
kind: Namespace
metadata:
  name: velero
---
"#;

    #[test]
    fn test_parse_multi_doc_drops_empty_documents() {
        let docs = parse_yaml_multi(CRDS).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["metadata"]["name"], "backups.velero.io");
        assert_eq!(docs[0]["spec"]["group"], "velero.io");
        assert_eq!(docs[2]["kind"], "Namespace");
    }

    #[test]
    fn test_documents_of_kind_preserves_order() {
        let docs = parse_yaml_multi(CRDS).unwrap();
        let crds = documents_of_kind(docs, "CustomResourceDefinition");
        let names: Vec<_> = crds
            .iter()
            .map(|d| d["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["backups.velero.io", "restores.velero.io"]);
    }

    #[test]
    fn test_parse_empty_stream() {
        assert!(parse_yaml_multi("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_invalid() {
        let err = parse_yaml_multi("not: valid: yaml: {{").unwrap_err();
        assert!(err.to_string().contains("invalid YAML"));
    }

    #[test]
    fn test_scalars_convert() {
        let docs = parse_yaml_multi("enabled: true\nport: 8085\nratio: 1.5\nnothing: null").unwrap();
        assert_eq!(docs[0]["enabled"], true);
        assert_eq!(docs[0]["port"], 8085);
        assert!((docs[0]["ratio"].as_f64().unwrap() - 1.5).abs() < 0.0001);
        assert!(docs[0]["nothing"].is_null());
    }
}
