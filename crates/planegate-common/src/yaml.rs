//! YAML parsing utilities using yaml-rust2
//!
//! Documents are converted to `serde_json::Value` so the rest of the
//! workspace deals with a single dynamic document type.

use serde_json::{Map, Number, Value};
use thiserror::Error;
use yaml_rust2::{Yaml, YamlLoader};

/// Error type for YAML/JSON document parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct YamlError(String);

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a document that is either JSON or YAML.
///
/// Input starting with `{` or `[` is parsed as JSON, anything else as YAML.
pub fn parse_document(input: &str) -> Result<Value, YamlError> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|e| YamlError(e.to_string()))
    } else {
        parse_yaml(input)
    }
}

fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
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
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yaml_kubernetes_manifest() {
        let yaml = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
  namespace: build-ns
data:
  replicas: "3"
"#;
        let result = parse_yaml(yaml).unwrap();
        assert_eq!(result["apiVersion"], "v1");
        assert_eq!(result["kind"], "ConfigMap");
        assert_eq!(result["metadata"]["namespace"], "build-ns");
        assert_eq!(result["data"]["replicas"], "3");
    }

    #[test]
    fn test_parse_yaml_scalars() {
        let result = parse_yaml("enabled: true\ncount: 42\nratio: 1.5\nnothing: null").unwrap();
        assert_eq!(result["enabled"], true);
        assert_eq!(result["count"], 42);
        assert!((result["ratio"].as_f64().unwrap() - 1.5).abs() < 0.0001);
        assert!(result["nothing"].is_null());
    }

    #[test]
    fn test_parse_yaml_route_list() {
        let yaml = r#"
- name: prometheus
  endpoint: http://prometheus:9090
  auth:
    type: none
- name: vault
  endpoint: https://vault:8200
"#;
        let result = parse_yaml(yaml).unwrap();
        let routes = result.as_array().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0]["auth"]["type"], "none");
        assert_eq!(routes[1]["name"], "vault");
    }

    #[test]
    fn test_parse_yaml_empty() {
        assert_eq!(parse_yaml("").unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_yaml_invalid() {
        assert!(parse_yaml("not: valid: yaml: {{").is_err());
    }

    #[test]
    fn test_parse_document_json() {
        let doc = parse_document(r#"  {"kind": "Namespace", "metadata": {"name": "a"}}"#).unwrap();
        assert_eq!(doc["kind"], "Namespace");
    }

    #[test]
    fn test_parse_document_json_array() {
        let doc = parse_document(r#"[{"name": "a"}]"#).unwrap();
        assert_eq!(doc[0]["name"], "a");
    }

    #[test]
    fn test_parse_document_yaml() {
        let doc = parse_document("kind: Namespace\nmetadata:\n  name: a").unwrap();
        assert_eq!(doc["metadata"]["name"], "a");
    }

    #[test]
    fn test_parse_document_bad_json() {
        assert!(parse_document("{not json").is_err());
    }
}
