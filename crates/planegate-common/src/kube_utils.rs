//! Kubernetes helpers shared by the agent and its tests
//!
//! Manifests arrive as dynamic documents; these helpers pull out the
//! identity (group/version/kind, name, namespace) needed to address them
//! through `kube::Api<DynamicObject>`.

use kube::api::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Group/version/kind triple as carried in request payloads
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version, e.g. "v1"
    pub version: String,
    /// Resource kind, e.g. "ConfigMap"
    pub kind: String,
}

impl Gvk {
    /// Build a triple from parts
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build a triple from an `apiVersion` string and kind
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = parse_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    /// `apiVersion` string, e.g. "apps/v1" or "v1"
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl From<&Gvk> for GroupVersionKind {
    fn from(gvk: &Gvk) -> Self {
        GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind)
    }
}

/// Identity of an object described by a manifest
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestIdentity {
    /// Group/version/kind
    pub gvk: Gvk,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if set and non-empty
    pub namespace: Option<String>,
}

/// Extract apiVersion, kind, name and namespace from a manifest.
pub fn manifest_identity(manifest: &Value) -> Result<ManifestIdentity, Error> {
    let api_version = manifest
        .get("apiVersion")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("manifest missing apiVersion"))?;

    let kind = manifest
        .get("kind")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization("manifest missing kind"))?;

    let name = manifest
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::serialization_for_kind(kind, "manifest missing metadata.name"))?;

    let namespace = manifest
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(ManifestIdentity {
        gvk: Gvk::from_api_version(api_version, kind),
        name: name.to_string(),
        namespace,
    })
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use planegate_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("apps/v1");
/// assert_eq!(group, "apps");
/// assert_eq!(version, "v1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Whether a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is a 409 AlreadyExists from the API server
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}
