//! Kubernetes operation executor
//!
//! Turns a [`ClusterAgentRequest`] into a [`ClusterAgentResponse`] by
//! running one resource operation against the local cluster. Failures never
//! escape: malformed input answers 400, a missing object on get answers 404
//! and anything the API server rejects answers 500.

use std::sync::Arc;

use kube::api::DynamicObject;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use planegate_common::kube_utils::{is_already_exists, is_not_found, manifest_identity, Gvk};
use planegate_common::yaml::parse_document;
use planegate_common::DEFAULT_FIELD_MANAGER;
use planegate_proto::{Action, ClusterAgentRequest, ClusterAgentResponse, Payload};

use crate::resources::ClusterResources;

// ============================================================================
// Payload decoding
// ============================================================================

/// Malformed request payloads, all answered with 400
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// `manifest` key absent
    #[error("missing manifest in payload")]
    MissingManifest,
    /// `manifest` neither object nor string
    #[error("manifest must be a YAML string or object")]
    InvalidManifest,
    /// `manifest` string is not valid YAML/JSON, or not a mapping
    #[error("failed to parse manifest: {0}")]
    UnparseableManifest(String),
    /// `gvk` absent or not an object
    #[error("missing or invalid gvk in payload")]
    InvalidGvk,
    /// `name` absent or empty
    #[error("missing or invalid name in payload")]
    InvalidName,
    /// `namespace` absent or empty
    #[error("missing or invalid namespace in payload")]
    InvalidNamespace,
}

/// A manifest as sent by the control plane: already structured, or a
/// YAML/JSON document to be parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestSource {
    /// Structured object
    Object(Payload),
    /// YAML or JSON text
    Document(String),
}

impl ManifestSource {
    /// Read `payload.manifest`.
    pub fn from_payload(payload: &Payload) -> Result<Self, PayloadError> {
        match payload.get("manifest") {
            None => Err(PayloadError::MissingManifest),
            Some(Value::Object(map)) => Ok(ManifestSource::Object(map.clone())),
            Some(Value::String(doc)) => Ok(ManifestSource::Document(doc.clone())),
            Some(_) => Err(PayloadError::InvalidManifest),
        }
    }

    /// Resolve to a JSON object.
    pub fn into_object(self) -> Result<Value, PayloadError> {
        match self {
            ManifestSource::Object(map) => Ok(Value::Object(map)),
            ManifestSource::Document(doc) => match parse_document(&doc) {
                Ok(value @ Value::Object(_)) => Ok(value),
                Ok(_) => Err(PayloadError::UnparseableManifest(
                    "document is not a mapping".to_string(),
                )),
                Err(e) => Err(PayloadError::UnparseableManifest(e.to_string())),
            },
        }
    }
}

#[derive(Debug)]
struct ApplyPayload {
    manifest: Value,
    field_manager: String,
}

#[derive(Debug)]
struct ListPayload {
    gvk: Gvk,
    namespace: Option<String>,
    label_selector: Option<String>,
}

#[derive(Debug)]
struct GetPayload {
    gvk: Gvk,
    name: String,
    namespace: Option<String>,
}

fn manifest(payload: &Payload) -> Result<Value, PayloadError> {
    ManifestSource::from_payload(payload)?.into_object()
}

fn non_empty_str(payload: &Payload, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn gvk(payload: &Payload) -> Result<Gvk, PayloadError> {
    let map = payload
        .get("gvk")
        .and_then(Value::as_object)
        .ok_or(PayloadError::InvalidGvk)?;
    let field = |k: &str| map.get(k).and_then(Value::as_str).unwrap_or_default();
    Ok(Gvk::new(field("group"), field("version"), field("kind")))
}

/// Render a label map as a selector; non-string values are dropped.
fn label_selector(payload: &Payload) -> Option<String> {
    let labels = payload.get("labelSelector").and_then(Value::as_object)?;
    let selector = labels
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|v| format!("{}={}", k, v)))
        .collect::<Vec<_>>()
        .join(",");
    Some(selector).filter(|s| !s.is_empty())
}

impl ApplyPayload {
    fn decode(payload: &Payload) -> Result<Self, PayloadError> {
        Ok(Self {
            manifest: manifest(payload)?,
            field_manager: non_empty_str(payload, "fieldManager")
                .unwrap_or_else(|| DEFAULT_FIELD_MANAGER.to_string()),
        })
    }
}

impl ListPayload {
    fn decode(payload: &Payload) -> Result<Self, PayloadError> {
        Ok(Self {
            gvk: gvk(payload)?,
            namespace: non_empty_str(payload, "namespace"),
            label_selector: label_selector(payload),
        })
    }
}

impl GetPayload {
    fn decode(payload: &Payload) -> Result<Self, PayloadError> {
        let gvk = gvk(payload)?;
        let name = non_empty_str(payload, "name").ok_or(PayloadError::InvalidName)?;
        Ok(Self {
            gvk,
            name,
            namespace: non_empty_str(payload, "namespace"),
        })
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Executes cluster-agent requests against the local cluster
#[derive(Clone)]
pub struct KubernetesExecutor {
    resources: Arc<dyn ClusterResources>,
}

impl KubernetesExecutor {
    /// Create an executor over a resource backend
    pub fn new(resources: Arc<dyn ClusterResources>) -> Self {
        Self { resources }
    }

    /// Execute one request. Always returns a response correlated to `req`.
    #[instrument(
        skip(self, req),
        fields(request_id = %req.request_id, identifier = %req.identifier)
    )]
    pub async fn execute(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let action = serde_json::from_value::<Action>(Value::String(req.identifier.clone()))
            .unwrap_or(Action::Unknown);
        debug!(action = action.as_str(), "executing cluster agent request");

        let response = match action {
            Action::ApplyResource => self.apply_resource(req).await,
            Action::ListResources => self.list_resources(req).await,
            Action::GetResource => self.get_resource(req).await,
            Action::DeleteResource => self.delete_resource(req).await,
            Action::PatchResource => self.patch_resource(req).await,
            Action::CreateNamespace => self.create_namespace(req).await,
            Action::WatchResources | Action::Unknown => ClusterAgentResponse::fail(
                req,
                400,
                format!("unsupported action: {}", req.identifier),
                None,
            ),
        };

        if let Some(err) = &response.error {
            warn!(code = err.code, error = %err.message, "cluster agent request failed");
        }
        response
    }

    async fn apply_resource(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let payload = match ApplyPayload::decode(&req.payload) {
            Ok(p) => p,
            Err(e) => return bad_request(req, e),
        };

        let result = match manifest_identity(&payload.manifest) {
            Ok(identity) => self
                .resources
                .apply(&identity, &payload.manifest, &payload.field_manager)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(obj) => ClusterAgentResponse::success(
                req,
                to_payload(json!({
                    "applied": true,
                    "resourceVersion": obj.metadata.resource_version.unwrap_or_default(),
                    "uid": obj.metadata.uid.unwrap_or_default(),
                    "creationTimestamp": obj
                        .metadata
                        .creation_timestamp
                        .map(|t| t.0.format("%Y-%m-%dT%H:%M:%SZ").to_string())
                        .unwrap_or_default(),
                })),
            ),
            Err(e) => ClusterAgentResponse::fail_retryable(
                req,
                500,
                format!("failed to apply resource: {}", e),
            ),
        }
    }

    async fn list_resources(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let payload = match ListPayload::decode(&req.payload) {
            Ok(p) => p,
            Err(e) => return bad_request(req, e),
        };

        let items = self
            .resources
            .list(&payload.gvk, payload.namespace, payload.label_selector)
            .await
            .map_err(|e| e.to_string())
            .and_then(|items| {
                items
                    .iter()
                    .map(object_value)
                    .collect::<Result<Vec<_>, _>>()
            });

        match items {
            Ok(items) => {
                let count = items.len();
                ClusterAgentResponse::success(req, to_payload(json!({"items": items, "count": count})))
            }
            Err(e) => server_error(req, format!("failed to list resources: {}", e)),
        }
    }

    async fn get_resource(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let payload = match GetPayload::decode(&req.payload) {
            Ok(p) => p,
            Err(e) => return bad_request(req, e),
        };

        let obj = match self
            .resources
            .get(&payload.gvk, &payload.name, payload.namespace)
            .await
        {
            Ok(obj) => obj,
            Err(e) if is_not_found(&e) => {
                return ClusterAgentResponse::fail(req, 404, format!("resource not found: {}", e), None)
            }
            Err(e) => return server_error(req, format!("failed to get resource: {}", e)),
        };

        match object_value(&obj) {
            Ok(resource) => {
                ClusterAgentResponse::success(req, to_payload(json!({"resource": resource})))
            }
            Err(e) => server_error(req, format!("failed to get resource: {}", e)),
        }
    }

    async fn delete_resource(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let manifest = match manifest(&req.payload) {
            Ok(m) => m,
            Err(e) => return bad_request(req, e),
        };

        let result = match manifest_identity(&manifest) {
            Ok(identity) => self
                .resources
                .delete(&identity)
                .await
                .map(|_| identity.name)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(name) => {
                ClusterAgentResponse::success(req, to_payload(json!({"deleted": true, "name": name})))
            }
            Err(e) => server_error(req, format!("failed to delete resource: {}", e)),
        }
    }

    async fn patch_resource(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let manifest = match manifest(&req.payload) {
            Ok(m) => m,
            Err(e) => return bad_request(req, e),
        };

        let result = match manifest_identity(&manifest) {
            Ok(identity) => self
                .resources
                .merge_patch(&identity, &manifest)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(obj) => ClusterAgentResponse::success(
                req,
                to_payload(json!({
                    "patched": true,
                    "resourceVersion": obj.metadata.resource_version.unwrap_or_default(),
                })),
            ),
            Err(e) => server_error(req, format!("failed to patch resource: {}", e)),
        }
    }

    async fn create_namespace(&self, req: &ClusterAgentRequest) -> ClusterAgentResponse {
        let Some(namespace) = non_empty_str(&req.payload, "namespace") else {
            return bad_request(req, PayloadError::InvalidNamespace);
        };

        match self.resources.create_namespace(&namespace).await {
            Ok(()) => {}
            Err(e) if is_already_exists(&e) => {
                debug!(namespace = %namespace, "namespace already exists");
            }
            Err(e) => return server_error(req, format!("failed to create namespace: {}", e)),
        }

        ClusterAgentResponse::success(
            req,
            to_payload(json!({"namespace": namespace, "created": true})),
        )
    }
}

fn bad_request(req: &ClusterAgentRequest, err: PayloadError) -> ClusterAgentResponse {
    ClusterAgentResponse::fail(req, 400, err.to_string(), None)
}

fn server_error(req: &ClusterAgentRequest, message: String) -> ClusterAgentResponse {
    ClusterAgentResponse::fail(req, 500, message, None)
}

fn object_value(obj: &DynamicObject) -> Result<Value, String> {
    serde_json::to_value(obj).map_err(|e| e.to_string())
}

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
