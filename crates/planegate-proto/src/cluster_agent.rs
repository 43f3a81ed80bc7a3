//! CQRS-framed Kubernetes requests and responses
//!
//! A [`ClusterAgentRequest`] names an executor operation in `identifier`
//! and carries its arguments in `payload`. The agent always answers with a
//! [`ClusterAgentResponse`] whose `requestID` equals the request's, whether
//! the operation succeeded or not.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{generate_message_id, Correlated, Payload};

/// Detail key marking a failure as safe to retry
pub const RETRYABLE_DETAIL: &str = "retryable";

/// Whether a request mutates state (command) or only reads it (query)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    /// Mutating operation
    Command,
    /// Read-only operation
    Query,
}

/// Outcome of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The operation completed
    Success,
    /// The operation failed; `error` is set
    Fail,
}

/// Error carried by a failed response
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// HTTP-style status code (400, 404, 500, ...)
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: u16,

    /// Human readable message
    pub message: String,

    /// Additional structured context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Payload>,
}

fn is_zero(code: &u16) -> bool {
    *code == 0
}

impl ErrorDetails {
    /// Whether the failure is marked as retryable
    pub fn is_retryable(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get(RETRYABLE_DETAIL))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Request executed by the agent against its local cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterAgentRequest {
    /// Command or query
    #[serde(rename = "type")]
    pub request_type: RequestType,

    /// Executor operation name, e.g. `apply-resource`
    #[serde(default)]
    pub identifier: String,

    /// Correlation key, echoed verbatim in the response
    #[serde(rename = "requestID", default)]
    pub request_id: String,

    /// Target cluster
    #[serde(rename = "clusterId", default)]
    pub cluster_id: String,

    /// Operation arguments
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,

    /// Per-request timeout overrides, in seconds
    #[serde(
        rename = "overrideRequestTimeouts",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub override_request_timeouts: Vec<u64>,
}

impl ClusterAgentRequest {
    fn new(
        request_type: RequestType,
        identifier: impl Into<String>,
        cluster_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            request_type,
            identifier: identifier.into(),
            request_id: generate_message_id(),
            cluster_id: cluster_id.into(),
            payload,
            override_request_timeouts: Vec::new(),
        }
    }

    /// Build a mutating request with a fresh request ID.
    pub fn command(
        identifier: impl Into<String>,
        cluster_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(RequestType::Command, identifier, cluster_id, payload)
    }

    /// Build a read-only request with a fresh request ID.
    pub fn query(
        identifier: impl Into<String>,
        cluster_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self::new(RequestType::Query, identifier, cluster_id, payload)
    }

    /// True for commands
    pub fn is_command(&self) -> bool {
        self.request_type == RequestType::Command
    }

    /// True for queries
    pub fn is_query(&self) -> bool {
        self.request_type == RequestType::Query
    }
}

impl Correlated for ClusterAgentRequest {
    fn correlation_id(&self) -> &str {
        &self.request_id
    }
}

/// Agent's answer to a [`ClusterAgentRequest`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterAgentResponse {
    /// Copied from the request
    #[serde(rename = "type")]
    pub request_type: RequestType,

    /// Copied from the request
    #[serde(default)]
    pub identifier: String,

    /// Copied from the request
    #[serde(rename = "requestID", default)]
    pub request_id: String,

    /// Copied from the request
    #[serde(rename = "clusterId", default)]
    pub cluster_id: String,

    /// Success or fail
    pub status: ResponseStatus,

    /// Result document on success
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub payload: Payload,

    /// Error on fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

impl ClusterAgentResponse {
    fn for_request(req: &ClusterAgentRequest, status: ResponseStatus) -> Self {
        Self {
            request_type: req.request_type,
            identifier: req.identifier.clone(),
            request_id: req.request_id.clone(),
            cluster_id: req.cluster_id.clone(),
            status,
            payload: Payload::new(),
            error: None,
        }
    }

    /// Successful response to `req`.
    pub fn success(req: &ClusterAgentRequest, payload: Payload) -> Self {
        Self {
            payload,
            ..Self::for_request(req, ResponseStatus::Success)
        }
    }

    /// Failed response to `req`.
    pub fn fail(
        req: &ClusterAgentRequest,
        code: u16,
        message: impl Into<String>,
        details: Option<Payload>,
    ) -> Self {
        Self {
            error: Some(ErrorDetails {
                code,
                message: message.into(),
                details,
            }),
            ..Self::for_request(req, ResponseStatus::Fail)
        }
    }

    /// Failed response to `req` marked as retryable.
    pub fn fail_retryable(req: &ClusterAgentRequest, code: u16, message: impl Into<String>) -> Self {
        let mut details = Payload::new();
        details.insert(RETRYABLE_DETAIL.to_string(), Value::Bool(true));
        Self::fail(req, code, message, Some(details))
    }

    /// True when the operation completed
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// True when the operation failed
    pub fn is_fail(&self) -> bool {
        self.status == ResponseStatus::Fail
    }

    /// Error code of a failed response, 0 otherwise
    pub fn error_code(&self) -> u16 {
        self.error.as_ref().map(|e| e.code).unwrap_or(0)
    }
}

impl Correlated for ClusterAgentResponse {
    fn correlation_id(&self) -> &str {
        &self.request_id
    }
}
