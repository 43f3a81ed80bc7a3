//! HTTP tunnel request/response pair
//!
//! The gateway wraps an inbound HTTP call into an [`HttpTunnelRequest`];
//! the agent's router performs it against the named target and answers
//! with an [`HttpTunnelResponse`]. Bodies travel base64-encoded.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{generate_message_id, Correlated};

/// Multi-valued header map, `name -> [value]`
pub type HeaderValues = BTreeMap<String, Vec<String>>;

/// HTTP call to perform inside the remote plane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpTunnelRequest {
    /// Correlation key, echoed in the response
    #[serde(rename = "requestID", default)]
    pub request_id: String,

    /// ID assigned by the gateway's HTTP front end, for log correlation
    #[serde(
        rename = "gatewayRequestID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub gateway_request_id: String,

    /// Route name on the agent (`k8s` or a configured route)
    #[serde(default)]
    pub target: String,

    /// HTTP method
    #[serde(default)]
    pub method: String,

    /// Path appended to the route endpoint
    #[serde(default)]
    pub path: String,

    /// Raw query string without the leading `?`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,

    /// Request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: HeaderValues,

    /// Request body
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl HttpTunnelRequest {
    /// Build a request with a fresh request ID.
    pub fn new(
        target: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        headers: HeaderValues,
        body: Vec<u8>,
    ) -> Self {
        Self {
            request_id: generate_message_id(),
            gateway_request_id: String::new(),
            target: target.into(),
            method: method.into(),
            path: path.into(),
            query: query.into(),
            headers,
            body,
        }
    }

    /// Path with the query string appended when present
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

impl Correlated for HttpTunnelRequest {
    fn correlation_id(&self) -> &str {
        &self.request_id
    }
}

/// Error carried by a failed tunnel response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelErrorDetails {
    /// HTTP status code
    pub code: u16,
    /// Human readable message
    pub message: String,
}

/// Result of an [`HttpTunnelRequest`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpTunnelResponse {
    /// Copied from the request
    #[serde(rename = "requestID", default)]
    pub request_id: String,

    /// Backend status, or the error code for failures
    #[serde(rename = "statusCode", default)]
    pub status_code: u16,

    /// Response headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: HeaderValues,

    /// Response body
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Set when the agent could not complete the call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TunnelErrorDetails>,
}

impl HttpTunnelResponse {
    /// Backend answer to `req`, passed through verbatim.
    pub fn success(
        req: &HttpTunnelRequest,
        status_code: u16,
        headers: HeaderValues,
        body: Vec<u8>,
    ) -> Self {
        Self {
            request_id: req.request_id.clone(),
            status_code,
            headers,
            body,
            error: None,
        }
    }

    /// Failure answering `req`; `statusCode` mirrors `code`.
    pub fn error(req: &HttpTunnelRequest, code: u16, message: impl Into<String>) -> Self {
        Self {
            request_id: req.request_id.clone(),
            status_code: code,
            headers: HeaderValues::new(),
            body: Vec::new(),
            error: Some(TunnelErrorDetails {
                code,
                message: message.into(),
            }),
        }
    }

    /// True when the agent reached the backend
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl Correlated for HttpTunnelResponse {
    fn correlation_id(&self) -> &str {
        &self.request_id
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
