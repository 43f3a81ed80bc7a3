//! HTTP request router
//!
//! Maps the `target` of an [`HttpTunnelRequest`] to a configured backend,
//! applies that route's authentication and performs the call. The `k8s`
//! route is always present and goes through the kube client's own
//! transport; every other route gets its own reqwest client.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::{HeaderMap, Method, Request};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use planegate_proto::{HeaderValues, HttpTunnelRequest, HttpTunnelResponse};

use crate::kube_client::KubeConnection;

/// Name of the built-in Kubernetes API route
pub const K8S_ROUTE: &str = "k8s";

// ============================================================================
// Errors
// ============================================================================

/// Errors from routing a tunneled HTTP request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No route registered under the requested name
    #[error("unknown target: {target} (available targets: {})", available.join(", "))]
    UnknownTarget {
        /// Requested target
        target: String,
        /// Registered route names, sorted
        available: Vec<String>,
    },

    /// The outgoing request could not be assembled
    #[error("failed to create request: {0}")]
    BuildRequest(String),

    /// The backend could not be reached
    #[error("backend request failed: {0}")]
    Backend(String),

    /// The backend answered but its body could not be read
    #[error("failed to read response: {0}")]
    ReadResponse(String),

    /// Two routes share a name, or a route shadows `k8s`
    #[error("duplicate route name: {0}")]
    DuplicateRoute(String),

    /// A route's client could not be built
    #[error("invalid route {name}: {message}")]
    InvalidRoute {
        /// Route name
        name: String,
        /// Reason
        message: String,
    },
}

impl RouterError {
    /// HTTP status reported back through the tunnel
    pub fn status_code(&self) -> u16 {
        match self {
            RouterError::UnknownTarget { .. } => 404,
            RouterError::Backend(_) | RouterError::ReadResponse(_) => 502,
            RouterError::BuildRequest(_)
            | RouterError::DuplicateRoute(_)
            | RouterError::InvalidRoute { .. } => 500,
        }
    }
}

// ============================================================================
// Route configuration
// ============================================================================

/// Kind of backend a route points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The local Kubernetes API server
    Kubernetes,
    /// Plain HTTP service
    Http,
    /// HTTPS service
    Https,
}

impl Backend {
    fn for_endpoint(endpoint: &str) -> Self {
        if endpoint.starts_with("https://") {
            Backend::Https
        } else {
            Backend::Http
        }
    }
}

/// Authentication scheme applied to every request on a route
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    /// Bearer token from the agent's service account
    #[serde(rename = "serviceaccount")]
    ServiceAccount,
    /// Static bearer token
    Bearer,
    /// HTTP basic auth
    Basic,
    /// No credentials
    #[default]
    None,
}

/// Route credentials
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Scheme
    #[serde(rename = "type", default)]
    pub auth_type: AuthType,
    /// Bearer token
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    /// Basic auth user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Basic auth password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    /// Bearer auth with a token
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            auth_type: AuthType::Bearer,
            token: token.into(),
            ..Default::default()
        }
    }

    /// Basic auth with user and password
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            auth_type: AuthType::Basic,
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// `Authorization` header value for this scheme, if any.
    ///
    /// Incomplete credentials send nothing.
    pub fn authorization(&self) -> Option<String> {
        match self.auth_type {
            AuthType::ServiceAccount | AuthType::Bearer if !self.token.is_empty() => {
                Some(format!("Bearer {}", self.token))
            }
            AuthType::Basic if !self.username.is_empty() && !self.password.is_empty() => {
                let raw = format!("{}:{}", self.username, self.password);
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                ))
            }
            _ => None,
        }
    }
}

/// A user-defined route as loaded from configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Target name used in tunnel requests
    pub name: String,
    /// Base URL, e.g. `http://prometheus:9090`
    pub endpoint: String,
    /// Credentials
    #[serde(default)]
    pub auth: AuthConfig,
}

// ============================================================================
// Transports
// ============================================================================

/// What a backend returned
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendResponse {
    /// HTTP status
    pub status: u16,
    /// Response headers
    pub headers: HeaderValues,
    /// Response body
    pub body: Vec<u8>,
}

/// Performs a fully built request against one backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RouteTransport: Send + Sync {
    /// Send `request` and read the whole response
    async fn send(&self, request: Request<Vec<u8>>) -> Result<BackendResponse, RouterError>;
}

/// Transport over the kube client; TLS and CA trust come from its config
#[derive(Clone)]
pub struct KubeTransport {
    client: kube::Client,
}

impl KubeTransport {
    /// Wrap a kube client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteTransport for KubeTransport {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<BackendResponse, RouterError> {
        // The client resolves paths against its own cluster URL
        let (mut parts, body) = request.into_parts();
        parts.uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse()
            .map_err(|e: http::uri::InvalidUri| RouterError::BuildRequest(e.to_string()))?;
        let request = Request::from_parts(parts, kube::client::Body::from(body));

        let response = self
            .client
            .send(request)
            .await
            .map_err(|e| RouterError::Backend(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = header_values(response.headers());
        let body = response
            .into_body()
            .collect_bytes()
            .await
            .map_err(|e| RouterError::ReadResponse(e.to_string()))?;

        Ok(BackendResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Transport over a dedicated reqwest client
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client; `accept_invalid_certs` disables certificate checks
    pub fn new(accept_invalid_certs: bool) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RouteTransport for ReqwestTransport {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<BackendResponse, RouterError> {
        let request = reqwest::Request::try_from(request)
            .map_err(|e| RouterError::BuildRequest(e.to_string()))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| RouterError::Backend(e.to_string()))?;
        let status = response.status().as_u16();
        let headers = header_values(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| RouterError::ReadResponse(e.to_string()))?;

        Ok(BackendResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Flatten a header map into the multi-valued wire form
pub fn header_values(headers: &HeaderMap) -> HeaderValues {
    let mut out: HeaderValues = BTreeMap::new();
    for (name, value) in headers {
        out.entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    out
}

/// Build a header map from the multi-valued wire form
pub fn header_map(values: &HeaderValues) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for (name, list) in values {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
        for value in list {
            let value = HeaderValue::from_str(value).map_err(|e| e.to_string())?;
            map.append(name.clone(), value);
        }
    }
    Ok(map)
}

// ============================================================================
// Router
// ============================================================================

/// A registered backend
#[derive(Clone)]
pub struct Route {
    /// Target name
    pub name: String,
    /// Backend kind
    pub backend: Backend,
    /// Base URL
    pub endpoint: String,
    /// Credentials
    pub auth: AuthConfig,
    transport: Arc<dyn RouteTransport>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Build a route over an explicit transport
    pub fn new(
        name: impl Into<String>,
        backend: Backend,
        endpoint: impl Into<String>,
        auth: AuthConfig,
        transport: Arc<dyn RouteTransport>,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            endpoint: endpoint.into(),
            auth,
            transport,
        }
    }

    /// The built-in `k8s` route over the kube client
    pub fn kubernetes(conn: &KubeConnection) -> Self {
        Self::new(
            K8S_ROUTE,
            Backend::Kubernetes,
            conn.endpoint.clone(),
            AuthConfig {
                auth_type: AuthType::ServiceAccount,
                token: conn.token.clone().unwrap_or_default(),
                ..Default::default()
            },
            Arc::new(KubeTransport::new(conn.client.clone())),
        )
    }

    /// A user route with its own reqwest client.
    ///
    /// Routes without auth skip certificate verification; all others verify.
    pub fn from_config(config: RouteConfig) -> Result<Self, RouterError> {
        let insecure = config.auth.auth_type == AuthType::None;
        let transport = ReqwestTransport::new(insecure).map_err(|e| RouterError::InvalidRoute {
            name: config.name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self::new(
            config.name,
            Backend::for_endpoint(&config.endpoint),
            config.endpoint,
            config.auth,
            Arc::new(transport),
        ))
    }
}

/// Routes tunneled HTTP requests to backends by target name
#[derive(Clone, Debug)]
pub struct Router {
    routes: BTreeMap<String, Route>,
}

impl Router {
    /// Register the `k8s` route and then every configured route.
    ///
    /// A configured route named `k8s`, or two with the same name, is refused.
    pub fn new(k8s: &KubeConnection, configs: Vec<RouteConfig>) -> Result<Self, RouterError> {
        let mut routes = vec![Route::kubernetes(k8s)];
        info!(endpoint = %k8s.endpoint, auth = "serviceaccount", "registered default k8s route");

        for config in configs {
            info!(
                name = %config.name,
                endpoint = %config.endpoint,
                auth = ?config.auth.auth_type,
                "registered route"
            );
            routes.push(Route::from_config(config)?);
        }
        Self::from_routes(routes)
    }

    /// Build a router from already constructed routes
    pub fn from_routes(routes: Vec<Route>) -> Result<Self, RouterError> {
        let mut map = BTreeMap::new();
        for route in routes {
            if map.contains_key(&route.name) {
                return Err(RouterError::DuplicateRoute(route.name));
            }
            map.insert(route.name.clone(), route);
        }
        Ok(Self { routes: map })
    }

    /// Registered target names, sorted
    pub fn targets(&self) -> Vec<String> {
        self.routes.keys().cloned().collect()
    }

    /// Look up a route by name
    pub fn get(&self, name: &str) -> Option<&Route> {
        self.routes.get(name)
    }

    /// Perform `req` and answer with a correlated response.
    #[instrument(
        skip(self, req),
        fields(
            request_id = %req.request_id,
            gateway_request_id = %req.gateway_request_id,
            target = %req.target
        )
    )]
    pub async fn route(&self, req: &HttpTunnelRequest) -> HttpTunnelResponse {
        match self.forward(req).await {
            Ok(resp) => {
                info!(
                    status_code = resp.status,
                    body_size = resp.body.len(),
                    "agent request completed"
                );
                HttpTunnelResponse::success(req, resp.status, resp.headers, resp.body)
            }
            Err(e) => HttpTunnelResponse::error(req, e.status_code(), e.to_string()),
        }
    }

    async fn forward(&self, req: &HttpTunnelRequest) -> Result<BackendResponse, RouterError> {
        let Some(route) = self.routes.get(&req.target) else {
            let available = self.targets();
            warn!(available_targets = ?available, "unknown target requested");
            return Err(RouterError::UnknownTarget {
                target: req.target.clone(),
                available,
            });
        };

        let url = format!("{}{}", route.endpoint, req.path_and_query());
        debug!(method = %req.method, url = %url, "routing request to backend");

        let request = build_request(route, req, &url)?;
        route.transport.send(request).await.inspect_err(|e| {
            error!(url = %url, error = %e, "backend request failed");
        })
    }
}

fn build_request(
    route: &Route,
    req: &HttpTunnelRequest,
    url: &str,
) -> Result<Request<Vec<u8>>, RouterError> {
    let method = Method::from_bytes(req.method.as_bytes())
        .map_err(|e| RouterError::BuildRequest(format!("invalid method {:?}: {}", req.method, e)))?;
    let mut headers = header_map(&req.headers).map_err(RouterError::BuildRequest)?;

    // Backends only ever see the route's own credentials
    if headers.remove(AUTHORIZATION).is_some() {
        debug!(auth = ?route.auth.auth_type, "dropped caller Authorization header");
    }
    if let Some(value) = route.auth.authorization() {
        let value =
            HeaderValue::from_str(&value).map_err(|e| RouterError::BuildRequest(e.to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }

    let mut request = Request::builder()
        .method(method)
        .uri(url)
        .body(req.body.clone())
        .map_err(|e| RouterError::BuildRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}
