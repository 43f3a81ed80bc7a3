//! Request handlers
//!
//! A [`RequestHandler`] turns one decoded request frame into its response.
//! The connection manager is generic over the handler, so the protocol
//! generation is fixed when the agent is built.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use planegate_proto::{
    ClusterAgentRequest, ClusterAgentResponse, Correlated, HttpTunnelRequest, HttpTunnelResponse,
    ProtocolVersion,
};

use crate::executor::KubernetesExecutor;
use crate::router::Router;

/// Status reported when a request exceeds its deadline
pub const TIMEOUT_STATUS: u16 = 504;

/// Maps a decoded request to its response
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Inbound frame type
    type Request: DeserializeOwned + Correlated + Send + Sync + 'static;
    /// Outbound frame type
    type Response: Serialize + Correlated + Send + Sync + 'static;

    /// Protocol generation this handler speaks
    fn protocol(&self) -> ProtocolVersion;

    /// Produce the response for `request`
    async fn handle(&self, request: &Self::Request) -> Self::Response;

    /// Response sent when `handle` exceeds its deadline
    fn timed_out(&self, request: &Self::Request, after: Duration) -> Self::Response;

    /// Deadline for `request`; `default` unless the request overrides it
    fn deadline(&self, _request: &Self::Request, default: Duration) -> Duration {
        default
    }
}

fn timeout_message(after: Duration) -> String {
    format!("request timed out after {}s", after.as_secs_f64())
}

/// Serves cluster-agent frames with the Kubernetes executor
#[derive(Clone)]
pub struct ClusterAgentHandler {
    executor: KubernetesExecutor,
}

impl ClusterAgentHandler {
    /// Wrap an executor
    pub fn new(executor: KubernetesExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl RequestHandler for ClusterAgentHandler {
    type Request = ClusterAgentRequest;
    type Response = ClusterAgentResponse;

    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::ClusterAgent
    }

    async fn handle(&self, request: &ClusterAgentRequest) -> ClusterAgentResponse {
        self.executor.execute(request).await
    }

    fn timed_out(&self, request: &ClusterAgentRequest, after: Duration) -> ClusterAgentResponse {
        ClusterAgentResponse::fail_retryable(request, TIMEOUT_STATUS, timeout_message(after))
    }

    /// The first non-zero `overrideRequestTimeouts` entry, in seconds, wins.
    fn deadline(&self, request: &ClusterAgentRequest, default: Duration) -> Duration {
        request
            .override_request_timeouts
            .iter()
            .copied()
            .find(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Serves HTTP tunnel frames with the router
#[derive(Clone)]
pub struct HttpTunnelHandler {
    router: Arc<Router>,
}

impl HttpTunnelHandler {
    /// Wrap a router
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl RequestHandler for HttpTunnelHandler {
    type Request = HttpTunnelRequest;
    type Response = HttpTunnelResponse;

    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::HttpTunnel
    }

    async fn handle(&self, request: &HttpTunnelRequest) -> HttpTunnelResponse {
        self.router.route(request).await
    }

    fn timed_out(&self, request: &HttpTunnelRequest, after: Duration) -> HttpTunnelResponse {
        HttpTunnelResponse::error(request, TIMEOUT_STATUS, timeout_message(after))
    }
}
