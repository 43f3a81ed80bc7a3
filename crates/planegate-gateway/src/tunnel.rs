//! Request/response correlation over agent sockets
//!
//! Every outbound request gets a fresh `requestID` and a oneshot slot in a
//! pending map. The slot is registered before the frame is written so a fast
//! agent can never answer into nothing. Slots are removed on delivery, on
//! timeout and on send failure.

use std::time::Duration;

use dashmap::DashMap;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use planegate_proto::{
    generate_message_id, ClusterAgentRequest, ClusterAgentResponse, HttpTunnelRequest,
    HttpTunnelResponse, ProtocolVersion,
};

use crate::registry::{Outbound, SharedAgentRegistry};

/// Default deadline for one tunneled request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while tunneling a request
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// No agent is connected for the plane
    #[error("no agents connected for plane {0}")]
    NotConnected(String),

    /// The frame could not be queued on the agent's socket
    #[error("failed to send request: {0}")]
    SendFailed(String),

    /// No response arrived in time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The pending slot was dropped without a response
    #[error("agent disconnected")]
    ChannelClosed,

    /// The request's protocol is not the one this deployment's agents speak
    #[error("{requested} requests are not supported: agents speak {deployed}")]
    ProtocolMismatch {
        /// Protocol of the rejected request
        requested: ProtocolVersion,
        /// Protocol configured on the gateway
        deployed: ProtocolVersion,
    },
}

impl TunnelError {
    /// HTTP status reported to proxy callers
    pub fn status_code(&self) -> StatusCode {
        match self {
            TunnelError::NotConnected(_) => StatusCode::SERVICE_UNAVAILABLE,
            TunnelError::SendFailed(_) => StatusCode::BAD_GATEWAY,
            TunnelError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            TunnelError::ChannelClosed => StatusCode::BAD_GATEWAY,
            TunnelError::ProtocolMismatch { .. } => StatusCode::NOT_IMPLEMENTED,
        }
    }
}

type Pending<T> = DashMap<String, oneshot::Sender<T>>;

/// RPC surface over the registered agents
pub struct Tunnel {
    registry: SharedAgentRegistry,
    protocol: ProtocolVersion,
    pending_http: Pending<HttpTunnelResponse>,
    pending_cluster: Pending<ClusterAgentResponse>,
}

impl Tunnel {
    /// Create a tunnel speaking `protocol` with agents in `registry`
    pub fn new(registry: SharedAgentRegistry, protocol: ProtocolVersion) -> Self {
        Self {
            registry,
            protocol,
            pending_http: DashMap::new(),
            pending_cluster: DashMap::new(),
        }
    }

    /// Protocol spoken on this deployment
    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending_http.len() + self.pending_cluster.len()
    }

    fn ensure_protocol(&self, requested: ProtocolVersion) -> Result<(), TunnelError> {
        if requested == self.protocol {
            return Ok(());
        }
        warn!(requested = %requested, deployed = %self.protocol, "rejecting request for the wrong protocol");
        Err(TunnelError::ProtocolMismatch {
            requested,
            deployed: self.protocol,
        })
    }

    /// Send an HTTP tunnel request and wait for its response.
    ///
    /// The request's `requestID` is replaced with a fresh one.
    pub async fn send_http_request(
        &self,
        identifier: &str,
        mut req: HttpTunnelRequest,
        timeout: Duration,
    ) -> Result<HttpTunnelResponse, TunnelError> {
        self.ensure_protocol(ProtocolVersion::HttpTunnel)?;
        req.request_id = generate_message_id();
        debug!(
            plane = %identifier,
            request_id = %req.request_id,
            gateway_request_id = %req.gateway_request_id,
            target = %req.target,
            method = %req.method,
            path = %req.path,
            "sending HTTP tunnel request"
        );
        let request_id = req.request_id.clone();
        round_trip(&self.registry, &self.pending_http, identifier, &request_id, &req, timeout).await
    }

    /// Send a cluster-agent request and wait for its response.
    ///
    /// The request's `requestID` is replaced with a fresh one.
    pub async fn send_cluster_agent_request(
        &self,
        identifier: &str,
        mut req: ClusterAgentRequest,
        timeout: Duration,
    ) -> Result<ClusterAgentResponse, TunnelError> {
        self.ensure_protocol(ProtocolVersion::ClusterAgent)?;
        req.request_id = generate_message_id();
        debug!(
            plane = %identifier,
            request_id = %req.request_id,
            identifier = %req.identifier,
            "sending cluster-agent request"
        );
        let request_id = req.request_id.clone();
        round_trip(&self.registry, &self.pending_cluster, identifier, &request_id, &req, timeout)
            .await
    }

    /// Route one inbound text frame from an agent.
    ///
    /// Heartbeats are consumed here; undecodable frames and responses to
    /// unknown requests are logged and dropped.
    pub fn handle_frame(&self, identifier: &str, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(plane = %identifier, error = %e, "failed to parse agent frame");
                return;
            }
        };

        if value.get("type").and_then(Value::as_str) == Some("heartbeat") {
            trace!(plane = %identifier, "agent heartbeat");
            return;
        }

        match self.protocol {
            ProtocolVersion::HttpTunnel => {
                if let Some(resp) = decode::<HttpTunnelResponse>(identifier, value) {
                    let request_id = resp.request_id.clone();
                    complete(&self.pending_http, identifier, &request_id, resp);
                }
            }
            ProtocolVersion::ClusterAgent => {
                if let Some(resp) = decode::<ClusterAgentResponse>(identifier, value) {
                    let request_id = resp.request_id.clone();
                    complete(&self.pending_cluster, identifier, &request_id, resp);
                }
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(identifier: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(resp) => Some(resp),
        Err(e) => {
            warn!(plane = %identifier, error = %e, "failed to decode agent response");
            None
        }
    }
}

fn complete<T>(pending: &Pending<T>, identifier: &str, request_id: &str, resp: T) {
    if request_id.is_empty() {
        warn!(plane = %identifier, "received response without requestID");
        return;
    }
    match pending.remove(request_id) {
        Some((_, tx)) => {
            if tx.send(resp).is_err() {
                debug!(request_id = %request_id, "caller gave up before response arrived");
            }
        }
        None => warn!(plane = %identifier, request_id = %request_id, "received response for unknown request"),
    }
}

async fn round_trip<Req: Serialize, Resp>(
    registry: &SharedAgentRegistry,
    pending: &Pending<Resp>,
    identifier: &str,
    request_id: &str,
    req: &Req,
    timeout: Duration,
) -> Result<Resp, TunnelError> {
    let agent = registry
        .select(identifier)
        .ok_or_else(|| TunnelError::NotConnected(identifier.to_string()))?;
    let frame = serde_json::to_string(req).map_err(|e| TunnelError::SendFailed(e.to_string()))?;

    let (tx, rx) = oneshot::channel();
    pending.insert(request_id.to_string(), tx);
    let _slot = PendingSlot { pending, request_id };

    if let Err(e) = agent.sender.send(Outbound::Frame(frame)).await {
        warn!(plane = %identifier, connection_id = %agent.id, "agent connection closed before send");
        return Err(TunnelError::SendFailed(e.to_string()));
    }

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(_)) => Err(TunnelError::ChannelClosed),
        Err(_) => {
            warn!(plane = %identifier, request_id = %request_id, "tunnel request timed out");
            Err(TunnelError::Timeout(timeout))
        }
    }
}

/// Removes a pending entry when the caller stops waiting, including when
/// the caller's future is dropped.
struct PendingSlot<'a, T> {
    pending: &'a Pending<T>,
    request_id: &'a str,
}

impl<T> Drop for PendingSlot<'_, T> {
    fn drop(&mut self) {
        self.pending.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentRegistry;
    use planegate_common::PlaneIdentity;
    use planegate_proto::HeaderValues;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const PLANE: &str = "dataplane/dp-1";

    fn tunnel_with_agent(protocol: ProtocolVersion) -> (Arc<Tunnel>, mpsc::Receiver<Outbound>) {
        let registry = Arc::new(AgentRegistry::default());
        let (tx, rx) = mpsc::channel(8);
        registry.register(
            &PlaneIdentity::new("dataplane", "dp-1").unwrap(),
            tx,
            CancellationToken::new(),
        );
        (Arc::new(Tunnel::new(registry, protocol)), rx)
    }

    fn http_request() -> HttpTunnelRequest {
        HttpTunnelRequest::new("k8s", "GET", "/api/v1/pods", "", HeaderValues::new(), vec![])
    }

    async fn next_frame<T: serde::de::DeserializeOwned>(rx: &mut mpsc::Receiver<Outbound>) -> T {
        match rx.recv().await {
            Some(Outbound::Frame(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_tunnel_error_status_codes() {
        assert_eq!(
            TunnelError::NotConnected("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            TunnelError::SendFailed("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::Timeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(TunnelError::ChannelClosed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            TunnelError::ProtocolMismatch {
                requested: ProtocolVersion::HttpTunnel,
                deployed: ProtocolVersion::ClusterAgent,
            }
            .status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[tokio::test]
    async fn test_http_request_refused_on_cluster_agent_deployment() {
        let (tunnel, mut rx) = tunnel_with_agent(ProtocolVersion::ClusterAgent);
        let err = tunnel
            .send_http_request(PLANE, http_request(), Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TunnelError::ProtocolMismatch {
                requested: ProtocolVersion::HttpTunnel,
                deployed: ProtocolVersion::ClusterAgent,
            }
        ));
        assert_eq!(tunnel.pending_count(), 0);
        assert!(rx.try_recv().is_err(), "no frame may reach the agent");
    }

    #[tokio::test]
    async fn test_cluster_agent_request_refused_on_http_tunnel_deployment() {
        let (tunnel, mut rx) = tunnel_with_agent(ProtocolVersion::HttpTunnel);
        let req = ClusterAgentRequest::query("get-resource", "dp-1", Default::default());
        let err = tunnel
            .send_cluster_agent_request(PLANE, req, Duration::from_secs(30))
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::ProtocolMismatch { .. }));
        assert_eq!(
            err.to_string(),
            "cluster-agent requests are not supported: agents speak http-tunnel"
        );
        assert_eq!(tunnel.pending_count(), 0);
        assert!(rx.try_recv().is_err(), "no frame may reach the agent");
    }

    #[tokio::test]
    async fn test_http_round_trip_assigns_fresh_request_id() {
        let (tunnel, mut rx) = tunnel_with_agent(ProtocolVersion::HttpTunnel);
        let original = http_request();
        let original_id = original.request_id.clone();

        let agent = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let req: HttpTunnelRequest = next_frame(&mut rx).await;
                let resp = HttpTunnelResponse::success(&req, 200, HeaderValues::new(), b"pods".to_vec());
                tunnel.handle_frame(PLANE, &serde_json::to_string(&resp).unwrap());
                req.request_id
            })
        };

        let resp = tunnel
            .send_http_request(PLANE, original, Duration::from_secs(5))
            .await
            .unwrap();
        let sent_id = agent.await.unwrap();

        assert_ne!(sent_id, original_id);
        assert_eq!(resp.request_id, sent_id);
        assert_eq!(resp.body, b"pods");
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cluster_agent_round_trip() {
        let (tunnel, mut rx) = tunnel_with_agent(ProtocolVersion::ClusterAgent);
        {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                let req: ClusterAgentRequest = next_frame(&mut rx).await;
                let resp = ClusterAgentResponse::fail(&req, 404, "resource not found: x", None);
                tunnel.handle_frame(PLANE, &serde_json::to_string(&resp).unwrap());
            });
        }

        let req = ClusterAgentRequest::query("get-resource", "dp-1", Default::default());
        let resp = tunnel
            .send_cluster_agent_request(PLANE, req, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(resp.is_fail());
        assert_eq!(resp.error_code(), 404);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let tunnel = Tunnel::new(Arc::new(AgentRegistry::default()), ProtocolVersion::HttpTunnel);
        let err = tunnel
            .send_http_request(PLANE, http_request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NotConnected(ref p) if p == PLANE));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let (tunnel, _rx) = tunnel_with_agent(ProtocolVersion::HttpTunnel);
        let err = tunnel
            .send_http_request(PLANE, http_request(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_removes_pending_entry() {
        let (tunnel, rx) = tunnel_with_agent(ProtocolVersion::HttpTunnel);
        drop(rx);
        let err = tunnel
            .send_http_request(PLANE, http_request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::SendFailed(_)));
        assert_eq!(tunnel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_are_dropped() {
        let (tunnel, mut rx) = tunnel_with_agent(ProtocolVersion::HttpTunnel);
        let call = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move {
                tunnel
                    .send_http_request(PLANE, http_request(), Duration::from_secs(5))
                    .await
            })
        };
        let req: HttpTunnelRequest = next_frame(&mut rx).await;

        let stranger = HttpTunnelResponse::success(&http_request(), 200, HeaderValues::new(), vec![]);
        tunnel.handle_frame(PLANE, &serde_json::to_string(&stranger).unwrap());
        tunnel.handle_frame(PLANE, "not json");
        tunnel.handle_frame(PLANE, r#"{"statusCode":200}"#);
        tunnel.handle_frame(
            PLANE,
            &serde_json::to_string(&planegate_proto::Message::heartbeat("dataplane/dp-1", 1)).unwrap(),
        );
        assert_eq!(tunnel.pending_count(), 1);

        let resp = HttpTunnelResponse::error(&req, 502, "backend request failed: refused");
        tunnel.handle_frame(PLANE, &serde_json::to_string(&resp).unwrap());

        let got = call.await.unwrap().unwrap();
        assert_eq!(got.status_code, 502);
        assert_eq!(tunnel.pending_count(), 0);
    }
}
