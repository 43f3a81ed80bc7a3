//! Gateway HTTP server
//!
//! One listener carries the agent WebSocket endpoint, the proxy and the plane
//! API; health checks get a second plain-HTTP listener. Each agent socket runs a
//! read loop, a writer task fed by the registry's channel and a ping ticker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use planegate_common::{PlaneIdentity, PlaneType};
use planegate_proto::{ProtocolVersion, PLANE_TYPE_PARAM};

use crate::config::GatewayConfig;
use crate::health::health_router;
use crate::plane_ca::{FilePlaneCaSource, PeerCertificates, PlaneAuthorizer};
use crate::plane_api::{all_status_handler, notify_handler, reconnect_handler, status_handler};
use crate::proxy::proxy_handler;
use crate::registry::{AgentRegistry, Outbound, SharedAgentRegistry};
use crate::tls::{build_server_config, PeerCertAcceptor, TlsError};
use crate::tunnel::Tunnel;

/// Frames queued per agent before senders wait
const OUTBOUND_QUEUE: usize = 256;

/// How long in-flight HTTP requests get to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Errors that stop the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// TLS material could not be loaded
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// A listener could not bind
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that failed
        addr: SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },

    /// A listener failed while serving
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Shared state for handlers
#[derive(Clone)]
pub struct GatewayState {
    /// Live agent connections
    pub registry: SharedAgentRegistry,
    /// Request correlation over the registry
    pub tunnel: Arc<Tunnel>,
    /// Validated configuration
    pub config: Arc<GatewayConfig>,
    /// Per-plane certificate check; `None` admits any agent the TLS layer accepted
    pub authorizer: Option<PlaneAuthorizer>,
}

impl GatewayState {
    /// Fresh registry and tunnel for `config`
    pub fn new(config: GatewayConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new(config.dispatch_policy));
        let tunnel = Arc::new(Tunnel::new(registry.clone(), config.protocol));
        let authorizer = config
            .tls
            .as_ref()
            .and_then(|tls| tls.plane_ca.clone())
            .map(|path| PlaneAuthorizer::new(Arc::new(FilePlaneCaSource::new(path))));
        Self {
            registry,
            tunnel,
            config: Arc::new(config),
            authorizer,
        }
    }

    /// Check agents against per-plane CAs with `authorizer`
    pub fn with_authorizer(mut self, authorizer: PlaneAuthorizer) -> Self {
        self.authorizer = Some(authorizer);
        self
    }
}

/// Routes served on the main listener
pub fn router(state: GatewayState) -> Router {
    Router::new()
        // Agent tunnel endpoint
        .route("/ws", get(ws_handler))
        // HTTP proxy into a plane
        .route(
            "/api/proxy/{plane_type}/{plane_id}/{target}",
            any(proxy_handler),
        )
        .route(
            "/api/proxy/{plane_type}/{plane_id}/{target}/{*path}",
            any(proxy_handler),
        )
        // Plane lifecycle API
        .route("/api/v1/planes/notify", post(notify_handler))
        .route("/api/v1/planes/status", get(all_status_handler))
        .route(
            "/api/v1/planes/{plane_type}/{plane_id}/reconnect",
            post(reconnect_handler),
        )
        .route(
            "/api/v1/planes/{plane_type}/{plane_id}/status",
            get(status_handler),
        )
        .with_state(state)
}

/// Query parameters of the agent endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "planeType")]
    plane_type: Option<String>,
    #[serde(rename = "planeID")]
    plane_id: Option<String>,
    #[serde(rename = "planeName")]
    plane_name: Option<String>,
}

/// Plane identity announced by a connecting agent.
///
/// The plane parameter depends on the protocol: `planeID` for the HTTP
/// tunnel, `planeName` for the cluster-agent protocol.
pub fn connect_identity(
    query: &ConnectQuery,
    protocol: ProtocolVersion,
) -> Result<PlaneIdentity, String> {
    let plane_type = query
        .plane_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing {} parameter", PLANE_TYPE_PARAM))?;

    let plane_id = match protocol {
        ProtocolVersion::HttpTunnel => query.plane_id.as_deref(),
        ProtocolVersion::ClusterAgent => query.plane_name.as_deref(),
    }
    .filter(|s| !s.is_empty())
    .ok_or_else(|| format!("missing {} parameter", protocol.plane_param()))?;

    if plane_type.parse::<PlaneType>().is_err() {
        return Err(format!(
            "invalid {}: must be 'dataplane', 'buildplane', or 'observabilityplane'",
            PLANE_TYPE_PARAM
        ));
    }
    PlaneIdentity::new(plane_type, plane_id).map_err(|e| e.to_string())
}

async fn ws_handler(
    State(state): State<GatewayState>,
    Query(query): Query<ConnectQuery>,
    peer: Option<Extension<PeerCertificates>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let plane = match connect_identity(&query, state.tunnel.protocol()) {
        Ok(plane) => plane,
        Err(message) => {
            warn!(error = %message, "rejecting agent connection");
            return (StatusCode::BAD_REQUEST, message).into_response();
        }
    };

    let authorized = match &state.authorizer {
        Some(authorizer) => {
            let peer = peer.map(|Extension(peer)| peer).unwrap_or_default();
            match authorizer.authorize(&plane, &peer) {
                Ok(resources) => resources,
                Err(e) => {
                    warn!(plane = %plane.identifier(), error = %e, "client certificate verification failed");
                    return (
                        StatusCode::UNAUTHORIZED,
                        format!("client certificate verification failed: {}", e),
                    )
                        .into_response();
                }
            }
        }
        None => Vec::new(),
    };

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| handle_socket(state, plane, authorized, socket))
}

async fn handle_socket(
    state: GatewayState,
    plane: PlaneIdentity,
    authorized: Vec<String>,
    socket: WebSocket,
) {
    let identifier = plane.identifier();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let closed = CancellationToken::new();
    let connection_id = state
        .registry
        .register_authorized(&plane, authorized, tx.clone(), closed.clone());

    let writer = tokio::spawn({
        let closed = closed.clone();
        let identifier = identifier.clone();
        async move {
            loop {
                let outbound = tokio::select! {
                    _ = closed.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(outbound) => outbound,
                        None => break,
                    },
                };
                let message = match outbound {
                    Outbound::Frame(text) => Message::Text(text.into()),
                    Outbound::Ping => Message::Ping(Default::default()),
                };
                if let Err(e) = sink.send(message).await {
                    warn!(plane = %identifier, error = %e, "failed to write to agent");
                    break;
                }
            }
            let _ = sink.close().await;
        }
    });

    let pinger = tokio::spawn({
        let interval = state.config.heartbeat_interval;
        async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => {
                debug!(plane = %identifier, connection_id = %connection_id, "connection closed by registry");
                break;
            }
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(message)) => {
                state.registry.touch(&identifier, &connection_id);
                match message {
                    Message::Text(text) => state.tunnel.handle_frame(&identifier, text.as_str()),
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => state.tunnel.handle_frame(&identifier, text),
                        Err(_) => warn!(plane = %identifier, "dropping non-UTF-8 binary frame"),
                    },
                    Message::Close(_) => {
                        debug!(plane = %identifier, "agent sent close");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            Some(Err(e)) => {
                debug!(plane = %identifier, error = %e, "agent read failed");
                break;
            }
            None => break,
        }
    }

    closed.cancel();
    pinger.abort();
    let _ = writer.await;
    state.registry.unregister(&identifier, &connection_id);
    info!(plane = %identifier, connection_id = %connection_id, "agent connection closed");
}

/// Evict connections silent for longer than `timeout`, checking every
/// `interval` until `cancel` fires.
pub fn spawn_stale_sweeper(
    registry: SharedAgentRegistry,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for (identifier, connection_id) in registry.detect_stale(timeout) {
                registry.evict(&identifier, &connection_id);
            }
        }
        debug!("stale connection sweeper stopped");
    })
}

async fn serve_plain(addr: SocketAddr, app: Router, cancel: CancellationToken) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(ServerError::Serve)
}

/// Serve the main and health listeners until `cancel` fires.
pub async fn serve(state: GatewayState, cancel: CancellationToken) -> Result<(), ServerError> {
    let config = state.config.clone();
    let app = router(state);

    let health = tokio::spawn({
        let cancel = cancel.clone();
        let addr = config.health_addr;
        async move {
            info!(addr = %addr, "starting health listener");
            serve_plain(addr, health_router(), cancel).await
        }
    });

    let result = match &config.tls {
        Some(tls) => {
            let server_config = build_server_config(tls)?;
            let rustls = RustlsConfig::from_config(Arc::new(server_config));
            let handle = axum_server::Handle::new();
            tokio::spawn({
                let handle = handle.clone();
                let cancel = cancel.clone();
                async move {
                    cancel.cancelled().await;
                    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
                }
            });

            info!(
                addr = %config.listen_addr,
                mtls = tls.client_ca.is_some(),
                plane_ca = tls.plane_ca.is_some(),
                protocol = %config.protocol,
                "starting gateway"
            );
            axum_server::bind(config.listen_addr)
                .acceptor(PeerCertAcceptor::new(rustls))
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(ServerError::Serve)
        }
        None => {
            warn!(addr = %config.listen_addr, "no server certificate configured, serving plain HTTP");
            serve_plain(config.listen_addr, app, cancel.clone()).await
        }
    };

    cancel.cancel();
    match health.await {
        Ok(Err(e)) => warn!(error = %e, "health listener failed"),
        Err(e) => warn!(error = %e, "health listener panicked"),
        Ok(Ok(())) => {}
    }
    result
}
