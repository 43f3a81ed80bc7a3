//! Outbound tunnel connection
//!
//! The agent dials the gateway, keeps the socket open and serves every
//! request frame it receives. When the connection drops it waits a fixed
//! delay and dials again, until cancelled.
//!
//! # Connection Flow
//!
//! ```text
//! run ──► connect ──► read loop ──► connection lost ──► sleep(delay) ─┐
//!  ▲                     │                                             │
//!  │                     ├─ ping       -> pong (tungstenite)           │
//!  │                     ├─ request    -> spawn handler -> writer      │
//!  │                     └─ bad frame  -> warn, skip                   │
//!  └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All writes go through one [`TunnelWriter`], so concurrent handlers never
//! interleave frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use planegate_proto::{Correlated, Message};

use crate::config::AgentConfig;
use crate::dispatch::RequestHandler;
use crate::tls::{build_client_config, TlsError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

/// Upper bound on flushing the close frame of a detached socket
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Agent connection state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// Between attempts
    Disconnected,
    /// Dialing the gateway
    Connecting,
    /// Socket open and serving requests
    Connected,
    /// Run loop has exited
    Stopped,
}

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    /// Dial or upgrade failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Upgrade did not finish in time
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// No socket is attached
    #[error("not connected")]
    NotConnected,
    /// Frame could not be encoded
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    /// Socket write failed
    #[error("write failed: {0}")]
    WriteFailed(String),
}

// ============================================================================
// Writer
// ============================================================================

/// Serialized write half of the current connection.
///
/// Clones share one slot; a reconnect replaces the socket in that slot.
#[derive(Clone, Default)]
pub struct TunnelWriter {
    sink: Arc<Mutex<Option<WsSink>>>,
}

impl TunnelWriter {
    async fn attach(&self, sink: WsSink) {
        *self.sink.lock().await = Some(sink);
    }

    /// True while a socket is attached
    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Write one frame
    pub async fn send(&self, message: WsMessage) -> Result<(), ClientError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(message)
            .await
            .map_err(|e| ClientError::WriteFailed(e.to_string()))
    }

    /// Encode `value` as JSON and write it as a text frame
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ClientError> {
        let text = serde_json::to_string(value)?;
        self.send(WsMessage::text(text)).await
    }

    /// Close and detach the socket; later writes fail with `NotConnected`.
    ///
    /// The socket leaves the slot before the close frame is flushed, so
    /// writers and a reconnect never wait on a stalled peer.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        let Some(mut sink) = sink else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "error closing websocket"),
            Err(_) => debug!(timeout = ?CLOSE_TIMEOUT, "gave up closing websocket"),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Tunnel client serving one protocol through `H`
pub struct AgentClient<H: RequestHandler> {
    config: AgentConfig,
    handler: Arc<H>,
    tls: Arc<rustls::ClientConfig>,
    state: Arc<RwLock<ClientState>>,
    writer: TunnelWriter,
    stop: CancellationToken,
    attempts: AtomicU64,
}

impl<H: RequestHandler> AgentClient<H> {
    /// Build a client; TLS material is loaded here so bad paths fail early.
    pub fn new(config: AgentConfig, handler: Arc<H>) -> Result<Self, ClientError> {
        let tls = build_client_config(&config.tls)?;
        Ok(Self {
            config,
            handler,
            tls: Arc::new(tls),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            writer: TunnelWriter::default(),
            stop: CancellationToken::new(),
            attempts: AtomicU64::new(0),
        })
    }

    /// Current connection state
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Shared writer for the current connection
    pub fn writer(&self) -> TunnelWriter {
        self.writer.clone()
    }

    /// Number of dial attempts so far
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Ask the run loop to exit and close the socket
    pub fn stop(&self) {
        self.stop.cancel();
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    fn is_shutdown(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.stop.is_cancelled()
    }

    async fn shutdown(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.stop.cancelled() => {}
        }
    }

    /// Connect and serve until `cancel` fires or [`stop`](Self::stop) is called.
    ///
    /// Connection failures never end the loop; every attempt is followed by
    /// `reconnect_delay`, which is itself cut short by cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let delay = self.config.reconnect_delay;
        info!(
            plane = %self.config.plane,
            protocol = %self.config.protocol,
            url = %self.config.server_url,
            "starting agent"
        );

        while !self.is_shutdown(&cancel) {
            self.set_state(ClientState::Connecting).await;
            let connected = tokio::select! {
                result = self.connect() => result,
                _ = self.shutdown(&cancel) => break,
            };

            match connected {
                Ok(ws) => {
                    self.serve(ws, &cancel).await;
                    if self.is_shutdown(&cancel) {
                        break;
                    }
                    info!(retry_in = ?delay, "connection lost, reconnecting");
                }
                Err(e) => {
                    error!(error = %e, retry_in = ?delay, "failed to connect to gateway");
                }
            }
            self.set_state(ClientState::Disconnected).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown(&cancel) => break,
            }
        }

        self.writer.close().await;
        self.set_state(ClientState::Stopped).await;
        info!("agent stopped");
    }

    async fn connect(&self) -> Result<WsStream, ClientError> {
        let url = self.config.connect_url();
        self.attempts.fetch_add(1, Ordering::SeqCst);
        debug!(url = %url, "dialing gateway");

        let connector = Connector::Rustls(self.tls.clone());
        let dial =
            tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, Some(connector));
        let timeout = self.config.handshake_timeout;
        let (ws, _) = tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| ClientError::HandshakeTimeout(timeout))?
            .map_err(|e| ClientError::ConnectionFailed(e.to_string()))?;

        info!(url = %url, "connected to gateway");
        Ok(ws)
    }

    /// Serve one connection until it drops or shutdown is requested.
    async fn serve(&self, ws: WsStream, cancel: &CancellationToken) {
        let (sink, mut stream) = ws.split();
        self.writer.attach(sink).await;
        self.set_state(ClientState::Connected).await;

        let done = CancellationToken::new();
        let watcher = self.spawn_shutdown_watcher(cancel.clone(), done.clone());
        let heartbeat = self
            .config
            .heartbeat_interval
            .map(|every| self.spawn_heartbeat(every, done.clone()));

        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = self.shutdown(cancel) => break,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.dispatch(text),
                    Err(_) => warn!(len = bytes.len(), "ignoring non-UTF-8 binary frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(frame = ?frame, "gateway closed the connection");
                    break;
                }
                // tungstenite queues the pong for pings and flushes it on the next read
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read failed");
                    break;
                }
                None => break,
            }
        }

        done.cancel();
        watcher.abort();
        if let Some(handle) = heartbeat {
            handle.abort();
        }
        self.writer.close().await;
    }

    fn spawn_shutdown_watcher(
        &self,
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let writer = self.writer.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => writer.close().await,
                _ = stop.cancelled() => writer.close().await,
                _ = done.cancelled() => {}
            }
        })
    }

    fn spawn_heartbeat(
        &self,
        every: Duration,
        done: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let writer = self.writer.clone();
        let from = self.config.plane.identifier();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = done.cancelled() => break,
                }
                sequence += 1;
                if let Err(e) = writer.send_json(&Message::heartbeat(&from, sequence)).await {
                    debug!(error = %e, sequence, "failed to send heartbeat");
                    break;
                }
            }
        })
    }

    /// Decode a frame and serve it on its own task.
    fn dispatch(&self, text: &str) {
        let request: H::Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    error = %e,
                    protocol = %self.config.protocol,
                    len = text.len(),
                    "failed to decode request frame, skipping"
                );
                return;
            }
        };
        if request.correlation_id().is_empty() {
            warn!("received request without requestID");
            return;
        }

        let handler = self.handler.clone();
        let writer = self.writer.clone();
        let deadline = handler.deadline(&request, self.config.request_timeout);
        tokio::spawn(async move {
            let request_id = request.correlation_id().to_string();
            let response =
                match tokio::time::timeout(deadline, handler.handle(&request)).await {
                    Ok(response) => response,
                    Err(_) => {
                        warn!(request_id = %request_id, deadline = ?deadline, "request timed out");
                        handler.timed_out(&request, deadline)
                    }
                };
            if let Err(e) = writer.send_json(&response).await {
                error!(request_id = %request_id, error = %e, "failed to send response");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::extract::RawQuery;
    use axum::routing::get;
    use planegate_common::PlaneIdentity;
    use planegate_proto::{
        ClusterAgentRequest, ClusterAgentResponse, HeaderValues, HttpTunnelRequest,
        HttpTunnelResponse, Payload, ProtocolVersion,
    };
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    use crate::dispatch::ClusterAgentHandler;
    use crate::executor::KubernetesExecutor;
    use crate::resources::MockClusterResources;

    /// Answers with the request path, sleeping first for `/slow/*` paths
    struct PathEcho;

    #[async_trait]
    impl RequestHandler for PathEcho {
        type Request = HttpTunnelRequest;
        type Response = HttpTunnelResponse;

        fn protocol(&self) -> ProtocolVersion {
            ProtocolVersion::HttpTunnel
        }

        async fn handle(&self, request: &HttpTunnelRequest) -> HttpTunnelResponse {
            if let Some(ms) = request.path.strip_prefix("/slow/") {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            HttpTunnelResponse::success(
                request,
                200,
                HeaderValues::new(),
                request.path.clone().into_bytes(),
            )
        }

        fn timed_out(&self, request: &HttpTunnelRequest, _after: Duration) -> HttpTunnelResponse {
            HttpTunnelResponse::error(request, 504, "timed out")
        }
    }

    fn config_for(addr: SocketAddr) -> AgentConfig {
        let url = url::Url::parse(&format!("ws://{}/ws", addr)).unwrap();
        let mut config = AgentConfig::new(
            url,
            PlaneIdentity::new("dataplane", "dp-1").unwrap(),
            ProtocolVersion::HttpTunnel,
        );
        config.reconnect_delay = Duration::from_millis(50);
        config
    }

    async fn closed_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn request(path: &str) -> HttpTunnelRequest {
        HttpTunnelRequest::new("svc", "GET", path, "", HeaderValues::new(), vec![])
    }

    /// Gateway stand-in: reports the query, sends `requests`, then forwards
    /// every text frame it receives.
    async fn scripted_gateway(
        requests: Vec<HttpTunnelRequest>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<String>) {
        let frames = requests
            .iter()
            .map(|req| serde_json::to_string(req).unwrap())
            .collect();
        raw_gateway(frames).await
    }

    /// Like [`scripted_gateway`], but the frames are sent verbatim
    async fn raw_gateway(
        outbound: Vec<String>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<String>, mpsc::UnboundedReceiver<String>) {
        let (query_tx, query_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let app = axum::Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade, RawQuery(query): RawQuery| {
                let outbound = outbound.clone();
                let frame_tx = frame_tx.clone();
                let _ = query_tx.send(query.unwrap_or_default());
                async move {
                    ws.on_upgrade(move |socket| drive(socket, outbound, frame_tx))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (addr, query_rx, frame_rx)
    }

    async fn drive(
        mut socket: WebSocket,
        outbound: Vec<String>,
        frames: mpsc::UnboundedSender<String>,
    ) {
        for text in outbound {
            socket.send(AxumMessage::Text(text.into())).await.unwrap();
        }
        while let Some(Ok(msg)) = socket.recv().await {
            if let AxumMessage::Text(text) = msg {
                let _ = frames.send(text.as_str().to_string());
            }
        }
    }

    async fn next_response(rx: &mut mpsc::UnboundedReceiver<String>) -> HttpTunnelResponse {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("gateway closed");
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_writer_without_socket_is_not_connected() {
        let writer = TunnelWriter::default();
        assert!(!writer.is_connected().await);
        let err = writer.send_json(&request("/")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        writer.close().await;
    }

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = AgentClient::new(config_for(closed_port().await), Arc::new(PathEcho)).unwrap();
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_new_refuses_missing_client_cert() {
        let mut config = config_for(closed_port().await);
        config.tls.enabled = true;
        let err = AgentClient::new(config, Arc::new(PathEcho)).err().unwrap();
        assert!(matches!(err, ClientError::Tls(_)));
    }

    // ==========================================================================
    // Story Tests: Reconnect And Shutdown
    // ==========================================================================

    /// Story: gateway is down, the agent keeps dialing at a fixed delay and
    /// exits promptly when cancelled.
    #[tokio::test]
    async fn story_reconnects_until_cancelled() {
        let config = config_for(closed_port().await);
        let delay = config.reconnect_delay;
        let client = Arc::new(AgentClient::new(config, Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();

        let handle = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await })
        };

        tokio::time::sleep(delay * 5 + Duration::from_millis(150)).await;
        assert!(client.connect_attempts() >= 5, "attempts: {}", client.connect_attempts());

        cancel.cancel();
        tokio::time::timeout(delay + Duration::from_millis(200), handle)
            .await
            .expect("run did not exit after cancel")
            .unwrap();
        assert_eq!(client.state().await, ClientState::Stopped);
    }

    #[tokio::test]
    async fn story_stop_ends_run_loop() {
        let client = Arc::new(
            AgentClient::new(config_for(closed_port().await), Arc::new(PathEcho)).unwrap(),
        );
        let handle = {
            let client = client.clone();
            tokio::spawn(async move { client.run(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run did not exit after stop")
            .unwrap();
        assert_eq!(client.state().await, ClientState::Stopped);
    }

    // ==========================================================================
    // Story Tests: Serving Requests
    // ==========================================================================

    /// Story: a slow request does not hold back a fast one; each response
    /// carries its own requestID.
    #[tokio::test]
    async fn story_concurrent_requests_are_isolated() {
        let slow = request("/slow/400");
        let fast = request("/fast");
        let (addr, mut queries, mut frames) =
            scripted_gateway(vec![slow.clone(), fast.clone()]).await;

        let client = Arc::new(AgentClient::new(config_for(addr), Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();
        let handle = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await })
        };

        let query = queries.recv().await.unwrap();
        assert!(query.contains("planeType=dataplane"));
        assert!(query.contains("planeID=dp-1"));

        let first = next_response(&mut frames).await;
        assert_eq!(first.request_id, fast.request_id);
        assert_eq!(first.body, b"/fast");

        let second = next_response(&mut frames).await;
        assert_eq!(second.request_id, slow.request_id);
        assert_eq!(second.body, b"/slow/400");
        assert_eq!(client.state().await, ClientState::Connected);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn story_slow_handler_answers_with_timeout() {
        let slow = request("/slow/2000");
        let (addr, _queries, mut frames) = scripted_gateway(vec![slow.clone()]).await;

        let mut config = config_for(addr);
        config.request_timeout = Duration::from_millis(100);
        let client = Arc::new(AgentClient::new(config, Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();
        {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await });
        }

        let resp = next_response(&mut frames).await;
        assert_eq!(resp.request_id, slow.request_id);
        assert_eq!(resp.status_code, 504);
        cancel.cancel();
    }

    #[tokio::test]
    async fn story_invalid_frames_are_skipped() {
        let good = request("/ok");
        let (addr, _queries, mut frames) = raw_gateway(vec![
            "not json".to_string(),
            r#"{"target":"svc","method":"GET","path":"/"}"#.to_string(),
            serde_json::to_string(&good).unwrap(),
        ])
        .await;

        let client = Arc::new(AgentClient::new(config_for(addr), Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();
        {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await });
        }

        let resp = next_response(&mut frames).await;
        assert_eq!(resp.request_id, good.request_id);
        assert_eq!(resp.body, b"/ok");
        cancel.cancel();
    }

    /// Story: a cluster-agent agent is handed an http-tunnel frame. The frame
    /// is logged and dropped; no response of any shape goes back, and the
    /// next cluster-agent frame is still served.
    #[tokio::test]
    async fn story_http_tunnel_frame_is_skipped_by_cluster_agent() {
        let logs = LogBuffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let foreign = request("/api/v1/namespaces");
        let native = ClusterAgentRequest::query("scale-deployment", "dp-1", Payload::new());
        let (addr, _queries, mut frames) = raw_gateway(vec![
            serde_json::to_string(&foreign).unwrap(),
            serde_json::to_string(&native).unwrap(),
        ])
        .await;

        let mut config = config_for(addr);
        config.protocol = ProtocolVersion::ClusterAgent;
        let handler = ClusterAgentHandler::new(KubernetesExecutor::new(Arc::new(
            MockClusterResources::new(),
        )));
        let client = Arc::new(AgentClient::new(config, Arc::new(handler)).unwrap());
        let cancel = CancellationToken::new();
        {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await });
        }

        let text = tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("gateway closed");
        let resp: ClusterAgentResponse = serde_json::from_str(&text).unwrap();
        assert_eq!(resp.request_id, native.request_id);
        assert_eq!(resp.error_code(), 400);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(frames.try_recv().is_err(), "unexpected extra frame");
        assert!(!text.contains(&foreign.request_id));

        let output = logs.contents();
        assert!(output.contains("failed to decode request frame, skipping"), "{output}");
        assert!(output.contains("protocol=cluster-agent"), "{output}");
        cancel.cancel();
    }

    /// Collects formatted log lines written by a test subscriber
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<std::sync::Mutex<Vec<u8>>>);

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
        type Writer = LogBuffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    /// Story: the gateway pings an idle agent and gets its payload back.
    #[tokio::test]
    async fn story_gateway_ping_is_answered() {
        let (tx, mut pongs) = mpsc::unbounded_channel::<Vec<u8>>();
        let app = axum::Router::new().route(
            "/ws",
            get(move |ws: WebSocketUpgrade| {
                let tx = tx.clone();
                async move {
                    ws.on_upgrade(move |mut socket: WebSocket| async move {
                        socket
                            .send(AxumMessage::Ping(b"liveness".to_vec().into()))
                            .await
                            .unwrap();
                        while let Some(Ok(msg)) = socket.recv().await {
                            if let AxumMessage::Pong(data) = msg {
                                let _ = tx.send(data.to_vec());
                            }
                        }
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = Arc::new(AgentClient::new(config_for(addr), Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();
        {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await });
        }

        let pong = tokio::time::timeout(Duration::from_secs(5), pongs.recv())
            .await
            .expect("no pong")
            .unwrap();
        assert_eq!(pong, b"liveness");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_close_detaches_socket_first() {
        let (addr, _queries, _frames) = raw_gateway(vec![]).await;
        let url = format!("ws://{}/ws", addr);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (sink, _stream) = ws.split();

        let writer = TunnelWriter::default();
        writer.attach(sink).await;
        assert!(writer.is_connected().await);

        tokio::time::timeout(CLOSE_TIMEOUT + Duration::from_secs(1), writer.close())
            .await
            .expect("close did not finish");
        assert!(!writer.is_connected().await);
        let err = writer.send(WsMessage::text("late")).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));

        // a second close finds an empty slot
        writer.close().await;
    }

    #[tokio::test]
    async fn story_heartbeats_carry_increasing_sequence() {
        let (addr, _queries, mut frames) = scripted_gateway(vec![]).await;
        let mut config = config_for(addr);
        config.heartbeat_interval = Some(Duration::from_millis(50));
        let client = Arc::new(AgentClient::new(config, Arc::new(PathEcho)).unwrap());
        let cancel = CancellationToken::new();
        {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await });
        }

        let mut sequences = Vec::new();
        for _ in 0..2 {
            let text = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .unwrap()
                .unwrap();
            let msg: Message = serde_json::from_str(&text).unwrap();
            assert_eq!(msg.from, "dataplane/dp-1");
            sequences.push(msg.heartbeat_sequence().unwrap());
        }
        assert_eq!(sequences, vec![1, 2]);
        cancel.cancel();
    }
}
