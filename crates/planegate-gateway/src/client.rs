//! Client for the gateway's plane API
//!
//! Used by controllers to announce plane lifecycle events and to read
//! connection status. Failures are split into transient ones, worth a retry,
//! and permanent ones that need a fix on the caller's side.

use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::plane_api::{NotificationResponse, PlaneNotification, PlaneStatusList};
use crate::registry::PlaneConnectionStatus;

/// Default per-request timeout
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (status {})", code),
        None => String::new(),
    }
}

/// Errors returned by [`GatewayClient`]
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Network failure, 5xx, 429 or an unexpected status; retry later
    #[error("transient gateway error{}: {message}", status_suffix(.status))]
    Transient {
        /// HTTP status, absent for network failures
        status: Option<u16>,
        /// What went wrong
        message: String,
    },

    /// 4xx or an undecodable response; retrying will not help
    #[error("permanent gateway error{}: {message}", status_suffix(.status))]
    Permanent {
        /// HTTP status, when one was received
        status: Option<u16>,
        /// What went wrong
        message: String,
    },

    /// The client could not be built
    #[error("invalid gateway client configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// True when the call is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }

    /// HTTP status, when one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Transient { status, .. } | ClientError::Permanent { status, .. } => *status,
            ClientError::InvalidConfig(_) => None,
        }
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16, body: &str) -> ClientError {
    let (transient, message) = match status {
        500..=599 => (true, "gateway server error"),
        429 => (true, "gateway rate limited"),
        400..=499 => (false, "gateway client error"),
        _ => (true, "unexpected status code"),
    };
    let message = if body.is_empty() {
        message.to_string()
    } else {
        format!("{}: {}", message, body.trim())
    };
    if transient {
        ClientError::Transient {
            status: Some(status),
            message,
        }
    } else {
        ClientError::Permanent {
            status: Some(status),
            message,
        }
    }
}

/// Connection settings for [`GatewayClient`]
#[derive(Clone, Debug)]
pub struct GatewayClientConfig {
    /// Gateway base URL, e.g. `https://cluster-gateway:8443`
    pub base_url: String,
    /// Extra CA bundle (PEM) trusted for the gateway certificate
    pub ca_pem: Option<Vec<u8>>,
    /// Skip gateway certificate verification
    pub insecure_skip_verify: bool,
    /// Per-request timeout
    pub timeout: Duration,
}

impl GatewayClientConfig {
    /// Verified connection to `base_url` with the default timeout
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ca_pem: None,
            insecure_skip_verify: false,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

/// HTTP client for the plane API
#[derive(Clone, Debug)]
pub struct GatewayClient {
    base_url: Url,
    http: reqwest::Client,
}

impl GatewayClient {
    /// Client for `base_url` with default settings
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_config(GatewayClientConfig::new(base_url))
    }

    /// Client built from explicit settings
    pub fn with_config(config: GatewayClientConfig) -> Result<Self, ClientError> {
        if config.base_url.is_empty() {
            return Err(ClientError::InvalidConfig("base URL is required".to_string()));
        }
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::InvalidConfig(format!("invalid base URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidConfig(format!(
                "invalid base URL: {}",
                config.base_url
            )));
        }

        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(pem) = &config.ca_pem {
            let ca = reqwest::Certificate::from_pem(pem)
                .map_err(|e| ClientError::InvalidConfig(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca);
        }
        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| ClientError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { base_url, http })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                ClientError::Permanent {
                    status: None,
                    message: e.to_string(),
                }
            } else {
                ClientError::Transient {
                    status: None,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        response.json::<T>().await.map_err(|e| ClientError::Permanent {
            status: Some(status.as_u16()),
            message: format!("failed to decode response: {}", e),
        })
    }

    /// Tell the gateway a plane resource changed; its agents are disconnected.
    pub async fn notify_plane_lifecycle(
        &self,
        notification: &PlaneNotification,
    ) -> Result<NotificationResponse, ClientError> {
        let url = self.endpoint(&["api", "v1", "planes", "notify"]);
        debug!(
            url = %url,
            plane_type = %notification.plane_type,
            plane_id = %notification.plane_id,
            event = %notification.event,
            "notifying gateway of plane lifecycle event"
        );
        self.send(self.http.post(url).json(notification)).await
    }

    /// Disconnect every agent of a plane so they reconnect.
    pub async fn force_reconnect(
        &self,
        plane_type: &str,
        plane_id: &str,
    ) -> Result<NotificationResponse, ClientError> {
        let url = self.endpoint(&["api", "v1", "planes", plane_type, plane_id, "reconnect"]);
        self.send(self.http.post(url)).await
    }

    /// Connection status of one plane.
    pub async fn get_plane_status(
        &self,
        plane_type: &str,
        plane_id: &str,
    ) -> Result<PlaneConnectionStatus, ClientError> {
        let url = self.endpoint(&["api", "v1", "planes", plane_type, plane_id, "status"]);
        self.send(self.http.get(url)).await
    }

    /// Status of one plane resource, counting only agents whose certificate
    /// was accepted for it.
    pub async fn get_resource_status(
        &self,
        plane_type: &str,
        plane_id: &str,
        namespace: &str,
        name: &str,
    ) -> Result<PlaneConnectionStatus, ClientError> {
        let mut url = self.endpoint(&["api", "v1", "planes", plane_type, plane_id, "status"]);
        url.query_pairs_mut()
            .append_pair("namespace", namespace)
            .append_pair("name", name);
        self.send(self.http.get(url)).await
    }

    /// Connection status of every plane with agents.
    pub async fn get_all_plane_statuses(&self) -> Result<PlaneStatusList, ClientError> {
        let url = self.endpoint(&["api", "v1", "planes", "status"]);
        self.send(self.http.get(url)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::Outbound;
    use crate::server::{router, GatewayState};
    use axum::http::StatusCode;
    use planegate_common::PlaneIdentity;
    use rstest::rstest;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn spawn(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn failing_server(status: StatusCode) -> GatewayClient {
        let app = axum::Router::new().fallback(move || async move { (status, "nope") });
        let addr = spawn(app).await;
        GatewayClient::new(format!("http://{}", addr)).unwrap()
    }

    #[rstest]
    #[case(500, true)]
    #[case(503, true)]
    #[case(429, true)]
    #[case(400, false)]
    #[case(404, false)]
    #[case(302, true)]
    fn test_classify_status(#[case] status: u16, #[case] transient: bool) {
        let err = classify_status(status, "");
        assert_eq!(err.is_transient(), transient);
        assert_eq!(err.status(), Some(status));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            classify_status(503, "").to_string(),
            "transient gateway error (status 503): gateway server error"
        );
        assert_eq!(
            classify_status(400, "bad event\n").to_string(),
            "permanent gateway error (status 400): gateway client error: bad event"
        );
        let network = ClientError::Transient {
            status: None,
            message: "connection refused".into(),
        };
        assert_eq!(network.to_string(), "transient gateway error: connection refused");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            GatewayClient::new(""),
            Err(ClientError::InvalidConfig(_))
        ));
        assert!(matches!(
            GatewayClient::new("not a url"),
            Err(ClientError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let client = GatewayClient::new("https://gw.example.com/prefix/").unwrap();
        assert_eq!(
            client.endpoint(&["api", "v1", "planes", "status"]).as_str(),
            "https://gw.example.com/prefix/api/v1/planes/status"
        );
    }

    #[tokio::test]
    async fn test_calls_against_gateway() {
        let state = GatewayState::new(GatewayConfig::default());
        let (tx, _rx) = mpsc::channel::<Outbound>(4);
        let closed = CancellationToken::new();
        state.registry.register_authorized(
            &PlaneIdentity::new("dataplane", "dp-1").unwrap(),
            vec!["default/dp-1".to_string()],
            tx,
            closed.clone(),
        );
        let addr = spawn(router(state)).await;
        let client = GatewayClient::new(format!("http://{}", addr)).unwrap();

        let status = client.get_plane_status("dataplane", "dp-1").await.unwrap();
        assert!(status.connected);
        assert_eq!(status.authorized_resources, vec!["default/dp-1"]);
        let resource = client
            .get_resource_status("dataplane", "dp-1", "default", "dp-1")
            .await
            .unwrap();
        assert_eq!(resource.connected_agents, 1);
        let other = client
            .get_resource_status("dataplane", "dp-1", "other", "dp-1")
            .await
            .unwrap();
        assert!(!other.connected);
        assert_eq!(client.get_all_plane_statuses().await.unwrap().total, 1);

        let resp = client
            .notify_plane_lifecycle(&PlaneNotification {
                plane_type: "dataplane".into(),
                plane_id: "dp-1".into(),
                event: "updated".into(),
                namespace: "default".into(),
                name: "dp-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(resp.disconnected_agents, 1);
        assert!(closed.is_cancelled());

        let resp = client.force_reconnect("dataplane", "dp-1").await.unwrap();
        assert_eq!(resp.disconnected_agents, 0);
    }

    #[tokio::test]
    async fn test_bad_event_is_permanent() {
        let addr = spawn(router(GatewayState::new(GatewayConfig::default()))).await;
        let client = GatewayClient::new(format!("http://{}", addr)).unwrap();
        let err = client
            .notify_plane_lifecycle(&PlaneNotification {
                plane_type: "dataplane".into(),
                plane_id: "dp-1".into(),
                event: "exploded".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let client = failing_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let err = client.get_plane_status("dataplane", "dp-1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.status(), Some(503));

        let client = failing_server(StatusCode::TOO_MANY_REQUESTS).await;
        assert!(client.force_reconnect("dataplane", "dp-1").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = GatewayClient::new(format!("http://{}", addr)).unwrap();
        let err = client.get_all_plane_statuses().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.status(), None);
    }
}
