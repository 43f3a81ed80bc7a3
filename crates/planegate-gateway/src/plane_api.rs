//! Plane lifecycle and status API
//!
//! Controllers call these endpoints when a plane resource changes (for
//! example after a CA rotation) so its agents reconnect with fresh
//! credentials.

use std::fmt;
use std::str::FromStr;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::registry::PlaneConnectionStatus;
use crate::server::GatewayState;

/// Plane resource lifecycle event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaneEvent {
    /// Plane resource created
    Created,
    /// Plane resource updated
    Updated,
    /// Plane resource deleted
    Deleted,
}

impl PlaneEvent {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaneEvent::Created => "created",
            PlaneEvent::Updated => "updated",
            PlaneEvent::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PlaneEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaneEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(PlaneEvent::Created),
            "updated" => Ok(PlaneEvent::Updated),
            "deleted" => Ok(PlaneEvent::Deleted),
            other => Err(format!("unknown event type: {}", other)),
        }
    }
}

/// Body of `POST /api/v1/planes/notify`
///
/// `event` stays a string so an unknown value is reported as such rather
/// than as a decode failure.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaneNotification {
    /// Plane type
    #[serde(rename = "planeType")]
    pub plane_type: String,
    /// Plane ID
    #[serde(rename = "planeID")]
    pub plane_id: String,
    /// Lifecycle event
    pub event: String,
    /// Namespace of the plane resource
    pub namespace: String,
    /// Name of the plane resource
    pub name: String,
}

/// Result of a notification or forced reconnect
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    /// Connections closed
    pub disconnected_agents: usize,
    /// Always true on a 200
    pub success: bool,
}

/// Body of `GET /api/v1/planes/status`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneStatusList {
    /// One entry per plane with live connections
    pub planes: Vec<PlaneConnectionStatus>,
    /// Number of entries in `planes`
    pub total: usize,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, message.into()).into_response()
}

/// `POST /api/v1/planes/notify`
pub async fn notify_handler(
    State(state): State<GatewayState>,
    payload: Result<Json<PlaneNotification>, JsonRejection>,
) -> Response {
    let Json(notification) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "invalid notification payload");
            return bad_request(format!("invalid payload: {}", rejection.body_text()));
        }
    };

    if notification.plane_type.is_empty()
        || notification.plane_id.is_empty()
        || notification.event.is_empty()
    {
        warn!(
            plane_type = %notification.plane_type,
            plane_id = %notification.plane_id,
            event = %notification.event,
            "notification missing required fields"
        );
        return bad_request("missing required fields: planeType, planeID, event");
    }

    let event: PlaneEvent = match notification.event.parse() {
        Ok(event) => event,
        Err(message) => {
            warn!(event = %notification.event, "unknown plane event");
            return bad_request(message);
        }
    };

    info!(
        plane_type = %notification.plane_type,
        plane_id = %notification.plane_id,
        event = %event,
        resource = %format!("{}/{}", notification.namespace, notification.name),
        "plane notification received"
    );

    let disconnected = state
        .registry
        .disconnect_all_for_plane(&notification.plane_type, &notification.plane_id);

    info!(
        plane_type = %notification.plane_type,
        plane_id = %notification.plane_id,
        disconnected_agents = disconnected,
        "agents disconnected for reconnection"
    );

    Json(NotificationResponse {
        disconnected_agents: disconnected,
        success: true,
    })
    .into_response()
}

/// `POST /api/v1/planes/{type}/{id}/reconnect`
pub async fn reconnect_handler(
    State(state): State<GatewayState>,
    Path((plane_type, plane_id)): Path<(String, String)>,
) -> Json<NotificationResponse> {
    info!(plane_type = %plane_type, plane_id = %plane_id, "manual reconnection requested");
    let disconnected = state.registry.disconnect_all_for_plane(&plane_type, &plane_id);
    info!(
        plane_type = %plane_type,
        plane_id = %plane_id,
        disconnected_agents = disconnected,
        "manual reconnection processed"
    );
    Json(NotificationResponse {
        disconnected_agents: disconnected,
        success: true,
    })
}

/// Optional plane resource selector of the status endpoint
#[derive(Debug, Default, Deserialize)]
pub struct ResourceQuery {
    /// Resource namespace; empty for cluster-scoped resources
    #[serde(default)]
    pub namespace: String,
    /// Resource name
    pub name: Option<String>,
}

/// `GET /api/v1/planes/{type}/{id}/status[?namespace=..&name=..]`
pub async fn status_handler(
    State(state): State<GatewayState>,
    Path((plane_type, plane_id)): Path<(String, String)>,
    Query(resource): Query<ResourceQuery>,
) -> Json<PlaneConnectionStatus> {
    match resource.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => Json(state.registry.resource_status(
            &plane_type,
            &plane_id,
            &resource.namespace,
            name,
        )),
        None => Json(state.registry.plane_status(&plane_type, &plane_id)),
    }
}

/// `GET /api/v1/planes/status`
pub async fn all_status_handler(State(state): State<GatewayState>) -> Json<PlaneStatusList> {
    let planes = state.registry.all_plane_statuses();
    Json(PlaneStatusList {
        total: planes.len(),
        planes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::Outbound;
    use crate::server::router;
    use axum::body::Body;
    use axum::http::Request;
    use planegate_common::PlaneIdentity;
    use rstest::rstest;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn state() -> GatewayState {
        GatewayState::new(GatewayConfig::default())
    }

    fn connect(
        state: &GatewayState,
        plane_type: &str,
        plane_id: &str,
    ) -> (CancellationToken, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        let closed = CancellationToken::new();
        let plane = PlaneIdentity::new(plane_type, plane_id).unwrap();
        state.registry.register(&plane, tx, closed.clone());
        (closed, rx)
    }

    async fn call(state: &GatewayState, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_notify_disconnects_plane() {
        let state = state();
        let (first, _rx1) = connect(&state, "dataplane", "dp-1");
        let (second, _rx2) = connect(&state, "dataplane", "dp-1");
        let (other, _rx3) = connect(&state, "buildplane", "bp-1");

        let (status, body) = call(
            &state,
            "POST",
            "/api/v1/planes/notify",
            r#"{"planeType":"dataplane","planeID":"dp-1","event":"updated","namespace":"ns","name":"dp"}"#,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let resp: NotificationResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(
            resp,
            NotificationResponse {
                disconnected_agents: 2,
                success: true
            }
        );
        assert!(first.is_cancelled() && second.is_cancelled());
        assert!(!other.is_cancelled());
        assert!(!state.registry.is_connected("dataplane/dp-1"));
    }

    #[rstest]
    #[case(r#"{"planeType":"dataplane","event":"created"}"#, "missing required fields: planeType, planeID, event")]
    #[case(r#"{"planeType":"dataplane","planeID":"dp-1","event":"renamed"}"#, "unknown event type: renamed")]
    #[tokio::test]
    async fn test_notify_rejects(#[case] body: &str, #[case] message: &str) {
        let (status, text) = call(&state(), "POST", "/api/v1/planes/notify", body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(text, message);
    }

    #[tokio::test]
    async fn test_notify_rejects_malformed_json() {
        let (status, text) = call(&state(), "POST", "/api/v1/planes/notify", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.starts_with("invalid payload: "));
    }

    #[tokio::test]
    async fn test_reconnect_with_no_agents() {
        let (status, body) = call(&state(), "POST", "/api/v1/planes/dataplane/none/reconnect", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"disconnectedAgents":0,"success":true}"#);
    }

    #[tokio::test]
    async fn test_status_endpoints() {
        let state = state();
        let (_closed, _rx) = connect(&state, "dataplane", "dp-1");

        let (status, body) = call(&state, "GET", "/api/v1/planes/dataplane/dp-1/status", "").await;
        assert_eq!(status, StatusCode::OK);
        let plane: PlaneConnectionStatus = serde_json::from_str(&body).unwrap();
        assert!(plane.connected);
        assert_eq!(plane.connected_agents, 1);

        let (_, body) = call(&state, "GET", "/api/v1/planes/buildplane/bp-1/status", "").await;
        let plane: PlaneConnectionStatus = serde_json::from_str(&body).unwrap();
        assert!(!plane.connected);

        let (_, body) = call(&state, "GET", "/api/v1/planes/status", "").await;
        let list: PlaneStatusList = serde_json::from_str(&body).unwrap();
        assert_eq!(list.total, 1);
        assert_eq!(list.planes[0].plane_id, "dp-1");
    }

    #[tokio::test]
    async fn test_resource_status_counts_authorized_agents() {
        let state = state();
        let (tx, _rx) = mpsc::channel(8);
        state.registry.register_authorized(
            &PlaneIdentity::new("dataplane", "prod").unwrap(),
            vec!["org-a/prod-dp".to_string()],
            tx,
            CancellationToken::new(),
        );

        let (_, body) = call(
            &state,
            "GET",
            "/api/v1/planes/dataplane/prod/status?namespace=org-a&name=prod-dp",
            "",
        )
        .await;
        let plane: PlaneConnectionStatus = serde_json::from_str(&body).unwrap();
        assert!(plane.connected);
        assert_eq!(plane.authorized_resources, vec!["org-a/prod-dp"]);

        let (_, body) = call(
            &state,
            "GET",
            "/api/v1/planes/dataplane/prod/status?namespace=org-b&name=prod-dp",
            "",
        )
        .await;
        let plane: PlaneConnectionStatus = serde_json::from_str(&body).unwrap();
        assert!(!plane.connected);
        assert_eq!(plane.connected_agents, 0);
    }

    #[test]
    fn test_event_parse() {
        assert_eq!("deleted".parse::<PlaneEvent>().unwrap(), PlaneEvent::Deleted);
        assert!("Deleted".parse::<PlaneEvent>().is_err());
    }
}
