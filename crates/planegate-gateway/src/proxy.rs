//! HTTP proxy into a plane
//!
//! `ANY /api/proxy/{planeType}/{planeID}/{target}/{*path}` is tunneled to the
//! plane's agent as one `HttpTunnelRequest`. Streaming requests (watches,
//! followed logs, upgrades) cannot be expressed as a single request/response
//! pair and are refused with 501.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use planegate_common::PlaneIdentity;
use planegate_proto::{HeaderValues, HttpTunnelRequest, HttpTunnelResponse};

use crate::server::GatewayState;

/// Header carrying the caller's request ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Largest request body the proxy buffers
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe the caller's hop and must not reach the backend
const HOP_BY_HOP: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Path parameters of the proxy route
#[derive(Debug, Deserialize)]
pub struct ProxyPath {
    plane_type: String,
    plane_id: String,
    target: String,
    #[serde(default)]
    path: String,
}

/// Caller's `X-Request-ID`, or a fresh `gw-` prefixed ID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(16);
            format!("gw-{}", id)
        })
}

/// True for requests that need a long-lived response stream.
pub fn is_streaming(path: &str, query: &str, headers: &HeaderMap) -> bool {
    if query.contains("watch=true") {
        return true;
    }
    if path.contains("/log") && query.contains("follow=true") {
        return true;
    }
    let connection_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"));
    connection_upgrade || headers.contains_key(http::header::UPGRADE)
}

fn tunneled_headers(headers: &HeaderMap) -> HeaderValues {
    let mut out = HeaderValues::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

/// Proxy one request through the plane's agent
pub async fn proxy_handler(
    State(state): State<GatewayState>,
    Path(params): Path<ProxyPath>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let request_id = request_id(&parts.headers);

    let plane = match PlaneIdentity::new(&params.plane_type, &params.plane_id) {
        Ok(plane) => plane,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let identifier = plane.identifier();
    let path = format!("/{}", params.path);
    let query = parts.uri.query().unwrap_or_default();

    if is_streaming(&path, query, &parts.headers) {
        warn!(
            plane = %identifier,
            target = %params.target,
            path = %path,
            request_id = %request_id,
            "streaming request refused"
        );
        return (
            StatusCode::NOT_IMPLEMENTED,
            "streaming requests are not supported through the tunnel",
        )
            .into_response();
    }

    let body: Bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };

    info!(
        plane = %identifier,
        target = %params.target,
        method = %parts.method,
        path = %path,
        request_id = %request_id,
        "proxy request received"
    );

    let mut tunnel_req = HttpTunnelRequest::new(
        params.target.as_str(),
        parts.method.as_str(),
        path,
        query,
        tunneled_headers(&parts.headers),
        body.to_vec(),
    );
    tunnel_req.gateway_request_id = request_id.clone();

    match state
        .tunnel
        .send_http_request(&identifier, tunnel_req, state.config.request_timeout)
        .await
    {
        Ok(resp) => {
            info!(
                plane = %identifier,
                target = %params.target,
                status = resp.status_code,
                request_id = %request_id,
                "proxy request completed"
            );
            into_response(resp)
        }
        Err(e) => {
            warn!(
                plane = %identifier,
                target = %params.target,
                request_id = %request_id,
                error = %e,
                "proxy request failed"
            );
            (e.status_code(), format!("proxy request failed: {}", e)).into_response()
        }
    }
}

fn into_response(resp: HttpTunnelResponse) -> Response {
    let status = match StatusCode::from_u16(resp.status_code) {
        Ok(status) => status,
        Err(_) => {
            warn!(status = resp.status_code, "agent returned an invalid status code");
            return (
                StatusCode::BAD_GATEWAY,
                format!("agent returned invalid status {}", resp.status_code),
            )
                .into_response();
        }
    };

    let mut headers = HeaderMap::new();
    for (name, values) in &resp.headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }

    let body = match (&resp.error, resp.body.is_empty()) {
        (Some(error), true) => error.message.clone().into_bytes(),
        _ => resp.body,
    };

    (status, headers, body).into_response()
}
