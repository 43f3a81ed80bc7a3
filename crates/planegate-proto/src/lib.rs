//! Wire protocol for the planegate agent/gateway tunnel.
//!
//! Every frame on the tunnel is a JSON text frame. Three message families
//! are defined here:
//!
//! - [`Message`]: generic envelope with request/response/broadcast/heartbeat
//!   variants, used for liveness reporting and fan-out notifications
//! - [`ClusterAgentRequest`] / [`ClusterAgentResponse`]: CQRS-framed
//!   Kubernetes operations executed by the agent
//! - [`HttpTunnelRequest`] / [`HttpTunnelResponse`]: HTTP calls proxied by
//!   the agent to a named backend route
//!
//! # Communication Flow
//!
//! ```text
//! ┌──────────────────┐   request frame (requestID=r1)    ┌──────────────────┐
//! │     Gateway      │ ────────────────────────────────► │      Agent       │
//! │ (control plane)  │                                   │  (remote plane)  │
//! │                  │ ◄──────────────────────────────── │                  │
//! └──────────────────┘   response frame (requestID=r1)   └──────────────────┘
//!            ▲                                                  │
//!            └──────────── agent dials outbound ────────────────┘
//! ```
//!
//! Responses are matched to requests solely by request ID; ordering across
//! concurrently dispatched requests is not preserved.

#![deny(missing_docs)]

use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};

pub mod cluster_agent;
pub mod error;
pub mod message;
pub mod tunnel;

pub use cluster_agent::{
    ClusterAgentRequest, ClusterAgentResponse, ErrorDetails, RequestType, ResponseStatus,
};
pub use error::ValidationError;
pub use message::{Action, Message, MessageType};
pub use tunnel::{HeaderValues, HttpTunnelRequest, HttpTunnelResponse, TunnelErrorDetails};

/// Open key/value document carried in payload fields
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Query parameter carrying the plane type on the tunnel URL
pub const PLANE_TYPE_PARAM: &str = "planeType";

/// Query parameter carrying the plane ID (current protocol)
pub const PLANE_ID_PARAM: &str = "planeID";

/// Query parameter carrying the plane name (legacy protocol)
pub const PLANE_NAME_PARAM: &str = "planeName";

/// Generate a new message/request identifier (UUID v4).
pub fn generate_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time formatted as an RFC 3339 string.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A frame that can be matched to its counterpart by request ID.
pub trait Correlated {
    /// The correlation key of this frame
    fn correlation_id(&self) -> &str;
}

/// Protocol generation spoken on one tunnel deployment.
///
/// Agent and gateway must be configured with the same value; the two
/// generations are never mixed on one wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// HTTP tunnel frames, plane identified by `planeID`
    #[default]
    HttpTunnel,
    /// CQRS cluster-agent frames, plane identified by `planeName`
    ClusterAgent,
}

impl ProtocolVersion {
    /// Query parameter that carries the plane identity for this generation
    pub fn plane_param(&self) -> &'static str {
        match self {
            ProtocolVersion::HttpTunnel => PLANE_ID_PARAM,
            ProtocolVersion::ClusterAgent => PLANE_NAME_PARAM,
        }
    }

    /// Stable string form used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::HttpTunnel => "http-tunnel",
            ProtocolVersion::ClusterAgent => "cluster-agent",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http-tunnel" | "httptunnel" => Ok(ProtocolVersion::HttpTunnel),
            "cluster-agent" | "clusteragent" => Ok(ProtocolVersion::ClusterAgent),
            other => Err(format!(
                "unknown protocol '{}': expected 'http-tunnel' or 'cluster-agent'",
                other
            )),
        }
    }
}
