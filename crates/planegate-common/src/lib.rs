//! Common types for planegate: errors, plane identity, and utilities

#![deny(missing_docs)]

pub mod duration;
pub mod env;
pub mod error;
pub mod kube_utils;
pub mod plane;
pub mod telemetry;
pub mod yaml;

pub use error::Error;
pub use plane::{plane_identifier, PlaneIdentity, PlaneType};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply when a request names none
pub const DEFAULT_FIELD_MANAGER: &str = "planegate-agent";

/// Path of the tunnel WebSocket endpoint on the gateway
pub const TUNNEL_PATH: &str = "/ws";

/// Default port for the gateway's tunnel listener
pub const DEFAULT_GATEWAY_PORT: u16 = 8443;

/// Default port for the gateway's health listener
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
