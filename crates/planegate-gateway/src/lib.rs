//! Planegate Gateway - control-plane side of the agent tunnel
//!
//! Agents in remote planes dial in over WebSocket and stay connected. The
//! gateway keeps a registry of those connections and turns calls from the
//! control plane into correlated request/response frames on them.
//!
//! - **Registry**: live connections per plane, dispatch policy, staleness
//! - **Tunnel**: request correlation by `requestID` with per-call deadlines
//! - **Server**: the `/ws` endpoint, the HTTP proxy and the plane API
//! - **Plane CA**: per-plane client certificate checks for connecting agents
//! - **Client**: typed access to the plane API for controllers

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod health;
pub mod plane_ca;
pub mod plane_api;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod tls;
pub mod tunnel;

pub use client::{ClientError, GatewayClient, GatewayClientConfig};
pub use config::{Cli, GatewayConfig, ServerTls};
pub use plane_ca::{FilePlaneCaSource, PlaneAuthError, PlaneAuthorizer, PlaneCaSource};
pub use registry::{AgentRegistry, DispatchPolicy, PlaneConnectionStatus, SharedAgentRegistry};
pub use server::{router, serve, GatewayState, ServerError};
pub use tunnel::{Tunnel, TunnelError};
