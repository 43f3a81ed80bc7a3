//! Planegate Agent - remote plane runtime
//!
//! The agent runs inside a remote plane's Kubernetes cluster and keeps an
//! **outbound** WebSocket connection to the control-plane gateway. The
//! gateway never dials in; every request reaches the plane over this tunnel.
//!
//! - **Client**: dial, reconnect with a fixed delay, serve frames concurrently
//! - **Executor**: cluster-agent CQRS operations against the local cluster
//! - **Router**: HTTP tunnel requests proxied to named backend routes
//!
//! Which of executor or router is active depends on the configured
//! [`ProtocolVersion`](planegate_proto::ProtocolVersion).

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod kube_client;
pub mod resources;
pub mod router;
pub mod tls;

pub use client::{AgentClient, ClientError, ClientState, TunnelWriter};
pub use config::{AgentConfig, Cli};
pub use dispatch::{ClusterAgentHandler, HttpTunnelHandler, RequestHandler};
pub use executor::KubernetesExecutor;
pub use router::{Router, RouterError};
