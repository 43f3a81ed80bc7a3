//! Gateway configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use planegate_common::duration::parse_duration;
use planegate_common::{Error, DEFAULT_GATEWAY_PORT, DEFAULT_HEALTH_PORT};
use planegate_proto::ProtocolVersion;

use crate::registry::{DispatchPolicy, HEARTBEAT_STALE_THRESHOLD};
use crate::tunnel::DEFAULT_REQUEST_TIMEOUT;

/// Interval between pings to each agent
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// planegate gateway - accepts agent tunnels and proxies requests to planes
#[derive(Parser, Debug, Clone)]
#[command(name = "planegate-gateway", version, about, long_about = None)]
pub struct Cli {
    /// Address for the agent and API listener
    #[arg(long, env = "LISTEN_ADDR", default_value_t = default_listen_addr())]
    pub listen_addr: SocketAddr,

    /// Address for the plain-HTTP health listener
    #[arg(long, env = "HEALTH_ADDR", default_value_t = default_health_addr())]
    pub health_addr: SocketAddr,

    /// Server certificate (PEM); without it the listener serves plain HTTP
    #[arg(long, env = "SERVER_CERT_PATH")]
    pub server_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[arg(long, env = "SERVER_KEY_PATH")]
    pub server_key: Option<PathBuf>,

    /// CA bundle (PEM) that agent client certificates must chain to
    #[arg(long, env = "CLIENT_CA_PATH")]
    pub client_ca: Option<PathBuf>,

    /// YAML file listing each plane resource's client CA; agents are then
    /// admitted only with a certificate from their own plane's CA
    #[arg(long, env = "PLANE_CA_CONFIG_PATH")]
    pub plane_ca_config: Option<PathBuf>,

    /// Frame protocol spoken with agents
    #[arg(long, env = "TUNNEL_PROTOCOL", default_value = "http-tunnel")]
    pub protocol: ProtocolVersion,

    /// Interval between pings to each agent
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value = "30s", value_parser = duration_arg)]
    pub heartbeat_interval: Duration,

    /// Silence after which an agent connection is evicted
    #[arg(long, env = "HEARTBEAT_TIMEOUT", default_value = "90s", value_parser = duration_arg)]
    pub heartbeat_timeout: Duration,

    /// Deadline for one tunneled request
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30s", value_parser = duration_arg)]
    pub request_timeout: Duration,

    /// Connection choice when a plane has several agents: latest or round-robin
    #[arg(long, env = "DISPATCH_POLICY", default_value = "latest")]
    pub dispatch_policy: DispatchPolicy,

    /// Log filter, e.g. "debug" or "info,planegate=trace"
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_GATEWAY_PORT))
}

fn default_health_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_HEALTH_PORT))
}

/// Server TLS material
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerTls {
    /// Certificate chain (PEM)
    pub cert: PathBuf,
    /// Private key (PEM)
    pub key: PathBuf,
    /// Client CA bundle; when set, agents must present a certificate
    pub client_ca: Option<PathBuf>,
    /// Per-plane client CA file, checked when an agent connects
    pub plane_ca: Option<PathBuf>,
}

/// Validated gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Agent and API listener
    pub listen_addr: SocketAddr,
    /// Health listener
    pub health_addr: SocketAddr,
    /// TLS for the main listener; `None` serves plain HTTP
    pub tls: Option<ServerTls>,
    /// Frame protocol
    pub protocol: ProtocolVersion,
    /// Ping interval
    pub heartbeat_interval: Duration,
    /// Eviction threshold
    pub heartbeat_timeout: Duration,
    /// Tunneled request deadline
    pub request_timeout: Duration,
    /// Connection choice policy
    pub dispatch_policy: DispatchPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            health_addr: default_health_addr(),
            tls: None,
            protocol: ProtocolVersion::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_STALE_THRESHOLD,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            dispatch_policy: DispatchPolicy::default(),
        }
    }
}

impl Cli {
    /// Validate flag combinations.
    pub fn into_config(self) -> Result<GatewayConfig, Error> {
        let tls = match (self.server_cert, self.server_key) {
            (Some(cert), Some(key)) => Some(ServerTls {
                cert,
                key,
                client_ca: self.client_ca,
                plane_ca: self.plane_ca_config,
            }),
            (None, None) if self.client_ca.is_some() => {
                return Err(Error::configuration_for_key(
                    "client-ca",
                    "client CA requires --server-cert and --server-key",
                ))
            }
            (None, None) if self.plane_ca_config.is_some() => {
                return Err(Error::configuration_for_key(
                    "plane-ca-config",
                    "plane CA verification requires --server-cert and --server-key",
                ))
            }
            (None, None) => None,
            _ => {
                return Err(Error::configuration_for_key(
                    "server-cert",
                    "--server-cert and --server-key must be set together",
                ))
            }
        };

        if self.heartbeat_interval.is_zero() {
            return Err(Error::configuration_for_key(
                "heartbeat-interval",
                "heartbeat interval must be positive",
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(Error::configuration_for_key(
                "heartbeat-timeout",
                format!(
                    "heartbeat timeout ({:?}) must exceed the heartbeat interval ({:?})",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            ));
        }

        Ok(GatewayConfig {
            listen_addr: self.listen_addr,
            health_addr: self.health_addr,
            tls,
            protocol: self.protocol,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            request_timeout: self.request_timeout,
            dispatch_policy: self.dispatch_policy,
        })
    }
}
