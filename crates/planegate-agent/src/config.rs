//! Agent configuration
//!
//! Flags take precedence over environment variables (clap's `env`
//! fallback). Routes are read from an optional YAML or JSON file whose
//! secrets may be indirected through environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use serde_json::Value;

use planegate_common::duration::parse_duration;
use planegate_common::env::{EnvSource, OsEnv};
use planegate_common::yaml::parse_document;
use planegate_common::{Error, PlaneIdentity};
use planegate_proto::ProtocolVersion;

use crate::router::{AuthConfig, AuthType, RouteConfig};
use crate::tls::TlsSettings;

/// WebSocket handshake timeout
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

/// planegate agent - tunnels control-plane requests into this cluster
#[derive(Parser, Debug, Clone)]
#[command(name = "planegate-agent", version, about, long_about = None)]
pub struct Cli {
    /// Gateway WebSocket URL, e.g. wss://gateway.example.com:8443/ws
    #[arg(long, env = "SERVER_URL")]
    pub server_url: String,

    /// Plane type: dataplane, buildplane or observabilityplane
    #[arg(long, env = "PLANE_TYPE", default_value = "dataplane")]
    pub plane_type: String,

    /// Plane ID (sent as planeName with the cluster-agent protocol)
    #[arg(long, env = "PLANE_ID")]
    pub plane_id: String,

    /// Frame protocol spoken with the gateway
    #[arg(long, env = "TUNNEL_PROTOCOL", default_value = "http-tunnel")]
    pub protocol: ProtocolVersion,

    /// Present a client certificate and verify the gateway
    #[arg(long, env = "TLS_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub tls_enabled: bool,

    /// Client certificate (PEM)
    #[arg(long, env = "CLIENT_CERT_PATH")]
    pub client_cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "CLIENT_KEY_PATH")]
    pub client_key: Option<PathBuf>,

    /// Gateway CA bundle (PEM)
    #[arg(long, env = "SERVER_CA_PATH")]
    pub server_ca: Option<PathBuf>,

    /// Connect without server verification if the CA cannot be loaded
    #[arg(long)]
    pub insecure_skip_ca_fallback: bool,

    /// Delay between connection attempts (e.g. 5s, 1m)
    #[arg(long, env = "RECONNECT_DELAY", default_value = "5s", value_parser = duration_arg)]
    pub reconnect_delay: Duration,

    /// Send structured heartbeat messages at this interval
    #[arg(long, env = "HEARTBEAT_INTERVAL", value_parser = duration_arg)]
    pub heartbeat_interval: Option<Duration>,

    /// Upper bound for handling one request
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "30s", value_parser = duration_arg)]
    pub request_timeout: Duration,

    /// YAML or JSON list of HTTP routes
    #[arg(long, env = "ROUTES_FILE")]
    pub routes_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,planegate=trace"
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Validated agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Gateway URL without plane query parameters
    pub server_url: url::Url,
    /// Which plane this agent serves
    pub plane: PlaneIdentity,
    /// Frame protocol
    pub protocol: ProtocolVersion,
    /// TLS dial settings
    pub tls: TlsSettings,
    /// Fixed delay between connection attempts
    pub reconnect_delay: Duration,
    /// Optional structured heartbeat interval
    pub heartbeat_interval: Option<Duration>,
    /// Upper bound for handling one request
    pub request_timeout: Duration,
    /// WebSocket handshake timeout
    pub handshake_timeout: Duration,
    /// User routes
    pub routes: Vec<RouteConfig>,
}

impl AgentConfig {
    /// Minimal configuration for a plane, without TLS or routes
    pub fn new(server_url: url::Url, plane: PlaneIdentity, protocol: ProtocolVersion) -> Self {
        Self {
            server_url,
            plane,
            protocol,
            tls: TlsSettings::default(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: None,
            request_timeout: Duration::from_secs(30),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            routes: Vec::new(),
        }
    }

    /// Gateway URL carrying the plane identity as query parameters
    pub fn connect_url(&self) -> url::Url {
        let mut url = self.server_url.clone();
        url.query_pairs_mut()
            .append_pair(planegate_proto::PLANE_TYPE_PARAM, self.plane.plane_type.as_str())
            .append_pair(self.protocol.plane_param(), &self.plane.plane_id);
        url
    }
}

impl Cli {
    /// Validate flags and load the routes file.
    pub fn into_config(self) -> Result<AgentConfig, Error> {
        self.into_config_with(&OsEnv)
    }

    /// Like [`Cli::into_config`], resolving route secrets from `env`.
    pub fn into_config_with(self, env: &dyn EnvSource) -> Result<AgentConfig, Error> {
        let server_url = parse_server_url(&self.server_url)?;
        let plane = PlaneIdentity::new(&self.plane_type, &self.plane_id)?;
        let routes = match &self.routes_file {
            Some(path) => load_routes(path, env)?,
            None => Vec::new(),
        };

        if self.tls_enabled && server_url.scheme() == "ws" {
            tracing::warn!(url = %server_url, "TLS enabled but server URL is not wss; dialing in cleartext");
        }

        Ok(AgentConfig {
            server_url,
            plane,
            protocol: self.protocol,
            tls: TlsSettings {
                enabled: self.tls_enabled,
                client_cert: self.client_cert,
                client_key: self.client_key,
                server_ca: self.server_ca,
                insecure_skip_ca_fallback: self.insecure_skip_ca_fallback,
            },
            reconnect_delay: self.reconnect_delay,
            heartbeat_interval: self.heartbeat_interval,
            request_timeout: self.request_timeout,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            routes,
        })
    }
}

/// Parse a gateway URL; only `ws` and `wss` are accepted.
pub fn parse_server_url(raw: &str) -> Result<url::Url, Error> {
    let url = url::Url::parse(raw)
        .map_err(|e| Error::configuration_for_key("server-url", format!("invalid server URL: {}", e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(Error::configuration_for_key(
            "server-url",
            format!("unsupported scheme '{}': expected ws or wss", other),
        )),
    }
}

// ============================================================================
// Routes file
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteAuthEntry {
    #[serde(rename = "type", default)]
    auth_type: AuthType,
    #[serde(default)]
    token: String,
    #[serde(default)]
    token_env: Option<String>,
    #[serde(default)]
    username: String,
    #[serde(default)]
    username_env: Option<String>,
    #[serde(default)]
    password: String,
    #[serde(default)]
    password_env: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    name: String,
    endpoint: String,
    #[serde(default)]
    auth: RouteAuthEntry,
}

fn resolve(env: &dyn EnvSource, inline: String, var: Option<&str>) -> String {
    var.and_then(|key| env.var(key))
        .filter(|v| !v.is_empty())
        .unwrap_or(inline)
}

impl RouteEntry {
    fn into_route(self, env: &dyn EnvSource) -> Result<RouteConfig, Error> {
        if self.name.is_empty() {
            return Err(Error::configuration_for_key("routes", "route name must not be empty"));
        }
        url::Url::parse(&self.endpoint).map_err(|e| {
            Error::configuration_for_key(
                "routes",
                format!("route {}: invalid endpoint '{}': {}", self.name, self.endpoint, e),
            )
        })?;

        let auth = self.auth;
        Ok(RouteConfig {
            name: self.name,
            endpoint: self.endpoint.trim_end_matches('/').to_string(),
            auth: AuthConfig {
                auth_type: auth.auth_type,
                token: resolve(env, auth.token, auth.token_env.as_deref()),
                username: resolve(env, auth.username, auth.username_env.as_deref()),
                password: resolve(env, auth.password, auth.password_env.as_deref()),
            },
        })
    }
}

/// Parse a routes document: a list, or an object with a `routes` list.
pub fn parse_routes(input: &str, env: &dyn EnvSource) -> Result<Vec<RouteConfig>, Error> {
    let doc = parse_document(input)
        .map_err(|e| Error::configuration_for_key("routes", e.to_string()))?;
    let list = match doc {
        Value::Null => return Ok(Vec::new()),
        Value::Object(mut map) => map.remove("routes").unwrap_or(Value::Array(Vec::new())),
        other => other,
    };
    let entries: Vec<RouteEntry> = serde_json::from_value(list)
        .map_err(|e| Error::configuration_for_key("routes", e.to_string()))?;
    entries.into_iter().map(|e| e.into_route(env)).collect()
}

/// Read and parse a routes file.
pub fn load_routes(path: &Path, env: &dyn EnvSource) -> Result<Vec<RouteConfig>, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::configuration_for_key("routes-file", format!("{}: {}", path.display(), e))
    })?;
    parse_routes(&content, env)
}
