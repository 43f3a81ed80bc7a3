//! Agent connection tracking
//!
//! Several agent replicas may serve one plane, so each plane identifier maps
//! to a list of live connections. Entries are removed as soon as their
//! socket ends; nothing is kept for disconnected agents.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use planegate_common::{plane_identifier, PlaneIdentity};

use crate::plane_ca::resource_key;

/// Heartbeat staleness threshold (3x the 30s ping interval)
pub const HEARTBEAT_STALE_THRESHOLD: Duration = Duration::from_secs(90);

/// Frame queued for an agent's writer task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame
    Frame(String),
    /// WebSocket ping
    Ping,
}

/// Sender half of an agent's outbound queue
pub type AgentSender = mpsc::Sender<Outbound>;

/// Which connection serves a request when a plane has several
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchPolicy {
    /// Most recently connected agent
    #[default]
    Latest,
    /// Rotate across connected agents
    RoundRobin,
}

impl DispatchPolicy {
    /// Stable string form used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchPolicy::Latest => "latest",
            DispatchPolicy::RoundRobin => "round-robin",
        }
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" => Ok(DispatchPolicy::Latest),
            "round-robin" | "roundrobin" => Ok(DispatchPolicy::RoundRobin),
            other => Err(format!(
                "unknown dispatch policy '{}': expected 'latest' or 'round-robin'",
                other
            )),
        }
    }
}

/// One live agent socket
#[derive(Debug)]
pub struct AgentConnection {
    /// Connection ID (UUID v4)
    pub id: String,
    /// Plane this agent serves
    pub plane: PlaneIdentity,
    /// When the socket was registered
    pub connected_at: DateTime<Utc>,
    /// Wall-clock time of the last inbound frame
    pub last_seen: DateTime<Utc>,
    /// Plane resources (`namespace/name`) whose CA accepted the agent's
    /// certificate; empty when per-plane verification is off
    pub authorized_resources: Vec<String>,
    last_seen_instant: Instant,
    sender: AgentSender,
    closed: CancellationToken,
}

impl AgentConnection {
    fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.last_seen_instant = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_seen_instant.elapsed() > threshold
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            id: self.id.clone(),
            plane_type: self.plane.plane_type.as_str().to_string(),
            plane_id: self.plane.plane_id.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen,
            authorized_resources: self.authorized_resources.clone(),
        }
    }

    fn is_authorized_for(&self, resource: &str) -> bool {
        self.authorized_resources.iter().any(|r| r == resource)
    }
}

/// Snapshot of a connection, safe to hold across awaits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    /// Connection ID
    pub id: String,
    /// Plane type
    pub plane_type: String,
    /// Plane ID
    #[serde(rename = "planeID")]
    pub plane_id: String,
    /// Registration time
    pub connected_at: DateTime<Utc>,
    /// Last inbound frame
    pub last_seen: DateTime<Utc>,
    /// Resources the connection is authorized for
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_resources: Vec<String>,
}

/// Connection chosen to carry one request
#[derive(Clone, Debug)]
pub struct SelectedAgent {
    /// Connection ID
    pub id: String,
    /// Outbound queue of that connection
    pub sender: AgentSender,
}

/// Connection status of one plane
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaneConnectionStatus {
    /// Plane type
    pub plane_type: String,
    /// Plane ID
    #[serde(rename = "planeID")]
    pub plane_id: String,
    /// At least one agent is connected
    pub connected: bool,
    /// Number of connected agents
    pub connected_agents: usize,
    /// Most recent frame from any agent of the plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Resources at least one connected agent is authorized for, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authorized_resources: Vec<String>,
}

/// Registry of live agent connections
///
/// Thread-safe registry using DashMap for concurrent access.
pub struct AgentRegistry {
    connections: DashMap<String, Vec<AgentConnection>>,
    round_robin: DashMap<String, usize>,
    policy: DispatchPolicy,
}

/// Shared reference to the registry
pub type SharedAgentRegistry = Arc<AgentRegistry>;

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DispatchPolicy::default())
    }
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            connections: DashMap::new(),
            round_robin: DashMap::new(),
            policy,
        }
    }

    /// Dispatch policy in effect
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Register a socket and return its connection ID.
    ///
    /// Cancelling `closed` is how the registry tells the socket's handler to
    /// hang up.
    pub fn register(
        &self,
        plane: &PlaneIdentity,
        sender: AgentSender,
        closed: CancellationToken,
    ) -> String {
        self.register_authorized(plane, Vec::new(), sender, closed)
    }

    /// Register a socket whose certificate was accepted for `authorized_resources`
    pub fn register_authorized(
        &self,
        plane: &PlaneIdentity,
        authorized_resources: Vec<String>,
        sender: AgentSender,
        closed: CancellationToken,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let identifier = plane.identifier();
        let now = Utc::now();

        let for_plane = {
            let mut conns = self.connections.entry(identifier.clone()).or_default();
            conns.push(AgentConnection {
                id: id.clone(),
                plane: plane.clone(),
                connected_at: now,
                last_seen: now,
                authorized_resources: authorized_resources.clone(),
                last_seen_instant: Instant::now(),
                sender,
                closed,
            });
            conns.len()
        };

        info!(
            plane = %identifier,
            connection_id = %id,
            authorized_resources = ?authorized_resources,
            connections_for_plane = for_plane,
            total_connections = self.count(),
            "agent registered"
        );
        id
    }

    /// Remove one connection. Returns false if it was already gone.
    pub fn unregister(&self, identifier: &str, connection_id: &str) -> bool {
        let removed = match self.connections.get_mut(identifier) {
            Some(mut conns) => {
                let before = conns.len();
                conns.retain(|c| c.id != connection_id);
                conns.len() != before
            }
            None => false,
        };

        if self
            .connections
            .remove_if(identifier, |_, conns| conns.is_empty())
            .is_some()
        {
            self.round_robin.remove(identifier);
        }

        if removed {
            info!(
                plane = %identifier,
                connection_id = %connection_id,
                total_connections = self.count(),
                "agent unregistered"
            );
        } else {
            debug!(plane = %identifier, connection_id = %connection_id, "connection already unregistered");
        }
        removed
    }

    /// Pick the connection that should carry the next request
    pub fn select(&self, identifier: &str) -> Option<SelectedAgent> {
        let conns = self.connections.get(identifier)?;
        if conns.is_empty() {
            return None;
        }

        let conn = match self.policy {
            DispatchPolicy::Latest => conns.last()?,
            DispatchPolicy::RoundRobin => {
                let mut next = self.round_robin.entry(identifier.to_string()).or_insert(0);
                let idx = *next % conns.len();
                *next = (idx + 1) % conns.len();
                &conns[idx]
            }
        };

        Some(SelectedAgent {
            id: conn.id.clone(),
            sender: conn.sender.clone(),
        })
    }

    /// Record inbound activity on a connection
    pub fn touch(&self, identifier: &str, connection_id: &str) {
        if let Some(mut conns) = self.connections.get_mut(identifier) {
            if let Some(conn) = conns.iter_mut().find(|c| c.id == connection_id) {
                conn.touch();
            }
        }
    }

    /// Total live connections across all planes
    pub fn count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    /// True if the plane has at least one live connection
    pub fn is_connected(&self, identifier: &str) -> bool {
        self.connections
            .get(identifier)
            .is_some_and(|conns| !conns.is_empty())
    }

    /// Snapshots of a plane's connections, oldest first
    pub fn connected_agents(&self, identifier: &str) -> Vec<AgentInfo> {
        self.connections
            .get(identifier)
            .map(|conns| conns.iter().map(AgentConnection::info).collect())
            .unwrap_or_default()
    }

    /// Hang up every agent of a plane and forget them. Returns how many.
    pub fn disconnect_all_for_plane(&self, plane_type: &str, plane_id: &str) -> usize {
        let identifier = plane_identifier(plane_type, plane_id);
        self.round_robin.remove(&identifier);
        let Some((_, conns)) = self.connections.remove(&identifier) else {
            debug!(plane = %identifier, "no connections to disconnect");
            return 0;
        };

        for conn in &conns {
            info!(plane = %identifier, connection_id = %conn.id, "disconnecting agent");
            conn.closed.cancel();
        }
        info!(plane = %identifier, disconnected = conns.len(), "disconnected all agents for plane");
        conns.len()
    }

    /// Hang up one connection and forget it
    pub fn evict(&self, identifier: &str, connection_id: &str) {
        let closed = self.connections.get(identifier).and_then(|conns| {
            conns
                .iter()
                .find(|c| c.id == connection_id)
                .map(|c| c.closed.clone())
        });
        if let Some(closed) = closed {
            warn!(plane = %identifier, connection_id = %connection_id, "evicting silent agent");
            closed.cancel();
            self.unregister(identifier, connection_id);
        }
    }

    /// Status of one plane; a plane with no connections reports disconnected
    pub fn plane_status(&self, plane_type: &str, plane_id: &str) -> PlaneConnectionStatus {
        let identifier = plane_identifier(plane_type, plane_id);
        match self.connections.get(&identifier) {
            Some(conns) => status_for(plane_type, plane_id, &conns),
            None => status_for(plane_type, plane_id, &[]),
        }
    }

    /// Status of one plane resource, counting only agents authorized for it
    pub fn resource_status(
        &self,
        plane_type: &str,
        plane_id: &str,
        namespace: &str,
        name: &str,
    ) -> PlaneConnectionStatus {
        let identifier = plane_identifier(plane_type, plane_id);
        let resource = resource_key(namespace, name);
        let mut status = status_for(plane_type, plane_id, &[]);
        if let Some(conns) = self.connections.get(&identifier) {
            let authorized: Vec<&AgentConnection> =
                conns.iter().filter(|c| c.is_authorized_for(&resource)).collect();
            if !authorized.is_empty() {
                status.connected = true;
                status.connected_agents = authorized.len();
                status.last_seen = authorized.iter().map(|c| c.last_seen).max();
                status.authorized_resources = vec![resource];
            }
        }
        status
    }

    /// Status of every plane with live connections, sorted by identifier
    pub fn all_plane_statuses(&self) -> Vec<PlaneConnectionStatus> {
        let mut statuses: Vec<(String, PlaneConnectionStatus)> = self
            .connections
            .iter()
            .filter_map(|entry| {
                let (plane_type, plane_id) = entry.key().split_once('/')?;
                Some((
                    entry.key().clone(),
                    status_for(plane_type, plane_id, entry.value()),
                ))
            })
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses.into_iter().map(|(_, s)| s).collect()
    }

    /// Connections silent for longer than `threshold`, as (identifier, connection ID)
    pub fn detect_stale(&self, threshold: Duration) -> Vec<(String, String)> {
        self.connections
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|c| c.is_stale(threshold))
                    .map(|c| (entry.key().clone(), c.id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

fn status_for(plane_type: &str, plane_id: &str, conns: &[AgentConnection]) -> PlaneConnectionStatus {
    PlaneConnectionStatus {
        plane_type: plane_type.to_string(),
        plane_id: plane_id.to_string(),
        connected: !conns.is_empty(),
        connected_agents: conns.len(),
        last_seen: conns.iter().map(|c| c.last_seen).max(),
        authorized_resources: conns
            .iter()
            .flat_map(|c| c.authorized_resources.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
    }
}
