//! Plane identity
//!
//! A plane is a remote cluster reachable only through its agent. Each
//! connection is keyed by `"{planeType}/{planeID}"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of remote plane
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaneType {
    /// Runs application workloads
    Dataplane,
    /// Runs builds
    Buildplane,
    /// Runs logging/metrics backends
    Observabilityplane,
}

impl PlaneType {
    /// All plane types, in declaration order
    pub const ALL: [PlaneType; 3] = [
        PlaneType::Dataplane,
        PlaneType::Buildplane,
        PlaneType::Observabilityplane,
    ];

    /// Wire name of this plane type
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaneType::Dataplane => "dataplane",
            PlaneType::Buildplane => "buildplane",
            PlaneType::Observabilityplane => "observabilityplane",
        }
    }
}

impl fmt::Display for PlaneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaneType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PlaneType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                Error::validation_for_field(
                    "planeType",
                    format!(
                        "invalid planeType '{}': must be one of dataplane, buildplane, observabilityplane",
                        s
                    ),
                )
            })
    }
}

/// Build the registry key for a plane.
pub fn plane_identifier(plane_type: &str, plane_id: &str) -> String {
    format!("{}/{}", plane_type, plane_id)
}

/// Validated plane type and ID pair
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PlaneIdentity {
    /// Plane type
    pub plane_type: PlaneType,
    /// Plane ID (or name, for the legacy protocol)
    pub plane_id: String,
}

impl PlaneIdentity {
    /// Validate and build an identity from raw strings.
    pub fn new(plane_type: &str, plane_id: &str) -> Result<Self, Error> {
        let plane_type = plane_type.parse()?;
        if plane_id.is_empty() {
            return Err(Error::validation_for_field("planeID", "planeID is required"));
        }
        if plane_id.contains('/') {
            return Err(Error::validation_for_field(
                "planeID",
                format!("invalid planeID '{}': must not contain '/'", plane_id),
            ));
        }
        Ok(Self {
            plane_type,
            plane_id: plane_id.to_string(),
        })
    }

    /// Registry key, `"{planeType}/{planeID}"`
    pub fn identifier(&self) -> String {
        plane_identifier(self.plane_type.as_str(), &self.plane_id)
    }

    /// Parse a registry key back into an identity.
    pub fn parse(identifier: &str) -> Result<Self, Error> {
        let (plane_type, plane_id) = identifier.split_once('/').ok_or_else(|| {
            Error::validation(format!(
                "invalid plane identifier '{}': expected planeType/planeID",
                identifier
            ))
        })?;
        Self::new(plane_type, plane_id)
    }
}

impl fmt::Display for PlaneIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plane_type, self.plane_id)
    }
}
