//! Core location report types for meshtrack.
//!
//! This module defines the immutable [`LocationReport`] record that every node
//! stores and exchanges, plus [`ReportDraft`], the loosely-typed shape accepted
//! at ingest before validation and id/timestamp assignment.

use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Opaque key/value metadata attached to a report.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The kind of entity a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Emergency responder or volunteer.
    Responder,
    /// Person needing help.
    Civilian,
    /// Event or emergency situation.
    Incident,
    /// Safe spot, shelter or supply point.
    Resource,
    /// Danger zone or obstacle.
    Hazard,
}

impl EntityType {
    /// Every valid entity type, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Responder,
        Self::Civilian,
        Self::Incident,
        Self::Resource,
        Self::Hazard,
    ];

    /// The wire name of this entity type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Responder => "responder",
            Self::Civilian => "civilian",
            Self::Incident => "incident",
            Self::Resource => "resource",
            Self::Hazard => "hazard",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                Error::validation(format!(
                    "invalid entity_type '{s}', expected one of: responder, civilian, incident, resource, hazard"
                ))
            })
    }
}

/// Geographic coordinates of a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in decimal degrees.
    #[serde(rename = "lat")]
    pub latitude: f64,
    /// Longitude in decimal degrees.
    #[serde(rename = "lon")]
    pub longitude: f64,
    /// Altitude in metres above sea level.
    #[serde(rename = "alt", default)]
    pub altitude: Option<f64>,
    /// GPS accuracy in metres.
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl Position {
    /// Create a position with no altitude or accuracy.
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
        }
    }

    /// Check that this is a valid coordinate pair.
    ///
    /// # Errors
    ///
    /// Returns a validation error for non-finite or out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::validation(format!(
                "latitude {} out of range [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::validation(format!(
                "longitude {} out of range [-180, 180]",
                self.longitude
            )));
        }
        if self.accuracy.is_some_and(|a| !a.is_finite() || a < 0.0) {
            return Err(Error::validation("accuracy must be a non-negative number"));
        }
        if self.altitude.is_some_and(|a| !a.is_finite()) {
            return Err(Error::validation("altitude must be a finite number"));
        }
        Ok(())
    }
}

/// An immutable location report.
///
/// Reports are append-only: once stored they are never updated, and the `id`
/// is unique across the whole mesh so the same report merged from several
/// peers collapses to a single row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    /// Mesh-wide unique identifier.
    pub id: Uuid,
    /// The tracked entity.
    pub entity_id: Uuid,
    /// What kind of entity this is.
    pub entity_type: EntityType,
    /// Where the entity was.
    pub position: Position,
    /// Opaque additional context.
    #[serde(default)]
    pub metadata: Metadata,
    /// The node that created this report.
    #[serde(rename = "node_id")]
    pub origin_node_id: String,
    /// UTC milliseconds timestamp of creation.
    pub created_at: i64,
}

impl LocationReport {
    /// Check that a fully-formed report can be stored.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the position is invalid, the origin node
    /// is empty or the timestamp is negative.
    pub fn validate(&self) -> Result<()> {
        self.position.validate()?;
        if self.origin_node_id.trim().is_empty() {
            return Err(Error::validation("node_id must not be empty"));
        }
        if self.created_at < 0 {
            return Err(Error::validation("created_at must not be negative"));
        }
        Ok(())
    }

    /// The `(created_at, id)` key reports are ordered by during sync.
    #[must_use]
    pub fn sync_key(&self) -> (i64, String) {
        (self.created_at, self.id.to_string())
    }
}

/// A report as submitted to the ingest endpoint.
///
/// Everything a peer forwards is present; a local client usually only sends
/// the entity, its type and its position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportDraft {
    /// Report id, assigned if absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// The tracked entity.
    pub entity_id: Uuid,
    /// Entity type, checked against [`EntityType`].
    pub entity_type: String,
    /// Position, required.
    #[serde(default)]
    pub position: Option<Position>,
    /// Optional metadata.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Origin node, defaults to the receiving node.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Creation timestamp in UTC milliseconds, defaults to now.
    #[serde(default)]
    pub created_at: Option<i64>,
}

impl ReportDraft {
    /// Validate the draft and fill in anything missing.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the entity type is unknown or the
    /// position is missing or invalid.
    pub fn finalize(self, default_origin: &str) -> Result<LocationReport> {
        let entity_type: EntityType = self.entity_type.parse()?;
        let position = self
            .position
            .ok_or_else(|| Error::validation("position is required"))?;

        let origin_node_id = self
            .node_id
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_origin.to_string());

        let report = LocationReport {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            entity_id: self.entity_id,
            entity_type,
            position,
            metadata: self.metadata.unwrap_or_default(),
            origin_node_id,
            created_at: self.created_at.unwrap_or_else(now_millis),
        };
        report.validate()?;
        Ok(report)
    }
}

impl From<&LocationReport> for ReportDraft {
    fn from(report: &LocationReport) -> Self {
        Self {
            id: Some(report.id),
            entity_id: report.entity_id,
            entity_type: report.entity_type.to_string(),
            position: Some(report.position),
            metadata: Some(report.metadata.clone()),
            node_id: Some(report.origin_node_id.clone()),
            created_at: Some(report.created_at),
        }
    }
}

/// Current UTC time in milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
