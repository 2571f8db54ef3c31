//! # ridesafe-types
//!
//! Shared alert and presence structures for the RideSafe dispatch system.
//!
//! These types are used by:
//! - `backend-rust`: HTTP request/response bodies, datastore records and
//!   Socket.IO push payloads
//! - `ridesafe-device`: internet transport client, mesh payloads and the
//!   emergency controller
//!
//! ## Conventions
//!
//! - All timestamps are Unix epoch milliseconds (`i64`)
//! - Coordinates are WGS-84 decimal degrees
//! - Wire field names are camelCase, enum values SCREAMING_SNAKE_CASE

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Maximum number of prior positions carried with an alert.
pub const MAX_BREADCRUMBS: usize = 10;

/// Riders further than this from an alert are not notified.
pub const DEFAULT_DISPATCH_RADIUS_M: f64 = 1000.0;

/// A rider counts as active when its last heartbeat is at most this old.
pub const DEFAULT_PRESENCE_FRESHNESS_MS: i64 = 60_000;

/// Socket.IO event names shared by the backend and device push channel.
pub mod push_events {
    pub const NEW_NEARBY: &str = "alert:new_nearby";
    pub const ASSIGNED: &str = "alert:assigned";
    pub const CANCELLED: &str = "alert:cancelled";
    /// Client → server, once per connection.
    pub const REGISTER_DEVICE: &str = "register_device";
    /// Server → client acknowledgement of `register_device`.
    pub const DEVICE_REGISTERED: &str = "device:registered";
}

/// Private push room for one device.
pub fn device_room(device_id: &str) -> String {
    format!("device:{device_id}")
}

// ── Geography ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Great-circle distance in meters (haversine on a spherical Earth).
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// One timestamped position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreadcrumbPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
}

impl BreadcrumbPoint {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// Location attached to an alert at trigger time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_ms: i64,
    /// Prior positions, oldest first. At most [`MAX_BREADCRUMBS`].
    #[serde(default)]
    pub breadcrumb_trail: Vec<BreadcrumbPoint>,
}

impl AlertLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Builds a location from a fix plus the trail that preceded it.
    /// Keeps only the newest [`MAX_BREADCRUMBS`] trail points.
    pub fn from_fix(fix: BreadcrumbPoint, trail: &[BreadcrumbPoint]) -> Self {
        let skip = trail.len().saturating_sub(MAX_BREADCRUMBS);
        Self {
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp_ms: fix.timestamp_ms,
            breadcrumb_trail: trail[skip..].to_vec(),
        }
    }
}

// ── Alert Status ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Triggered,
    Dispatching,
    Dispatched,
    ResponderAssigned,
    Resolved,
    Cancelled,
    Escalated,
}

impl AlertStatus {
    /// Statuses from which a responder may still claim the alert.
    pub const CLAIMABLE: [AlertStatus; 3] = [
        AlertStatus::Triggered,
        AlertStatus::Dispatching,
        AlertStatus::Dispatched,
    ];

    /// Targets reachable through `PATCH /alerts/:id/status`.
    pub const MANUAL_TARGETS: [AlertStatus; 2] = [AlertStatus::Cancelled, AlertStatus::Escalated];

    pub const ALL: [AlertStatus; 7] = [
        AlertStatus::Triggered,
        AlertStatus::Dispatching,
        AlertStatus::Dispatched,
        AlertStatus::ResponderAssigned,
        AlertStatus::Resolved,
        AlertStatus::Cancelled,
        AlertStatus::Escalated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Triggered => "TRIGGERED",
            AlertStatus::Dispatching => "DISPATCHING",
            AlertStatus::Dispatched => "DISPATCHED",
            AlertStatus::ResponderAssigned => "RESPONDER_ASSIGNED",
            AlertStatus::Resolved => "RESOLVED",
            AlertStatus::Cancelled => "CANCELLED",
            AlertStatus::Escalated => "ESCALATED",
        }
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }

}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown alert status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for AlertStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ── Backend Records ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRecord {
    pub id: String,
    /// Victim device
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub victim_name: Option<String>,
    pub status: AlertStatus,
    pub triggered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<AlertLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiderPresence {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Fix time reported by the device
    pub timestamp: i64,
    /// Server receive time of the latest heartbeat
    pub last_seen_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl RiderPresence {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

// ── HTTP Bodies ───────────────────────────────────────────────────────────────

/// `POST /api/v1/alerts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlertRequest {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub victim_name: Option<String>,
    pub status: AlertStatus,
    pub triggered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<AlertLocation>,
}

/// `PATCH /api/v1/alerts/:id/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: AlertStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateResponse {
    pub id: String,
    pub status: AlertStatus,
    pub updated_at: i64,
}

/// `POST /api/v1/alerts/:id/accept`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequest {
    pub responder_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
}

/// `POST /api/v1/riders/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub device_id: String,
    pub location: HeartbeatLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub ok: bool,
    pub device_id: String,
    pub last_seen_at: i64,
}

// ── Push Payloads ─────────────────────────────────────────────────────────────

/// `alert:new_nearby`, also delivered from SOS_TRIGGERED mesh envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyAlert {
    pub alert_id: String,
    pub victim_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub victim_name: Option<String>,
    pub triggered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<AlertLocation>,
    /// Receiver's distance to the victim, when both positions are known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_m: Option<f64>,
}

/// `alert:assigned`, also delivered from SOS_ASSIGNED mesh envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedNotice {
    pub alert_id: String,
    pub victim_device_id: String,
    pub responder_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_name: Option<String>,
    pub assigned_at: i64,
}

/// `alert:cancelled`, also delivered from SOS_CANCELLED mesh envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledNotice {
    pub alert_id: String,
    pub victim_device_id: String,
    pub cancelled_at: i64,
}
