//! dispatch.rs — Alert intake, nearby matching and responder assignment
//!
//! ## Flow
//! 1. `create_alert` stores a TRIGGERED record, then matches riders whose
//!    heartbeat is fresh and who are within the dispatch radius, nearest first.
//!    Each match gets `alert:new_nearby` with its own distance.
//! 2. `accept` claims the alert with one conditional update. Exactly one of any
//!    number of concurrent claims wins; the rest are told why they lost.
//! 3. `update_status` cancels or escalates a TRIGGERED alert. Cancellation is
//!    pushed to the victim and to the riders who were told about it.
//!
//! Push and audit failures are logged and never fail the operation.

use std::sync::Arc;

use ridesafe_types::{
    haversine_m, push_events, AcceptRequest, AlertRecord, AlertStatus, AssignedNotice, CancelledNotice,
    CreateAlertRequest, GeoPoint, HeartbeatAck, HeartbeatRequest, NearbyAlert, RiderPresence, StatusUpdateResponse,
};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLogger};
use crate::config::BackendConfig;
use crate::error::{ApiError, StoreError};
use crate::persistence::Datastore;
use crate::push::Notifier;

#[derive(Debug, Clone, PartialEq)]
pub struct RiderMatch {
    pub device_id: String,
    pub distance_m: f64,
}

/// Riders within `radius_m` of `at`, excluding the victim, nearest first.
/// Freshness is applied by the caller's query.
pub fn match_nearby(riders: &[RiderPresence], victim_device_id: &str, at: GeoPoint, radius_m: f64) -> Vec<RiderMatch> {
    let mut matches: Vec<RiderMatch> = riders
        .iter()
        .filter(|r| r.device_id != victim_device_id)
        .map(|r| RiderMatch { device_id: r.device_id.clone(), distance_m: haversine_m(at, r.point()) })
        .filter(|m| m.distance_m <= radius_m)
        .collect();
    matches.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    matches
}

pub struct DispatchService {
    store: Datastore,
    notifier: Arc<dyn Notifier>,
    audit: AuditLogger,
    radius_m: f64,
    freshness_ms: i64,
}

impl DispatchService {
    pub fn new(store: Datastore, notifier: Arc<dyn Notifier>, audit: AuditLogger, config: &BackendConfig) -> Self {
        Self {
            store,
            notifier,
            audit,
            radius_m: config.dispatch_radius_m,
            freshness_ms: config.presence_freshness_ms,
        }
    }

    pub fn store(&self) -> &Datastore {
        &self.store
    }

    fn push<T: Serialize>(&self, device_id: &str, event: &'static str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.notifier.notify(device_id, event, &value),
            Err(e) => warn!("Could not encode {event} for {device_id}: {e}"),
        }
    }

    async fn riders_near(&self, at: GeoPoint, victim_device_id: &str, now_ms: i64) -> Result<Vec<RiderMatch>, StoreError> {
        let riders = self.store.active_riders(now_ms - self.freshness_ms).await?;
        Ok(match_nearby(&riders, victim_device_id, at, self.radius_m))
    }

    // ── Create + dispatch ─────────────────────────────────────────────────────

    pub async fn create_alert(&self, req: CreateAlertRequest, now_ms: i64) -> Result<AlertRecord, ApiError> {
        let record = AlertRecord {
            id: Uuid::new_v4().to_string(),
            device_id: req.device_id,
            victim_name: req.victim_name,
            status: AlertStatus::Triggered,
            triggered_at: req.triggered_at,
            location: req.location,
            responder_device_id: None,
            responder_name: None,
            assigned_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        };
        self.store.insert_alert(&record).await?;
        info!("🆘 Alert {} created for {}", record.id, record.device_id);
        self.audit
            .append(
                AuditEventType::AlertCreated,
                &record.id,
                json!({ "deviceId": record.device_id, "triggeredAt": record.triggered_at, "hasLocation": record.location.is_some() }),
            )
            .await;

        if let Err(e) = self.dispatch(&record, now_ms).await {
            warn!("Dispatch for alert {} failed: {e}", record.id);
        }
        Ok(record)
    }

    /// Notifies every nearby active rider. Returns who was notified.
    pub async fn dispatch(&self, alert: &AlertRecord, now_ms: i64) -> Result<Vec<RiderMatch>, StoreError> {
        let Some(location) = &alert.location else {
            info!("Alert {} has no location, skipping nearby matching", alert.id);
            return Ok(Vec::new());
        };
        let matches = self.riders_near(location.point(), &alert.device_id, now_ms).await?;
        for m in &matches {
            let notice = NearbyAlert {
                alert_id: alert.id.clone(),
                victim_device_id: alert.device_id.clone(),
                victim_name: alert.victim_name.clone(),
                triggered_at: alert.triggered_at,
                location: Some(location.clone()),
                distance_m: Some(m.distance_m),
            };
            self.push(&m.device_id, push_events::NEW_NEARBY, &notice);
        }
        info!("📡 Alert {} dispatched to {} rider(s)", alert.id, matches.len());
        let notified: Vec<_> = matches.iter().map(|m| json!({ "deviceId": m.device_id, "distanceM": m.distance_m })).collect();
        self.audit
            .append(AuditEventType::AlertDispatched, &alert.id, json!({ "radiusM": self.radius_m, "notified": notified }))
            .await;
        Ok(matches)
    }

    // ── Accept ────────────────────────────────────────────────────────────────

    pub async fn accept(&self, alert_id: &str, req: AcceptRequest, now_ms: i64) -> Result<AlertRecord, ApiError> {
        let claimed = self
            .store
            .claim_alert(alert_id, &req.responder_device_id, req.responder_name.as_deref(), now_ms)
            .await?;

        let Some(record) = claimed else {
            return Err(match self.store.get_alert(alert_id).await? {
                None => ApiError::AlertNotFound,
                Some(current) if current.responder_device_id.is_some() => ApiError::AlreadyAssigned,
                Some(current) => ApiError::NotClaimable(current.status),
            });
        };

        info!("🙋 Alert {} claimed by {}", record.id, req.responder_device_id);
        let notice = AssignedNotice {
            alert_id: record.id.clone(),
            victim_device_id: record.device_id.clone(),
            responder_device_id: req.responder_device_id.clone(),
            responder_name: req.responder_name.clone(),
            assigned_at: now_ms,
        };
        self.push(&record.device_id, push_events::ASSIGNED, &notice);
        self.push(&req.responder_device_id, push_events::ASSIGNED, &notice);
        self.audit
            .append(AuditEventType::ResponderAssigned, &record.id, json!({ "responderDeviceId": req.responder_device_id }))
            .await;
        Ok(record)
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub async fn update_status(&self, alert_id: &str, to: AlertStatus, now_ms: i64) -> Result<StatusUpdateResponse, ApiError> {
        let Some(record) = self.store.transition_from_triggered(alert_id, to, now_ms).await? else {
            return Err(match self.store.get_alert(alert_id).await? {
                None => ApiError::AlertNotFound,
                Some(current) => ApiError::InvalidTransition { from: current.status, to },
            });
        };

        info!("Alert {} moved to {to}", record.id);
        self.audit
            .append(AuditEventType::StatusChanged, &record.id, json!({ "from": AlertStatus::Triggered, "to": to }))
            .await;
        if to == AlertStatus::Cancelled {
            self.push_cancelled(&record, now_ms).await;
        }
        Ok(StatusUpdateResponse { id: record.id, status: record.status, updated_at: record.updated_at })
    }

    async fn push_cancelled(&self, record: &AlertRecord, now_ms: i64) {
        let notice = CancelledNotice {
            alert_id: record.id.clone(),
            victim_device_id: record.device_id.clone(),
            cancelled_at: now_ms,
        };
        self.push(&record.device_id, push_events::CANCELLED, &notice);
        let Some(location) = &record.location else { return };
        match self.riders_near(location.point(), &record.device_id, now_ms).await {
            Ok(matches) => {
                for m in matches {
                    self.push(&m.device_id, push_events::CANCELLED, &notice);
                }
            }
            Err(e) => warn!("Could not look up riders for cancelled alert {}: {e}", record.id),
        }
    }

    // ── Presence ──────────────────────────────────────────────────────────────

    pub async fn heartbeat(&self, req: HeartbeatRequest, now_ms: i64) -> Result<HeartbeatAck, ApiError> {
        let presence = self
            .store
            .upsert_presence(&req.device_id, req.location.latitude, req.location.longitude, req.location.timestamp, now_ms)
            .await?;
        Ok(HeartbeatAck { ok: true, device_id: presence.device_id, last_seen_at: presence.last_seen_at })
    }
}
