//! transport.rs — The seam between the router and its two transports
//!
//! A transport publishes [`SosAction`]s and produces [`InboundEvent`]s.
//! Availability is a live query, never cached by the caller.

use std::fmt;

use futures_util::future::BoxFuture;
use ridesafe_types::{AlertLocation, AssignedNotice, CancelledNotice, NearbyAlert};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportKind {
    Mesh,
    Internet,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mesh => f.write_str("mesh"),
            TransportKind::Internet => f.write_str("internet"),
        }
    }
}

/// SOS raised by this device.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredAlert {
    /// Device-local alert id. The backend assigns its own.
    pub alert_id: String,
    pub device_id: String,
    pub victim_name: Option<String>,
    pub triggered_at: i64,
    pub location: Option<AlertLocation>,
}

impl TriggeredAlert {
    pub fn as_nearby(&self) -> NearbyAlert {
        NearbyAlert {
            alert_id: self.alert_id.clone(),
            victim_device_id: self.device_id.clone(),
            victim_name: self.victim_name.clone(),
            triggered_at: self.triggered_at,
            location: self.location.clone(),
            distance_m: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SosAction {
    Triggered(TriggeredAlert),
    /// Retraction of an alert this device raised.
    Cancelled(CancelledNotice),
    /// A responder claiming someone else's alert.
    Accept(AssignedNotice),
}

impl SosAction {
    pub fn alert_id(&self) -> &str {
        match self {
            SosAction::Triggered(t) => &t.alert_id,
            SosAction::Cancelled(c) => &c.alert_id,
            SosAction::Accept(a) => &a.alert_id,
        }
    }
}

/// Outcome of a successful publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub transport: TransportKind,
    /// Id assigned by the backend, when the internet transport created a record.
    pub backend_alert_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NearbyAlert(NearbyAlert),
    Assigned(AssignedNotice),
    Cancelled(CancelledNotice),
}

/// Inbound event tagged with the transport that delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub source: TransportKind,
    pub event: InboundEvent,
}

pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;

    fn is_available(&self) -> bool;

    fn publish(&self, action: SosAction) -> BoxFuture<'_, Result<PublishReceipt, TransportError>>;

    fn subscribe(&self) -> broadcast::Receiver<Inbound>;

    /// Backend id recorded for a device-local alert id, if this transport created one.
    fn backend_alert_id(&self, _local_alert_id: &str) -> Option<String> {
        None
    }
}
