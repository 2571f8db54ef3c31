//! push.rs — Socket.IO push channel
//!
//! Each device connects once and sends `register_device { deviceId }`. The
//! socket then joins the private room `device:{deviceId}` and is acknowledged
//! with `device:registered`. Dispatch notifications are emitted to rooms, so a
//! device reconnecting on another socket keeps receiving them.

use std::sync::Mutex;

use ridesafe_types::{device_room, push_events};
use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use socketioxide::SocketIo;
use tracing::{debug, info, warn};

/// Delivers one named event to one device's room.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, device_id: &str, event: &'static str, payload: &Value);
}

// ── Socket.IO ─────────────────────────────────────────────────────────────────

pub struct SocketNotifier {
    io: SocketIo,
}

impl SocketNotifier {
    pub fn new(io: SocketIo) -> Self {
        Self { io }
    }
}

impl Notifier for SocketNotifier {
    fn notify(&self, device_id: &str, event: &'static str, payload: &Value) {
        if let Err(e) = self.io.to(device_room(device_id)).emit(event, payload) {
            warn!("Push {event} to {device_id} failed: {e}");
        }
    }
}

pub fn register_namespace(io: &SocketIo) {
    io.ns("/", |socket: SocketRef| async move {
        on_connect(socket);
    });
}

fn on_connect(socket: SocketRef) {
    debug!("Push socket connected: {}", socket.id);

    socket.on(push_events::REGISTER_DEVICE, |s: SocketRef, Data::<Value>(data)| {
        let Some(device_id) = data.get("deviceId").and_then(Value::as_str).filter(|id| !id.trim().is_empty()) else {
            warn!("register_device without deviceId from socket {}", s.id);
            return;
        };
        if let Err(e) = s.join(device_room(device_id)) {
            warn!("Device {device_id} could not join its push room: {e}");
            return;
        }
        info!("📲 Device {device_id} registered for push on socket {}", s.id);
        if let Err(e) = s.emit(push_events::DEVICE_REGISTERED, &json!({ "deviceId": device_id })) {
            warn!("Could not acknowledge {device_id}: {e}");
        }
    });

    socket.on_disconnect(|s: SocketRef| {
        debug!("Push socket disconnected: {}", s.id);
    });
}

// ── Recording ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub device_id: String,
    pub event: &'static str,
    pub payload: Value,
}

/// Keeps every notification in memory. Used by tests and headless runs.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_to(&self, device_id: &str) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.device_id == device_id).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, device_id: &str, event: &'static str, payload: &Value) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Notification { device_id: device_id.to_string(), event, payload: payload.clone() });
        }
    }
}
