//! push_channel.rs — Socket.IO client for backend push events
//!
//! Speaks Socket.IO v5 over Engine.IO v4, WebSocket transport only:
//!
//! ```text
//! server: 0{"sid":…,"pingInterval":…}     Engine.IO open
//! client: 40                               connect default namespace
//! server: 40{"sid":…}
//! client: 42["register_device",{"deviceId":…}]
//! server: 42["device:registered",{…}]      → channel reports connected
//! server: 2 / client: 3                    ping / pong
//! server: 42["alert:new_nearby",{…}]       → forwarded to subscribers
//! ```
//!
//! When the socket drops the channel reports disconnected, waits
//! `reconnect_delay` and starts over, re-registering the device.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ridesafe_types::push_events;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::PushError;

// ── Codec ─────────────────────────────────────────────────────────────────────

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Close,
    Ping,
    Pong,
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, data: Value, ack_id: Option<u64> },
    ConnectError(Value),
}

pub fn decode(frame: &str) -> Result<Packet, PushError> {
    let mut chars = frame.chars();
    let engine = chars.next().ok_or_else(|| PushError::Protocol("empty frame".to_string()))?;
    let rest = chars.as_str();
    match engine {
        '0' => Ok(Packet::Open(parse_json(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(rest),
        other => Err(PushError::Protocol(format!("unsupported engine packet '{other}'"))),
    }
}

fn decode_socket(body: &str) -> Result<Packet, PushError> {
    let mut chars = body.chars();
    let kind = chars.next().ok_or_else(|| PushError::Protocol("empty socket packet".to_string()))?;
    let rest = chars.as_str();
    match kind {
        '0' if rest.is_empty() => Ok(Packet::Connect(None)),
        '0' => Ok(Packet::Connect(Some(parse_json(rest)?))),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            let ack_id = if digits > 0 { rest[..digits].parse().ok() } else { None };
            let args = parse_json(&rest[digits..])?;
            let mut items = match args {
                Value::Array(items) => items.into_iter(),
                _ => return Err(PushError::Protocol("event payload is not an array".to_string())),
            };
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => return Err(PushError::Protocol("event without a name".to_string())),
            };
            let data = items.next().unwrap_or(Value::Null);
            Ok(Packet::Event { name, data, ack_id })
        }
        '4' => Ok(Packet::ConnectError(parse_json(rest).unwrap_or(Value::Null))),
        other => Err(PushError::Protocol(format!("unsupported socket packet '{other}'"))),
    }
}

fn parse_json(s: &str) -> Result<Value, PushError> {
    serde_json::from_str(s).map_err(|e| PushError::Protocol(format!("bad JSON in frame: {e}")))
}

pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", json!([name, data]))
}

pub const CONNECT_FRAME: &str = "40";
pub const PONG_FRAME: &str = "3";

/// `http://host:port` → `ws://host:port/socket.io/?EIO=4&transport=websocket`
pub fn socket_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}/socket.io/?EIO=4&transport=websocket")
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PushChannelConfig {
    pub base_url: String,
    pub device_id: String,
    pub reconnect_delay: Duration,
    /// How long to wait for `device:registered` before giving up on a session.
    pub register_timeout: Duration,
}

/// A server event other than the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub name: String,
    pub data: Value,
}

pub struct PushChannel {
    connected: watch::Receiver<bool>,
    events: broadcast::Sender<PushEvent>,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Starts the connect/reconnect loop in the background.
    pub fn spawn(config: PushChannelConfig) -> Self {
        let (connected_tx, connected) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        let tx = events.clone();

        let task = tokio::spawn(async move {
            loop {
                match run_session(&config, &connected_tx, &tx).await {
                    Ok(()) => info!("🔌 Push channel closed by server"),
                    Err(e) => warn!("Push channel: {e}"),
                }
                connected_tx.send_replace(false);
                tokio::time::sleep(config.reconnect_delay).await;
            }
        });

        Self { connected, events, task }
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Resolves once the device is registered, or after `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.clone();
        tokio::time::timeout(timeout, rx.wait_for(|c| *c)).await.map(|r| r.is_ok()).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_session(
    config: &PushChannelConfig,
    connected: &watch::Sender<bool>,
    events: &broadcast::Sender<PushEvent>,
) -> Result<(), PushError> {
    let url = socket_url(&config.base_url);
    let (ws, _) = connect_async(url.as_str()).await.map_err(|e| PushError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();
    debug!("Push channel: WebSocket open to {url}");

    let send = |text: String| Message::Text(text);
    let mut registered = false;
    let register_deadline = tokio::time::sleep(config.register_timeout);
    tokio::pin!(register_deadline);

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = &mut register_deadline, if !registered => {
                return Err(PushError::Protocol("device registration was not acknowledged".to_string()));
            }
        };
        let text = match frame {
            None => return Ok(()),
            Some(Err(e)) => return Err(PushError::Connect(e.to_string())),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) => return Ok(()),
            Some(Ok(_)) => continue,
        };

        let packet = match decode(&text) {
            Ok(p) => p,
            Err(e) => {
                debug!("Push channel: ignoring frame: {e}");
                continue;
            }
        };

        match packet {
            Packet::Open(_) => {
                sink.send(send(CONNECT_FRAME.to_string())).await.map_err(|e| PushError::Connect(e.to_string()))?;
            }
            Packet::Connect(_) => {
                let register = encode_event(push_events::REGISTER_DEVICE, &json!({ "deviceId": config.device_id }));
                sink.send(send(register)).await.map_err(|e| PushError::Connect(e.to_string()))?;
            }
            Packet::Ping => {
                sink.send(send(PONG_FRAME.to_string())).await.map_err(|e| PushError::Connect(e.to_string()))?;
            }
            Packet::Event { name, .. } if name == push_events::DEVICE_REGISTERED => {
                registered = true;
                connected.send_replace(true);
                info!("🔌 Push channel registered as {}", config.device_id);
            }
            Packet::Event { name, data, .. } => {
                // No subscribers is fine
                let _ = events.send(PushEvent { name, data });
            }
            Packet::ConnectError(reason) => {
                return Err(PushError::Protocol(format!("namespace connect refused: {reason}")));
            }
            Packet::Close | Packet::Disconnect => return Err(PushError::Closed),
            Packet::Pong => {}
        }
    }
}
