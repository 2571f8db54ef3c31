//! internet.rs — Backend HTTP client plus the push channel
//!
//! Outbound actions map onto the dispatch API:
//!   - Triggered → `POST /api/v1/alerts`
//!   - Cancelled → `PATCH /api/v1/alerts/:id/status {CANCELLED}`
//!   - Accept    → `POST /api/v1/alerts/:id/accept`
//!
//! Inbound events arrive on the push channel and are decoded into
//! [`InboundEvent`]s. The transport counts as available only while the push
//! channel is registered.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::{Client, Response, StatusCode};
use ridesafe_types::{
    push_events, AcceptRequest, AlertRecord, AlertStatus, BreadcrumbPoint, CreateAlertRequest, HeartbeatAck,
    HeartbeatLocation, HeartbeatRequest, StatusUpdateRequest, StatusUpdateResponse,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::push_channel::{PushChannel, PushChannelConfig, PushEvent};
use crate::transport::{Inbound, InboundEvent, PublishReceipt, SosAction, Transport, TransportKind, TriggeredAlert};

#[derive(Debug, Clone)]
pub struct InternetConfig {
    pub base_url: String,
    pub device_id: String,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub register_timeout: Duration,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

pub struct InternetTransport {
    http: Client,
    base_url: String,
    push: PushChannel,
    inbound: broadcast::Sender<Inbound>,
    /// Device-local alert id → backend alert id
    backend_ids: Mutex<HashMap<String, String>>,
    forwarder: JoinHandle<()>,
}

impl InternetTransport {
    pub fn new(config: InternetConfig) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        let push = PushChannel::spawn(PushChannelConfig {
            base_url: config.base_url.clone(),
            device_id: config.device_id.clone(),
            reconnect_delay: config.reconnect_delay,
            register_timeout: config.register_timeout,
        });
        let (inbound, _) = broadcast::channel(64);
        let forwarder = spawn_forwarder(push.subscribe(), inbound.clone());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            push,
            inbound,
            backend_ids: Mutex::new(HashMap::new()),
            forwarder,
        })
    }

    pub fn push_channel(&self) -> &PushChannel {
        &self.push
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn remember(&self, local_id: &str, backend_id: &str) {
        if let Ok(mut ids) = self.backend_ids.lock() {
            ids.insert(local_id.to_string(), backend_id.to_string());
        }
    }

    fn resolve_backend_id(&self, alert_id: &str) -> Option<String> {
        let ids = self.backend_ids.lock().ok()?;
        if let Some(id) = ids.get(alert_id) {
            return Some(id.clone());
        }
        ids.values().find(|v| v.as_str() == alert_id).cloned()
    }

    pub async fn create_alert(&self, alert: &TriggeredAlert) -> Result<AlertRecord, TransportError> {
        let body = CreateAlertRequest {
            device_id: alert.device_id.clone(),
            victim_name: alert.victim_name.clone(),
            status: AlertStatus::Triggered,
            triggered_at: alert.triggered_at,
            location: alert.location.clone(),
        };
        let resp = self.http.post(self.url("/api/v1/alerts")).json(&body).send().await?;
        let record: AlertRecord = read_json(resp).await?;
        self.remember(&alert.alert_id, &record.id);
        info!("🌐 Alert {} created on backend as {}", alert.alert_id, record.id);
        Ok(record)
    }

    pub async fn update_status(&self, backend_id: &str, status: AlertStatus) -> Result<StatusUpdateResponse, TransportError> {
        let resp = self
            .http
            .patch(self.url(&format!("/api/v1/alerts/{backend_id}/status")))
            .json(&StatusUpdateRequest { status })
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn accept(&self, backend_id: &str, body: &AcceptRequest) -> Result<AlertRecord, TransportError> {
        let resp = self
            .http
            .post(self.url(&format!("/api/v1/alerts/{backend_id}/accept")))
            .json(body)
            .send()
            .await?;
        read_json(resp).await
    }

    pub async fn heartbeat(&self, device_id: &str, fix: BreadcrumbPoint) -> Result<HeartbeatAck, TransportError> {
        let body = HeartbeatRequest {
            device_id: device_id.to_string(),
            location: HeartbeatLocation { latitude: fix.latitude, longitude: fix.longitude, timestamp: fix.timestamp_ms },
        };
        let resp = self.http.post(self.url("/api/v1/riders/heartbeat")).json(&body).send().await?;
        read_json(resp).await
    }

    async fn publish_action(&self, action: SosAction) -> Result<PublishReceipt, TransportError> {
        match action {
            SosAction::Triggered(alert) => {
                let record = self.create_alert(&alert).await?;
                Ok(PublishReceipt { transport: TransportKind::Internet, backend_alert_id: Some(record.id) })
            }
            SosAction::Cancelled(notice) => {
                let backend_id = self
                    .resolve_backend_id(&notice.alert_id)
                    .ok_or_else(|| TransportError::UnknownBackendAlert(notice.alert_id.clone()))?;
                let updated = self.update_status(&backend_id, AlertStatus::Cancelled).await?;
                info!("🌐 Alert {} cancelled on backend", updated.id);
                Ok(PublishReceipt { transport: TransportKind::Internet, backend_alert_id: Some(updated.id) })
            }
            SosAction::Accept(notice) => {
                let body = AcceptRequest {
                    responder_device_id: notice.responder_device_id.clone(),
                    responder_name: notice.responder_name.clone(),
                };
                let record = self.accept(&notice.alert_id, &body).await?;
                info!("🌐 Claimed alert {} as responder", record.id);
                Ok(PublishReceipt { transport: TransportKind::Internet, backend_alert_id: Some(record.id) })
            }
        }
    }
}

impl Drop for InternetTransport {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl Transport for InternetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Internet
    }

    fn is_available(&self) -> bool {
        self.push.is_connected()
    }

    fn publish(&self, action: SosAction) -> BoxFuture<'_, Result<PublishReceipt, TransportError>> {
        Box::pin(self.publish_action(action))
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inbound.subscribe()
    }

    fn backend_alert_id(&self, local_alert_id: &str) -> Option<String> {
        self.backend_ids.lock().ok()?.get(local_alert_id).cloned()
    }
}

/// Success bodies decode as `T`; error bodies become `Rejected { code }`.
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let text = resp.text().await.unwrap_or_default();
    Err(rejection(status, &text))
}

fn rejection(status: StatusCode, body: &str) -> TransportError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => TransportError::Rejected { code: env.error.code, message: env.error.message },
        Err(_) => TransportError::Rejected {
            code: match status {
                StatusCode::NOT_FOUND => "ALERT_NOT_FOUND".to_string(),
                other => format!("HTTP_{}", other.as_u16()),
            },
            message: body.to_string(),
        },
    }
}

/// Decodes a push event into an inbound event. Unknown names yield `None`.
pub fn decode_push_event(event: &PushEvent) -> Option<InboundEvent> {
    let decoded = match event.name.as_str() {
        push_events::NEW_NEARBY => serde_json::from_value(event.data.clone()).map(InboundEvent::NearbyAlert),
        push_events::ASSIGNED => serde_json::from_value(event.data.clone()).map(InboundEvent::Assigned),
        push_events::CANCELLED => serde_json::from_value(event.data.clone()).map(InboundEvent::Cancelled),
        _ => return None,
    };
    match decoded {
        Ok(ev) => Some(ev),
        Err(e) => {
            warn!("Push event {} has an unexpected payload: {e}", event.name);
            None
        }
    }
}

fn spawn_forwarder(mut push: broadcast::Receiver<PushEvent>, inbound: broadcast::Sender<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match push.recv().await {
                Ok(event) => {
                    if let Some(ev) = decode_push_event(&event) {
                        debug!("Push → {}", event.name);
                        let _ = inbound.send(Inbound { source: TransportKind::Internet, event: ev });
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Push forwarder lagged by {n} events"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
