//! mesh.rs — Store-and-forward flooding over the short-range radio
//!
//! Inbound pipeline for every scanned payload:
//!
//! ```text
//! bytes ─▶ parse + validate ─▶ dedup ─▶ deliver (unless self-originated)
//!                                    └─▶ relay with hop+1 (while hop < maxHops)
//! ```
//!
//! Validation and dedup are synchronous; only the radio advertise awaits.
//! Delivery is best-effort: there is no ack and no retransmit beyond relaying.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use ridesafe_types::haversine_m;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::Capability;
use crate::crypto::DeviceIdentity;
use crate::dedup::{DedupStore, DEFAULT_DEDUP_TTL_MS};
use crate::envelope::{EnvelopePayload, MeshEnvelope, DEFAULT_MAX_HOPS, DEFAULT_STALENESS_MS};
use crate::error::{CapabilityError, EnvelopeError, TransportError};
use crate::location::BreadcrumbTrail;
use crate::now_ms;
use crate::radio::ShortRangeRadio;
use crate::transport::{Inbound, InboundEvent, PublishReceipt, SosAction, Transport, TransportKind};

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub max_hops: i64,
    pub staleness_ms: i64,
    pub dedup_ttl_ms: i64,
    /// Persist the dedup ledger here when set.
    pub dedup_path: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            staleness_ms: DEFAULT_STALENESS_MS,
            dedup_ttl_ms: DEFAULT_DEDUP_TTL_MS,
            dedup_path: None,
        }
    }
}

/// What happened to one inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Rejected(EnvelopeError),
    Duplicate,
    Accepted {
        /// Delivered to local listeners (false for our own envelopes)
        delivered: bool,
        /// Envelope to re-broadcast, when the hop ceiling allows
        relay: Option<MeshEnvelope>,
    },
}

/// Clears `relay_running` however the relay task ends: scan closed, abort or panic.
struct RelayRunningGuard(Arc<MeshTransport>);

impl Drop for RelayRunningGuard {
    fn drop(&mut self) {
        self.0.relay_running.store(false, Ordering::SeqCst);
    }
}

pub struct MeshTransport {
    device_id: String,
    identity: Arc<DeviceIdentity>,
    radio: Capability<Arc<dyn ShortRangeRadio>>,
    config: MeshConfig,
    dedup: Mutex<DedupStore>,
    trail: BreadcrumbTrail,
    inbound: broadcast::Sender<Inbound>,
    relay_running: AtomicBool,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshTransport {
    pub fn new(
        device_id: impl Into<String>,
        identity: Arc<DeviceIdentity>,
        radio: Capability<Arc<dyn ShortRangeRadio>>,
        trail: BreadcrumbTrail,
        config: MeshConfig,
    ) -> Self {
        let dedup = match &config.dedup_path {
            Some(path) => DedupStore::persistent(config.dedup_ttl_ms, path.clone()),
            None => DedupStore::new(config.dedup_ttl_ms),
        };
        let (inbound, _) = broadcast::channel(64);
        Self {
            device_id: device_id.into(),
            identity,
            radio,
            config,
            dedup: Mutex::new(dedup),
            trail,
            inbound,
            relay_running: AtomicBool::new(false),
            relay_task: Mutex::new(None),
        }
    }

    /// Starts the scan consumer. Fails when the radio capability is missing.
    pub fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let radio = match &self.radio {
            Capability::Available(radio) => radio.clone(),
            Capability::Unavailable { reason } => {
                return Err(TransportError::Radio(
                    CapabilityError { capability: "short-range radio", reason: reason.clone() }.to_string(),
                ))
            }
        };
        if self.relay_running.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut scan = radio.start_scan()?;
        self.relay_running.store(true, Ordering::SeqCst);

        let mesh = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _running = RelayRunningGuard(Arc::clone(&mesh));
            info!("🕸️ Mesh relay loop running (service {})", radio.service_id());
            while let Some(bytes) = scan.recv().await {
                if let RelayOutcome::Accepted { relay: Some(next), .. } = mesh.handle_incoming(&bytes, now_ms()) {
                    mesh.advertise(&next).await;
                }
            }
            warn!("Mesh scan ended; relay loop stopped");
        });
        if let Ok(mut slot) = self.relay_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.relay_running.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.relay_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if let Ok(mut dedup) = self.dedup.lock() {
            dedup.flush();
        }
    }

    /// Validates, dedups and delivers one scanned payload.
    pub fn handle_incoming(&self, bytes: &[u8], now_ms: i64) -> RelayOutcome {
        let verified = match MeshEnvelope::parse_and_validate(bytes, now_ms, self.config.staleness_ms) {
            Ok(v) => v,
            Err(e) => {
                debug!("Mesh: dropped envelope: {e}");
                return RelayOutcome::Rejected(e);
            }
        };
        let envelope = verified.envelope;

        if !self.record_seen(&envelope.message_id, now_ms) {
            return RelayOutcome::Duplicate;
        }

        let delivered = envelope.origin_device_id != self.device_id;
        if delivered {
            let event = self.to_event(verified.payload);
            debug!("Mesh: delivering {} from {} (hop {})", envelope.kind.as_str(), envelope.origin_device_id, envelope.hop);
            // No subscribers is fine
            let _ = self.inbound.send(Inbound { source: TransportKind::Mesh, event });
        }

        let relay = (envelope.hop < envelope.max_hops).then(|| envelope.relayed());
        RelayOutcome::Accepted { delivered, relay }
    }

    fn record_seen(&self, message_id: &str, now_ms: i64) -> bool {
        match self.dedup.lock() {
            Ok(mut dedup) => dedup.check_and_record(message_id, now_ms),
            Err(poisoned) => poisoned.into_inner().check_and_record(message_id, now_ms),
        }
    }

    fn to_event(&self, payload: EnvelopePayload) -> InboundEvent {
        match payload {
            EnvelopePayload::Triggered(mut alert) => {
                if let (Some(loc), Some(me)) = (&alert.location, self.trail.latest()) {
                    alert.distance_m = Some(haversine_m(me.point(), loc.point()));
                }
                InboundEvent::NearbyAlert(alert)
            }
            EnvelopePayload::Cancelled(c) => InboundEvent::Cancelled(c),
            EnvelopePayload::Assigned(a) => InboundEvent::Assigned(a),
        }
    }

    async fn advertise(&self, envelope: &MeshEnvelope) {
        let Capability::Available(radio) = &self.radio else { return };
        match envelope.to_bytes() {
            Ok(bytes) => {
                // Fire-and-forget: the next flood or periodic cycle is the retry
                if let Err(e) = radio.advertise(bytes).await {
                    warn!("Mesh: advertise {} failed: {e}", envelope.message_id);
                }
            }
            Err(e) => warn!("Mesh: encode {} failed: {e}", envelope.message_id),
        }
    }

    fn payload_for(action: SosAction) -> EnvelopePayload {
        match action {
            SosAction::Triggered(t) => EnvelopePayload::Triggered(t.as_nearby()),
            SosAction::Cancelled(c) => EnvelopePayload::Cancelled(c),
            SosAction::Accept(a) => EnvelopePayload::Assigned(a),
        }
    }

    async fn publish_action(&self, action: SosAction) -> Result<PublishReceipt, TransportError> {
        let Capability::Available(radio) = &self.radio else {
            return Err(TransportError::Unavailable(TransportKind::Mesh));
        };
        let payload = Self::payload_for(action);
        let now = now_ms();
        let envelope = MeshEnvelope::build(&self.identity, &self.device_id, &payload, self.config.max_hops, now)?;
        // Our own flood echoing back must not be relayed again
        self.record_seen(&envelope.message_id, now);
        radio.advertise(envelope.to_bytes()?).await?;
        info!("🕸️ Mesh flooded {} for alert {}", envelope.kind.as_str(), payload.alert_id());
        Ok(PublishReceipt { transport: TransportKind::Mesh, backend_alert_id: None })
    }
}

impl Transport for MeshTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn is_available(&self) -> bool {
        self.radio.is_available() && self.relay_running.load(Ordering::SeqCst)
    }

    fn publish(&self, action: SosAction) -> BoxFuture<'_, Result<PublishReceipt, TransportError>> {
        Box::pin(self.publish_action(action))
    }

    fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inbound.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ridesafe_types::{AlertLocation, BreadcrumbPoint, CancelledNotice, NearbyAlert};
    use tokio::sync::mpsc;

    use crate::transport::TriggeredAlert;

    /// Records advertised payloads; scans are fed through `inject`.
    struct RecordingRadio {
        sent: Mutex<Vec<Bytes>>,
        inject: Mutex<Option<mpsc::Receiver<Bytes>>>,
    }

    impl RecordingRadio {
        fn new() -> (Arc<Self>, mpsc::Sender<Bytes>) {
            let (tx, rx) = mpsc::channel(16);
            (Arc::new(Self { sent: Mutex::new(Vec::new()), inject: Mutex::new(Some(rx)) }), tx)
        }

        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl ShortRangeRadio for RecordingRadio {
        fn service_id(&self) -> &str {
            "test"
        }

        fn advertise(&self, payload: Bytes) -> BoxFuture<'_, Result<(), TransportError>> {
            self.sent.lock().unwrap().push(payload);
            Box::pin(async { Ok(()) })
        }

        fn start_scan(&self) -> Result<mpsc::Receiver<Bytes>, TransportError> {
            self.inject.lock().unwrap().take().ok_or(TransportError::Radio("scan already running".into()))
        }
    }

    fn mesh_with(device_id: &str, radio: Arc<RecordingRadio>, trail: BreadcrumbTrail) -> Arc<MeshTransport> {
        let radio: Arc<dyn ShortRangeRadio> = radio;
        Arc::new(MeshTransport::new(
            device_id,
            Arc::new(DeviceIdentity::in_memory()),
            Capability::Available(radio),
            trail,
            MeshConfig::default(),
        ))
    }

    fn foreign_envelope(max_hops: i64, hop: i64, now: i64) -> MeshEnvelope {
        let victim = DeviceIdentity::in_memory();
        let payload = EnvelopePayload::Triggered(NearbyAlert {
            alert_id: "a-1".into(),
            victim_device_id: "victim".into(),
            victim_name: None,
            triggered_at: now,
            location: Some(AlertLocation {
                latitude: 28.6139,
                longitude: 77.2090,
                timestamp_ms: now,
                breadcrumb_trail: vec![],
            }),
            distance_m: None,
        });
        let mut env = MeshEnvelope::build(&victim, "victim", &payload, max_hops, now).unwrap();
        for _ in 0..hop {
            env = env.relayed();
        }
        env
    }

    #[test]
    fn same_envelope_twice_delivers_once() {
        let (radio, _) = RecordingRadio::new();
        let mesh = mesh_with("rider", radio, BreadcrumbTrail::new());
        let mut rx = mesh.subscribe();
        let now = now_ms();
        let bytes = foreign_envelope(3, 0, now).to_bytes().unwrap();

        let first = mesh.handle_incoming(&bytes, now);
        assert!(matches!(first, RelayOutcome::Accepted { delivered: true, relay: Some(ref r) } if r.hop == 1));
        assert_eq!(mesh.handle_incoming(&bytes, now + 10), RelayOutcome::Duplicate);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn envelope_at_ceiling_is_delivered_but_not_relayed() {
        let (radio, _) = RecordingRadio::new();
        let mesh = mesh_with("rider", radio, BreadcrumbTrail::new());
        let now = now_ms();
        let at_ceiling = foreign_envelope(2, 2, now).to_bytes().unwrap();
        assert_eq!(
            mesh.handle_incoming(&at_ceiling, now),
            RelayOutcome::Accepted { delivered: true, relay: None }
        );
        let over = foreign_envelope(2, 3, now).to_bytes().unwrap();
        assert!(matches!(
            mesh.handle_incoming(&over, now),
            RelayOutcome::Rejected(EnvelopeError::HopLimitExceeded { .. })
        ));
    }

    #[test]
    fn nearby_alert_carries_distance_from_latest_fix() {
        let (radio, _) = RecordingRadio::new();
        let trail = BreadcrumbTrail::new();
        trail.push(BreadcrumbPoint { latitude: 28.6229, longitude: 77.2080, timestamp_ms: 0 });
        let mesh = mesh_with("rider", radio, trail);
        let mut rx = mesh.subscribe();
        let now = now_ms();
        mesh.handle_incoming(&foreign_envelope(3, 0, now).to_bytes().unwrap(), now);

        match rx.try_recv().unwrap().event {
            InboundEvent::NearbyAlert(a) => {
                let d = a.distance_m.unwrap();
                assert!((950.0..=1050.0).contains(&d), "distance {d}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn own_flood_echo_is_dropped() {
        let (radio, _) = RecordingRadio::new();
        let mesh = mesh_with("victim-1", radio.clone(), BreadcrumbTrail::new());
        let mut rx = mesh.subscribe();
        let action = SosAction::Cancelled(CancelledNotice {
            alert_id: "a-9".into(),
            victim_device_id: "victim-1".into(),
            cancelled_at: now_ms(),
        });
        let receipt = mesh.publish(action).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Mesh);

        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(mesh.handle_incoming(&sent[0], now_ms()), RelayOutcome::Duplicate);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn relay_loop_rebroadcasts_and_reports_availability() {
        let (radio, inject) = RecordingRadio::new();
        let mesh = mesh_with("rider", radio.clone(), BreadcrumbTrail::new());
        assert!(!mesh.is_available());
        mesh.start().unwrap();
        assert!(mesh.is_available());

        let mut rx = mesh.subscribe();
        let env = foreign_envelope(3, 1, now_ms());
        inject.send(env.to_bytes().unwrap()).await.unwrap();
        inject.send(env.to_bytes().unwrap()).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got.source, TransportKind::Mesh);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let sent = radio.sent();
        assert_eq!(sent.len(), 1, "duplicate must not be re-broadcast");
        let relayed: MeshEnvelope = serde_json::from_slice(&sent[0]).unwrap();
        assert_eq!(relayed.hop, 2);
        assert_eq!(relayed.message_id, env.message_id);

        mesh.stop();
        assert!(!mesh.is_available());
    }

    #[tokio::test]
    async fn hostile_timestamp_is_dropped_and_relay_loop_keeps_running() {
        let (radio, inject) = RecordingRadio::new();
        let mesh = mesh_with("rider", radio.clone(), BreadcrumbTrail::new());
        mesh.start().unwrap();
        let mut rx = mesh.subscribe();

        let mut hostile = serde_json::to_value(foreign_envelope(3, 0, now_ms())).unwrap();
        hostile["createdAt"] = serde_json::json!(i64::MIN);
        inject.send(Bytes::from(serde_json::to_vec(&hostile).unwrap())).await.unwrap();

        let env = foreign_envelope(3, 0, now_ms());
        inject.send(env.to_bytes().unwrap()).await.unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(got.event, InboundEvent::NearbyAlert(ref a) if a.alert_id == "a-1"));
        assert!(mesh.is_available());
        mesh.stop();
    }

    #[tokio::test]
    async fn availability_drops_when_scan_ends() {
        let (radio, inject) = RecordingRadio::new();
        let mesh = mesh_with("rider", radio, BreadcrumbTrail::new());
        mesh.start().unwrap();
        assert!(mesh.is_available());

        drop(inject);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while mesh.is_available() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn publish_without_radio_fails() {
        let mesh = MeshTransport::new(
            "victim",
            Arc::new(DeviceIdentity::in_memory()),
            Capability::unavailable("no BLE"),
            BreadcrumbTrail::new(),
            MeshConfig::default(),
        );
        let alert = TriggeredAlert {
            alert_id: "a".into(),
            device_id: "victim".into(),
            victim_name: None,
            triggered_at: 0,
            location: None,
        };
        assert!(matches!(
            mesh.publish(SosAction::Triggered(alert)).await,
            Err(TransportError::Unavailable(TransportKind::Mesh))
        ));
        assert!(!mesh.is_available());
    }
}
