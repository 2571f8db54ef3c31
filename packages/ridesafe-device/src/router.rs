//! router.rs — Transport selection, mirroring and inbound merge
//!
//! | mode           | mesh up | internet up | primary  | mirror   |
//! |----------------|---------|-------------|----------|----------|
//! | AUTO           | yes     | yes         | mesh     | internet |
//! | AUTO           | yes     | no          | mesh     | –        |
//! | AUTO           | no      | yes         | internet | –        |
//! | FORCE_MESH     | yes     | any         | mesh     | –        |
//! | FORCE_INTERNET | any     | yes         | internet | –        |
//!
//! Anything else fails with `NoTransportAvailable`. Availability is queried
//! live before every decision. The mirror runs detached and never affects the
//! reported outcome.
//!
//! Responder claims are the exception: in AUTO the backend decides first.
//! SOS_ASSIGNED is flooded over mesh only after the backend accepts the claim,
//! or when the backend cannot decide (internet down, or an alert it has never
//! seen). A 409 from the backend fails the claim and nothing is flooded.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dedup::{DedupStore, DEFAULT_DEDUP_TTL_MS};
use crate::error::TransportError;
use crate::now_ms;
use crate::transport::{Inbound, InboundEvent, PublishReceipt, SosAction, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterMode {
    Auto,
    ForceMesh,
    ForceInternet,
}

impl FromStr for RouterMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(RouterMode::Auto),
            "force_mesh" | "mesh" => Ok(RouterMode::ForceMesh),
            "force_internet" | "internet" => Ok(RouterMode::ForceInternet),
            other => Err(format!("unknown router mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkStatus {
    Hybrid,
    MeshOnly,
    Internet,
    Offline,
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetworkStatus::Hybrid => "HYBRID",
            NetworkStatus::MeshOnly => "MESH_ONLY",
            NetworkStatus::Internet => "INTERNET",
            NetworkStatus::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

pub fn network_status(mode: RouterMode, mesh_up: bool, internet_up: bool) -> NetworkStatus {
    match (mode, mesh_up, internet_up) {
        (RouterMode::ForceMesh, true, _) => NetworkStatus::MeshOnly,
        (RouterMode::ForceInternet, _, true) => NetworkStatus::Internet,
        (RouterMode::Auto, true, true) => NetworkStatus::Hybrid,
        (RouterMode::Auto, true, false) => NetworkStatus::MeshOnly,
        (RouterMode::Auto, false, true) => NetworkStatus::Internet,
        _ => NetworkStatus::Offline,
    }
}

pub struct TransportRouter {
    mode: RwLock<RouterMode>,
    mesh: Option<Arc<dyn Transport>>,
    internet: Option<Arc<dyn Transport>>,
    inbound: broadcast::Sender<Inbound>,
    merge_tasks: Vec<JoinHandle<()>>,
}

impl TransportRouter {
    /// Must be called inside a tokio runtime: spawns one merge task per transport.
    pub fn new(mode: RouterMode, mesh: Option<Arc<dyn Transport>>, internet: Option<Arc<dyn Transport>>) -> Self {
        let (inbound, _) = broadcast::channel(64);
        let seen_assigned = Arc::new(Mutex::new(DedupStore::new(DEFAULT_DEDUP_TTL_MS)));
        let merge_tasks = mesh
            .iter()
            .chain(internet.iter())
            .map(|t| spawn_merge(t.subscribe(), inbound.clone(), seen_assigned.clone()))
            .collect();
        Self { mode: RwLock::new(mode), mesh, internet, inbound, merge_tasks }
    }

    pub fn mode(&self) -> RouterMode {
        self.mode.read().map(|m| *m).unwrap_or(RouterMode::Auto)
    }

    pub fn set_mode(&self, mode: RouterMode) {
        if let Ok(mut m) = self.mode.write() {
            *m = mode;
        }
        info!("Router mode → {mode:?}");
    }

    fn mesh_up(&self) -> bool {
        self.mesh.as_ref().is_some_and(|t| t.is_available())
    }

    fn internet_up(&self) -> bool {
        self.internet.as_ref().is_some_and(|t| t.is_available())
    }

    pub fn status(&self) -> NetworkStatus {
        network_status(self.mode(), self.mesh_up(), self.internet_up())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Inbound> {
        self.inbound.subscribe()
    }

    /// Backend id any transport recorded for a device-local alert.
    pub fn backend_alert_id(&self, local_alert_id: &str) -> Option<String> {
        self.mesh
            .iter()
            .chain(self.internet.iter())
            .find_map(|t| t.backend_alert_id(local_alert_id))
    }

    fn select(&self) -> Result<(Arc<dyn Transport>, Option<Arc<dyn Transport>>), TransportError> {
        let mesh = self.mesh.as_ref().filter(|t| t.is_available()).cloned();
        let internet = self.internet.as_ref().filter(|t| t.is_available()).cloned();
        match self.mode() {
            RouterMode::ForceMesh => mesh.map(|m| (m, None)).ok_or(TransportError::NoTransportAvailable),
            RouterMode::ForceInternet => internet.map(|i| (i, None)).ok_or(TransportError::NoTransportAvailable),
            RouterMode::Auto => match (mesh, internet) {
                (Some(m), mirror) => Ok((m, mirror)),
                (None, Some(i)) => Ok((i, None)),
                (None, None) => Err(TransportError::NoTransportAvailable),
            },
        }
    }

    pub async fn publish(&self, action: SosAction) -> Result<PublishReceipt, TransportError> {
        if matches!(action, SosAction::Accept(_)) && self.mode() == RouterMode::Auto {
            return self.publish_claim(action).await;
        }
        let (primary, mirror) = self.select()?;

        if let Some(mirror) = mirror {
            let mirrored = action.clone();
            tokio::spawn(async move {
                match mirror.publish(mirrored).await {
                    Ok(r) => debug!("Mirror publish via {} ok", r.transport),
                    Err(e) => warn!("Mirror publish via {} failed: {e}", mirror.kind()),
                }
            });
        }

        debug!("Publishing {} via {}", action.alert_id(), primary.kind());
        primary.publish(action).await
    }

    async fn publish_claim(&self, action: SosAction) -> Result<PublishReceipt, TransportError> {
        let mesh = self.mesh.as_ref().filter(|t| t.is_available()).cloned();
        let internet = self.internet.as_ref().filter(|t| t.is_available()).cloned();

        let Some(internet) = internet else {
            let mesh = mesh.ok_or(TransportError::NoTransportAvailable)?;
            debug!("Claim {} via mesh only, backend unreachable", action.alert_id());
            return mesh.publish(action).await;
        };

        match internet.publish(action.clone()).await {
            Ok(receipt) => {
                if let Some(mesh) = mesh {
                    if let Err(e) = mesh.publish(action).await {
                        warn!("Backend accepted claim but mesh flood failed: {e}");
                    }
                }
                Ok(receipt)
            }
            Err(TransportError::Rejected { code, message }) if code != "ALERT_NOT_FOUND" => {
                info!("Backend refused claim on {}: {code}", action.alert_id());
                Err(TransportError::Rejected { code, message })
            }
            Err(e) => match mesh {
                Some(mesh) => {
                    warn!("Backend could not decide claim on {} ({e}), flooding over mesh", action.alert_id());
                    mesh.publish(action).await
                }
                None => Err(e),
            },
        }
    }

    pub fn stop(&self) {
        for task in &self.merge_tasks {
            task.abort();
        }
    }
}

impl Drop for TransportRouter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_merge(
    mut source: broadcast::Receiver<Inbound>,
    out: broadcast::Sender<Inbound>,
    seen_assigned: Arc<Mutex<DedupStore>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let inbound = match source.recv().await {
                Ok(i) => i,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Router merge lagged by {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let InboundEvent::Assigned(notice) = &inbound.event {
                let first = match seen_assigned.lock() {
                    Ok(mut seen) => seen.check_and_record(&notice.alert_id, now_ms()),
                    Err(poisoned) => poisoned.into_inner().check_and_record(&notice.alert_id, now_ms()),
                };
                if !first {
                    debug!("Suppressed repeat assignment for {}", notice.alert_id);
                    continue;
                }
            }
            let _ = out.send(inbound);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use ridesafe_types::{AssignedNotice, CancelledNotice};

    use crate::transport::TransportKind;

    struct FakeTransport {
        kind: TransportKind,
        up: AtomicBool,
        /// Backend error code returned by every publish when set.
        reject_with: Mutex<Option<&'static str>>,
        published: Mutex<Vec<SosAction>>,
        inbound: broadcast::Sender<Inbound>,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, up: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                up: AtomicBool::new(up),
                reject_with: Mutex::new(None),
                published: Mutex::new(Vec::new()),
                inbound: broadcast::channel(16).0,
            })
        }

        fn reject(&self, code: &'static str) {
            *self.reject_with.lock().unwrap() = Some(code);
        }

        fn published(&self) -> usize {
            self.published.lock().unwrap().len()
        }

        fn emit(&self, event: InboundEvent) {
            self.inbound.send(Inbound { source: self.kind, event }).unwrap();
        }
    }

    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn publish(&self, action: SosAction) -> BoxFuture<'_, Result<PublishReceipt, TransportError>> {
            self.published.lock().unwrap().push(action);
            let kind = self.kind;
            let rejected = *self.reject_with.lock().unwrap();
            Box::pin(async move {
                match rejected {
                    Some(code) => Err(TransportError::Rejected { code: code.into(), message: "refused".into() }),
                    None => Ok(PublishReceipt { transport: kind, backend_alert_id: None }),
                }
            })
        }

        fn subscribe(&self) -> broadcast::Receiver<Inbound> {
            self.inbound.subscribe()
        }
    }

    fn cancel() -> SosAction {
        SosAction::Cancelled(CancelledNotice { alert_id: "a".into(), victim_device_id: "v".into(), cancelled_at: 0 })
    }

    fn claim() -> SosAction {
        SosAction::Accept(AssignedNotice {
            alert_id: "a-1".into(),
            victim_device_id: "v".into(),
            responder_device_id: "r".into(),
            responder_name: None,
            assigned_at: 1,
        })
    }

    fn router(mode: RouterMode, mesh: &Arc<FakeTransport>, internet: &Arc<FakeTransport>) -> TransportRouter {
        let m: Arc<dyn Transport> = mesh.clone();
        let i: Arc<dyn Transport> = internet.clone();
        TransportRouter::new(mode, Some(m), Some(i))
    }

    #[test]
    fn status_table() {
        use NetworkStatus::*;
        use RouterMode::*;
        assert_eq!(network_status(Auto, true, true), Hybrid);
        assert_eq!(network_status(Auto, true, false), MeshOnly);
        assert_eq!(network_status(Auto, false, true), Internet);
        assert_eq!(network_status(Auto, false, false), Offline);
        assert_eq!(network_status(ForceMesh, true, true), MeshOnly);
        assert_eq!(network_status(ForceMesh, false, true), Offline);
        assert_eq!(network_status(ForceInternet, true, true), Internet);
        assert_eq!(network_status(ForceInternet, true, false), Offline);
    }

    #[test]
    fn mode_parses_from_cli_strings() {
        assert_eq!("force-mesh".parse::<RouterMode>().unwrap(), RouterMode::ForceMesh);
        assert_eq!("AUTO".parse::<RouterMode>().unwrap(), RouterMode::Auto);
        assert!("carrier-pigeon".parse::<RouterMode>().is_err());
    }

    #[tokio::test]
    async fn auto_prefers_mesh_and_mirrors_to_internet() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let r = router(RouterMode::Auto, &mesh, &internet);
        assert_eq!(r.status(), NetworkStatus::Hybrid);

        let receipt = r.publish(cancel()).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Mesh);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mesh.published(), 1);
        assert_eq!(internet.published(), 1);
    }

    #[tokio::test]
    async fn auto_falls_back_to_internet() {
        let mesh = FakeTransport::new(TransportKind::Mesh, false);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let r = router(RouterMode::Auto, &mesh, &internet);
        let receipt = r.publish(cancel()).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Internet);
        assert_eq!(mesh.published(), 0);

        internet.up.store(false, Ordering::SeqCst);
        assert_eq!(r.status(), NetworkStatus::Offline);
        assert!(matches!(r.publish(cancel()).await, Err(TransportError::NoTransportAvailable)));
    }

    #[tokio::test]
    async fn forced_modes_never_fall_back() {
        let mesh = FakeTransport::new(TransportKind::Mesh, false);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let r = router(RouterMode::ForceMesh, &mesh, &internet);
        assert!(matches!(r.publish(cancel()).await, Err(TransportError::NoTransportAvailable)));
        assert_eq!(internet.published(), 0);

        r.set_mode(RouterMode::ForceInternet);
        mesh.up.store(true, Ordering::SeqCst);
        let receipt = r.publish(cancel()).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Internet);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mesh.published(), 0, "forced mode has no mirror");
    }

    #[tokio::test]
    async fn repeated_assignment_is_suppressed_across_transports() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let r = router(RouterMode::Auto, &mesh, &internet);
        let mut rx = r.subscribe();

        let notice = AssignedNotice {
            alert_id: "a-1".into(),
            victim_device_id: "v".into(),
            responder_device_id: "r".into(),
            responder_name: None,
            assigned_at: 1,
        };
        mesh.emit(InboundEvent::Assigned(notice.clone()));
        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.source, TransportKind::Mesh);

        internet.emit(InboundEvent::Assigned(notice));
        internet.emit(InboundEvent::Cancelled(CancelledNotice {
            alert_id: "a-1".into(),
            victim_device_id: "v".into(),
            cancelled_at: 2,
        }));
        let next = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(next.event, InboundEvent::Cancelled(_)), "duplicate assignment leaked: {next:?}");
    }

    #[tokio::test]
    async fn claim_goes_to_backend_first_then_floods() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let r = router(RouterMode::Auto, &mesh, &internet);

        let receipt = r.publish(claim()).await.unwrap();
        assert_eq!(receipt.transport, TransportKind::Internet);
        assert_eq!(internet.published(), 1);
        assert_eq!(mesh.published(), 1);
    }

    #[tokio::test]
    async fn claim_refused_by_backend_is_not_flooded() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        internet.reject("ALERT_ALREADY_ASSIGNED");
        let r = router(RouterMode::Auto, &mesh, &internet);

        match r.publish(claim()).await {
            Err(TransportError::Rejected { code, .. }) => assert_eq!(code, "ALERT_ALREADY_ASSIGNED"),
            other => panic!("expected rejection, got {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mesh.published(), 0, "refused claim leaked onto mesh");
    }

    #[tokio::test]
    async fn claim_floods_when_backend_cannot_decide() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        internet.reject("ALERT_NOT_FOUND");
        let r = router(RouterMode::Auto, &mesh, &internet);
        assert_eq!(r.publish(claim()).await.unwrap().transport, TransportKind::Mesh);

        internet.up.store(false, Ordering::SeqCst);
        assert_eq!(r.publish(claim()).await.unwrap().transport, TransportKind::Mesh);
        assert_eq!(internet.published(), 1);
        assert_eq!(mesh.published(), 2);
    }

    #[tokio::test]
    async fn assignment_seen_ledger_expires() {
        let source = broadcast::channel(16).0;
        let (out, mut rx) = broadcast::channel(16);
        let seen = Arc::new(Mutex::new(DedupStore::new(1)));
        let task = spawn_merge(source.subscribe(), out, seen.clone());

        let notice = AssignedNotice {
            alert_id: "a-1".into(),
            victim_device_id: "v".into(),
            responder_device_id: "r".into(),
            responder_name: None,
            assigned_at: 1,
        };
        let assigned = Inbound { source: TransportKind::Mesh, event: InboundEvent::Assigned(notice) };
        source.send(assigned.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(seen.lock().unwrap().is_empty(now_ms()));
        source.send(assigned).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        task.abort();
    }
}
