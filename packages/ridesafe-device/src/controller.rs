//! controller.rs — Emergency state machine
//!
//! ```text
//! MONITORING ──crash──▶ CRASH_DETECTED ──▶ COUNTDOWN_ACTIVE ──expiry / send now──▶ ALERT_SENDING ──▶ ALERT_SENT
//!     ▲                      │                   │                                                  │
//!     └──────── cancel ──────┴───────────────────┘                                       assigned ──▶ RESPONDER_ASSIGNED
//! MONITORING ──manual SOS──▶ ALERT_SENDING
//! ```
//!
//! Escalation emits `AlertTriggered` synchronously from the cached breadcrumb
//! snapshot; the fresh location fetch and the transport publish run in a
//! detached task and report back through the same event channel.
//!
//! The countdown is one repeating 1 s tick. Every countdown carries a
//! generation number; starting, cancelling or escalating bumps it, so a stale
//! tick task can never act on a newer countdown.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ridesafe_types::{AlertLocation, AssignedNotice, CancelledNotice};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detector::{CrashEvent, DetectorEvent};
use crate::error::ControllerError;
use crate::location::{BreadcrumbTrail, LocationProvider};
use crate::now_ms;
use crate::router::TransportRouter;
use crate::transport::{InboundEvent, PublishReceipt, SosAction, TriggeredAlert};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyState {
    Monitoring,
    CrashDetected,
    CountdownActive,
    AlertSending,
    AlertSent,
    ResponderAssigned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyEvent {
    StateChanged { from: EmergencyState, to: EmergencyState },
    CountdownStarted { seconds: u32 },
    CountdownTick { remaining: u32 },
    Cancelled,
    AlertTriggered {
        alert_id: String,
        triggered_at: i64,
        /// Cached snapshot at trigger time
        location: Option<AlertLocation>,
        manual: bool,
    },
    AlertPublished { alert_id: String, receipt: PublishReceipt },
    AlertPublishFailed { alert_id: String, error: String },
    ResponderAssigned(AssignedNotice),
    AlertRetracted { alert_id: String },
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub device_id: String,
    pub victim_name: Option<String>,
    pub countdown_secs: u32,
    /// Crashes this soon after the previous alert are ignored.
    pub reentry_lock_ms: i64,
    pub fresh_location_timeout: Duration,
    pub audible_warning: bool,
}

impl ControllerConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            victim_name: None,
            countdown_secs: 10,
            reentry_lock_ms: 5_000,
            fresh_location_timeout: Duration::from_secs(5),
            audible_warning: true,
        }
    }
}

/// Audible or spoken countdown warning.
pub trait WarningSink: Send + Sync + 'static {
    fn start(&self, countdown_secs: u32);
    fn silence(&self);
}

/// Warning sink for headless devices: logs instead of sounding.
pub struct LogWarning;

impl WarningSink for LogWarning {
    fn start(&self, countdown_secs: u32) {
        warn!("🔊 Crash detected! Sending SOS in {countdown_secs}s unless cancelled");
    }

    fn silence(&self) {
        debug!("🔇 Warning silenced");
    }
}

struct Inner {
    state: EmergencyState,
    generation: u64,
    countdown: Option<JoinHandle<()>>,
    active_alert: Option<String>,
    last_alert_at: Option<i64>,
    warning_on: bool,
    subscriptions: Vec<JoinHandle<()>>,
}

pub struct EmergencyController {
    config: ControllerConfig,
    router: Arc<TransportRouter>,
    trail: BreadcrumbTrail,
    location: Option<Arc<dyn LocationProvider>>,
    warning: Arc<dyn WarningSink>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<EmergencyEvent>,
}

impl EmergencyController {
    pub fn new(
        config: ControllerConfig,
        router: Arc<TransportRouter>,
        trail: BreadcrumbTrail,
        location: Option<Arc<dyn LocationProvider>>,
        warning: Arc<dyn WarningSink>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            config,
            router,
            trail,
            location,
            warning,
            inner: Mutex::new(Inner {
                state: EmergencyState::Monitoring,
                generation: 0,
                countdown: None,
                active_alert: None,
                last_alert_at: None,
                warning_on: false,
                subscriptions: Vec::new(),
            }),
            events,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: EmergencyEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, to: EmergencyState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        debug!("Emergency {from:?} → {to:?}");
        self.emit(EmergencyEvent::StateChanged { from, to });
    }

    fn silence(&self, inner: &mut Inner) {
        if inner.warning_on {
            inner.warning_on = false;
            self.warning.silence();
        }
    }

    /// Stops the countdown task unless the caller is that task.
    fn clear_countdown(inner: &mut Inner, abort: bool) {
        inner.generation += 1;
        if let Some(task) = inner.countdown.take() {
            if abort {
                task.abort();
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmergencyEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> EmergencyState {
        self.lock().state
    }

    pub fn active_alert_id(&self) -> Option<String> {
        self.lock().active_alert.clone()
    }

    /// Wires detector crashes and router assignments into the state machine.
    pub fn start(self: &Arc<Self>, detector: Option<broadcast::Receiver<DetectorEvent>>) {
        let mut tasks = Vec::new();

        if let Some(mut rx) = detector {
            let me = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(DetectorEvent::Crash(crash)) => me.on_crash(crash),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => warn!("Controller lagged {n} detector events"),
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        let mut inbound = self.router.subscribe();
        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(i) => {
                        if let InboundEvent::Assigned(notice) = i.event {
                            me.on_assigned(notice);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!("Controller lagged {n} inbound events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let mut inner = self.lock();
        for old in inner.subscriptions.drain(..) {
            old.abort();
        }
        inner.subscriptions = tasks;
    }

    /// Clears timers, silences the warning, drops subscriptions and returns
    /// to MONITORING. Safe from any state.
    pub fn stop(&self) {
        let mut inner = self.lock();
        Self::clear_countdown(&mut inner, true);
        self.silence(&mut inner);
        for task in inner.subscriptions.drain(..) {
            task.abort();
        }
        inner.active_alert = None;
        self.set_state(&mut inner, EmergencyState::Monitoring);
    }

    pub fn on_crash(self: &Arc<Self>, crash: CrashEvent) {
        let mut inner = self.lock();
        if inner.state != EmergencyState::Monitoring {
            debug!("Crash ignored while {:?}", inner.state);
            return;
        }
        if let Some(last) = inner.last_alert_at {
            if now_ms() - last < self.config.reentry_lock_ms {
                info!("Crash ignored: within re-entry lock of the previous alert");
                return;
            }
        }
        info!("💥 Crash reported ({:.2}g), starting countdown", crash.magnitude);
        self.set_state(&mut inner, EmergencyState::CrashDetected);
        if self.config.audible_warning {
            inner.warning_on = true;
            self.warning.start(self.config.countdown_secs);
        }
        self.start_countdown(&mut inner);
    }

    fn start_countdown(self: &Arc<Self>, inner: &mut Inner) {
        Self::clear_countdown(inner, true);
        let generation = inner.generation;
        let seconds = self.config.countdown_secs;
        self.set_state(inner, EmergencyState::CountdownActive);
        self.emit(EmergencyEvent::CountdownStarted { seconds });

        let me = Arc::clone(self);
        inner.countdown = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            // First tick completes immediately
            ticker.tick().await;
            for remaining in (0..seconds).rev() {
                ticker.tick().await;
                if !me.tick(generation, remaining) {
                    return;
                }
            }
            me.escalate_from_countdown(generation);
        }));
    }

    /// Emits one tick. Returns false when this countdown is no longer current.
    fn tick(&self, generation: u64, remaining: u32) -> bool {
        let inner = self.lock();
        if inner.generation != generation || inner.state != EmergencyState::CountdownActive {
            return false;
        }
        self.emit(EmergencyEvent::CountdownTick { remaining });
        true
    }

    fn escalate_from_countdown(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != EmergencyState::CountdownActive {
            return;
        }
        // Called from the countdown task itself: detach, never abort
        Self::clear_countdown(&mut inner, false);
        self.escalate(&mut inner, false);
    }

    /// User cancel. Only honoured before the alert goes out.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.state, EmergencyState::CrashDetected | EmergencyState::CountdownActive) {
            debug!("Cancel ignored while {:?}", inner.state);
            return false;
        }
        Self::clear_countdown(&mut inner, true);
        self.silence(&mut inner);
        self.set_state(&mut inner, EmergencyState::Monitoring);
        self.emit(EmergencyEvent::Cancelled);
        info!("Countdown cancelled by user");
        true
    }

    /// Skip the rest of a running countdown.
    pub fn send_now(self: &Arc<Self>) -> Option<String> {
        let mut inner = self.lock();
        if !matches!(inner.state, EmergencyState::CrashDetected | EmergencyState::CountdownActive) {
            return None;
        }
        Self::clear_countdown(&mut inner, true);
        Some(self.escalate(&mut inner, false))
    }

    /// Manual SOS. Allowed from MONITORING as well as during a countdown.
    pub fn trigger_manual(self: &Arc<Self>) -> Option<String> {
        let mut inner = self.lock();
        if !matches!(
            inner.state,
            EmergencyState::Monitoring | EmergencyState::CrashDetected | EmergencyState::CountdownActive
        ) {
            return None;
        }
        Self::clear_countdown(&mut inner, true);
        Some(self.escalate(&mut inner, true))
    }

    fn escalate(self: &Arc<Self>, inner: &mut Inner, manual: bool) -> String {
        self.silence(inner);
        self.set_state(inner, EmergencyState::AlertSending);

        let alert_id = Uuid::new_v4().to_string();
        let triggered_at = now_ms();
        let snapshot = self.trail.snapshot_location();
        self.emit(EmergencyEvent::AlertTriggered {
            alert_id: alert_id.clone(),
            triggered_at,
            location: snapshot.clone(),
            manual,
        });
        self.set_state(inner, EmergencyState::AlertSent);
        inner.active_alert = Some(alert_id.clone());
        inner.last_alert_at = Some(triggered_at);
        info!("🚨 SOS {alert_id} triggered{}", if manual { " manually" } else { "" });

        let me = Arc::clone(self);
        let id = alert_id.clone();
        tokio::spawn(async move {
            let location = me.fresher_location().await.or(snapshot);
            let alert = TriggeredAlert {
                alert_id: id.clone(),
                device_id: me.config.device_id.clone(),
                victim_name: me.config.victim_name.clone(),
                triggered_at,
                location,
            };
            match me.router.publish(SosAction::Triggered(alert)).await {
                Ok(receipt) => {
                    info!("SOS {id} published via {}", receipt.transport);
                    me.emit(EmergencyEvent::AlertPublished { alert_id: id, receipt });
                }
                Err(e) => {
                    warn!("SOS {id} publish failed: {e}");
                    me.emit(EmergencyEvent::AlertPublishFailed { alert_id: id, error: e.to_string() });
                }
            }
        });

        alert_id
    }

    async fn fresher_location(&self) -> Option<AlertLocation> {
        let provider = self.location.as_ref()?;
        match tokio::time::timeout(self.config.fresh_location_timeout, provider.current_position()).await {
            Ok(Ok(fix)) => Some(self.trail.location_with_fix(fix)),
            Ok(Err(e)) => {
                debug!("Fresh location unavailable, using cached snapshot: {e}");
                None
            }
            Err(_) => {
                debug!("Fresh location timed out, using cached snapshot");
                None
            }
        }
    }

    /// Assignment notice from either transport.
    pub fn on_assigned(&self, notice: AssignedNotice) {
        let mut inner = self.lock();
        if !matches!(inner.state, EmergencyState::AlertSending | EmergencyState::AlertSent) {
            return;
        }
        if notice.victim_device_id != self.config.device_id {
            return;
        }
        let Some(local_id) = inner.active_alert.clone() else { return };
        let matches_alert =
            notice.alert_id == local_id || self.router.backend_alert_id(&local_id).as_deref() == Some(notice.alert_id.as_str());
        if !matches_alert {
            debug!("Assignment for {} is not our active alert", notice.alert_id);
            return;
        }
        info!("🙋 Responder {} assigned to our SOS", notice.responder_device_id);
        self.set_state(&mut inner, EmergencyState::ResponderAssigned);
        self.emit(EmergencyEvent::ResponderAssigned(notice));
    }

    /// Withdraws a sent alert: publishes SOS_CANCELLED, then returns to MONITORING.
    pub async fn retract_alert(&self) -> Result<PublishReceipt, ControllerError> {
        let alert_id = {
            let inner = self.lock();
            if !matches!(inner.state, EmergencyState::AlertSent | EmergencyState::ResponderAssigned) {
                return Err(ControllerError::InvalidState(inner.state));
            }
            inner.active_alert.clone().ok_or(ControllerError::InvalidState(inner.state))?
        };

        let notice = CancelledNotice {
            alert_id: alert_id.clone(),
            victim_device_id: self.config.device_id.clone(),
            cancelled_at: now_ms(),
        };
        let result = self.router.publish(SosAction::Cancelled(notice)).await;

        let mut inner = self.lock();
        inner.active_alert = None;
        self.set_state(&mut inner, EmergencyState::Monitoring);
        self.emit(EmergencyEvent::AlertRetracted { alert_id });
        Ok(result?)
    }
}

impl Drop for EmergencyController {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = inner.countdown.take() {
            task.abort();
        }
        for task in inner.subscriptions.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use futures_util::future::BoxFuture;
    use ridesafe_types::BreadcrumbPoint;

    use crate::detector::ConfirmationParams;
    use crate::error::TransportError;
    use crate::router::RouterMode;
    use crate::sensor::Orientation;
    use crate::transport::{Inbound, Transport, TransportKind};

    struct FakeInternet {
        up: AtomicBool,
        published: Mutex<Vec<SosAction>>,
        inbound: broadcast::Sender<Inbound>,
    }

    impl Transport for FakeInternet {
        fn kind(&self) -> TransportKind {
            TransportKind::Internet
        }

        fn is_available(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        fn publish(&self, action: SosAction) -> BoxFuture<'_, Result<PublishReceipt, TransportError>> {
            let backend_alert_id = Some(format!("srv-{}", action.alert_id()));
            self.published.lock().unwrap().push(action);
            Box::pin(async move { Ok(PublishReceipt { transport: TransportKind::Internet, backend_alert_id }) })
        }

        fn subscribe(&self) -> broadcast::Receiver<Inbound> {
            self.inbound.subscribe()
        }

        fn backend_alert_id(&self, local: &str) -> Option<String> {
            Some(format!("srv-{local}"))
        }
    }

    #[derive(Default)]
    struct CountingWarning {
        started: AtomicUsize,
        silenced: AtomicUsize,
    }

    impl WarningSink for CountingWarning {
        fn start(&self, _: u32) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn silence(&self) {
            self.silenced.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        controller: Arc<EmergencyController>,
        internet: Arc<FakeInternet>,
        warning: Arc<CountingWarning>,
        events: broadcast::Receiver<EmergencyEvent>,
    }

    fn rig() -> Rig {
        let internet = Arc::new(FakeInternet {
            up: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            inbound: broadcast::channel(16).0,
        });
        let transport: Arc<dyn Transport> = internet.clone();
        let router = Arc::new(TransportRouter::new(RouterMode::Auto, None, Some(transport)));
        let trail = BreadcrumbTrail::new();
        trail.push(BreadcrumbPoint { latitude: 28.6139, longitude: 77.2090, timestamp_ms: 1 });
        let warning = Arc::new(CountingWarning::default());
        let mut config = ControllerConfig::new("victim-1");
        config.countdown_secs = 3;
        let controller = EmergencyController::new(config, router, trail, None, warning.clone());
        controller.start(None);
        let events = controller.subscribe();
        Rig { controller, internet, warning, events }
    }

    fn crash() -> CrashEvent {
        CrashEvent {
            timestamp_ms: now_ms(),
            magnitude: 5.0,
            threshold: 2.5,
            spike_timestamp_ms: now_ms(),
            spike_orientation: Orientation { x: 0.0, y: 0.0, z: 1.0 },
            confirmation: ConfirmationParams { stillness_threshold_g: 1.2, stillness_window_ms: 3000, spike_timeout_ms: 10000 },
        }
    }

    fn drain(rx: &mut broadcast::Receiver<EmergencyEvent>) -> Vec<EmergencyEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn published(r: &Rig) -> Vec<SosAction> {
        r.internet.published.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_expiry_sends_alert() {
        let mut r = rig();
        r.controller.on_crash(crash());
        assert_eq!(r.controller.state(), EmergencyState::CountdownActive);
        assert_eq!(r.warning.started.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);

        let events = drain(&mut r.events);
        let ticks: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                EmergencyEvent::CountdownTick { remaining } => Some(*remaining),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![2, 1, 0]);
        assert!(events.contains(&EmergencyEvent::CountdownStarted { seconds: 3 }));
        assert!(events.iter().any(|e| matches!(e, EmergencyEvent::AlertTriggered { manual: false, location: Some(_), .. })));
        assert!(events.iter().any(|e| matches!(e, EmergencyEvent::AlertPublished { .. })));
        assert_eq!(published(&r).len(), 1);
        assert_eq!(r.warning.silenced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_countdown_prevents_alert() {
        let mut r = rig();
        r.controller.on_crash(crash());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(r.controller.cancel());
        assert_eq!(r.controller.state(), EmergencyState::Monitoring);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(published(&r).is_empty());
        let events = drain(&mut r.events);
        assert!(events.contains(&EmergencyEvent::Cancelled));
        assert!(!events.iter().any(|e| matches!(e, EmergencyEvent::AlertTriggered { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_trigger_emits_synchronously() {
        let mut r = rig();
        let id = r.controller.trigger_manual().unwrap();
        // Visible before any await
        let events = drain(&mut r.events);
        assert!(events.iter().any(|e| matches!(e, EmergencyEvent::AlertTriggered { alert_id, manual: true, .. } if *alert_id == id)));
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);

        // Cancel after sending is a no-op; so is a second trigger
        assert!(!r.controller.cancel());
        assert!(r.controller.trigger_manual().is_none());
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);
    }

    #[tokio::test(start_paused = true)]
    async fn send_now_skips_countdown() {
        let r = rig();
        assert!(r.controller.send_now().is_none());
        r.controller.on_crash(crash());
        assert!(r.controller.send_now().is_some());
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(published(&r).len(), 1, "countdown must not fire a second alert");
    }

    #[tokio::test(start_paused = true)]
    async fn assignment_must_match_our_alert() {
        let mut r = rig();
        let local = r.controller.trigger_manual().unwrap();
        let notice = |victim: &str, alert: &str| AssignedNotice {
            alert_id: alert.to_string(),
            victim_device_id: victim.to_string(),
            responder_device_id: "rider-2".into(),
            responder_name: None,
            assigned_at: 1,
        };

        r.controller.on_assigned(notice("someone-else", &local));
        r.controller.on_assigned(notice("victim-1", "unrelated"));
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);

        // Backend id reported by the internet transport
        r.internet.inbound.send(Inbound {
            source: TransportKind::Internet,
            event: InboundEvent::Assigned(notice("victim-1", &format!("srv-{local}"))),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(r.controller.state(), EmergencyState::ResponderAssigned);
        assert!(drain(&mut r.events).iter().any(|e| matches!(e, EmergencyEvent::ResponderAssigned(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn retract_then_reentry_lock() {
        let r = rig();
        assert!(matches!(r.controller.retract_alert().await, Err(ControllerError::InvalidState(EmergencyState::Monitoring))));

        let id = r.controller.trigger_manual().unwrap();
        r.controller.retract_alert().await.unwrap();
        assert_eq!(r.controller.state(), EmergencyState::Monitoring);
        let actions = published(&r);
        assert!(matches!(actions.last(), Some(SosAction::Cancelled(c)) if c.alert_id == id));

        // Re-entry lock uses wall-clock time: a crash right after the alert is ignored
        r.controller.on_crash(crash());
        assert_eq!(r.controller.state(), EmergencyState::Monitoring);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_safe_from_any_state() {
        let r = rig();
        r.controller.stop();
        r.controller.on_crash(crash());
        r.controller.stop();
        assert_eq!(r.controller.state(), EmergencyState::Monitoring);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(published(&r).is_empty());

        r.controller.trigger_manual();
        r.controller.stop();
        assert_eq!(r.controller.state(), EmergencyState::Monitoring);
        r.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_is_reported_not_fatal() {
        let mut r = rig();
        r.internet.up.store(false, Ordering::SeqCst);
        r.controller.trigger_manual().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(r.controller.state(), EmergencyState::AlertSent);
        assert!(drain(&mut r.events).iter().any(|e| matches!(e, EmergencyEvent::AlertPublishFailed { .. })));
    }
}
