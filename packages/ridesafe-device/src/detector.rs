//! # detector
//!
//! Accelerometer crash detector.
//!
//! A crash is a magnitude spike followed by a continuous stillness hold:
//!
//! ```text
//! IDLE ──spike──▶ SPIKE_DETECTED ──▶ WAITING_FOR_STILLNESS ──still for window──▶ IDLE (+CrashEvent)
//!                                          │
//!                                          └──spike timeout──▶ IDLE
//! ```
//!
//! After a confirmed crash the detector ignores all samples for the cooldown
//! window, emitting a single `CooldownLocked` notice.
//!
//! [`CrashDetector::process`] is a pure state machine driven by explicit
//! timestamps. [`CrashDetector::start`] wraps it in a sampling task.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::capability::Capability;
use crate::error::{CapabilityError, ConfigError};
use crate::now_ms;
use crate::sensor::{MotionSample, MotionSensor, Orientation};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub sample_interval_ms: u64,
    pub spike_threshold_g: f64,
    pub stillness_threshold_g: f64,
    pub stillness_window_ms: u64,
    pub spike_timeout_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 100,
            spike_threshold_g: 2.5,
            stillness_threshold_g: 1.2,
            stillness_window_ms: 3_000,
            spike_timeout_ms: 10_000,
            cooldown_ms: 30_000,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_thresholds(self.spike_threshold_g, self.stillness_threshold_g)?;
        nonzero("sample_interval_ms", self.sample_interval_ms)?;
        nonzero("stillness_window_ms", self.stillness_window_ms)?;
        nonzero("spike_timeout_ms", self.spike_timeout_ms)?;
        nonzero("cooldown_ms", self.cooldown_ms)?;
        Ok(())
    }
}

fn validate_thresholds(spike_g: f64, stillness_g: f64) -> Result<(), ConfigError> {
    if !(spike_g.is_finite() && spike_g > 0.0) {
        return Err(ConfigError::NotPositive { field: "spike_threshold_g", value: spike_g });
    }
    if !(stillness_g.is_finite() && stillness_g > 0.0) {
        return Err(ConfigError::NotPositive { field: "stillness_threshold_g", value: stillness_g });
    }
    if stillness_g >= spike_g {
        return Err(ConfigError::ThresholdOrder { spike_g, stillness_g });
    }
    Ok(())
}

fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroDuration { field });
    }
    Ok(())
}

// ── Events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionPhase {
    Idle,
    SpikeDetected,
    WaitingForStillness,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseChangeReason {
    Spike,
    Timeout,
    StillnessConfirmed,
}

/// Thresholds in force when a crash was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationParams {
    pub stillness_threshold_g: f64,
    pub stillness_window_ms: u64,
    pub spike_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashEvent {
    pub timestamp_ms: i64,
    /// Peak magnitude observed between the spike and confirmation
    pub magnitude: f64,
    /// Spike threshold in force
    pub threshold: f64,
    pub spike_timestamp_ms: i64,
    pub spike_orientation: Orientation,
    pub confirmation: ConfirmationParams,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectorEvent {
    PhaseChanged {
        from: DetectionPhase,
        to: DetectionPhase,
        reason: PhaseChangeReason,
        at_ms: i64,
    },
    Crash(CrashEvent),
    /// First sample suppressed by the post-crash cooldown.
    CooldownLocked { until_ms: i64 },
}

// ── State machine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum PhaseState {
    Idle,
    Waiting {
        spike_at_ms: i64,
        orientation: Orientation,
        peak_g: f64,
        still_since_ms: Option<i64>,
    },
}

pub struct CrashDetector {
    config: DetectorConfig,
    state: PhaseState,
    cooldown_until_ms: Option<i64>,
    lock_notified: bool,
}

impl CrashDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: PhaseState::Idle,
            cooldown_until_ms: None,
            lock_notified: false,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn phase(&self) -> DetectionPhase {
        match self.state {
            PhaseState::Idle => DetectionPhase::Idle,
            PhaseState::Waiting { .. } => DetectionPhase::WaitingForStillness,
        }
    }

    pub fn set_thresholds(&mut self, spike_g: f64, stillness_g: f64) -> Result<(), ConfigError> {
        validate_thresholds(spike_g, stillness_g)?;
        self.config.spike_threshold_g = spike_g;
        self.config.stillness_threshold_g = stillness_g;
        Ok(())
    }

    pub fn set_stillness_window_ms(&mut self, ms: u64) -> Result<(), ConfigError> {
        nonzero("stillness_window_ms", ms)?;
        self.config.stillness_window_ms = ms;
        Ok(())
    }

    pub fn set_spike_timeout_ms(&mut self, ms: u64) -> Result<(), ConfigError> {
        nonzero("spike_timeout_ms", ms)?;
        self.config.spike_timeout_ms = ms;
        Ok(())
    }

    pub fn set_cooldown_ms(&mut self, ms: u64) -> Result<(), ConfigError> {
        nonzero("cooldown_ms", ms)?;
        self.config.cooldown_ms = ms;
        Ok(())
    }

    pub fn set_sample_interval_ms(&mut self, ms: u64) -> Result<(), ConfigError> {
        nonzero("sample_interval_ms", ms)?;
        self.config.sample_interval_ms = ms;
        Ok(())
    }

    /// Feed one sample taken at `now_ms`. Returns the events it caused, in order.
    pub fn process(&mut self, sample: MotionSample, now_ms: i64) -> Vec<DetectorEvent> {
        if let Some(until_ms) = self.cooldown_until_ms {
            if now_ms < until_ms {
                if self.lock_notified {
                    return Vec::new();
                }
                self.lock_notified = true;
                return vec![DetectorEvent::CooldownLocked { until_ms }];
            }
            self.cooldown_until_ms = None;
            self.lock_notified = false;
        }

        let magnitude = sample.magnitude();
        let cfg = self.config;

        match self.state {
            PhaseState::Idle => {
                if magnitude < cfg.spike_threshold_g {
                    return Vec::new();
                }
                self.state = PhaseState::Waiting {
                    spike_at_ms: now_ms,
                    orientation: sample.orientation(),
                    peak_g: magnitude,
                    still_since_ms: None,
                };
                vec![
                    DetectorEvent::PhaseChanged {
                        from: DetectionPhase::Idle,
                        to: DetectionPhase::SpikeDetected,
                        reason: PhaseChangeReason::Spike,
                        at_ms: now_ms,
                    },
                    DetectorEvent::PhaseChanged {
                        from: DetectionPhase::SpikeDetected,
                        to: DetectionPhase::WaitingForStillness,
                        reason: PhaseChangeReason::Spike,
                        at_ms: now_ms,
                    },
                ]
            }
            PhaseState::Waiting { spike_at_ms, orientation, peak_g, still_since_ms } => {
                if now_ms - spike_at_ms > cfg.spike_timeout_ms as i64 {
                    self.state = PhaseState::Idle;
                    return vec![DetectorEvent::PhaseChanged {
                        from: DetectionPhase::WaitingForStillness,
                        to: DetectionPhase::Idle,
                        reason: PhaseChangeReason::Timeout,
                        at_ms: now_ms,
                    }];
                }

                let peak_g = peak_g.max(magnitude);

                if magnitude > cfg.stillness_threshold_g {
                    self.state = PhaseState::Waiting { spike_at_ms, orientation, peak_g, still_since_ms: None };
                    return Vec::new();
                }

                let still_since = still_since_ms.unwrap_or(now_ms);
                if now_ms - still_since < cfg.stillness_window_ms as i64 {
                    self.state = PhaseState::Waiting {
                        spike_at_ms,
                        orientation,
                        peak_g,
                        still_since_ms: Some(still_since),
                    };
                    return Vec::new();
                }

                self.state = PhaseState::Idle;
                self.cooldown_until_ms = Some(now_ms + cfg.cooldown_ms as i64);
                self.lock_notified = false;

                let crash = CrashEvent {
                    timestamp_ms: now_ms,
                    magnitude: peak_g,
                    threshold: cfg.spike_threshold_g,
                    spike_timestamp_ms: spike_at_ms,
                    spike_orientation: orientation,
                    confirmation: ConfirmationParams {
                        stillness_threshold_g: cfg.stillness_threshold_g,
                        stillness_window_ms: cfg.stillness_window_ms,
                        spike_timeout_ms: cfg.spike_timeout_ms,
                    },
                };
                vec![
                    DetectorEvent::Crash(crash),
                    DetectorEvent::PhaseChanged {
                        from: DetectionPhase::WaitingForStillness,
                        to: DetectionPhase::Idle,
                        reason: PhaseChangeReason::StillnessConfirmed,
                        at_ms: now_ms,
                    },
                ]
            }
        }
    }

    /// Start sampling `sensor` every `sample_interval_ms`.
    ///
    /// Fails immediately, without spawning anything, when the sensor
    /// capability is unavailable.
    pub fn start<S: MotionSensor>(self, sensor: Capability<S>) -> Result<DetectorHandle, CapabilityError> {
        let mut sensor = sensor.require("motion sensor")?;
        let (events, _) = broadcast::channel(64);
        let tx = events.clone();
        let period = Duration::from_millis(self.config.sample_interval_ms);
        let mut detector = self;

        let task = tokio::spawn(async move {
            let origin_ms = now_ms();
            let started = Instant::now();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("📈 Crash detector sampling every {}ms", period.as_millis());

            loop {
                ticker.tick().await;
                let Some(sample) = sensor.read() else { continue };
                let at = origin_ms + started.elapsed().as_millis() as i64;
                for event in detector.process(sample, at) {
                    match &event {
                        DetectorEvent::Crash(c) => info!(
                            "💥 Crash confirmed: peak {:.2}g (spike at {})",
                            c.magnitude, c.spike_timestamp_ms
                        ),
                        DetectorEvent::CooldownLocked { until_ms } => {
                            info!("Detector locked until {until_ms} (cooldown)")
                        }
                        DetectorEvent::PhaseChanged { from, to, reason, .. } => {
                            debug!("Detector phase {from:?} → {to:?} ({reason:?})")
                        }
                    }
                    // No subscribers is fine
                    let _ = tx.send(event);
                }
            }
        });

        Ok(DetectorHandle { events, task })
    }
}

/// Running sampling loop. Dropping the handle stops it.
pub struct DetectorHandle {
    events: broadcast::Sender<DetectorEvent>,
    task: JoinHandle<()>,
}

impl DetectorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<DetectorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for DetectorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
