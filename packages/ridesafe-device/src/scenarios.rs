//! scenarios.rs — Scripted motion profiles for the simulated accelerometer
//!
//! Each scenario exercises one path through the crash detector:
//! - `HardCrash`: spike then lasting stillness, confirms a crash
//! - `NearMiss`: spike then the rider keeps moving, times out
//! - `Pothole`: a jolt below the spike threshold, never leaves IDLE

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    None,
    HardCrash,
    NearMiss,
    Pothole,
}

/// What the simulated device is doing at a given moment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScenarioPhase {
    Riding,
    Impact { peak_g: f64 },
    Still,
    Moving,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashScenario {
    pub kind: ScenarioType,
    /// Time after sensor start at which the impact begins
    pub impact_at_ms: u64,
    pub impact_duration_ms: u64,
    pub peak_g: f64,
}

impl CrashScenario {
    pub fn none() -> Self {
        Self { kind: ScenarioType::None, impact_at_ms: u64::MAX, impact_duration_ms: 0, peak_g: 1.0 }
    }

    pub fn hard_crash(impact_at_ms: u64) -> Self {
        Self { kind: ScenarioType::HardCrash, impact_at_ms, impact_duration_ms: 300, peak_g: 6.0 }
    }

    pub fn near_miss(impact_at_ms: u64) -> Self {
        Self { kind: ScenarioType::NearMiss, impact_at_ms, impact_duration_ms: 200, peak_g: 4.0 }
    }

    pub fn pothole(impact_at_ms: u64) -> Self {
        Self { kind: ScenarioType::Pothole, impact_at_ms, impact_duration_ms: 100, peak_g: 1.6 }
    }

    /// Preset lookup used by the simulator CLI.
    pub fn from_name(name: &str, impact_at_ms: u64) -> Option<Self> {
        match name {
            "none" => Some(Self::none()),
            "hard_crash" => Some(Self::hard_crash(impact_at_ms)),
            "near_miss" => Some(Self::near_miss(impact_at_ms)),
            "pothole" => Some(Self::pothole(impact_at_ms)),
            _ => None,
        }
    }

    pub fn phase_at(&self, elapsed_ms: u64) -> ScenarioPhase {
        if self.kind == ScenarioType::None || elapsed_ms < self.impact_at_ms {
            return ScenarioPhase::Riding;
        }
        let since_impact = elapsed_ms - self.impact_at_ms;
        if since_impact < self.impact_duration_ms {
            return ScenarioPhase::Impact { peak_g: self.peak_g };
        }
        match self.kind {
            ScenarioType::HardCrash => ScenarioPhase::Still,
            ScenarioType::NearMiss => ScenarioPhase::Moving,
            ScenarioType::Pothole | ScenarioType::None => ScenarioPhase::Riding,
        }
    }
}
