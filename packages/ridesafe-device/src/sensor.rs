//! sensor.rs — Motion samples and the accelerometer seam
//!
//! The detector polls a [`MotionSensor`] once per sample interval. Real
//! platforms wrap their accelerometer driver; the simulator uses
//! [`SimulatedSensor`], which replays a [`CrashScenario`] over a resting
//! 1 g baseline with Gaussian noise.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::capability::Capability;
use crate::scenarios::{CrashScenario, ScenarioPhase};

// ── Types ─────────────────────────────────────────────────────────────────────

/// One accelerometer reading in g-units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl MotionSample {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Total acceleration magnitude.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Unit vector in the direction of the sample. Zero samples map to zero.
    pub fn orientation(&self) -> Orientation {
        let m = self.magnitude();
        if m == 0.0 {
            return Orientation { x: 0.0, y: 0.0, z: 0.0 };
        }
        Orientation { x: self.x / m, y: self.y / m, z: self.z / m }
    }
}

/// Normalized direction of a spike sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Accelerometer driver as seen by the crash detector.
pub trait MotionSensor: Send + 'static {
    /// Latest reading, or `None` when the driver had nothing new.
    fn read(&mut self) -> Option<MotionSample>;
}

// ── Simulated accelerometer ───────────────────────────────────────────────────

/// Resting device plus an optional scripted impact.
pub struct SimulatedSensor {
    scenario: CrashScenario,
    started: Instant,
    noise: Normal<f64>,
    rng: StdRng,
}

impl SimulatedSensor {
    /// Probe used by the simulator. Always available.
    pub fn probe(scenario: CrashScenario, noise_sigma_g: f64) -> Capability<Self> {
        match Normal::new(0.0, noise_sigma_g.abs()) {
            Ok(noise) => Capability::Available(Self {
                scenario,
                started: Instant::now(),
                noise,
                rng: StdRng::from_entropy(),
            }),
            Err(e) => Capability::unavailable(format!("bad noise model: {e}")),
        }
    }

    fn jitter(&mut self) -> f64 {
        self.noise.sample(&mut self.rng)
    }
}

impl MotionSensor for SimulatedSensor {
    fn read(&mut self) -> Option<MotionSample> {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let (dx, dy, dz) = (self.jitter(), self.jitter(), self.jitter());
        let sample = match self.scenario.phase_at(elapsed_ms) {
            ScenarioPhase::Riding => MotionSample::new(dx, dy, 1.0 + dz),
            // Lateral impact plus gravity
            ScenarioPhase::Impact { peak_g } => MotionSample::new(peak_g * 0.8 + dx, peak_g * 0.6 + dy, 1.0 + dz),
            // Bike down, rider motionless: gravity only, tiny noise
            ScenarioPhase::Still => MotionSample::new(dx * 0.1, 1.0 + dy * 0.1, dz * 0.1),
            // Rider gets up and moves around
            ScenarioPhase::Moving => MotionSample::new(0.6 + dx, 0.4 + dy, 1.0 + dz),
        };
        Some(sample)
    }
}
