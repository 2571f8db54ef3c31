//! location.rs — Position fixes and the breadcrumb trail
//!
//! Two consumers with different latency needs:
//! - the emergency controller reads the cached trail synchronously at
//!   trigger time, then asks the provider for a fresher fix in the background
//! - the mesh payload builders and heartbeat loop read the newest fix

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use ridesafe_types::{AlertLocation, BreadcrumbPoint, MAX_BREADCRUMBS};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::LocationError;
use crate::now_ms;

/// Platform location service.
pub trait LocationProvider: Send + Sync + 'static {
    /// On-demand fix. May fail, time out, or be denied.
    fn current_position(&self) -> BoxFuture<'_, Result<BreadcrumbPoint, LocationError>>;
}

// ── Breadcrumb trail ──────────────────────────────────────────────────────────

/// Bounded history of recent fixes, oldest first. Cheap to clone.
#[derive(Clone, Default)]
pub struct BreadcrumbTrail {
    points: Arc<Mutex<VecDeque<BreadcrumbPoint>>>,
}

impl BreadcrumbTrail {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BreadcrumbPoint>> {
        // A panicked writer cannot leave a VecDeque half-updated
        self.points.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a fix, evicting the oldest beyond [`MAX_BREADCRUMBS`].
    pub fn push(&self, fix: BreadcrumbPoint) {
        let mut points = self.lock();
        points.push_back(fix);
        while points.len() > MAX_BREADCRUMBS {
            points.pop_front();
        }
    }

    pub fn latest(&self) -> Option<BreadcrumbPoint> {
        self.lock().back().copied()
    }

    pub fn points(&self) -> Vec<BreadcrumbPoint> {
        self.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Alert location from the newest cached fix, with the fixes before it
    /// as the trail. Never blocks on the location provider.
    pub fn snapshot_location(&self) -> Option<AlertLocation> {
        let points = self.points();
        let (latest, prior) = points.split_last()?;
        Some(AlertLocation::from_fix(*latest, prior))
    }

    /// Like [`snapshot_location`](Self::snapshot_location) but centred on a
    /// fresh fix, with the whole cached trail behind it.
    pub fn location_with_fix(&self, fix: BreadcrumbPoint) -> AlertLocation {
        AlertLocation::from_fix(fix, &self.points())
    }
}

/// Polls `provider` every `interval` and feeds fixes into `trail`.
/// Failed fixes are skipped; the next tick retries.
pub fn watch_position(
    provider: Arc<dyn LocationProvider>,
    trail: BreadcrumbTrail,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match provider.current_position().await {
                Ok(fix) => {
                    debug!("📍 Fix {:.5},{:.5}", fix.latitude, fix.longitude);
                    trail.push(fix);
                }
                Err(e) => warn!("Location watch skipped a fix: {e}"),
            }
        }
    })
}

// ── Simulated GPS ─────────────────────────────────────────────────────────────

/// Degrees per meter of latitude (spherical Earth).
const DEG_PER_M: f64 = 1.0 / 111_320.0;

struct Walk {
    latitude: f64,
    longitude: f64,
    step: Normal<f64>,
    rng: StdRng,
}

/// Random walk around a start point. Each fix moves by a Gaussian step.
pub struct SimulatedLocation {
    walk: Mutex<Walk>,
}

impl SimulatedLocation {
    /// `step_sigma_m` is the standard deviation of each step per axis, in meters.
    pub fn new(latitude: f64, longitude: f64, step_sigma_m: f64) -> Result<Self, LocationError> {
        let step = Normal::new(0.0, step_sigma_m.abs())
            .map_err(|e| LocationError::Unavailable(format!("bad walk model: {e}")))?;
        Ok(Self {
            walk: Mutex::new(Walk { latitude, longitude, step, rng: StdRng::from_entropy() }),
        })
    }

    fn next_fix(&self) -> Result<BreadcrumbPoint, LocationError> {
        let mut walk = self
            .walk
            .lock()
            .map_err(|_| LocationError::Unavailable("walk state poisoned".to_string()))?;
        let w = &mut *walk;
        let north_m = w.step.sample(&mut w.rng);
        let east_m = w.step.sample(&mut w.rng);
        w.latitude += north_m * DEG_PER_M;
        w.longitude += east_m * DEG_PER_M / w.latitude.to_radians().cos().max(1e-6);
        Ok(BreadcrumbPoint { latitude: w.latitude, longitude: w.longitude, timestamp_ms: now_ms() })
    }
}

impl LocationProvider for SimulatedLocation {
    fn current_position(&self) -> BoxFuture<'_, Result<BreadcrumbPoint, LocationError>> {
        Box::pin(async move { self.next_fix() })
    }
}

/// Provider for devices where location permission was refused.
pub struct DeniedLocation;

impl LocationProvider for DeniedLocation {
    fn current_position(&self) -> BoxFuture<'_, Result<BreadcrumbPoint, LocationError>> {
        Box::pin(async { Err(LocationError::PermissionDenied) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(i: i64) -> BreadcrumbPoint {
        BreadcrumbPoint { latitude: 28.0 + i as f64 * 0.001, longitude: 77.0, timestamp_ms: i }
    }

    #[test]
    fn trail_evicts_oldest_first() {
        let trail = BreadcrumbTrail::new();
        for i in 0..15 {
            trail.push(fix(i));
        }
        let points = trail.points();
        assert_eq!(points.len(), MAX_BREADCRUMBS);
        assert_eq!(points[0].timestamp_ms, 5);
        assert_eq!(trail.latest().unwrap().timestamp_ms, 14);
    }

    #[test]
    fn snapshot_uses_newest_fix_and_prior_trail() {
        let trail = BreadcrumbTrail::new();
        assert!(trail.snapshot_location().is_none());
        for i in 0..4 {
            trail.push(fix(i));
        }
        let loc = trail.snapshot_location().unwrap();
        assert_eq!(loc.timestamp_ms, 3);
        let ts: Vec<i64> = loc.breadcrumb_trail.iter().map(|p| p.timestamp_ms).collect();
        assert_eq!(ts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn simulated_walk_stays_near_start() {
        let gps = SimulatedLocation::new(28.6139, 77.2090, 2.0).unwrap();
        let start = ridesafe_types::GeoPoint::new(28.6139, 77.2090);
        for _ in 0..20 {
            let f = gps.current_position().await.unwrap();
            assert!(ridesafe_types::haversine_m(start, f.point()) < 500.0);
        }
    }

    #[tokio::test]
    async fn denied_provider_reports_permission() {
        assert_eq!(DeniedLocation.current_position().await, Err(LocationError::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_fills_trail() {
        let trail = BreadcrumbTrail::new();
        let gps: Arc<dyn LocationProvider> = Arc::new(SimulatedLocation::new(28.6, 77.2, 1.0).unwrap());
        let task = watch_position(gps, trail.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(trail.len(), 3);
        task.abort();
    }
}
