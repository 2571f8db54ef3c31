//! config.rs — Device configuration file
//!
//! TOML with one section per component. Every field has a default, and the
//! crate ships `config.toml` as the fallback when no file is found.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::controller::ControllerConfig;
use crate::detector::DetectorConfig;
use crate::error::ConfigError;
use crate::mesh::MeshConfig;
use crate::radio::{UdpRadioConfig, DEFAULT_SERVICE_ID};
use crate::router::RouterMode;

pub const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub detector: DetectorConfig,
    pub emergency: EmergencySection,
    pub mesh: MeshSection,
    pub internet: InternetSection,
    pub router: RouterSection,
    pub simulation: SimulationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSection {
    pub id: String,
    pub name: Option<String>,
    pub key_path: PathBuf,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self { id: "rider-1".to_string(), name: None, key_path: PathBuf::from("data/device-key.json") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencySection {
    pub countdown_secs: u32,
    pub reentry_lock_ms: i64,
    pub fresh_location_timeout_ms: u64,
    pub audible_warning: bool,
}

impl Default for EmergencySection {
    fn default() -> Self {
        Self { countdown_secs: 10, reentry_lock_ms: 5_000, fresh_location_timeout_ms: 5_000, audible_warning: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSection {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
    pub multicast_group: Option<SocketAddr>,
    pub service_id: String,
    pub max_hops: i64,
    pub staleness_ms: i64,
    pub dedup_ttl_ms: i64,
    pub dedup_path: Option<PathBuf>,
}

impl Default for MeshSection {
    fn default() -> Self {
        let mesh = MeshConfig::default();
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 47800)),
            peers: Vec::new(),
            multicast_group: None,
            service_id: DEFAULT_SERVICE_ID.to_string(),
            max_hops: mesh.max_hops,
            staleness_ms: mesh.staleness_ms,
            dedup_ttl_ms: mesh.dedup_ttl_ms,
            dedup_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternetSection {
    pub enabled: bool,
    pub base_url: String,
    pub heartbeat_interval_secs: u64,
    pub request_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub register_timeout_ms: u64,
}

impl Default for InternetSection {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://127.0.0.1:3001".to_string(),
            heartbeat_interval_secs: 15,
            request_timeout_ms: 5_000,
            reconnect_delay_ms: 3_000,
            register_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub mode: RouterMode,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self { mode: RouterMode::Auto }
    }
}

/// Simulated sensor and GPS used by `ridesafe-sim`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub scenario: String,
    pub impact_at_ms: u64,
    pub noise_sigma_g: f64,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub walk_sigma_m: f64,
    pub gps_interval_ms: u64,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            scenario: "none".to_string(),
            impact_at_ms: 20_000,
            noise_sigma_g: 0.05,
            start_latitude: 28.6139,
            start_longitude: 77.2090,
            walk_sigma_m: 3.0,
            gps_interval_ms: 1_000,
        }
    }
}

impl DeviceConfig {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to the bundled defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(_) => {
                info!("No config at {}, using bundled defaults", path.display());
                Self::parse(DEFAULT_CONFIG)
            }
        }
    }

    /// Same rules as the runtime setters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector.validate()?;
        if self.emergency.countdown_secs == 0 {
            return Err(ConfigError::ZeroDuration { field: "countdown_secs" });
        }
        if self.emergency.reentry_lock_ms < 0 {
            return Err(ConfigError::NotPositive { field: "reentry_lock_ms", value: self.emergency.reentry_lock_ms as f64 });
        }
        if self.mesh.max_hops < 0 {
            return Err(ConfigError::NotPositive { field: "max_hops", value: self.mesh.max_hops as f64 });
        }
        if self.mesh.staleness_ms <= 0 {
            return Err(ConfigError::ZeroDuration { field: "staleness_ms" });
        }
        if self.mesh.dedup_ttl_ms <= 0 {
            return Err(ConfigError::ZeroDuration { field: "dedup_ttl_ms" });
        }
        if self.internet.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration { field: "heartbeat_interval_secs" });
        }
        if self.device.id.trim().is_empty() {
            return Err(ConfigError::Parse("device.id must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            device_id: self.device.id.clone(),
            victim_name: self.device.name.clone(),
            countdown_secs: self.emergency.countdown_secs,
            reentry_lock_ms: self.emergency.reentry_lock_ms,
            fresh_location_timeout: Duration::from_millis(self.emergency.fresh_location_timeout_ms),
            audible_warning: self.emergency.audible_warning,
        }
    }

    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig {
            max_hops: self.mesh.max_hops,
            staleness_ms: self.mesh.staleness_ms,
            dedup_ttl_ms: self.mesh.dedup_ttl_ms,
            dedup_path: self.mesh.dedup_path.clone(),
        }
    }

    pub fn radio_config(&self) -> UdpRadioConfig {
        UdpRadioConfig {
            bind_addr: self.mesh.bind_addr,
            peers: self.mesh.peers.clone(),
            multicast_group: self.mesh.multicast_group,
            service_id: self.mesh.service_id.clone(),
        }
    }
}
