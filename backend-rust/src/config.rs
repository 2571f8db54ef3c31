//! config.rs — Backend settings from the environment
//!
//! Every variable is optional. Absent or unparsable values fall back to the
//! defaults below, with a warning for the unparsable case.

use std::path::PathBuf;

use ridesafe_types::{DEFAULT_DISPATCH_RADIUS_M, DEFAULT_PRESENCE_FRESHNESS_MS};
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_AUDIT_LOG_PATH: &str = "data/alert-audit.jsonl";

#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub port: u16,
    /// `None` selects the in-memory datastore
    pub database_url: Option<String>,
    pub dispatch_radius_m: f64,
    pub presence_freshness_ms: i64,
    /// `None` keeps the audit chain in the log output only
    pub audit_log_path: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            dispatch_radius_m: DEFAULT_DISPATCH_RADIUS_M,
            presence_freshness_ms: DEFAULT_PRESENCE_FRESHNESS_MS,
            audit_log_path: Some(PathBuf::from(DEFAULT_AUDIT_LOG_PATH)),
        }
    }
}

impl BackendConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = parse_or(value("PORT"), "PORT", defaults.port);
        let dispatch_radius_m = parse_or(value("DISPATCH_RADIUS_M"), "DISPATCH_RADIUS_M", defaults.dispatch_radius_m);
        let freshness_secs: i64 = parse_or(
            value("PRESENCE_FRESHNESS_SECS"),
            "PRESENCE_FRESHNESS_SECS",
            defaults.presence_freshness_ms / 1000,
        );

        let dispatch_radius_m = if dispatch_radius_m > 0.0 && dispatch_radius_m.is_finite() {
            dispatch_radius_m
        } else {
            warn!("DISPATCH_RADIUS_M must be positive, using {}", defaults.dispatch_radius_m);
            defaults.dispatch_radius_m
        };
        let presence_freshness_ms = if freshness_secs > 0 {
            freshness_secs * 1000
        } else {
            warn!("PRESENCE_FRESHNESS_SECS must be positive, using {}", defaults.presence_freshness_ms / 1000);
            defaults.presence_freshness_ms
        };

        Self {
            port,
            database_url: value("DATABASE_URL"),
            dispatch_radius_m,
            presence_freshness_ms,
            audit_log_path: value("AUDIT_LOG_PATH").map(PathBuf::from).or(defaults.audit_log_path),
        }
    }
}

fn parse_or<T: std::str::FromStr + Copy + std::fmt::Display>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using {default}");
            default
        }),
    }
}
