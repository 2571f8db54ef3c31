//! RideSafe device pipeline.
//!
//! Crash detection, the emergency countdown, and dual-transport alert
//! propagation (signed mesh flooding plus the internet backend). Each
//! component is an owned struct built once at startup and shared by `Arc`.

pub mod capability;
pub mod config;
pub mod controller;
pub mod crypto;
pub mod dedup;
pub mod detector;
pub mod envelope;
pub mod error;
pub mod heartbeat;
pub mod internet;
pub mod location;
pub mod mesh;
pub mod push_channel;
pub mod radio;
pub mod router;
pub mod scenarios;
pub mod sensor;
pub mod transport;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
