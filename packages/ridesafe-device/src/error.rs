//! Error types for the device pipeline.
//!
//! Nothing here is fatal to the process. Configuration errors are returned
//! from setters, capability errors from `start`/fetch calls, and transport
//! errors are logged by whoever attempted the best-effort work.

use thiserror::Error;

use crate::controller::EmergencyState;
use crate::transport::TransportKind;

/// Rejected configuration. Values are never clamped silently.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("stillness threshold {stillness_g}g must be below spike threshold {spike_g}g")]
    ThresholdOrder { spike_g: f64, stillness_g: f64 },

    #[error("{field} must be a positive finite number, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid config file: {0}")]
    Parse(String),
}

/// A platform capability (sensor, radio, location) is missing.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{capability} unavailable: {reason}")]
pub struct CapabilityError {
    pub capability: &'static str,
    pub reason: String,
}

/// Why an inbound mesh envelope was refused.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("malformed envelope JSON: {0}")]
    Malformed(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("field {field} has the wrong type")]
    InvalidField { field: &'static str },

    #[error("unknown envelope type: {0}")]
    UnknownType(String),

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(i64),

    #[error("envelope is stale ({age_ms}ms old)")]
    Stale { age_ms: i64 },

    #[error("envelope created {skew_ms}ms in the future")]
    FromFuture { skew_ms: i64 },

    #[error("negative hop counter (hop={hop}, maxHops={max_hops})")]
    NegativeHop { hop: i64, max_hops: i64 },

    #[error("hop {hop} exceeds maxHops {max_hops}")]
    HopLimitExceeded { hop: i64, max_hops: i64 },

    #[error("signature verification failed")]
    BadSignature,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport available")]
    NoTransportAvailable,

    #[error("{0} transport unavailable")]
    Unavailable(TransportKind),

    /// The backend refused the request (409/404/400) with a stable code.
    #[error("rejected by backend: {code} ({message})")]
    Rejected { code: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("radio error: {0}")]
    Radio(String),

    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("no backend alert id known for {0}")]
    UnknownBackendAlert(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location unavailable: {0}")]
    Unavailable(String),

    #[error("location fetch timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push channel connect failed: {0}")]
    Connect(String),

    #[error("push channel protocol error: {0}")]
    Protocol(String),

    #[error("push channel closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key store JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("key store is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("not allowed while {0:?}")]
    InvalidState(EmergencyState),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
