//! Optional platform capabilities (motion sensor, short-range radio).
//!
//! A capability is probed once at startup and carried as a tagged value.
//! Dependent code branches on the variant instead of assuming presence.

use crate::error::CapabilityError;

#[derive(Debug, Clone)]
pub enum Capability<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Capability<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Capability::Unavailable { reason: reason.into() }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }

    pub fn as_ref(&self) -> Capability<&T> {
        match self {
            Capability::Available(handle) => Capability::Available(handle),
            Capability::Unavailable { reason } => Capability::Unavailable { reason: reason.clone() },
        }
    }

    /// Unwraps the handle, or reports which capability was missing.
    pub fn require(self, capability: &'static str) -> Result<T, CapabilityError> {
        match self {
            Capability::Available(handle) => Ok(handle),
            Capability::Unavailable { reason } => Err(CapabilityError { capability, reason }),
        }
    }
}
