//! envelope.rs — Signed mesh envelope wire format
//!
//! ```json
//! {
//!   "version": 1,
//!   "messageId": "…uuid…",
//!   "originDeviceId": "rider-7",
//!   "originPublicKey": "…hex…",
//!   "type": "SOS_TRIGGERED",
//!   "createdAt": 1718000000000,
//!   "hop": 0,
//!   "maxHops": 4,
//!   "payload": { … },
//!   "signature": "…hex…"
//! }
//! ```
//!
//! The signature covers the canonical JSON of every field except
//! `signature` and `hop`. Relays bump `hop` without holding the origin's
//! key, so the hop counter is bounded by `maxHops` rather than signed.

use bytes::Bytes;
use ridesafe_types::{AssignedNotice, CancelledNotice, NearbyAlert};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::crypto::{self, canonical_json, DeviceIdentity};
use crate::error::EnvelopeError;

pub const ENVELOPE_VERSION: i64 = 1;
pub const DEFAULT_MAX_HOPS: i64 = 4;
/// Envelopes older than this are treated as replays.
pub const DEFAULT_STALENESS_MS: i64 = 120_000;
/// Tolerated clock skew for envelopes stamped in the future.
pub const MAX_FUTURE_SKEW_MS: i64 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeType {
    SosTriggered,
    SosCancelled,
    SosAssigned,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::SosTriggered => "SOS_TRIGGERED",
            EnvelopeType::SosCancelled => "SOS_CANCELLED",
            EnvelopeType::SosAssigned => "SOS_ASSIGNED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "SOS_TRIGGERED" => Some(EnvelopeType::SosTriggered),
            "SOS_CANCELLED" => Some(EnvelopeType::SosCancelled),
            "SOS_ASSIGNED" => Some(EnvelopeType::SosAssigned),
            _ => None,
        }
    }
}

/// Typed payload for each envelope kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    Triggered(NearbyAlert),
    Cancelled(CancelledNotice),
    Assigned(AssignedNotice),
}

impl EnvelopePayload {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            EnvelopePayload::Triggered(_) => EnvelopeType::SosTriggered,
            EnvelopePayload::Cancelled(_) => EnvelopeType::SosCancelled,
            EnvelopePayload::Assigned(_) => EnvelopeType::SosAssigned,
        }
    }

    pub fn alert_id(&self) -> &str {
        match self {
            EnvelopePayload::Triggered(a) => &a.alert_id,
            EnvelopePayload::Cancelled(c) => &c.alert_id,
            EnvelopePayload::Assigned(a) => &a.alert_id,
        }
    }

    fn to_value(&self) -> Result<Value, EnvelopeError> {
        let value = match self {
            EnvelopePayload::Triggered(a) => serde_json::to_value(a),
            EnvelopePayload::Cancelled(c) => serde_json::to_value(c),
            EnvelopePayload::Assigned(a) => serde_json::to_value(a),
        };
        value.map_err(|e| EnvelopeError::Encoding(e.to_string()))
    }

    fn decode(kind: EnvelopeType, value: &Value) -> Result<Self, EnvelopeError> {
        let invalid = |e: serde_json::Error| EnvelopeError::InvalidPayload(e.to_string());
        Ok(match kind {
            EnvelopeType::SosTriggered => {
                let mut alert: NearbyAlert = serde_json::from_value(value.clone()).map_err(invalid)?;
                // Distance is receiver-relative and never trusted from the wire
                alert.distance_m = None;
                EnvelopePayload::Triggered(alert)
            }
            EnvelopeType::SosCancelled => EnvelopePayload::Cancelled(serde_json::from_value(value.clone()).map_err(invalid)?),
            EnvelopeType::SosAssigned => EnvelopePayload::Assigned(serde_json::from_value(value.clone()).map_err(invalid)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshEnvelope {
    pub version: i64,
    pub message_id: String,
    pub origin_device_id: String,
    pub origin_public_key: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub created_at: i64,
    pub hop: i64,
    pub max_hops: i64,
    pub payload: Value,
    pub signature: String,
}

/// An envelope that passed every check, with its decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEnvelope {
    pub envelope: MeshEnvelope,
    pub payload: EnvelopePayload,
}

impl MeshEnvelope {
    /// Builds and signs a fresh envelope at hop 0.
    pub fn build(
        identity: &DeviceIdentity,
        origin_device_id: &str,
        payload: &EnvelopePayload,
        max_hops: i64,
        now_ms: i64,
    ) -> Result<Self, EnvelopeError> {
        let mut envelope = MeshEnvelope {
            version: ENVELOPE_VERSION,
            message_id: Uuid::new_v4().to_string(),
            origin_device_id: origin_device_id.to_string(),
            origin_public_key: identity.public_key_hex(),
            kind: payload.kind(),
            created_at: now_ms,
            hop: 0,
            max_hops,
            payload: payload.to_value()?,
            signature: String::new(),
        };
        envelope.signature = identity.sign(&envelope.signing_bytes());
        Ok(envelope)
    }

    /// Canonical bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        canonical_json(&json!({
            "version": self.version,
            "messageId": self.message_id,
            "originDeviceId": self.origin_device_id,
            "originPublicKey": self.origin_public_key,
            "type": self.kind.as_str(),
            "createdAt": self.created_at,
            "maxHops": self.max_hops,
            "payload": self.payload,
        }))
    }

    pub fn verify_signature(&self) -> bool {
        crypto::verify(&self.signing_bytes(), &self.signature, &self.origin_public_key)
    }

    /// Copy for re-broadcast: `hop + 1`, everything else unchanged.
    pub fn relayed(&self) -> Self {
        Self { hop: self.hop + 1, ..self.clone() }
    }

    pub fn to_bytes(&self) -> Result<Bytes, EnvelopeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EnvelopeError::Encoding(e.to_string()))
    }

    /// Parses raw radio bytes and applies every inbound check, cheapest first.
    pub fn parse_and_validate(bytes: &[u8], now_ms: i64, staleness_ms: i64) -> Result<VerifiedEnvelope, EnvelopeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| EnvelopeError::Malformed("envelope is not an object".to_string()))?;

        let version = req_i64(obj, "version")?;
        let message_id = req_str(obj, "messageId")?;
        let origin_device_id = req_str(obj, "originDeviceId")?;
        let origin_public_key = req_str(obj, "originPublicKey")?;
        let kind_str = req_str(obj, "type")?;
        let created_at = req_i64(obj, "createdAt")?;
        let hop = req_i64(obj, "hop")?;
        let max_hops = req_i64(obj, "maxHops")?;
        let signature = req_str(obj, "signature")?;
        let payload = obj.get("payload").ok_or(EnvelopeError::MissingField("payload"))?;
        if !payload.is_object() {
            return Err(EnvelopeError::InvalidField { field: "payload" });
        }

        let kind = EnvelopeType::parse(&kind_str).ok_or(EnvelopeError::UnknownType(kind_str))?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }

        // createdAt is unauthenticated at this point; saturate rather than overflow
        let age_ms = now_ms.saturating_sub(created_at);
        if age_ms > staleness_ms {
            return Err(EnvelopeError::Stale { age_ms });
        }
        let skew_ms = age_ms.saturating_neg();
        if skew_ms > MAX_FUTURE_SKEW_MS {
            return Err(EnvelopeError::FromFuture { skew_ms });
        }

        if hop < 0 || max_hops < 0 {
            return Err(EnvelopeError::NegativeHop { hop, max_hops });
        }
        if hop > max_hops {
            return Err(EnvelopeError::HopLimitExceeded { hop, max_hops });
        }

        let envelope = MeshEnvelope {
            version,
            message_id,
            origin_device_id,
            origin_public_key,
            kind,
            created_at,
            hop,
            max_hops,
            payload: payload.clone(),
            signature,
        };
        if !envelope.verify_signature() {
            return Err(EnvelopeError::BadSignature);
        }

        let payload = EnvelopePayload::decode(kind, &envelope.payload)?;
        Ok(VerifiedEnvelope { envelope, payload })
    }
}

fn req_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, EnvelopeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(EnvelopeError::MissingField(field)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(EnvelopeError::InvalidField { field }),
    }
}

fn req_i64(obj: &Map<String, Value>, field: &'static str) -> Result<i64, EnvelopeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(EnvelopeError::MissingField(field)),
        Some(v) => v.as_i64().ok_or(EnvelopeError::InvalidField { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_718_000_000_000;

    fn triggered() -> EnvelopePayload {
        EnvelopePayload::Triggered(NearbyAlert {
            alert_id: "a-1".to_string(),
            victim_device_id: "victim".to_string(),
            victim_name: Some("Asha".to_string()),
            triggered_at: NOW,
            location: None,
            distance_m: None,
        })
    }

    fn signed(max_hops: i64) -> (DeviceIdentity, MeshEnvelope) {
        let id = DeviceIdentity::in_memory();
        let env = MeshEnvelope::build(&id, "victim", &triggered(), max_hops, NOW).unwrap();
        (id, env)
    }

    fn bytes_of(v: &Value) -> Vec<u8> {
        serde_json::to_vec(v).unwrap()
    }

    #[test]
    fn built_envelope_validates() {
        let (_, env) = signed(3);
        let ok = MeshEnvelope::parse_and_validate(&env.to_bytes().unwrap(), NOW + 1_000, DEFAULT_STALENESS_MS).unwrap();
        assert_eq!(ok.envelope, env);
        assert_eq!(ok.payload, triggered());
        assert_eq!(ok.payload.alert_id(), "a-1");
    }

    #[test]
    fn extreme_created_at_is_rejected_not_panicking() {
        let (_, env) = signed(3);
        let mut v = serde_json::to_value(&env).unwrap();

        v["createdAt"] = json!(i64::MIN);
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::Stale { age_ms: i64::MAX })
        ));

        v["createdAt"] = json!(i64::MAX);
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::FromFuture { .. })
        ));
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), i64::MIN, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::FromFuture { skew_ms: i64::MAX })
        ));
    }

    #[test]
    fn relay_keeps_signature_valid() {
        let (_, env) = signed(3);
        let relayed = env.relayed().relayed();
        assert_eq!(relayed.hop, 2);
        assert_eq!(relayed.message_id, env.message_id);
        assert!(relayed.verify_signature());
    }

    #[test]
    fn any_signed_field_mutation_breaks_signature() {
        let (_, env) = signed(3);
        let mut v = serde_json::to_value(&env).unwrap();
        v["payload"]["alertId"] = json!("a-2");
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::BadSignature)
        );

        let mut v = serde_json::to_value(&env).unwrap();
        v["maxHops"] = json!(9);
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::BadSignature)
        );

        let other = DeviceIdentity::in_memory();
        let mut v = serde_json::to_value(&env).unwrap();
        v["originPublicKey"] = json!(other.public_key_hex());
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::BadSignature)
        );
    }

    #[test]
    fn structural_rejections() {
        assert!(matches!(
            MeshEnvelope::parse_and_validate(b"{not json", NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::Malformed(_))
        ));

        let (_, env) = signed(3);
        let base = serde_json::to_value(&env).unwrap();

        let mut v = base.clone();
        v.as_object_mut().unwrap().remove("messageId");
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::MissingField("messageId"))
        );

        let mut v = base.clone();
        v["hop"] = json!("zero");
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::InvalidField { field: "hop" })
        );

        let mut v = base.clone();
        v["type"] = json!("SOS_PARTY");
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::UnknownType(_))
        ));

        let mut v = base;
        v["hop"] = json!(-1);
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes_of(&v), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::NegativeHop { .. })
        ));
    }

    #[test]
    fn hop_beyond_ceiling_is_rejected() {
        let (_, env) = signed(1);
        let at_ceiling = env.relayed();
        assert!(MeshEnvelope::parse_and_validate(&at_ceiling.to_bytes().unwrap(), NOW, DEFAULT_STALENESS_MS).is_ok());
        let over = at_ceiling.relayed();
        assert_eq!(
            MeshEnvelope::parse_and_validate(&over.to_bytes().unwrap(), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::HopLimitExceeded { hop: 2, max_hops: 1 })
        );
    }

    #[test]
    fn freshness_window() {
        let (_, env) = signed(3);
        let bytes = env.to_bytes().unwrap();
        assert!(MeshEnvelope::parse_and_validate(&bytes, NOW + DEFAULT_STALENESS_MS, DEFAULT_STALENESS_MS).is_ok());
        assert_eq!(
            MeshEnvelope::parse_and_validate(&bytes, NOW + DEFAULT_STALENESS_MS + 1, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::Stale { age_ms: DEFAULT_STALENESS_MS + 1 })
        );
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&bytes, NOW - MAX_FUTURE_SKEW_MS - 1, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::FromFuture { .. })
        ));
    }

    #[test]
    fn signed_but_mistyped_payload_is_rejected() {
        let id = DeviceIdentity::in_memory();
        let mut env = MeshEnvelope::build(&id, "victim", &triggered(), 3, NOW).unwrap();
        env.kind = EnvelopeType::SosAssigned;
        env.signature = id.sign(&env.signing_bytes());
        assert!(matches!(
            MeshEnvelope::parse_and_validate(&env.to_bytes().unwrap(), NOW, DEFAULT_STALENESS_MS),
            Err(EnvelopeError::InvalidPayload(_))
        ));
    }
}
