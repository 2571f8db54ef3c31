//! validation.rs — Field-level request validation
//!
//! Bodies are checked as raw JSON before they are deserialized, so every
//! problem in a request is reported at once with a stable code per field.
//! Paths use dotted keys with array indices, e.g. `location.breadcrumbTrail[3].latitude`.

use ridesafe_types::{
    AcceptRequest, AlertStatus, CreateAlertRequest, HeartbeatRequest, StatusUpdateRequest, MAX_BREADCRUMBS,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ApiError;

pub const MAX_ID_LEN: usize = 128;
pub const MAX_NAME_LEN: usize = 100;
/// Client timestamps older than this are rejected.
pub const MAX_PAST_MS: i64 = 24 * 60 * 60 * 1000;
/// Client timestamps further ahead than this are rejected.
pub const MAX_FUTURE_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    RequiredField,
    InvalidType,
    InvalidEnum,
    OutOfRange,
    ArrayTooLong,
    TimeOutOfRange,
    UnknownField,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub code: IssueCode,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, code: IssueCode, message: impl Into<String>) -> Self {
        Self { field: field.into(), code, message: message.into() }
    }
}

pub fn parse_json(bytes: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(bytes).map_err(|e| ApiError::MalformedJson(e.to_string()))
}

// ── Bodies ────────────────────────────────────────────────────────────────────

pub fn create_alert(body: &Value, now_ms: i64) -> Result<CreateAlertRequest, ApiError> {
    let mut c = Checker::new(now_ms);
    if let Some(obj) = c.object("", body, &["deviceId", "victimName", "status", "triggeredAt", "location"]) {
        if let Some(v) = c.required(obj, "", "deviceId") {
            c.string("deviceId", v, MAX_ID_LEN);
        }
        if let Some(v) = c.optional(obj, "victimName") {
            c.string("victimName", v, MAX_NAME_LEN);
        }
        if let Some(v) = c.required(obj, "", "status") {
            c.one_of("status", v, &[AlertStatus::Triggered]);
        }
        if let Some(v) = c.required(obj, "", "triggeredAt") {
            c.recent_timestamp("triggeredAt", v);
        }
        if let Some(v) = c.optional(obj, "location") {
            c.location("location", v);
        }
    }
    c.finish(body)
}

pub fn status_update(body: &Value) -> Result<StatusUpdateRequest, ApiError> {
    let mut c = Checker::new(0);
    if let Some(obj) = c.object("", body, &["status"]) {
        if let Some(v) = c.required(obj, "", "status") {
            c.one_of("status", v, &AlertStatus::MANUAL_TARGETS);
        }
    }
    c.finish(body)
}

pub fn accept(body: &Value) -> Result<AcceptRequest, ApiError> {
    let mut c = Checker::new(0);
    if let Some(obj) = c.object("", body, &["responderDeviceId", "responderName"]) {
        if let Some(v) = c.required(obj, "", "responderDeviceId") {
            c.string("responderDeviceId", v, MAX_ID_LEN);
        }
        if let Some(v) = c.optional(obj, "responderName") {
            c.string("responderName", v, MAX_NAME_LEN);
        }
    }
    c.finish(body)
}

pub fn heartbeat(body: &Value, now_ms: i64) -> Result<HeartbeatRequest, ApiError> {
    let mut c = Checker::new(now_ms);
    if let Some(obj) = c.object("", body, &["deviceId", "location"]) {
        if let Some(v) = c.required(obj, "", "deviceId") {
            c.string("deviceId", v, MAX_ID_LEN);
        }
        if let Some(v) = c.required(obj, "", "location") {
            if let Some(loc) = c.object("location", v, &["latitude", "longitude", "timestamp"]) {
                c.coordinates("location", loc);
                if let Some(ts) = c.required(loc, "location", "timestamp") {
                    c.recent_timestamp("location.timestamp", ts);
                }
            }
        }
    }
    c.finish(body)
}

// ── Checker ───────────────────────────────────────────────────────────────────

struct Checker {
    issues: Vec<FieldIssue>,
    now_ms: i64,
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Checker {
    fn new(now_ms: i64) -> Self {
        Self { issues: Vec::new(), now_ms }
    }

    fn push(&mut self, field: impl Into<String>, code: IssueCode, message: impl Into<String>) {
        self.issues.push(FieldIssue::new(field, code, message));
    }

    /// Requires an object and flags keys outside `allowed`.
    fn object<'a>(&mut self, path: &str, v: &'a Value, allowed: &[&str]) -> Option<&'a Map<String, Value>> {
        let Some(obj) = v.as_object() else {
            let field = if path.is_empty() { "body" } else { path };
            self.push(field, IssueCode::InvalidType, format!("expected object, got {}", type_name(v)));
            return None;
        };
        for key in obj.keys() {
            if !allowed.contains(&key.as_str()) {
                self.push(join(path, key), IssueCode::UnknownField, format!("unknown field {key:?}"));
            }
        }
        Some(obj)
    }

    /// Missing and `null` both count as absent.
    fn required<'a>(&mut self, obj: &'a Map<String, Value>, prefix: &str, key: &str) -> Option<&'a Value> {
        match obj.get(key) {
            Some(v) if !v.is_null() => Some(v),
            _ => {
                let field = join(prefix, key);
                self.push(field.clone(), IssueCode::RequiredField, format!("{field} is required"));
                None
            }
        }
    }

    fn optional<'a>(&mut self, obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
        obj.get(key).filter(|v| !v.is_null())
    }

    fn string(&mut self, path: &str, v: &Value, max_len: usize) {
        match v.as_str() {
            None => self.push(path, IssueCode::InvalidType, format!("expected string, got {}", type_name(v))),
            Some(s) if s.trim().is_empty() => self.push(path, IssueCode::RequiredField, format!("{path} must not be empty")),
            Some(s) if s.chars().count() > max_len => {
                self.push(path, IssueCode::OutOfRange, format!("{path} exceeds {max_len} characters"))
            }
            Some(_) => {}
        }
    }

    fn one_of(&mut self, path: &str, v: &Value, allowed: &[AlertStatus]) {
        let Some(s) = v.as_str() else {
            self.push(path, IssueCode::InvalidType, format!("expected string, got {}", type_name(v)));
            return;
        };
        if !allowed.iter().any(|status| status.as_str() == s) {
            let names: Vec<&str> = allowed.iter().map(|status| status.as_str()).collect();
            self.push(path, IssueCode::InvalidEnum, format!("{s:?} is not one of {}", names.join(", ")));
        }
    }

    fn number_in(&mut self, path: &str, v: &Value, min: f64, max: f64) {
        match v.as_f64() {
            None => self.push(path, IssueCode::InvalidType, format!("expected number, got {}", type_name(v))),
            Some(n) if !(min..=max).contains(&n) => {
                self.push(path, IssueCode::OutOfRange, format!("{n} is outside [{min}, {max}]"))
            }
            Some(_) => {}
        }
    }

    fn integer(&mut self, path: &str, v: &Value) -> Option<i64> {
        let n = v.as_i64();
        if n.is_none() {
            self.push(path, IssueCode::InvalidType, format!("expected integer milliseconds, got {}", type_name(v)));
        }
        n
    }

    /// Epoch milliseconds within `[now - MAX_PAST_MS, now + MAX_FUTURE_MS]`.
    fn recent_timestamp(&mut self, path: &str, v: &Value) {
        if let Some(ts) = self.integer(path, v) {
            if ts < self.now_ms - MAX_PAST_MS || ts > self.now_ms + MAX_FUTURE_MS {
                self.push(path, IssueCode::TimeOutOfRange, format!("{ts} is too far from server time {}", self.now_ms));
            }
        }
    }

    fn coordinates(&mut self, prefix: &str, obj: &Map<String, Value>) {
        if let Some(v) = self.required(obj, prefix, "latitude") {
            self.number_in(&join(prefix, "latitude"), v, -90.0, 90.0);
        }
        if let Some(v) = self.required(obj, prefix, "longitude") {
            self.number_in(&join(prefix, "longitude"), v, -180.0, 180.0);
        }
    }

    fn location(&mut self, path: &str, v: &Value) {
        let Some(obj) = self.object(path, v, &["latitude", "longitude", "timestampMs", "breadcrumbTrail"]) else {
            return;
        };
        self.coordinates(path, obj);
        if let Some(ts) = self.required(obj, path, "timestampMs") {
            self.integer(&join(path, "timestampMs"), ts);
        }
        let Some(trail) = self.optional(obj, "breadcrumbTrail") else {
            return;
        };
        let trail_path = join(path, "breadcrumbTrail");
        let Some(points) = trail.as_array() else {
            self.push(trail_path, IssueCode::InvalidType, format!("expected array, got {}", type_name(trail)));
            return;
        };
        if points.len() > MAX_BREADCRUMBS {
            self.push(
                trail_path.clone(),
                IssueCode::ArrayTooLong,
                format!("{} points, at most {MAX_BREADCRUMBS} allowed", points.len()),
            );
        }
        for (i, point) in points.iter().enumerate() {
            let point_path = format!("{trail_path}[{i}]");
            if let Some(p) = self.object(&point_path, point, &["latitude", "longitude", "timestampMs"]) {
                self.coordinates(&point_path, p);
                if let Some(ts) = self.required(p, &point_path, "timestampMs") {
                    self.integer(&join(&point_path, "timestampMs"), ts);
                }
            }
        }
    }

    fn finish<T: DeserializeOwned>(self, body: &Value) -> Result<T, ApiError> {
        if !self.issues.is_empty() {
            return Err(ApiError::Validation(self.issues));
        }
        serde_json::from_value(body.clone())
            .map_err(|e| ApiError::Validation(vec![FieldIssue::new("body", IssueCode::InvalidType, e.to_string())]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_750_000_000_000;

    fn issues(err: ApiError) -> Vec<FieldIssue> {
        match err {
            ApiError::Validation(issues) => issues,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    fn has(issues: &[FieldIssue], field: &str, code: IssueCode) -> bool {
        issues.iter().any(|i| i.field == field && i.code == code)
    }

    #[test]
    fn valid_alert_parses() {
        let body = json!({
            "deviceId": "dev-a",
            "victimName": "Asha",
            "status": "TRIGGERED",
            "triggeredAt": NOW - 1000,
            "location": {
                "latitude": 28.6139, "longitude": 77.2090, "timestampMs": NOW - 1000,
                "breadcrumbTrail": [{ "latitude": 28.6138, "longitude": 77.2089, "timestampMs": NOW - 5000 }]
            }
        });
        let req = create_alert(&body, NOW).unwrap();
        assert_eq!(req.device_id, "dev-a");
        assert_eq!(req.status, AlertStatus::Triggered);
        assert_eq!(req.location.unwrap().breadcrumb_trail.len(), 1);
    }

    #[test]
    fn alert_reports_every_problem() {
        let body = json!({
            "status": "RESOLVED",
            "triggeredAt": "yesterday",
            "extra": 1,
            "location": { "latitude": 91.0, "longitude": "east" }
        });
        let found = issues(create_alert(&body, NOW).unwrap_err());
        assert!(has(&found, "deviceId", IssueCode::RequiredField));
        assert!(has(&found, "status", IssueCode::InvalidEnum));
        assert!(has(&found, "triggeredAt", IssueCode::InvalidType));
        assert!(has(&found, "extra", IssueCode::UnknownField));
        assert!(has(&found, "location.latitude", IssueCode::OutOfRange));
        assert!(has(&found, "location.longitude", IssueCode::InvalidType));
        assert!(has(&found, "location.timestampMs", IssueCode::RequiredField));
    }

    #[test]
    fn trail_longer_than_ten_is_rejected() {
        let point = json!({ "latitude": 1.0, "longitude": 1.0, "timestampMs": NOW });
        let body = json!({
            "deviceId": "dev-a",
            "status": "TRIGGERED",
            "triggeredAt": NOW,
            "location": { "latitude": 1.0, "longitude": 1.0, "timestampMs": NOW, "breadcrumbTrail": vec![point; 11] }
        });
        let found = issues(create_alert(&body, NOW).unwrap_err());
        assert!(has(&found, "location.breadcrumbTrail", IssueCode::ArrayTooLong));
    }

    #[test]
    fn trigger_time_window() {
        let mut body = json!({ "deviceId": "dev-a", "status": "TRIGGERED", "triggeredAt": NOW + MAX_FUTURE_MS + 1 });
        assert!(has(&issues(create_alert(&body, NOW).unwrap_err()), "triggeredAt", IssueCode::TimeOutOfRange));
        body["triggeredAt"] = json!(NOW - MAX_PAST_MS - 1);
        assert!(has(&issues(create_alert(&body, NOW).unwrap_err()), "triggeredAt", IssueCode::TimeOutOfRange));
        body["triggeredAt"] = json!(NOW + MAX_FUTURE_MS);
        assert!(create_alert(&body, NOW).is_ok());
    }

    #[test]
    fn status_update_accepts_only_cancel_and_escalate() {
        assert_eq!(status_update(&json!({ "status": "CANCELLED" })).unwrap().status, AlertStatus::Cancelled);
        assert_eq!(status_update(&json!({ "status": "ESCALATED" })).unwrap().status, AlertStatus::Escalated);
        let found = issues(status_update(&json!({ "status": "RESOLVED" })).unwrap_err());
        assert!(has(&found, "status", IssueCode::InvalidEnum));
        let found = issues(status_update(&json!([])).unwrap_err());
        assert!(has(&found, "body", IssueCode::InvalidType));
    }

    #[test]
    fn accept_requires_responder() {
        assert!(accept(&json!({ "responderDeviceId": "dev-b" })).is_ok());
        let found = issues(accept(&json!({ "responderDeviceId": "  " })).unwrap_err());
        assert!(has(&found, "responderDeviceId", IssueCode::RequiredField));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let found = issues(accept(&json!({ "responderDeviceId": "dev-b", "responderName": long })).unwrap_err());
        assert!(has(&found, "responderName", IssueCode::OutOfRange));
    }

    #[test]
    fn heartbeat_checks_nested_location() {
        let ok = json!({ "deviceId": "dev-b", "location": { "latitude": 28.6, "longitude": 77.2, "timestamp": NOW } });
        assert_eq!(heartbeat(&ok, NOW).unwrap().location.timestamp, NOW);

        let bad = json!({ "deviceId": "dev-b", "location": { "latitude": 28.6, "timestamp": 1.5, "speed": 3 } });
        let found = issues(heartbeat(&bad, NOW).unwrap_err());
        assert!(has(&found, "location.longitude", IssueCode::RequiredField));
        assert!(has(&found, "location.timestamp", IssueCode::InvalidType));
        assert!(has(&found, "location.speed", IssueCode::UnknownField));
    }

    #[test]
    fn malformed_json_is_its_own_error() {
        assert!(matches!(parse_json(b"{not json"), Err(ApiError::MalformedJson(_))));
    }
}
