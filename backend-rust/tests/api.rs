use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ridesafe_backend::audit::AuditLogger;
use ridesafe_backend::config::BackendConfig;
use ridesafe_backend::persistence::Datastore;
use ridesafe_backend::push::RecordingNotifier;
use ridesafe_backend::state::AppState;
use ridesafe_backend::{api_router, now_ms};
use ridesafe_types::{push_events, AlertRecord, AlertStatus, NearbyAlert};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    store: Datastore,
    notifier: Arc<RecordingNotifier>,
}

fn app() -> TestApp {
    let store = Datastore::memory();
    let notifier = Arc::new(RecordingNotifier::default());
    let state = AppState::new(store.clone(), notifier.clone(), AuditLogger::disabled(), &BackendConfig::default());
    TestApp { router: api_router(state), store, notifier }
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn create_alert(router: &Router, lat: f64, lon: f64) -> AlertRecord {
    let now = now_ms();
    let (status, body) = call(
        router,
        "POST",
        "/api/v1/alerts",
        Some(json!({
            "deviceId": "victim-a",
            "victimName": "Asha",
            "status": "TRIGGERED",
            "triggeredAt": now,
            "location": { "latitude": lat, "longitude": lon, "timestampMs": now, "breadcrumbTrail": [] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    serde_json::from_value(body).unwrap()
}

async fn heartbeat(router: &Router, device_id: &str, lat: f64, lon: f64) {
    let (status, body) = call(
        router,
        "POST",
        "/api/v1/riders/heartbeat",
        Some(json!({ "deviceId": device_id, "location": { "latitude": lat, "longitude": lon, "timestamp": now_ms() } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["deviceId"], device_id);
}

#[tokio::test]
async fn create_returns_201_with_record() {
    let t = app();
    let alert = create_alert(&t.router, 28.6139, 77.2090).await;
    assert_eq!(alert.status, AlertStatus::Triggered);
    assert_eq!(alert.device_id, "victim-a");
    assert!(t.store.get_alert(&alert.id).await.unwrap().is_some());
}

#[tokio::test]
async fn dispatch_radius_edge() {
    let t = app();
    heartbeat(&t.router, "outside", 28.6229, 77.2080).await;
    heartbeat(&t.router, "inside", 28.6228, 77.2090).await;
    let alert = create_alert(&t.router, 28.6139, 77.2090).await;

    assert!(t.notifier.sent_to("outside").is_empty());
    let inside = t.notifier.sent_to("inside");
    assert_eq!(inside.len(), 1);
    assert_eq!(inside[0].event, push_events::NEW_NEARBY);
    let nearby: NearbyAlert = serde_json::from_value(inside[0].payload.clone()).unwrap();
    assert_eq!(nearby.alert_id, alert.id);
    assert!((950.0..1000.0).contains(&nearby.distance_m.unwrap()));
}

#[tokio::test]
async fn concurrent_accepts_have_exactly_one_winner() {
    let t = app();
    let alert = create_alert(&t.router, 28.6139, 77.2090).await;
    let uri = format!("/api/v1/alerts/{}/accept", alert.id);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let router = t.router.clone();
        let uri = uri.clone();
        tasks.push(tokio::spawn(async move {
            call(&router, "POST", &uri, Some(json!({ "responderDeviceId": format!("rider-{i}") }))).await
        }));
    }

    let mut ok = 0;
    let mut conflict = 0;
    for task in tasks {
        let (status, body) = task.await.unwrap();
        match status {
            StatusCode::OK => {
                ok += 1;
                assert_eq!(body["status"], "RESPONDER_ASSIGNED");
            }
            StatusCode::CONFLICT => {
                conflict += 1;
                assert_eq!(body["error"]["code"], "ALERT_ALREADY_ASSIGNED");
            }
            other => panic!("unexpected status {other}: {body}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflict, 15);
}

#[tokio::test]
async fn cancel_on_triggered_then_accept_is_blocked() {
    let t = app();
    let alert = create_alert(&t.router, 28.6139, 77.2090).await;

    let (status, body) =
        call(&t.router, "PATCH", &format!("/api/v1/alerts/{}/status", alert.id), Some(json!({ "status": "CANCELLED" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], alert.id.as_str());
    assert_eq!(body["status"], "CANCELLED");
    assert!(body["updatedAt"].is_i64());

    let (status, body) = call(
        &t.router,
        "POST",
        &format!("/api/v1/alerts/{}/accept", alert.id),
        Some(json!({ "responderDeviceId": "rider-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALERT_NOT_CLAIMABLE");
}

#[tokio::test]
async fn cancel_on_resolved_is_400() {
    let t = app();
    let now = now_ms();
    let Datastore::Memory(mem) = &t.store else { unreachable!() };
    mem.insert_alert(&AlertRecord {
        id: "resolved-1".into(),
        device_id: "victim-a".into(),
        victim_name: None,
        status: AlertStatus::Resolved,
        triggered_at: now,
        location: None,
        responder_device_id: Some("rider-1".into()),
        responder_name: None,
        assigned_at: Some(now),
        created_at: now,
        updated_at: now,
    })
    .await;

    let (status, body) =
        call(&t.router, "PATCH", "/api/v1/alerts/resolved-1/status", Some(json!({ "status": "CANCELLED" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_STATUS_TRANSITION");
    assert_eq!(t.store.get_alert("resolved-1").await.unwrap().unwrap().status, AlertStatus::Resolved);
}

#[tokio::test]
async fn missing_alert_is_404() {
    let t = app();
    let (status, body) =
        call(&t.router, "PATCH", "/api/v1/alerts/nope/status", Some(json!({ "status": "ESCALATED" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "ALERT_NOT_FOUND");

    let (status, body) =
        call(&t.router, "POST", "/api/v1/alerts/nope/accept", Some(json!({ "responderDeviceId": "r" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "ALERT_NOT_FOUND");
}

#[tokio::test]
async fn invalid_bodies_are_400_with_issues() {
    let t = app();
    let (status, body) = call(&t.router, "POST", "/api/v1/alerts", Some(json!({ "status": "PENDING", "foo": 1 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_FAILED");
    let codes: Vec<(String, String)> = body["error"]["issues"]
        .as_array()
        .unwrap()
        .iter()
        .map(|i| (i["field"].as_str().unwrap().to_string(), i["code"].as_str().unwrap().to_string()))
        .collect();
    assert!(codes.contains(&("deviceId".into(), "REQUIRED_FIELD".into())));
    assert!(codes.contains(&("status".into(), "INVALID_ENUM".into())));
    assert!(codes.contains(&("triggeredAt".into(), "REQUIRED_FIELD".into())));
    assert!(codes.contains(&("foo".into(), "UNKNOWN_FIELD".into())));

    let req = Request::builder()
        .method("POST")
        .uri("/api/v1/riders/heartbeat")
        .header("content-type", "application/json")
        .body(Body::from("{oops"))
        .unwrap();
    let resp = t.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sync_and_health() {
    let t = app();
    let before = now_ms();
    let (status, body) = call(&t.router, "GET", "/sync", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["serverTime"].as_i64().unwrap() >= before);

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let resp = t.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}
