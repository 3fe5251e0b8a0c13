// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use bus_recorder::bus::MemoryBus;
use bus_recorder::config::RecorderSettings;
use bus_recorder::control::ControlInterface;
use bus_recorder::guard::EnginePhase;
use bus_recorder::playback::Player;
use bus_recorder::recorder::Recorder;
use bus_recorder::storage::{MemoryStore, RecordingStore};
use common::{create_session, message_at};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    bus: MemoryBus,
    recorder: Arc<Recorder>,
    player: Arc<Player>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let bus = MemoryBus::new();
    let recorder = Arc::new(Recorder::new(
        store.clone(),
        Arc::new(bus.clone()),
        RecorderSettings::default(),
    ));
    let player = Arc::new(Player::new(store.clone(), Arc::new(bus.clone())));
    let control = ControlInterface::new(
        store.clone(),
        recorder.clone(),
        player.clone(),
        "replay/".to_string(),
    );
    Harness {
        app: control.router(),
        store,
        bus,
        recorder,
        player,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_create_and_fetch_session() {
    let h = harness();

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"node": "edge-7", "topic_filters": ["plant/#"]})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "CREATED");
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = call(&h.app, Method::GET, &format!("/v1/sessions/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["node"], "edge-7");
    assert_eq!(body["topic_filters"], json!(["plant/#"]));

    let (status, body) = call(&h.app, Method::GET, "/v1/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_session_requests_are_rejected() {
    let h = harness();

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"node": "edge-7", "topic_filters": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("topic_filters"));

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"node": "edge-7", "topic_filters": ["ok", ""]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/v1/sessions",
        Some(json!({"node": "edge-7"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = call(
        &h.app,
        Method::GET,
        &format!("/v1/sessions/{}", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_record_lifecycle_over_http() {
    let h = harness();
    let session = create_session(h.store.as_ref(), &["plant/#"]).await;
    let other = create_session(h.store.as_ref(), &["other/#"]).await;

    let start = format!("/v1/sessions/{}/record/start", session.id);
    let (status, body) = call(&h.app, Method::POST, &start, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = call(&h.app, Method::POST, &start, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already running"));

    let (status, body) = call(&h.app, Method::GET, "/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorder"]["phase"], "running");
    assert_eq!(body["recorder"]["session_id"], session.id.to_string());
    assert_eq!(body["player"]["phase"], "idle");

    h.bus.inject("plant/a", &b"{\"v\":1}"[..], 0, false);
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.recorder.messages_received() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/record/stop", other.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/record/stop", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["rows_persisted"], 1);

    let (_, body) = call(
        &h.app,
        Method::GET,
        &format!("/v1/sessions/{}", session.id),
        None,
    )
    .await;
    assert_eq!(body["state"], "STOPPED");

    // Stopping an idle recorder is a no-op
    let (status, body) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/record/stop", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("report").is_none());
}

#[tokio::test]
async fn test_start_recording_unknown_session() {
    let h = harness();
    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/record/start", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_message_retrieval_pages_and_filters() {
    let h = harness();
    let session = create_session(h.store.as_ref(), &["#"]).await;
    let batch = vec![
        message_at(session.id, "plant/b", 20, b"2"),
        message_at(session.id, "plant/a", 10, b"1"),
        message_at(session.id, "office/x", 15, b"{\"k\":true}"),
        message_at(session.id, "plant/c", 30, b"3"),
    ];
    h.store.insert_messages(&batch).await.unwrap();

    let base = format!("/v1/sessions/{}/messages", session.id);

    let (status, body) = call(&h.app, Method::GET, &base, None).await;
    assert_eq!(status, StatusCode::OK);
    let topics: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["topic"].as_str().unwrap())
        .collect();
    assert_eq!(topics, vec!["plant/a", "office/x", "plant/b", "plant/c"]);
    assert_eq!(body[1]["payload"], json!({"k": true}));
    assert_eq!(body[0]["ts"], "2025-03-01T12:00:00.010000Z");

    let (_, body) = call(
        &h.app,
        Method::GET,
        &format!("{}?topic_prefix=plant/&limit=2&offset=1", base),
        None,
    )
    .await;
    let topics: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["topic"].as_str().unwrap())
        .collect();
    assert_eq!(topics, vec!["plant/b", "plant/c"]);

    let (status, _) = call(&h.app, Method::GET, &format!("{}?limit=0", base), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&h.app, Method::GET, &format!("{}?limit=5001", base), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &h.app,
        Method::GET,
        &format!("/v1/sessions/{}/messages", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_playback_over_http_uses_default_prefix() {
    let h = harness();
    let session = create_session(h.store.as_ref(), &["#"]).await;
    h.store
        .insert_messages(&[message_at(session.id, "plant/a", 0, b"{}")])
        .await
        .unwrap();

    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/play/start?speed=4", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let mut player_status = h.player.watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        player_status.wait_for(|s| s.phase == EnginePhase::Idle),
    )
    .await
    .unwrap()
    .unwrap();

    let (status, body) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/play/stop", session.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["messages_total"], 1);
    assert_eq!(body["report"]["cancelled"], false);

    let published = h.bus.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "replay/plant/a");

    let (status, _) = call(
        &h.app,
        Method::POST,
        &format!("/v1/sessions/{}/play/start", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
