// SPDX-License-Identifier: MPL-2.0

//! Control plane tests driven through the router

use std::fs;
use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pitv::accounts::CsvUserDb;
use pitv::config::PipelineConfig;
use pitv::lease::{LeaseManager, LeasePolicy};
use pitv::net::Endpoint;
use pitv::pipeline::Pipeline;
use pitv::pipeline::simulated::SimulatedGraph;
use pitv::server::{self, AppState};
use pitv::stats::StatsSource;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct FixedStats;

impl StatsSource for FixedStats {
    fn cpu_temperature(&self) -> Option<f64> {
        Some(48.5)
    }

    fn process_cpu_load(&self) -> Option<f64> {
        Some(3.0)
    }

    fn total_cpu_load(&self) -> Option<f64> {
        None
    }
}

struct Harness {
    router: Router,
    graph: SimulatedGraph,
    recordings: TempDir,
    _accounts: TempDir,
}

fn harness() -> Harness {
    let recordings = tempfile::tempdir().unwrap();
    let accounts = tempfile::tempdir().unwrap();
    let user_db = accounts.path().join("usernames.txt");
    fs::write(
        &user_db,
        "username,password,role\nalice,secret,viewer\nbob,hunter2,admin\n",
    )
    .unwrap();

    let graph = SimulatedGraph::new();
    let config = PipelineConfig {
        recording_path: recordings.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let mut pipeline = Pipeline::new(config, Box::new(graph.clone()));
    pipeline.construct().unwrap();
    pipeline.start().unwrap();

    let state = AppState {
        leases: LeaseManager::new(pipeline.into_shared(), LeasePolicy::default()).into_shared(),
        credentials: Arc::new(CsvUserDb::new(&user_db)),
        stats: Arc::new(FixedStats),
    };
    let router = server::router(state, "/camera", recordings.path());

    Harness {
        router,
        graph,
        recordings,
        _accounts: accounts,
    }
}

fn basic(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

fn lease_body(guid: &str, port: i64, lease_time: i64) -> String {
    lease_body_to("127.0.0.1", guid, port, lease_time)
}

fn lease_body_to(host: &str, guid: &str, port: i64, lease_time: i64) -> String {
    json!({
        "lease_guid": guid,
        "udp_address": host,
        "udp_port": port,
        "lease_time": lease_time,
    })
    .to_string()
}

fn post(auth: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/camera");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn missing_or_wrong_credentials_are_unauthorized() {
    let h = harness();

    let (status, _) = send(&h.router, post(None, lease_body("", 5004, 1000))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.router,
        post(Some(&basic("alice", "wrong")), lease_body("", 5004, 1000)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &h.router,
        post(Some(&basic("mallory", "secret")), lease_body("", 5004, 1000)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(h.graph.destinations().is_empty());
}

#[tokio::test]
async fn authentication_is_checked_before_the_method() {
    let h = harness();

    let anonymous = Request::builder()
        .method("GET")
        .uri("/camera")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&h.router, anonymous).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authenticated = Request::builder()
        .method("GET")
        .uri("/camera")
        .header(header::AUTHORIZATION, basic("alice", "secret"))
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(authenticated).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers().get(header::ALLOW).unwrap(), "POST");
}

#[tokio::test]
async fn malformed_bodies_are_rejected() {
    let h = harness();
    let auth = basic("alice", "secret");

    let (status, body) = send(&h.router, post(Some(&auth), "{not json".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());

    let missing_port = json!({ "lease_guid": "", "udp_address": "127.0.0.1", "lease_time": 1000 });
    let (status, _) = send(&h.router, post(Some(&auth), missing_port.to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&h.router, post(Some(&auth), lease_body("", 70000, 1000))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(h.graph.destinations().is_empty());
}

#[tokio::test]
async fn lease_lifecycle_drives_the_egress_destinations() {
    let h = harness();
    let auth = basic("alice", "secret");

    let (status, first) = send(&h.router, post(Some(&auth), lease_body("", 5004, 5000))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "granted");
    let first_guid = first["guid"].as_str().unwrap().to_string();
    assert_eq!(first_guid.len(), 64);
    assert!(first_guid.chars().all(|c| c.is_ascii_alphanumeric()));

    let (status, second) = send(&h.router, post(Some(&auth), lease_body("", 5006, 5000))).await;
    assert_eq!(status, StatusCode::OK);
    let second_guid = second["guid"].as_str().unwrap().to_string();
    assert_ne!(first_guid, second_guid);
    assert_eq!(
        h.graph.destinations(),
        vec![
            Endpoint::new("127.0.0.1", 5004),
            Endpoint::new("127.0.0.1", 5006)
        ]
    );

    let (status, body) = send(&h.router, post(Some(&auth), lease_body("", 5008, 5000))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "lease_limit_reached");

    let (status, renewed) = send(
        &h.router,
        post(Some(&auth), lease_body(&first_guid, 5004, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renewed["status"], "renewed");
    assert_eq!(renewed["guid"], first_guid.as_str());

    let (status, released) = send(
        &h.router,
        post(Some(&auth), lease_body(&first_guid, 5004, 0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["status"], "released");
    assert_eq!(
        h.graph.destinations(),
        vec![Endpoint::new("127.0.0.1", 5006)]
    );

    // another user has their own allowance
    let (status, _) = send(
        &h.router,
        post(Some(&basic("bob", "hunter2")), lease_body("", 6000, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn identical_requests_share_one_destination() {
    let h = harness();
    let auth = basic("alice", "secret");
    let viewer = Endpoint::new("10.0.0.5", 6000);

    let (status, first) = send(
        &h.router,
        post(Some(&auth), lease_body_to("10.0.0.5", "", 6000, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = send(
        &h.router,
        post(Some(&auth), lease_body_to("10.0.0.5", "", 6000, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["guid"], second["guid"]);
    assert_eq!(h.graph.destinations(), vec![viewer.clone(), viewer.clone()]);

    let (status, body) = send(
        &h.router,
        post(Some(&auth), lease_body_to("10.0.0.5", "", 6000, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "lease_limit_reached");
    assert_eq!(h.graph.destinations().len(), 2);

    // Ending one lease keeps the other viewer receiving
    let first_guid = first["guid"].as_str().unwrap();
    let (status, released) = send(
        &h.router,
        post(Some(&auth), lease_body_to("10.0.0.5", first_guid, 6000, 0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["status"], "released");
    assert_eq!(h.graph.destinations(), vec![viewer]);
}

#[tokio::test]
async fn unknown_guids_end_quietly_but_cannot_renew() {
    let h = harness();
    let auth = basic("alice", "secret");
    let unknown = "x".repeat(64);

    let (status, body) = send(&h.router, post(Some(&auth), lease_body(&unknown, 5004, 0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_found");
    assert_eq!(body["guid"], unknown.as_str());

    let (status, body) = send(
        &h.router,
        post(Some(&auth), lease_body(&unknown, 5004, 5000)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_lease");
    assert!(h.graph.destinations().is_empty());
}

#[tokio::test]
async fn ending_a_lease_needs_no_destination() {
    let h = harness();
    let auth = basic("alice", "secret");
    let (_, granted) = send(&h.router, post(Some(&auth), lease_body("", 5004, 5000))).await;
    let guid = granted["guid"].as_str().unwrap();

    let (status, body) = send(
        &h.router,
        post(Some(&auth), lease_body_to("", guid, 0, 0)),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "released");
    assert!(h.graph.destinations().is_empty());
}

#[tokio::test]
async fn status_reports_availability_per_metric() {
    let h = harness();
    let request = Request::builder()
        .uri("/status")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["temp_cpu_ok"], true);
    assert_eq!(body["temp_cpu"], 48.5);
    assert_eq!(body["cpu_load_process_ok"], true);
    assert_eq!(body["cpu_load_total_ok"], false);
    assert_eq!(body["cpu_load_total"], 0.0);
}

#[tokio::test]
async fn index_and_recordings_are_served() {
    let h = harness();

    let request = Request::builder()
        .uri("/index.html")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "result": "Hello World!" }));

    fs::write(h.recordings.path().join("clip.mp4"), b"ftyp").unwrap();
    let request = Request::builder()
        .uri("/clip.mp4")
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ftyp");

    let request = Request::builder()
        .uri("/missing.mp4")
        .body(Body::empty())
        .unwrap();
    let response = h.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
