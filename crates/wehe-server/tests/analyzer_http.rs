use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::body::Body;
use http_body_util::BodyExt;
use hyper::Request;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;
use wehe_server::{
    analyzer_http,
    client::{ClientSession, ReplayType},
    geo::NoReverseGeocoder,
    metrics::Metrics,
    resources::Thresholds,
    trace::TraceCache,
    AppState, ServerConfig, SessionRegistry,
};

fn test_state(tmp: &TempDir) -> AppState {
    let mut cfg = ServerConfig::default();
    cfg.tests_dir = tmp.path().join("replays");
    cfg.tmp_results_dir = tmp.path().join("tmp_results");

    AppState {
        traces: Arc::new(TraceCache::new(cfg.tests_dir.clone(), 8)),
        cfg: Arc::new(cfg),
        registry: Arc::new(SessionRegistry::new()),
        catalog: Arc::new(Vec::new()),
        geocoder: Arc::new(NoReverseGeocoder),
        metrics: Metrics::new(),
        thresholds: Thresholds::default(),
        uuid_prefix: Arc::from("test"),
    }
}

async fn get_json(app: axum::Router, uri: &str) -> Value {
    let response = app
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn analyzed_session() -> ClientSession {
    let mut session = ClientSession::new(
        "U987654321".into(),
        "x".into(),
        11,
        "203.0.113.30".parse().unwrap(),
        "3.8".into(),
        "test_0000000000000004".into(),
    );
    session.add_replay(ReplayType::Original, "Webex_04282020".into(), false);
    session
        .receive_throughputs("9.0;[[20.0,20.5,19.5,20.1],[0.1,0.2,0.3,0.4]]")
        .unwrap();
    session.add_replay(ReplayType::Random, "WebexRandom_04282020".into(), true);
    session
        .receive_throughputs("9.0;[[5.0,5.5,4.5,5.1],[0.1,0.2,0.3,0.4]]")
        .unwrap();
    session.analyze().unwrap();
    session
}

#[tokio::test]
async fn missing_parameters_are_reported_in_order() {
    let tmp = TempDir::new().unwrap();
    let app = analyzer_http::router(test_state(&tmp));

    let body = get_json(app.clone(), "/Results").await;
    assert_eq!(body["error"], "command not provided");

    let body = get_json(app.clone(), "/Results?command=singleResult").await;
    assert_eq!(body["error"], "userID not provided");

    let body = get_json(app.clone(), "/Results?command=singleResult&userID=U1").await;
    assert_eq!(body["error"], "historyCount not provided");

    let body = get_json(
        app,
        "/Results?command=singleResult&userID=U1&historyCount=3",
    )
    .await;
    assert_eq!(body["error"], "testID not provided");
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let app = analyzer_http::router(test_state(&tmp));
    let body = get_json(app, "/Results?command=allResults&userID=U1&historyCount=3&testID=0").await;
    assert_eq!(body, serde_json::json!({"success": false, "error": "unknown command"}));
}

#[tokio::test]
async fn absent_session_reports_no_result() {
    let tmp = TempDir::new().unwrap();
    let app = analyzer_http::router(test_state(&tmp));
    let body = get_json(
        app,
        "/Results?command=singleResult&userID=U1&historyCount=3&testID=0",
    )
    .await;
    assert_eq!(body, serde_json::json!({"success": false, "error": "No result found"}));
}

#[tokio::test]
async fn result_lookup_matches_the_replay_by_type_code() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    state
        .registry
        .insert_unanalyzed(Arc::new(Mutex::new(analyzed_session())));

    let app = analyzer_http::router(state.clone());

    // testID=1 names the random replay of the test.
    let body = get_json(
        app.clone(),
        "/Results?command=singleResult&userID=U987654321&historyCount=11&testID=1",
    )
    .await;
    assert_eq!(body["success"], Value::Bool(true));
    let result = &body["response"];
    assert_eq!(result["replayName"], "WebexRandom_04282020");
    assert_eq!(result["extraString"], "x");

    // area_test is the normalized throughput gap, negative here because
    // the random replay was slower.
    let area: f64 = result["area_test"].as_str().unwrap().parse().unwrap();
    assert!(area < 0.0);

    // Consumed on success.
    assert!(state.registry.get_unanalyzed("U987654321", 11).is_none());
}

#[tokio::test]
async fn unanalyzed_session_reports_no_result() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);

    let mut session = analyzed_session();
    session.analysis = None;
    state.registry.insert_unanalyzed(Arc::new(Mutex::new(session)));

    let app = analyzer_http::router(state.clone());
    let body = get_json(
        app,
        "/Results?command=singleResult&userID=U987654321&historyCount=11&testID=1",
    )
    .await;
    assert_eq!(body, serde_json::json!({"success": false, "error": "No result found"}));

    // Not consumed: the session may still be analyzed later.
    assert!(state.registry.get_unanalyzed("U987654321", 11).is_some());
}

#[tokio::test]
async fn metrics_endpoint_exposes_the_registry_counters() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    state.metrics.session_opened();
    state.metrics.admission_denied("2");

    let app = analyzer_http::router(state);
    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("wehe_sessions_opened_total 1"), "{text}");
    assert!(text.contains("wehe_admission_denied_total{reason=\"2\"} 1"), "{text}");
}

// Session fixtures above exercise ClientSession::analyze end to end, so
// keep one timing-sensitive property pinned here as well.
#[tokio::test]
async fn analysis_duration_is_recorded_per_replay() {
    let session = analyzed_session();
    for replay in &session.replays {
        assert_eq!(replay.duration, Duration::from_secs(9));
    }
}
