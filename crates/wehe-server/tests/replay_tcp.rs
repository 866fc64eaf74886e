use std::{sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use wehe_server::{
    geo::NoReverseGeocoder, metrics::Metrics, replay_tcp, resources::Thresholds,
    trace::TraceCache, AppState, ServerConfig, SessionRegistry,
};

fn test_state(tmp: &TempDir) -> AppState {
    let mut cfg = ServerConfig::default();
    cfg.tests_dir = tmp.path().join("replays");
    cfg.tmp_results_dir = tmp.path().join("tmp_results");

    AppState {
        traces: Arc::new(TraceCache::new(cfg.tests_dir.clone(), 8)),
        cfg: Arc::new(cfg),
        registry: Arc::new(SessionRegistry::new()),
        catalog: Arc::new(vec!["Stream_01012024".to_string()]),
        geocoder: Arc::new(NoReverseGeocoder),
        metrics: Metrics::new(),
        thresholds: Thresholds::default(),
        uuid_prefix: Arc::from("test"),
    }
}

fn write_tcp_trace(tmp: &TempDir, name: &str, sets_json: &str) {
    let dir = tmp.path().join("replays").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let body = format!(
        r#"{{"test_name": "{name}", "is_tcp": true, "response_sets": {sets_json}}}"#
    );
    std::fs::write(dir.join(format!("{name}.pcap_server_all.json")), body).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_probe_returns_the_source_ip_and_closes() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let server = replay_tcp::start_tcp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /WHATSMYIPMAN HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let mut reply = String::new();
    timeout(Duration::from_secs(2), client.read_to_string(&mut reply))
        .await
        .expect("probe reply within deadline")
        .unwrap();
    assert_eq!(reply, "HTTP/1.1 200 OK\r\n\r\n127.0.0.1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bare_probe_works_too() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let server = replay_tcp::start_tcp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(b"WHATSMYIPMAN").await.unwrap();

    let mut reply = String::new();
    timeout(Duration::from_secs(2), client.read_to_string(&mut reply))
        .await
        .expect("probe reply within deadline")
        .unwrap();
    assert_eq!(reply, "HTTP/1.1 200 OK\r\n\r\n127.0.0.1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_client_gets_no_replay() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let server = replay_tcp::start_tcp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(b"some request bytes").await.unwrap();

    let mut reply = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
        .await
        .expect("connection closes")
        .unwrap();
    assert!(reply.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_sets_are_gated_and_surplus_carries_over() {
    let tmp = TempDir::new().unwrap();
    // First gate wants 10 request bytes, second wants 4. Payloads: "AAAA"
    // then "BB".
    write_tcp_trace(
        &tmp,
        "Stream_01012024",
        r#"[
            {"request_length": 10, "request_hash": "h0", "packets": [
                {"timestamp": 0.0, "payload": "41414141"}
            ]},
            {"request_length": 4, "request_hash": "h1", "packets": [
                {"timestamp": 0.0, "payload": "4242"}
            ]}
        ]"#,
    );
    let state = test_state(&tmp);
    state
        .registry
        .add("127.0.0.1".parse().unwrap(), "Stream_01012024".to_string());

    let server = replay_tcp::start_tcp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    // 14 bytes at once: 10 satisfy the first gate, the 4 surplus bytes
    // must satisfy the second without another write.
    client.write_all(&[0x55u8; 14]).await.unwrap();

    let mut got = [0u8; 6];
    timeout(Duration::from_secs(2), client.read_exact(&mut got))
        .await
        .expect("both response sets within deadline")
        .unwrap();
    assert_eq!(&got, b"AAAABB");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gate_waits_for_enough_request_bytes() {
    let tmp = TempDir::new().unwrap();
    write_tcp_trace(
        &tmp,
        "Stream_01012024",
        r#"[
            {"request_length": 8, "request_hash": "h0", "packets": [
                {"timestamp": 0.0, "payload": "4f4b"}
            ]}
        ]"#,
    );
    let state = test_state(&tmp);
    state
        .registry
        .add("127.0.0.1".parse().unwrap(), "Stream_01012024".to_string());

    let server = replay_tcp::start_tcp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&[0x55u8; 4]).await.unwrap();

    // Half the request sent: the gate must hold.
    let mut got = [0u8; 2];
    let early = timeout(Duration::from_millis(300), client.read_exact(&mut got)).await;
    assert!(early.is_err(), "response must wait for the full request");

    client.write_all(&[0x55u8; 4]).await.unwrap();
    timeout(Duration::from_secs(2), client.read_exact(&mut got))
        .await
        .expect("response after gate satisfied")
        .unwrap();
    assert_eq!(&got, b"OK");
}
