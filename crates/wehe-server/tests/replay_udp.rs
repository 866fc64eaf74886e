use std::{sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio::{net::UdpSocket, time::timeout};
use wehe_server::{
    geo::NoReverseGeocoder, metrics::Metrics, replay_udp, resources::Thresholds,
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
        catalog: Arc::new(vec!["Probe_01012024".to_string()]),
        geocoder: Arc::new(NoReverseGeocoder),
        metrics: Metrics::new(),
        thresholds: Thresholds::default(),
        uuid_prefix: Arc::from("test"),
    }
}

fn write_udp_trace(tmp: &TempDir, name: &str, packets_json: &str) {
    let dir = tmp.path().join("replays").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let body = format!(
        r#"{{"test_name": "{name}", "is_tcp": false, "packets": {packets_json}}}"#
    );
    std::fs::write(dir.join(format!("{name}.pcap_server_all.json")), body).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn whatsmyipman_probe_returns_source_ip_without_registration() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let server = replay_udp::start_udp_replay(state.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"WHATSMYIPMAN", server.local_addr())
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("probe reply within deadline")
        .unwrap();
    assert_eq!(&buf[..len], b"127.0.0.1");

    // The probe must not create a registry entry.
    assert!(!state.registry.has("127.0.0.1".parse().unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagrams_from_unregistered_ips_are_dropped_silently() {
    let tmp = TempDir::new().unwrap();
    let state = test_state(&tmp);
    let server = replay_udp::start_udp_replay(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"hello", server.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    let reply = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "unregistered datagram must get no reply");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_client_receives_the_trace_in_order() {
    let tmp = TempDir::new().unwrap();
    write_udp_trace(
        &tmp,
        "Probe_01012024",
        r#"[
            {"c_s_pair": "a-b", "timestamp": 0.0, "payload": "aa01", "end": false},
            {"c_s_pair": "a-b", "timestamp": 0.05, "payload": "bb02", "end": true}
        ]"#,
    );
    let state = test_state(&tmp);
    state
        .registry
        .add("127.0.0.1".parse().unwrap(), "Probe_01012024".to_string());

    let server = replay_udp::start_udp_replay(state.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"start", server.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("first packet")
        .unwrap();
    assert_eq!(&buf[..len], &[0xaa, 0x01]);

    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("second packet")
        .unwrap();
    assert_eq!(&buf[..len], &[0xbb, 0x02]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removing_the_registry_entry_stops_the_send_loop() {
    let tmp = TempDir::new().unwrap();
    write_udp_trace(
        &tmp,
        "Probe_01012024",
        r#"[
            {"c_s_pair": "a-b", "timestamp": 0.0, "payload": "aa01", "end": false},
            {"c_s_pair": "a-b", "timestamp": 2.0, "payload": "bb02", "end": true}
        ]"#,
    );
    let state = test_state(&tmp);
    let client_ip = "127.0.0.1".parse().unwrap();
    state.registry.add(client_ip, "Probe_01012024".to_string());

    let server = replay_udp::start_udp_replay(state.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"start", server.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("first packet")
        .unwrap();
    assert_eq!(&buf[..len], &[0xaa, 0x01]);

    // Simulates the side-channel disconnect cleanup mid-replay.
    state.registry.del(client_ip);

    let second = timeout(Duration::from_millis(2500), client.recv_from(&mut buf)).await;
    assert!(second.is_err(), "send loop must stop once the IP is evicted");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_trace_ends_immediately() {
    let tmp = TempDir::new().unwrap();
    write_udp_trace(&tmp, "Probe_01012024", "[]");
    let state = test_state(&tmp);
    let client_ip = "127.0.0.1".parse().unwrap();
    state.registry.add(client_ip, "Probe_01012024".to_string());

    let server = replay_udp::start_udp_replay(state.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"start", server.local_addr()).await.unwrap();

    let mut buf = [0u8; 64];
    let reply = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(reply.is_err(), "zero-packet replay must send nothing");
}
