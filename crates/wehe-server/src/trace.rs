use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

/// A pre-recorded packet trace, immutable once loaded and shared read-only
/// between replay engines.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayTrace {
    pub name: String,
    pub is_tcp: bool,
    pub schedule: Schedule,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// Ordered by capture timestamp; the engine replays the timing.
    Udp(Vec<UdpPacket>),
    /// Ordered response sets; the engine gates each set on received bytes.
    Tcp(Vec<ResponseSet>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdpPacket {
    /// Original capture 4-tuple, `{client_ip}.{port}-{server_ip}.{port}`.
    pub cs_pair: String,
    /// Offset from the first packet of the original capture.
    pub offset: Duration,
    pub payload: Vec<u8>,
    pub end: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpPacket {
    /// Offset from the start of the response set.
    pub offset: Duration,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSet {
    /// Bytes the client must have sent since the start of this set before
    /// the packets go out.
    pub request_len: u64,
    pub request_hash: String,
    pub packets: Vec<TcpPacket>,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("replay {name:?} not found under {dir}")]
    NotFound { name: String, dir: String },
    #[error("replay {name:?} is malformed: {reason}")]
    Malformed { name: String, reason: String },
    #[error("read replay {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RawTrace {
    test_name: String,
    is_tcp: bool,
    #[serde(default)]
    packets: Vec<RawUdpPacket>,
    #[serde(default)]
    response_sets: Vec<RawResponseSet>,
}

#[derive(Debug, Deserialize)]
struct RawUdpPacket {
    c_s_pair: String,
    timestamp: f64,
    payload: String,
    #[serde(default)]
    end: bool,
}

#[derive(Debug, Deserialize)]
struct RawResponseSet {
    request_length: u64,
    #[serde(default)]
    request_hash: String,
    packets: Vec<RawTcpPacket>,
}

#[derive(Debug, Deserialize)]
struct RawTcpPacket {
    timestamp: f64,
    payload: String,
}

/// Trace file path by convention:
/// `<tests_dir>/<name>/<name>.pcap_server_all.json`.
pub fn trace_path(tests_dir: &Path, replay_name: &str) -> PathBuf {
    tests_dir
        .join(replay_name)
        .join(format!("{replay_name}.pcap_server_all.json"))
}

/// Parse a replay trace file from disk.
pub async fn load(tests_dir: &Path, replay_name: &str) -> Result<ReplayTrace, TraceError> {
    let path = trace_path(tests_dir, replay_name);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TraceError::NotFound {
                name: replay_name.to_string(),
                dir: tests_dir.display().to_string(),
            });
        }
        Err(source) => {
            return Err(TraceError::Io {
                name: replay_name.to_string(),
                source,
            });
        }
    };

    parse(replay_name, &data)
}

fn parse(replay_name: &str, data: &[u8]) -> Result<ReplayTrace, TraceError> {
    let malformed = |reason: String| TraceError::Malformed {
        name: replay_name.to_string(),
        reason,
    };

    let raw: RawTrace =
        serde_json::from_slice(data).map_err(|err| malformed(err.to_string()))?;

    let schedule = if raw.is_tcp {
        let mut sets = Vec::with_capacity(raw.response_sets.len());
        for (i, set) in raw.response_sets.into_iter().enumerate() {
            let mut packets = Vec::with_capacity(set.packets.len());
            for (j, packet) in set.packets.into_iter().enumerate() {
                packets.push(TcpPacket {
                    offset: offset_from_seconds(packet.timestamp)
                        .map_err(|reason| malformed(format!("set {i} packet {j}: {reason}")))?,
                    payload: decode_hex(&packet.payload)
                        .map_err(|reason| malformed(format!("set {i} packet {j}: {reason}")))?,
                });
            }
            sets.push(ResponseSet {
                request_len: set.request_length,
                request_hash: set.request_hash,
                packets,
            });
        }
        Schedule::Tcp(sets)
    } else {
        let mut packets = Vec::with_capacity(raw.packets.len());
        for (i, packet) in raw.packets.into_iter().enumerate() {
            packets.push(UdpPacket {
                cs_pair: packet.c_s_pair,
                offset: offset_from_seconds(packet.timestamp)
                    .map_err(|reason| malformed(format!("packet {i}: {reason}")))?,
                payload: decode_hex(&packet.payload)
                    .map_err(|reason| malformed(format!("packet {i}: {reason}")))?,
                end: packet.end,
            });
        }
        Schedule::Udp(packets)
    };

    Ok(ReplayTrace {
        name: raw.test_name,
        is_tcp: raw.is_tcp,
        schedule,
    })
}

/// Capture timestamps are float seconds; keep nanosecond precision.
fn offset_from_seconds(seconds: f64) -> Result<Duration, String> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("invalid timestamp {seconds}"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    let bytes = input.as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(format!("odd-length hex payload ({} chars)", bytes.len()));
    }

    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = hex_nibble(pair[0]).ok_or_else(|| format!("invalid hex byte {:?}", pair[0] as char))?;
        let lo = hex_nibble(pair[1]).ok_or_else(|| format!("invalid hex byte {:?}", pair[1] as char))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Bounded LRU cache of parsed traces keyed by replay name.
///
/// UDP replays used to re-parse the trace for every client; the cache keeps
/// the hot replays resident and evicts the least recently used name once
/// full.
#[derive(Debug)]
pub struct TraceCache {
    tests_dir: PathBuf,
    capacity: usize,
    inner: Mutex<LruState>,
}

#[derive(Debug, Default)]
struct LruState {
    traces: HashMap<String, Arc<ReplayTrace>>,
    order: Vec<String>,
}

impl TraceCache {
    pub fn new(tests_dir: PathBuf, capacity: usize) -> Self {
        Self {
            tests_dir,
            capacity: capacity.max(1),
            inner: Mutex::new(LruState::default()),
        }
    }

    pub async fn get_or_load(&self, replay_name: &str) -> Result<Arc<ReplayTrace>, TraceError> {
        if let Some(trace) = self.touch(replay_name) {
            return Ok(trace);
        }

        // Loads are performed outside the lock; concurrent loads of the same
        // trace are wasteful but harmless (the later insert wins).
        let trace = Arc::new(load(&self.tests_dir, replay_name).await?);
        self.insert(replay_name, trace.clone());
        Ok(trace)
    }

    fn touch(&self, replay_name: &str) -> Option<Arc<ReplayTrace>> {
        let mut state = self.inner.lock().expect("trace cache mutex");
        let trace = state.traces.get(replay_name).cloned()?;
        if let Some(pos) = state.order.iter().position(|name| name == replay_name) {
            let name = state.order.remove(pos);
            state.order.push(name);
        }
        Some(trace)
    }

    fn insert(&self, replay_name: &str, trace: Arc<ReplayTrace>) {
        let mut state = self.inner.lock().expect("trace cache mutex");
        if state.traces.insert(replay_name.to_string(), trace).is_none() {
            state.order.push(replay_name.to_string());
        }
        while state.order.len() > self.capacity {
            let evicted = state.order.remove(0);
            state.traces.remove(&evicted);
        }
    }
}
