use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Ports the replay engines must listen on so that every catalogued replay
/// can be served. Loaded from a JSON file because old clients probe test
/// ports (`WHATSMYIPMAN`) before the side channel tells us anything.
#[derive(Debug, Clone, Default)]
pub struct TestPorts {
    pub tcp_ports: Vec<u16>,
    pub udp_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Side-channel TLS listener (current + legacy protocol, demuxed on the
    /// first byte).
    pub sidechannel_addr: SocketAddr,
    /// Legacy analyzer HTTPS listener.
    pub analyzer_addr: SocketAddr,

    /// Directory with one subdirectory per replay name.
    pub tests_dir: PathBuf,
    /// JSON file listing the TCP/UDP replay ports to open.
    pub ports_file: PathBuf,

    /// Root for per-test temporary result files (clientXputs, replayInfo).
    pub tmp_results_dir: PathBuf,
    /// Root for permanent results.
    pub results_dir: PathBuf,

    /// File whose first line seeds the measurement UUID prefix.
    pub uuid_prefix_file: Option<PathBuf>,

    /// Server certificate chain + private key in PEM format, issued by the
    /// external CA tooling.
    pub cert_file: PathBuf,
    pub key_file: PathBuf,

    /// Replays held in memory at most (LRU by replay name).
    pub trace_cache_capacity: usize,

    /// Side-channel connections are dropped after this long without a
    /// complete inbound frame, so a hung client cannot hold its IP slot
    /// forever. Twice the hard UDP replay cap.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sidechannel_addr: SocketAddr::from(([0, 0, 0, 0], 55556)),
            analyzer_addr: SocketAddr::from(([0, 0, 0, 0], 56566)),
            tests_dir: PathBuf::from("res/replays"),
            ports_file: PathBuf::from("res/ports.json"),
            tmp_results_dir: PathBuf::from("tmp_results"),
            results_dir: PathBuf::from("results"),
            uuid_prefix_file: None,
            cert_file: PathBuf::from("res/certs/server.crt"),
            key_file: PathBuf::from("res/certs/server.key"),
            trace_cache_capacity: 32,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let sidechannel_addr = addr_from_env("WEHE_SIDECHANNEL_ADDR")
            .context("parse WEHE_SIDECHANNEL_ADDR")?
            .unwrap_or(defaults.sidechannel_addr);

        let analyzer_addr = addr_from_env("WEHE_ANALYZER_ADDR")
            .context("parse WEHE_ANALYZER_ADDR")?
            .unwrap_or(defaults.analyzer_addr);

        let tests_dir = path_from_env("WEHE_TESTS_DIR").unwrap_or(defaults.tests_dir);
        let ports_file = path_from_env("WEHE_PORTS_FILE").unwrap_or(defaults.ports_file);
        let tmp_results_dir =
            path_from_env("WEHE_TMP_RESULTS_DIR").unwrap_or(defaults.tmp_results_dir);
        let results_dir = path_from_env("WEHE_RESULTS_DIR").unwrap_or(defaults.results_dir);
        let uuid_prefix_file = path_from_env("WEHE_UUID_PREFIX_FILE");

        let cert_file = path_from_env("WEHE_CERT_FILE").unwrap_or(defaults.cert_file);
        let key_file = path_from_env("WEHE_KEY_FILE").unwrap_or(defaults.key_file);

        let trace_cache_capacity = std::env::var("WEHE_TRACE_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(defaults.trace_cache_capacity);

        let idle_timeout = std::env::var("WEHE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);

        Ok(Self {
            sidechannel_addr,
            analyzer_addr,
            tests_dir,
            ports_file,
            tmp_results_dir,
            results_dir,
            uuid_prefix_file,
            cert_file,
            key_file,
            trace_cache_capacity,
            idle_timeout,
        })
    }
}

fn addr_from_env(key: &str) -> Result<Option<SocketAddr>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            let addr = SocketAddr::from_str(raw.trim())
                .with_context(|| format!("invalid {key} value {raw:?}"))?;
            Ok(Some(addr))
        }
        _ => Ok(None),
    }
}

fn path_from_env(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .and_then(|v| (!v.trim().is_empty()).then(|| PathBuf::from(v)))
}

/// Load and validate the ports-to-open file.
pub fn load_test_ports(path: &std::path::Path) -> Result<TestPorts> {
    let data = std::fs::read(path)
        .with_context(|| format!("read ports file {}", path.display()))?;
    let ports: PortsFile = serde_json::from_slice(&data)
        .with_context(|| format!("parse ports file {}", path.display()))?;

    let mut out = TestPorts::default();
    for port in ports.tcp_ports {
        out.tcp_ports.push(validate_port(port, "TCP", path)?);
    }
    for port in ports.udp_ports {
        out.udp_ports.push(validate_port(port, "UDP", path)?);
    }
    Ok(out)
}

// Ports are read as i64 so an out-of-range entry reports its value instead
// of failing as a deserialization type error.
#[derive(Debug, Deserialize)]
struct PortsFile {
    #[serde(default)]
    tcp_ports: Vec<i64>,
    #[serde(default)]
    udp_ports: Vec<i64>,
}

fn validate_port(port: i64, proto: &str, path: &std::path::Path) -> Result<u16> {
    if !(0..=65535).contains(&port) {
        bail!(
            "{proto} port {port} in {} is not a valid port number",
            path.display()
        );
    }
    Ok(port as u16)
}

/// Replay names are the subdirectory names of the tests directory.
pub fn scan_replay_catalog(tests_dir: &std::path::Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(tests_dir)
        .with_context(|| format!("read tests dir {}", tests_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// The private key of the root CA is password protected; certificate
/// issuance happens in external tooling, but the deployment contract is
/// that the passphrase reaches this process through the environment, so
/// fail fast when it is missing.
pub fn require_key_password() -> Result<String> {
    match std::env::var("WEHE_KEY_PASSWORD") {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => bail!("WEHE_KEY_PASSWORD is not set in environment"),
    }
}
