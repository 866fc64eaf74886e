use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;
use wehe_analysis::AnalysisResults;

use crate::geo::ReverseGeocoder;

/// Which of the two replays of a test an attempt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplayType {
    Original = 0,
    Random = 1,
}

impl ReplayType {
    pub fn from_code(code: &str) -> Result<Self, SessionError> {
        match code {
            "0" => Ok(ReplayType::Original),
            "1" => Ok(ReplayType::Random),
            other => Err(SessionError::Protocol(format!(
                "unexpected replay type {other:?}; must be 0 (original) or 1 (random)"
            ))),
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Failure bucketing for result files and logs: a stable tag plus an
/// optional human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    pub tag: ExceptionTag,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionTag {
    NoExp,
    UnknownReplayName,
    NoPermission,
    Overloaded,
    ProtocolError,
}

impl Exception {
    pub fn none() -> Self {
        Self {
            tag: ExceptionTag::NoExp,
            detail: None,
        }
    }

    pub fn unknown_replay_name() -> Self {
        Self {
            tag: ExceptionTag::UnknownReplayName,
            detail: None,
        }
    }

    pub fn no_permission() -> Self {
        Self {
            tag: ExceptionTag::NoPermission,
            detail: None,
        }
    }

    pub fn overloaded(metric: &str, value: f64, active_replays: usize) -> Self {
        Self {
            tag: ExceptionTag::Overloaded,
            detail: Some(format!(
                "server overloaded: {metric} at {value:.1} with {active_replays} active replays"
            )),
        }
    }

    pub fn protocol_error(detail: impl Into<String>) -> Self {
        Self {
            tag: ExceptionTag::ProtocolError,
            detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.tag {
            ExceptionTag::NoExp => "NoExp",
            ExceptionTag::UnknownReplayName => "UnknownReplayName",
            ExceptionTag::NoPermission => "NoPermission",
            ExceptionTag::Overloaded => "Overloaded",
            ExceptionTag::ProtocolError => "ProtocolError",
        };
        match &self.detail {
            Some(detail) => write!(f, "{tag}: {detail}"),
            None => f.write_str(tag),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("analysis requires exactly one original and one random replay")]
    ReplayTypesInvalid,
    #[error(transparent)]
    Analysis(#[from] wehe_analysis::AnalysisError),
}

/// Data collected from one replay of a test.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayAttempt {
    pub replay_type: ReplayType,
    pub replay_name: String,
    pub throughputs: Vec<f64>,
    pub sample_times: Vec<f64>,
    pub duration: Duration,
}

/// Per-test aggregate. One session lives from the first successful ID
/// declaration until the last replay disconnects (or, on the legacy path,
/// until the result is polled).
#[derive(Debug)]
pub struct ClientSession {
    pub user_id: String,
    /// Free-form extra data; current clients report the number of
    /// connection attempts made before reaching the platform.
    pub extra_string: String,
    pub test_id: i64,
    pub is_last_replay: bool,
    pub public_ip: IpAddr,
    pub client_version: String,
    pub mobile_stats: Option<Value>,
    pub start_time: DateTime<Utc>,
    pub exception: Exception,
    pub mlab_uuid: String,
    pub replays: Vec<ReplayAttempt>,
    pub analysis: Option<AnalysisResults>,
    /// True while this session owns its IP's registry slot. Lets the same
    /// session re-ask permission for its next replay without tripping the
    /// one-replay-per-IP rule.
    pub holds_ip_slot: bool,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: String,
        extra_string: String,
        test_id: i64,
        public_ip: IpAddr,
        client_version: String,
        mlab_uuid: String,
    ) -> Self {
        Self {
            user_id,
            extra_string,
            test_id,
            is_last_replay: false,
            public_ip,
            client_version,
            mobile_stats: None,
            start_time: Utc::now(),
            exception: Exception::none(),
            mlab_uuid,
            replays: Vec::new(),
            analysis: None,
            holds_ip_slot: false,
        }
    }

    pub fn add_replay(&mut self, replay_type: ReplayType, replay_name: String, is_last: bool) {
        self.replays.push(ReplayAttempt {
            replay_type,
            replay_name,
            throughputs: Vec::new(),
            sample_times: Vec::new(),
            duration: Duration::ZERO,
        });
        self.is_last_replay = is_last;
    }

    pub fn current_replay(&self) -> Option<&ReplayAttempt> {
        self.replays.last()
    }

    pub fn current_replay_mut(&mut self) -> Option<&mut ReplayAttempt> {
        self.replays.last_mut()
    }

    /// Parse a `<duration_s>;[[throughputs],[sample_times]]` message into
    /// the current replay attempt. Returns the raw array portion, which is
    /// written to the throughput file verbatim.
    pub fn receive_throughputs(&mut self, message: &str) -> Result<String, SessionError> {
        let (duration_raw, arrays_raw) = message.split_once(';').ok_or_else(|| {
            SessionError::Protocol(format!("improperly formatted throughput data: {message:?}"))
        })?;

        let duration_s: f64 = duration_raw.trim().parse().map_err(|_| {
            SessionError::Protocol(format!("replay duration is not a float: {duration_raw:?}"))
        })?;
        if !duration_s.is_finite() || duration_s < 0.0 {
            return Err(SessionError::Protocol(format!(
                "replay duration out of range: {duration_raw:?}"
            )));
        }

        let arrays: Vec<Vec<f64>> = serde_json::from_str(arrays_raw).map_err(|err| {
            SessionError::Protocol(format!("throughput arrays are not valid JSON: {err}"))
        })?;
        let [throughputs, sample_times]: [Vec<f64>; 2] =
            arrays.try_into().map_err(|got: Vec<Vec<f64>>| {
                SessionError::Protocol(format!(
                    "expected [[throughputs],[sample_times]], got {} arrays",
                    got.len()
                ))
            })?;

        let replay = self.current_replay_mut().ok_or_else(|| {
            SessionError::Protocol("throughputs received before any replay was declared".into())
        })?;
        replay.duration = Duration::from_secs_f64(duration_s);
        replay.throughputs = throughputs;
        replay.sample_times = sample_times;

        Ok(arrays_raw.to_string())
    }

    /// Store mobile stats; when usable coordinates are present, annotate
    /// `locationInfo` with the reverse-geocoded city, country, and the
    /// session start time rendered in the resolved time zone.
    pub fn receive_mobile_stats(
        &mut self,
        message: &str,
        geocoder: &dyn ReverseGeocoder,
    ) -> anyhow::Result<()> {
        let mut stats: Value =
            serde_json::from_str(message).context("mobile stats is not valid JSON")?;
        if !stats.is_object() {
            bail!("mobile stats is not a JSON object");
        }

        if let Some(coords) = usable_coordinates(&stats)? {
            let (lat, lon) = coords;
            // Coordinates are rounded to one decimal (~11 km) before lookup
            // and storage; finer precision identifies households.
            let lat = (lat * 10.0).round() / 10.0;
            let lon = (lon * 10.0).round() / 10.0;

            if let Some(location) = geocoder.locate(lat, lon)? {
                let tz: chrono_tz::Tz = location
                    .time_zone
                    .parse()
                    .map_err(|_| anyhow!("unknown time zone {:?}", location.time_zone))?;
                let local_time = self
                    .start_time
                    .with_timezone(&tz)
                    .format("%Y-%m-%d %H:%M:%S%z")
                    .to_string();

                let info = stats
                    .get_mut("locationInfo")
                    .and_then(Value::as_object_mut)
                    .ok_or_else(|| anyhow!("locationInfo disappeared during annotation"))?;
                info.insert("country".into(), Value::String(location.country));
                info.insert("city".into(), Value::String(location.city));
                info.insert("localTime".into(), Value::String(local_time));
                info.insert("latitude".into(), json!(lat));
                info.insert("longitude".into(), json!(lon));
            }
        }

        self.mobile_stats = Some(stats);
        Ok(())
    }

    /// Run the two-sample KS analysis over the original and random replays'
    /// throughputs. Order of the replays within the test does not matter,
    /// but there must be exactly one of each type.
    pub fn analyze(&mut self) -> Result<&AnalysisResults, SessionError> {
        if self.replays.len() < 2 {
            return Err(SessionError::ReplayTypesInvalid);
        }

        let original = self
            .replays
            .iter()
            .filter(|r| r.replay_type == ReplayType::Original)
            .collect::<Vec<_>>();
        let random = self
            .replays
            .iter()
            .filter(|r| r.replay_type == ReplayType::Random)
            .collect::<Vec<_>>();
        let (&original, &random) = match (original.as_slice(), random.as_slice()) {
            ([original], [random]) => (original, random),
            _ => return Err(SessionError::ReplayTypesInvalid),
        };

        let results = wehe_analysis::analyze(&original.throughputs, &random.throughputs)?;
        Ok(self.analysis.insert(results))
    }

    pub fn throughputs_file(&self, tmp_results_dir: &Path, contents: &str) -> Option<ResultFile> {
        let replay = self.current_replay()?;
        Some(ResultFile {
            path: tmp_results_dir
                .join(&self.user_id)
                .join("clientXputs")
                .join(format!(
                    "Xput_{}_{}_{}.json",
                    self.user_id,
                    self.test_id,
                    replay.replay_type.code()
                )),
            contents: contents.to_string(),
        })
    }

    /// The 18-element replay-info array. The shape matches what the
    /// pre-rewrite server emitted, so several fields are fixed ballast.
    pub fn replay_info_file(&self, tmp_results_dir: &Path) -> anyhow::Result<ResultFile> {
        let replay = self
            .current_replay()
            .ok_or_else(|| anyhow!("no replay to write info for"))?;

        let anon_ip = anonymize_ip(self.public_ip).to_string();
        let mobile_stats = match &self.mobile_stats {
            Some(stats) => serde_json::to_string(stats).context("serialize mobile stats")?,
            None => "null".to_string(),
        };
        let elapsed_s = (Utc::now() - self.start_time).num_milliseconds() as f64 / 1000.0;

        let items = json!([
            self.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            self.user_id,
            anon_ip,
            anon_ip,
            replay.replay_name,
            self.extra_string,
            self.test_id.to_string(),
            replay.replay_type.code().to_string(),
            self.exception.to_string(),
            true,  // replay packets finished sending
            true,  // result;no + jitter handshake (deprecated)
            null,  // iperf rate (deprecated)
            elapsed_s,
            format!("{:.9}", replay.duration.as_secs_f64()),
            mobile_stats,
            false,
            self.client_version,
            self.mlab_uuid,
        ]);

        Ok(ResultFile {
            path: tmp_results_dir
                .join(&self.user_id)
                .join("replayInfo")
                .join(format!(
                    "replayInfo_{}_{}_{}.json",
                    self.user_id,
                    self.test_id,
                    replay.replay_type.code()
                )),
            contents: serde_json::to_string(&items).context("serialize replay info")?,
        })
    }
}

/// A result file ready to be written under the temporary results root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub path: PathBuf,
    pub contents: String,
}

impl ResultFile {
    pub async fn write(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, &self.contents).await
    }
}

/// Extract coordinates from `locationInfo` when they are present and
/// usable. `"nil"` and the exact `"0.0"` placeholder both mean the client
/// declined to share a location.
fn usable_coordinates(stats: &Value) -> anyhow::Result<Option<(f64, f64)>> {
    let Some(info) = stats.get("locationInfo").and_then(Value::as_object) else {
        return Ok(None);
    };
    let (Some(lat), Some(lon)) = (info.get("latitude"), info.get("longitude")) else {
        return Ok(None);
    };

    let lat = coordinate(lat).context("locationInfo.latitude")?;
    let lon = coordinate(lon).context("locationInfo.longitude")?;
    Ok(lat.zip(lon))
}

fn coordinate(value: &Value) -> anyhow::Result<Option<f64>> {
    match value {
        Value::String(raw) if raw == "nil" || raw == "0.0" => Ok(None),
        Value::String(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| anyhow!("not a float: {raw:?}")),
        Value::Number(num) => {
            let v = num.as_f64().ok_or_else(|| anyhow!("not a float: {num}"))?;
            Ok((v != 0.0).then_some(v))
        }
        other => Err(anyhow!("unexpected coordinate value: {other}")),
    }
}

/// Strip the host portion of an address before it is written to disk:
/// IPv4 keeps its /24, IPv6 keeps its /48. Applying it twice is a no-op.
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            IpAddr::V4(Ipv4Addr::new(a, b, c, 0))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            for octet in octets.iter_mut().skip(6) {
                *octet = 0;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

/// Case-insensitive `true`/`false`, the only boolean spelling clients send.
pub fn parse_bool(raw: &str) -> Result<bool, SessionError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(SessionError::Protocol(format!(
            "cannot parse {other:?} into a bool"
        ))),
    }
}
