use std::{
    net::{IpAddr, SocketAddr},
    sync::{atomic::{AtomicU64, Ordering}, Arc},
};

use anyhow::{bail, Context};
use serde_json::json;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use wehe_sidechannel_protocol as protocol;
use wehe_sidechannel_protocol::{Opcode, ResponseCode};

use crate::{
    client::{parse_bool, ClientSession, Exception, ReplayType, SessionError},
    config::ServerConfig,
    geo::ReverseGeocoder,
    legacy,
    metrics::Metrics,
    registry::{Admission, SessionRegistry, SAMPLES_PER_REPLAY},
    resources::{self, Thresholds},
    trace::TraceCache,
};

/// Shared state handed to every listener task.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    /// Names of the replays this server can serve.
    pub catalog: Arc<Vec<String>>,
    pub traces: Arc<TraceCache>,
    pub geocoder: Arc<dyn ReverseGeocoder>,
    pub metrics: Metrics,
    pub thresholds: Thresholds,
    /// Prefix for measurement UUIDs, from the configured prefix file.
    pub uuid_prefix: Arc<str>,
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub(crate) fn new(
        addr: SocketAddr,
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start the TLS side-channel listener. Each accepted connection runs as
/// one task; the current and legacy wire variants are demuxed on the first
/// byte the client sends.
pub async fn start_sidechannel(
    state: AppState,
    acceptor: TlsAcceptor,
) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(state.cfg.sidechannel_addr).await?;
    let addr = listener.local_addr()?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!("side channel accept failed: {err}");
                            continue;
                        }
                    };

                    // Derived before the TLS wrap hides the TCP socket.
                    let mlab_uuid = measurement_uuid(&state.uuid_prefix, &stream);
                    let acceptor = acceptor.clone();
                    let state = state.clone();
                    tokio::spawn(async move {
                        let tls = match acceptor.accept(stream).await {
                            Ok(tls) => tls,
                            Err(err) => {
                                tracing::debug!(%peer, "TLS handshake failed: {err}");
                                return;
                            }
                        };
                        let span = tracing::info_span!("sidechannel_session", %peer);
                        if let Err(err) =
                            handle_connection(tls, peer, mlab_uuid, state).instrument(span).await
                        {
                            tracing::debug!("session ended: {err:#}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle::new(addr, shutdown_tx, task))
}

/// Globally unique measurement identifier tied to the TCP connection, used
/// to join our records with platform-side ones. On Linux the kernel socket
/// cookie is unique per connection for the lifetime of the host; elsewhere
/// a process-wide counter stands in.
pub fn measurement_uuid(prefix: &str, stream: &TcpStream) -> String {
    static FALLBACK: AtomicU64 = AtomicU64::new(1);

    #[cfg(target_os = "linux")]
    let cookie = socket2::SockRef::from(stream).cookie().ok();
    #[cfg(not(target_os = "linux"))]
    let cookie: Option<u64> = None;

    let cookie = cookie.unwrap_or_else(|| FALLBACK.fetch_add(1, Ordering::Relaxed));
    format!("{prefix}_{cookie:016x}")
}

/// Opcode-driven session states. `Declared` covers the window between a
/// follow-up `declareReplay` and its `ask4permission`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    New,
    Identified,
    Permitted,
    Sampled,
    Declared,
    Analyzed,
}

/// Drive one side-channel connection. Generic over the stream so the state
/// machine can be exercised without TLS.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    mlab_uuid: String,
    state: AppState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    state.metrics.session_opened();
    let _guard = SessionGuard(state.metrics.clone());

    let mut session: Option<ClientSession> = None;
    let result = drive_session(&mut stream, peer, mlab_uuid, &state, &mut session).await;

    // The registry entry is the replay engines' permission to serve this
    // IP; it goes away with the connection no matter how it ended.
    if let Some(session) = &session {
        if session.holds_ip_slot {
            state.registry.del(session.public_ip);
        }
    }

    result
}

async fn drive_session<S>(
    stream: &mut S,
    peer: SocketAddr,
    mlab_uuid: String,
    state: &AppState,
    session_slot: &mut Option<ClientSession>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let idle = state.cfg.idle_timeout;
    let mut machine = SessionState::New;

    loop {
        let mut header = [0u8; protocol::REQUEST_HEADER_LEN];
        match timeout(idle, stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Clean disconnect between frames.
                return Ok(());
            }
            Ok(Err(err)) => return Err(err).context("read request header"),
            Err(_) => bail!("idle timeout waiting for request"),
        }

        if protocol::is_legacy_preamble(header[0]) {
            // Legacy clients never return to this loop; the linear script
            // owns the connection from here.
            return legacy::run(stream, header, peer, mlab_uuid, state).await;
        }

        let parsed = protocol::decode_request_header(header);
        let mut body = vec![0u8; parsed.body_len];
        match timeout(idle, stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err).context("read request body"),
            Err(_) => bail!("idle timeout waiting for request body"),
        }
        let body = String::from_utf8(body).map_err(|_| {
            SessionError::Protocol("request body is not valid UTF-8".into())
        })?;

        let Some(opcode) = Opcode::from_byte(parsed.opcode_byte) else {
            state.metrics.protocol_error();
            send_response(stream, ResponseCode::Error, b"").await?;
            bail!("unknown side channel opcode: {:#04x}", parsed.opcode_byte);
        };
        tracing::debug!(%opcode, "request");

        machine = match (machine, opcode) {
            (SessionState::New, Opcode::ReceiveId) => {
                let declared = parse_declare_id(&body, peer.ip())?;
                let session = declared.into_session(mlab_uuid.clone());
                tracing::info!(
                    user_id = %session.user_id,
                    test_id = session.test_id,
                    public_ip = %session.public_ip,
                    replay = %session.current_replay().map(|r| r.replay_name.as_str()).unwrap_or(""),
                    "test declared"
                );
                *session_slot = Some(session);
                send_response(stream, ResponseCode::Ok, b"").await?;
                SessionState::Identified
            }
            (SessionState::Identified | SessionState::Declared, Opcode::Ask4Permission) => {
                let session = expect_session(session_slot)?;
                let probe = resources::probe(&state.thresholds).await;
                let admission = state.registry.ask_permission(session, &state.catalog, probe);
                let body = match admission {
                    Admission::Allowed { samples_per_replay } => {
                        format!("0;{samples_per_replay}")
                    }
                    Admission::Denied { reason } => {
                        state.metrics.admission_denied(reason.wire_code());
                        format!("1;{}", reason.wire_code())
                    }
                };
                send_response(stream, ResponseCode::Ok, body.as_bytes()).await?;
                SessionState::Permitted
            }
            (SessionState::Permitted, Opcode::MobileStats) => {
                let session = expect_session(session_slot)?;
                match session.receive_mobile_stats(&body, state.geocoder.as_ref()) {
                    Ok(()) => send_response(stream, ResponseCode::Ok, b"").await?,
                    Err(err) => {
                        send_response(stream, ResponseCode::Error, b"").await?;
                        return Err(err.context("receive mobile stats"));
                    }
                }
                SessionState::Permitted
            }
            (SessionState::Permitted, Opcode::Throughputs) => {
                let session = expect_session(session_slot)?;
                let raw_arrays = match session.receive_throughputs(&body) {
                    Ok(raw) => raw,
                    Err(err) => {
                        send_response(stream, ResponseCode::Error, b"").await?;
                        return Err(err.into());
                    }
                };
                write_replay_results(session, state, &raw_arrays).await?;
                send_response(stream, ResponseCode::Ok, b"").await?;
                SessionState::Sampled
            }
            (SessionState::Sampled, Opcode::DeclareReplay) => {
                let session = expect_session(session_slot)?;
                let body = declare_replay(session, &state.catalog, &body)?;
                send_response(stream, ResponseCode::Ok, body.as_bytes()).await?;
                SessionState::Declared
            }
            (SessionState::Sampled, Opcode::AnalyzeTest) => {
                let session = expect_session(session_slot)?;
                let verdict = match session.analyze() {
                    Ok(results) => json!({
                        "Area0Var": results.area0var,
                        "KS2pVal": results.ks2_p,
                        "OriginalAvgThroughput": results.original_stats.average,
                        "RandomAvgThroughput": results.random_stats.average,
                    }),
                    Err(err) => {
                        send_response(stream, ResponseCode::Error, b"").await?;
                        return Err(err.into());
                    }
                };
                state.metrics.analysis_completed();
                let body = serde_json::to_vec(&verdict).context("serialize verdict")?;
                send_response(stream, ResponseCode::Ok, &body).await?;
                SessionState::Analyzed
            }
            (state_now, opcode) => {
                state.metrics.protocol_error();
                send_response(stream, ResponseCode::Error, b"").await?;
                bail!("opcode {opcode} not allowed in state {state_now:?}");
            }
        };
    }
}

fn expect_session<'a>(
    slot: &'a mut Option<ClientSession>,
) -> Result<&'a mut ClientSession, SessionError> {
    slot.as_mut()
        .ok_or_else(|| SessionError::Protocol("no test declared on this connection".into()))
}

/// Handle a follow-up `declareReplay` body: `<type>;<name>;<is_last>`.
/// Returns the status;info response body.
fn declare_replay(
    session: &mut ClientSession,
    catalog: &[String],
    body: &str,
) -> Result<String, SessionError> {
    let pieces: Vec<&str> = body.split(';').collect();
    if pieces.len() < 3 {
        return Err(SessionError::Protocol(format!(
            "expected at least 3 fields in declare replay; got {}",
            pieces.len()
        )));
    }

    let replay_type = ReplayType::from_code(pieces[0])?;
    let replay_name = pieces[1].replace('-', "_");
    let is_last = parse_bool(pieces[2])?;

    session.add_replay(replay_type, replay_name.clone(), is_last);

    if !catalog.iter().any(|name| name == &replay_name) {
        session.exception = Exception::unknown_replay_name();
        return Ok("1;1".to_string());
    }
    Ok(format!("0;{SAMPLES_PER_REPLAY}"))
}

/// Fields of a declare-ID message, shared by both wire variants.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeclaredId {
    pub user_id: String,
    pub replay_type: ReplayType,
    pub replay_name: String,
    pub extra_string: String,
    pub test_id: i64,
    pub is_last_replay: bool,
    pub public_ip: IpAddr,
    pub client_version: String,
}

impl DeclaredId {
    pub(crate) fn into_session(self, mlab_uuid: String) -> ClientSession {
        let mut session = ClientSession::new(
            self.user_id,
            self.extra_string,
            self.test_id,
            self.public_ip,
            self.client_version,
            mlab_uuid,
        );
        session.add_replay(self.replay_type, self.replay_name, self.is_last_replay);
        session
    }
}

/// Parse a declare-ID body:
/// `user_id;replay_type;replay_name;extra;test_id;is_last[;public_ip[;version]]`.
///
/// Carriers may hand a device one IP per port; the client reports the IP it
/// observed on the test port, and that one wins unless it is absent or the
/// loopback placeholder.
pub(crate) fn parse_declare_id(body: &str, peer_ip: IpAddr) -> Result<DeclaredId, SessionError> {
    let pieces: Vec<&str> = body.split(';').collect();
    if pieces.len() < 6 {
        return Err(SessionError::Protocol(format!(
            "expected at least 6 fields in declare ID; got {}",
            pieces.len()
        )));
    }

    let user_id = pieces[0].to_string();
    let replay_type = ReplayType::from_code(pieces[1])?;
    let replay_name = pieces[2].replace('-', "_");
    let extra_string = pieces[3].to_string();
    let test_id: i64 = pieces[4]
        .parse()
        .map_err(|_| SessionError::Protocol(format!("test ID is not an integer: {:?}", pieces[4])))?;
    let is_last_replay = parse_bool(pieces[5])?;

    let mut public_ip = peer_ip;
    if let Some(&supplied) = pieces.get(6) {
        if !supplied.is_empty() && supplied != "127.0.0.1" {
            public_ip = supplied.parse().map_err(|_| {
                SessionError::Protocol(format!("invalid public IP: {supplied:?}"))
            })?;
        }
    }
    let client_version = pieces.get(7).map_or("1.0", |v| *v).to_string();

    Ok(DeclaredId {
        user_id,
        replay_type,
        replay_name,
        extra_string,
        test_id,
        is_last_replay,
        public_ip,
        client_version,
    })
}

/// Write the per-replay throughput file and the replay-info record.
pub(crate) async fn write_replay_results(
    session: &ClientSession,
    state: &AppState,
    raw_arrays: &str,
) -> anyhow::Result<()> {
    if let Some(file) = session.throughputs_file(&state.cfg.tmp_results_dir, raw_arrays) {
        file.write().await.context("write throughput file")?;
    }
    let info = session.replay_info_file(&state.cfg.tmp_results_dir)?;
    info.write().await.context("write replay info file")?;
    Ok(())
}

async fn send_response<S>(
    stream: &mut S,
    code: ResponseCode,
    body: &[u8],
) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let frame = protocol::encode_response(code, body).context("encode response")?;
    stream.write_all(&frame).await.context("write response")?;
    Ok(())
}

struct SessionGuard(Metrics);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.session_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_id_takes_the_supplied_ip_over_the_peer() {
        let peer: IpAddr = "198.51.100.9".parse().unwrap();
        let declared = parse_declare_id(
            "U1234567890;0;Zoom-04282020;retries=1;42;false;203.0.113.7;4.2",
            peer,
        )
        .unwrap();
        assert_eq!(declared.public_ip, "203.0.113.7".parse::<IpAddr>().unwrap());
        assert_eq!(declared.replay_name, "Zoom_04282020");
        assert_eq!(declared.client_version, "4.2");
        assert_eq!(declared.replay_type, ReplayType::Original);
        assert!(!declared.is_last_replay);
    }

    #[test]
    fn declare_id_falls_back_to_peer_for_loopback_or_absent_ip() {
        let peer: IpAddr = "198.51.100.9".parse().unwrap();

        let declared =
            parse_declare_id("U1234567890;1;Zoom_04282020;x;7;true;127.0.0.1;4.2", peer).unwrap();
        assert_eq!(declared.public_ip, peer);

        let declared = parse_declare_id("U1234567890;1;Zoom_04282020;x;7;true", peer).unwrap();
        assert_eq!(declared.public_ip, peer);
        assert_eq!(declared.client_version, "1.0");
        assert!(declared.is_last_replay);
    }

    #[test]
    fn declare_id_rejects_short_and_malformed_bodies() {
        let peer: IpAddr = "198.51.100.9".parse().unwrap();
        assert!(parse_declare_id("U1;0;name", peer).is_err());
        assert!(parse_declare_id("U1;5;name;x;7;true", peer).is_err());
        assert!(parse_declare_id("U1;0;name;x;seven;true", peer).is_err());
        assert!(parse_declare_id("U1;0;name;x;7;maybe", peer).is_err());
    }
}
