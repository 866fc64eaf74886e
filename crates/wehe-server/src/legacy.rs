//! Side-channel sub-protocol for clients older than v4.0.
//!
//! The old wire format is a fixed linear script over 10-digit ASCII length
//! framing. State must survive between the per-replay connections the old
//! client opens, so sessions live in the registry's unanalyzed-tests table
//! until the legacy analyzer endpoint hands out the result.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use wehe_sidechannel_protocol as protocol;
use wehe_sidechannel_protocol::LEGACY_LENGTH_DIGITS;

use crate::{
    client::ClientSession,
    registry::{Admission, DenyReason, SAMPLES_PER_REPLAY},
    resources,
    sidechannel::{parse_declare_id, AppState, DeclaredId},
};

/// Replay host/port mapping advertised to old clients. The old server
/// bundled this table and clients still expect to receive it; the exact
/// literal is compatibility ballast.
const SERVER_MAPPING: &str = "{'tcp': {'': {'00000': ['', 34081]}, '002.021.034.145': {'00443': ['', 443]}, '003.162.003.119': {'00443': ['', 443]}, '008.249.245.246': {'00080': ['', 80]}, '008.252.208.244': {'00443': ['', 443]}, '013.225.025.052': {'00443': ['', 443]}, '017.253.011.202': {'00080': ['', 80]}, '018.002.192.002': {'00443': ['', 443]}, '018.032.197.018': {'00443': ['', 443]}, '018.160.041.126': {'00443': ['', 443]}, '023.015.179.224': {'00443': ['', 443]}, '023.033.029.087': {'00443': ['', 443]}, '023.040.060.072': {'00443': ['', 443]}, '023.040.060.146': {'00443': ['', 443]}, '023.040.060.160': {'00443': ['', 443]}, '023.197.180.251': {'00443': ['', 443]}, '035.241.016.093': {'00443': ['', 443]}, '045.057.062.168': {'00443': ['', 443]}, '052.223.227.060': {'00443': ['', 443]}, '052.223.227.181': {'00443': ['', 443]}, '065.158.047.083': {'00080': ['', 80]}, '074.125.172.072': {'00443': ['', 443]}, '082.216.034.026': {'00443': ['', 443]}, '082.216.034.032': {'00443': ['', 443]}, '093.017.156.102': {'00443': ['', 443]}, '139.104.212.047': {'00443': ['', 443]}, '147.160.181.042': {'00443': ['', 443]}, '151.101.118.248': {'00443': ['', 443]}, '151.101.248.246': {'00080': ['', 80]}, '151.101.250.109': {'00443': ['', 443]}, '157.240.245.063': {'00443': ['', 443]}, '172.217.129.041': {'00443': ['', 443]}, '188.065.126.005': {'00443': ['', 443]}, '192.229.210.163': {'00443': ['', 443]}, '192.229.221.012': {'00443': ['', 443]}, '208.085.042.032': {'00080': ['', 80]}, '208.111.190.109': {'00443': ['', 443]}, '2606:2800:21f:dc2:1fe1:23fc:954:1461': {'00443': ['', 443]}, '2606:4700::6811:164b': {'00081': ['', 81], '01194': ['', 1194], '06881': ['', 6881], '08443': ['', 8443], '05061': ['', 5061], '00465': ['', 465], '00995': ['', 995], '08080': ['', 8080], '00443': ['', 443], '00080': ['', 80], '00993': ['', 993], '00853': ['', 853], '01701': ['', 1701]}}, 'udp': {'010.110.049.082': {'63308': ['', 63308]}, '010.110.063.089': {'49882': ['', 49882]}, '010.110.089.150': {'62065': ['', 62065]}, '023.089.015.050': {'05004': ['', 5004]}, '052.112.077.144': {'03480': ['', 3480]}, '054.215.072.028': {'08801': ['', 8801]}, '066.022.214.035': {'50002': ['', 50002]}, '104.044.195.124': {'03478': ['', 3478]}, '142.250.082.217': {'03478': ['', 3478]}, '144.195.033.064': {'08801': ['', 8801]}, '157.240.245.008': {'00443': ['', 443]}, '157.240.245.062': {'03478': ['', 3478]}, '170.133.130.181': {'09000': ['', 9000]}, '2001:4860:4864:5::111': {'19305': ['', 19305]}}}";

/// Drive one legacy connection to completion. `first4` is the prefix of
/// the 10-digit declare-ID length that the demux already consumed.
pub(crate) async fn run<S>(
    stream: &mut S,
    first4: [u8; 4],
    peer: SocketAddr,
    mlab_uuid: String,
    state: &AppState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let declared = read_declare_id(stream, first4, peer, state.cfg.idle_timeout).await?;
    let user_id = declared.user_id.clone();
    let test_id = declared.test_id;

    let result = script(stream, declared, mlab_uuid, state).await;

    // The IP slot is freed per connection; the session itself stays in the
    // unanalyzed table for the analyzer endpoint (or the next replay).
    if let Some(session) = state.registry.get_unanalyzed(&user_id, test_id) {
        let mut locked = session.lock().expect("session mutex");
        if locked.holds_ip_slot {
            state.registry.del(locked.public_ip);
            locked.holds_ip_slot = false;
        }
    }
    result
}

async fn script<S>(
    stream: &mut S,
    declared: DeclaredId,
    mlab_uuid: String,
    state: &AppState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let idle = state.cfg.idle_timeout;
    let is_last_replay = declared.is_last_replay;
    let replay_name = declared.replay_name.clone();

    // A reconnecting client mid-test picks up its earlier session; only
    // the connection changes between replays.
    let session = match state
        .registry
        .get_unanalyzed(&declared.user_id, declared.test_id)
    {
        Some(existing) => {
            {
                let mut locked = existing.lock().expect("session mutex");
                locked.add_replay(
                    declared.replay_type,
                    declared.replay_name.clone(),
                    declared.is_last_replay,
                );
            }
            existing
        }
        None => {
            let session = Arc::new(Mutex::new(declared.into_session(mlab_uuid)));
            state.registry.insert_unanalyzed(session.clone());
            session
        }
    };

    // Server-side-changes message; obsolete, discarded.
    let _ = read_legacy(stream, idle).await?;

    ask_permission(stream, &session, state).await?;

    // Iperf advertisement; unused but still in the script.
    let advert = read_legacy(stream, idle).await?;
    if advert.split(';').next() == Some("WillSendIperf") {
        let _ = read_legacy(stream, idle).await?;
    }

    let advert = read_legacy(stream, idle).await?;
    if advert.split(';').next() == Some("WillSendMobileStats") {
        let stats = read_legacy(stream, idle).await?;
        let mut locked = session.lock().expect("session mutex");
        locked
            .receive_mobile_stats(&stats, state.geocoder.as_ref())
            .context("receive mobile stats")?;
    }

    send_legacy(stream, SERVER_MAPPING).await?;

    // Old clients need to know whether the replay has multiple UDP
    // senders; everything UDP on this server does.
    let trace = state
        .traces
        .get_or_load(&replay_name)
        .await
        .with_context(|| format!("load trace {replay_name:?}"))?;
    send_legacy(stream, if trace.is_tcp { "0" } else { "1" }).await?;

    // DONE;<replay_duration_seconds>
    let done = read_legacy(stream, idle).await?;
    let mut pieces = done.split(';');
    let (_, duration) = (pieces.next(), pieces.next());
    let Some(duration) = duration else {
        bail!("DONE message missing replay duration: {done:?}");
    };

    let payload = read_legacy(stream, idle).await?;
    let files = {
        let mut locked = session.lock().expect("session mutex");
        let raw = locked.receive_throughputs(&format!("{duration};{payload}"))?;
        let mut files = Vec::new();
        if let Some(file) = locked.throughputs_file(&state.cfg.tmp_results_dir, &raw) {
            files.push(file);
        }
        files.push(locked.replay_info_file(&state.cfg.tmp_results_dir)?);
        files
    };
    for file in files {
        file.write().await.context("write result file")?;
    }

    send_legacy(stream, "OK").await?;

    // Trailing Result;No.
    let _ = read_legacy(stream, idle).await?;

    // Old clients poll for the verdict immediately, so the last replay
    // analyzes inline while the client blocks on this connection.
    if is_last_replay {
        let mut locked = session.lock().expect("session mutex");
        locked.analyze()?;
        state.metrics.analysis_completed();
    }

    Ok(())
}

async fn ask_permission<S>(
    stream: &mut S,
    session: &Arc<Mutex<ClientSession>>,
    state: &AppState,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let probe = resources::probe(&state.thresholds).await;
    let admission = {
        let mut locked = session.lock().expect("session mutex");
        state.registry.ask_permission(&mut locked, &state.catalog, probe)
    };

    match admission {
        Admission::Allowed { samples_per_replay } => {
            let response = format!(
                "1;{};{}",
                state.cfg.sidechannel_addr.ip(),
                samples_per_replay
            );
            send_legacy(stream, &response).await
        }
        Admission::Denied { reason } => {
            state.metrics.admission_denied(reason.wire_code());
            let mut response = format!("0;{}", reason.wire_code());
            if reason == DenyReason::IpInUse {
                response.push_str(&format!(";{SAMPLES_PER_REPLAY}"));
            }
            send_legacy(stream, &response).await?;
            bail!("replay permission denied: {reason:?}");
        }
    }
}

async fn read_declare_id<S>(
    stream: &mut S,
    first4: [u8; 4],
    peer: SocketAddr,
    idle: Duration,
) -> anyhow::Result<DeclaredId>
where
    S: AsyncRead + Unpin + Send,
{
    let mut field = [0u8; LEGACY_LENGTH_DIGITS];
    field[..4].copy_from_slice(&first4);
    timeout(idle, stream.read_exact(&mut field[4..]))
        .await
        .context("idle timeout reading declare ID length")?
        .context("read declare ID length")?;

    let len = protocol::decode_legacy_length(field)?;
    let mut body = vec![0u8; len];
    timeout(idle, stream.read_exact(&mut body))
        .await
        .context("idle timeout reading declare ID")?
        .context("read declare ID")?;
    let body = String::from_utf8(body).context("declare ID is not valid UTF-8")?;

    Ok(parse_declare_id(&body, peer.ip())?)
}

async fn read_legacy<S>(stream: &mut S, idle: Duration) -> anyhow::Result<String>
where
    S: AsyncRead + Unpin + Send,
{
    let mut field = [0u8; LEGACY_LENGTH_DIGITS];
    timeout(idle, stream.read_exact(&mut field))
        .await
        .context("idle timeout reading legacy frame")?
        .context("read legacy length")?;
    let len = protocol::decode_legacy_length(field)?;

    let mut body = vec![0u8; len];
    timeout(idle, stream.read_exact(&mut body))
        .await
        .context("idle timeout reading legacy frame")?
        .context("read legacy body")?;
    String::from_utf8(body).context("legacy body is not valid UTF-8")
}

async fn send_legacy<S>(stream: &mut S, message: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let frame = protocol::encode_legacy(message.as_bytes())?;
    stream.write_all(&frame).await.context("write legacy frame")?;
    Ok(())
}
