use std::net::SocketAddr;

use anyhow::{bail, Context};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::Instant,
};
use tracing::Instrument;

use crate::{
    sidechannel::{AppState, ServerHandle},
    trace::Schedule,
};

const IP_PROBE_MAGIC: &[u8] = b"WHATSMYIPMAN";
const IP_PROBE_HTTP_PREFIX: &[u8] = b"GET /WHATSMYIPMAN";

/// Start one TCP replay engine.
pub async fn start_tcp_replay(state: AppState, addr: SocketAddr) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!("TCP replay accept failed: {err}");
                            continue;
                        }
                    };
                    let state = state.clone();
                    tokio::spawn(async move {
                        let span = tracing::info_span!("tcp_replay", %peer);
                        if let Err(err) = handle_connection(stream, peer, state).instrument(span).await {
                            tracing::debug!(%peer, "TCP replay ended: {err:#}");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle::new(local_addr, shutdown_tx, task))
}

/// Serve one client connection: answer the IP probe, or replay the trace
/// the client's IP was admitted for.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    let first_read = stream.read(&mut buf).await.context("initial read")?;
    if first_read == 0 {
        return Ok(());
    }

    let initial = &buf[..first_read];
    if initial.starts_with(IP_PROBE_HTTP_PREFIX) || initial == IP_PROBE_MAGIC {
        let reply = format!("HTTP/1.1 200 OK\r\n\r\n{}", peer.ip());
        stream
            .write_all(reply.as_bytes())
            .await
            .context("write IP probe reply")?;
        return Ok(());
    }

    let peer_ip = peer.ip();
    let Some(replay_name) = state.registry.get(peer_ip) else {
        bail!("{peer_ip} is not currently admitted for a replay");
    };

    let trace = state
        .traces
        .get_or_load(&replay_name)
        .await
        .with_context(|| format!("load trace {replay_name:?}"))?;
    let Schedule::Tcp(sets) = &trace.schedule else {
        bail!("replay {replay_name:?} is not a TCP trace");
    };

    state.metrics.replay_started("tcp");
    tracing::info!(replay = %replay_name, sets = sets.len(), "TCP replay started");

    // Bytes already read count toward the first request gate; any surplus
    // past a gate carries into the next one.
    let mut carry = first_read as u64;

    for set in sets {
        let mut received = carry;
        while received < set.request_len {
            if !state.registry.has(peer_ip) {
                tracing::debug!("client left the registry; stopping replay");
                return Ok(());
            }
            let n = stream.read(&mut buf).await.context("read request bytes")?;
            if n == 0 {
                return Ok(());
            }
            received += n as u64;
        }
        carry = received - set.request_len;
        // The captured request hash is informational only; the gate is
        // the byte count.

        let set_start = Instant::now();
        for packet in &set.packets {
            if !state.registry.has(peer_ip) {
                tracing::debug!("client left the registry; stopping replay");
                return Ok(());
            }
            tokio::time::sleep_until(set_start + packet.offset).await;
            stream
                .write_all(&packet.payload)
                .await
                .context("write replay packet")?;
        }
    }

    Ok(())
}
