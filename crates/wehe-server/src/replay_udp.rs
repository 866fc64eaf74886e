use std::{
    collections::HashSet,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UdpSocket, sync::oneshot, time::Instant};

use crate::{
    sidechannel::{AppState, ServerHandle},
    trace::Schedule,
};

/// Hard per-replay cap so a user is never left waiting on a long trace.
pub const UDP_REPLAY_TIMEOUT: Duration = Duration::from_secs(45);

const IP_PROBE_MAGIC: &[u8] = b"WHATSMYIPMAN";

/// Start one UDP replay engine. A single socket serves every client on
/// this port; the first datagram from an admitted source IP starts its
/// send loop.
pub async fn start_udp_replay(state: AppState, addr: SocketAddr) -> std::io::Result<ServerHandle> {
    let socket = Arc::new(UdpSocket::bind(addr).await?);
    let local_addr = socket.local_addr()?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        // Source IPs with a live send loop, so repeat datagrams from the
        // client's sender thread do not spawn duplicates.
        let active: Arc<Mutex<HashSet<IpAddr>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut buf = vec![0u8; 4096];

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(received) => received,
                        Err(err) => {
                            tracing::warn!("UDP replay recv failed: {err}");
                            continue;
                        }
                    };
                    let payload = &buf[..len];

                    if payload.starts_with(IP_PROBE_MAGIC) {
                        let reply = src.ip().to_string();
                        if let Err(err) = socket.send_to(reply.as_bytes(), src).await {
                            tracing::debug!(%src, "IP probe reply failed: {err}");
                        }
                        continue;
                    }

                    let src_ip = src.ip();
                    // Only IPs holding a side-channel admission may be
                    // served; anything else is dropped without a reply.
                    if !state.registry.has(src_ip) {
                        continue;
                    }

                    let newly_seen = active.lock().expect("active set mutex").insert(src_ip);
                    if !newly_seen {
                        tracing::trace!(%src, bytes = len, "datagram during running replay");
                        continue;
                    }

                    let socket = socket.clone();
                    let state = state.clone();
                    let active = active.clone();
                    tokio::spawn(async move {
                        send_loop(socket, src, &state).await;
                        active.lock().expect("active set mutex").remove(&src_ip);
                    });
                }
            }
        }
    });

    Ok(ServerHandle::new(local_addr, shutdown_tx, task))
}

/// Replay the trace to one client on the captured timing. The loop ends
/// when the schedule is done, the IP loses its registry entry, or the hard
/// cap elapses.
async fn send_loop(socket: Arc<UdpSocket>, dst: SocketAddr, state: &AppState) {
    let dst_ip = dst.ip();
    let Some(replay_name) = state.registry.get(dst_ip) else {
        return;
    };

    let trace = match state.traces.get_or_load(&replay_name).await {
        Ok(trace) => trace,
        Err(err) => {
            tracing::warn!(%dst, "failed to load trace: {err}");
            return;
        }
    };
    let Schedule::Udp(packets) = &trace.schedule else {
        tracing::warn!(%dst, replay = %replay_name, "replay is not a UDP trace");
        return;
    };

    state.metrics.replay_started("udp");
    tracing::info!(%dst, replay = %replay_name, packets = packets.len(), "UDP replay started");

    let start = Instant::now();
    let deadline = start + UDP_REPLAY_TIMEOUT;
    for packet in packets {
        if !state.registry.has(dst_ip) {
            tracing::debug!(%dst, "client left the registry; stopping replay");
            break;
        }
        if start.elapsed() > UDP_REPLAY_TIMEOUT {
            state.metrics.replay_timed_out();
            tracing::info!(%dst, replay = %replay_name, "UDP replay hit the hard cap");
            break;
        }

        // A packet scheduled past the cap never goes out; the loop waits
        // out the remaining window and ends at the cap.
        let due = start + packet.offset;
        if due > deadline {
            tokio::time::sleep_until(deadline).await;
            state.metrics.replay_timed_out();
            tracing::info!(%dst, replay = %replay_name, "UDP replay hit the hard cap");
            break;
        }
        tokio::time::sleep_until(due).await;

        // Eviction during the sleep must not produce a stray packet.
        if !state.registry.has(dst_ip) {
            tracing::debug!(%dst, "client left the registry; stopping replay");
            break;
        }

        if let Err(err) = socket.send_to(&packet.payload, dst).await {
            tracing::debug!(%dst, "UDP send failed: {err}");
            break;
        }
    }
}
