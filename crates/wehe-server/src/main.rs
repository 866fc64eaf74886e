#![forbid(unsafe_code)]

use std::{net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc};

use anyhow::Context;
use wehe_server::{
    analyzer_http, config, geo::NoReverseGeocoder, metrics::Metrics, replay_tcp, replay_udp,
    resources::Thresholds, sidechannel, tls, trace::TraceCache, AppState, ServerConfig,
    ServerHandle, SessionRegistry,
};

#[derive(Default)]
struct CliArgs {
    sidechannel_bind: Option<SocketAddr>,
    tests_dir: Option<PathBuf>,
    ports_file: Option<PathBuf>,
}

fn parse_args() -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--bind" {
            let value = args
                .next()
                .ok_or_else(|| "--bind requires a value like 0.0.0.0:55556".to_string())?;
            out.sidechannel_bind = Some(
                SocketAddr::from_str(&value)
                    .map_err(|_| format!("invalid --bind value {value:?}"))?,
            );
            continue;
        }

        if arg == "--tests-dir" {
            let value = args
                .next()
                .ok_or_else(|| "--tests-dir requires a path".to_string())?;
            out.tests_dir = Some(PathBuf::from(value));
            continue;
        }

        if arg == "--ports-file" {
            let value = args
                .next()
                .ok_or_else(|| "--ports-file requires a path".to_string())?;
            out.ports_file = Some(PathBuf::from(value));
            continue;
        }

        if arg == "--help" || arg == "-h" {
            println!(
                "Usage: wehe-server [--bind <ip:port>] [--tests-dir <dir>] [--ports-file <file>]\n\
                 \n\
                 Options:\n\
                 \t--bind <ip:port>\tSide-channel bind address (env: WEHE_SIDECHANNEL_ADDR)\n\
                 \t--tests-dir <dir>\tReplay catalog directory (env: WEHE_TESTS_DIR)\n\
                 \t--ports-file <file>\tReplay ports JSON (env: WEHE_PORTS_FILE)"
            );
            std::process::exit(0);
        }

        return Err(format!("unknown argument {arg:?}"));
    }

    Ok(out)
}

fn tokio_worker_threads_from_env() -> Option<usize> {
    let raw = std::env::var("WEHE_TOKIO_WORKER_THREADS").ok()?;
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            eprintln!(
                "warning: invalid WEHE_TOKIO_WORKER_THREADS value: {raw:?} (expected positive integer); using Tokio default"
            );
            None
        }
    }
}

fn build_tokio_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(n) = tokio_worker_threads_from_env() {
        builder.worker_threads(n);
    }
    builder.enable_all().build()
}

fn main() -> anyhow::Result<()> {
    build_tokio_runtime()?.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("Run with --help for usage.");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut cfg = ServerConfig::from_env().context("invalid config")?;
    if let Some(bind) = cli.sidechannel_bind {
        cfg.sidechannel_addr = bind;
    }
    if let Some(tests_dir) = cli.tests_dir {
        cfg.tests_dir = tests_dir;
    }
    if let Some(ports_file) = cli.ports_file {
        cfg.ports_file = ports_file;
    }

    // The passphrase itself is consumed by the external cert issuance
    // step; a missing value means the deployment is incomplete.
    config::require_key_password()?;

    let catalog = config::scan_replay_catalog(&cfg.tests_dir)?;
    tracing::info!(replays = catalog.len(), "replay catalog loaded");

    let ports = config::load_test_ports(&cfg.ports_file)?;
    let acceptor = tls::load_acceptor(&cfg.cert_file, &cfg.key_file)?;
    let uuid_prefix = load_uuid_prefix(&cfg)?;

    let state = AppState {
        traces: Arc::new(TraceCache::new(
            cfg.tests_dir.clone(),
            cfg.trace_cache_capacity,
        )),
        cfg: Arc::new(cfg),
        registry: Arc::new(SessionRegistry::new()),
        catalog: Arc::new(catalog),
        geocoder: Arc::new(NoReverseGeocoder),
        metrics: Metrics::new(),
        thresholds: Thresholds::default(),
        uuid_prefix,
    };

    let mut handles: Vec<ServerHandle> = Vec::new();

    let sidechannel = sidechannel::start_sidechannel(state.clone(), acceptor.clone())
        .await
        .context("bind side channel listener")?;
    tracing::info!("side channel listening on {}", sidechannel.local_addr());
    handles.push(sidechannel);

    let analyzer = analyzer_http::start_analyzer(state.clone(), acceptor.clone())
        .await
        .context("bind analyzer listener")?;
    tracing::info!("legacy analyzer listening on {}", analyzer.local_addr());
    handles.push(analyzer);

    // All replay ports open at startup: old clients probe a test port for
    // their public IP before they ever touch the side channel.
    let bind_ip = state.cfg.sidechannel_addr.ip();
    for port in &ports.tcp_ports {
        let handle = replay_tcp::start_tcp_replay(state.clone(), SocketAddr::new(bind_ip, *port))
            .await
            .with_context(|| format!("bind TCP replay port {port}"))?;
        tracing::info!("TCP replay engine listening on {}", handle.local_addr());
        handles.push(handle);
    }
    for port in &ports.udp_ports {
        let handle = replay_udp::start_udp_replay(state.clone(), SocketAddr::new(bind_ip, *port))
            .await
            .with_context(|| format!("bind UDP replay port {port}"))?;
        tracing::info!("UDP replay engine listening on {}", handle.local_addr());
        handles.push(handle);
    }

    // Best-effort graceful shutdown on Ctrl+C / SIGTERM.
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }

    tracing::info!("shutdown signal received");
    for handle in handles {
        handle.shutdown().await;
    }
    Ok(())
}

fn load_uuid_prefix(cfg: &ServerConfig) -> anyhow::Result<Arc<str>> {
    let Some(path) = &cfg.uuid_prefix_file else {
        return Ok(Arc::from("wehe"));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read UUID prefix file {}", path.display()))?;
    let prefix = raw.lines().next().unwrap_or("").trim();
    if prefix.is_empty() {
        anyhow::bail!("UUID prefix file {} is empty", path.display());
    }
    Ok(Arc::from(prefix))
}
