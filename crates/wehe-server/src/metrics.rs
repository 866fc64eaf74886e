use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus instrumentation shared by all listeners.
///
/// Label cardinality is fixed: the only labelled metric keys off the small
/// closed sets of admission deny reasons and replay transports.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    registry: Registry,

    sessions_opened_total: IntCounter,
    active_sessions: IntGauge,
    admission_denied_total: IntCounterVec,
    replays_started_total: IntCounterVec,
    replay_timeouts_total: IntCounter,
    analyses_total: IntCounter,
    protocol_errors_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_opened_total = IntCounter::with_opts(Opts::new(
            "wehe_sessions_opened_total",
            "Total side-channel sessions accepted.",
        ))
        .expect("wehe_sessions_opened_total metric must be valid");
        registry
            .register(Box::new(sessions_opened_total.clone()))
            .expect("wehe_sessions_opened_total must register");

        let active_sessions = IntGauge::with_opts(Opts::new(
            "wehe_active_sessions",
            "Side-channel sessions currently open.",
        ))
        .expect("wehe_active_sessions metric must be valid");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("wehe_active_sessions must register");

        let admission_denied_total = IntCounterVec::new(
            Opts::new(
                "wehe_admission_denied_total",
                "Replay admissions refused, by reason.",
            ),
            &["reason"],
        )
        .expect("wehe_admission_denied_total metric must be valid");
        registry
            .register(Box::new(admission_denied_total.clone()))
            .expect("wehe_admission_denied_total must register");

        let replays_started_total = IntCounterVec::new(
            Opts::new(
                "wehe_replays_started_total",
                "Replay send loops started, by transport.",
            ),
            &["transport"],
        )
        .expect("wehe_replays_started_total metric must be valid");
        registry
            .register(Box::new(replays_started_total.clone()))
            .expect("wehe_replays_started_total must register");

        let replay_timeouts_total = IntCounter::with_opts(Opts::new(
            "wehe_replay_timeouts_total",
            "UDP replays cut off at the hard per-replay cap.",
        ))
        .expect("wehe_replay_timeouts_total metric must be valid");
        registry
            .register(Box::new(replay_timeouts_total.clone()))
            .expect("wehe_replay_timeouts_total must register");

        let analyses_total = IntCounter::with_opts(Opts::new(
            "wehe_analyses_total",
            "Completed KS analyses.",
        ))
        .expect("wehe_analyses_total metric must be valid");
        registry
            .register(Box::new(analyses_total.clone()))
            .expect("wehe_analyses_total must register");

        let protocol_errors_total = IntCounter::with_opts(Opts::new(
            "wehe_protocol_errors_total",
            "Side-channel connections dropped on protocol errors.",
        ))
        .expect("wehe_protocol_errors_total metric must be valid");
        registry
            .register(Box::new(protocol_errors_total.clone()))
            .expect("wehe_protocol_errors_total must register");

        let this = Self {
            inner: Arc::new(Inner {
                registry,
                sessions_opened_total,
                active_sessions,
                admission_denied_total,
                replays_started_total,
                replay_timeouts_total,
                analyses_total,
                protocol_errors_total,
            }),
        };

        // Pre-initialize the label sets so output is stable from the start.
        for reason in ["1", "2", "3", "4"] {
            this.inner.admission_denied_total.with_label_values(&[reason]);
        }
        for transport in ["tcp", "udp"] {
            this.inner.replays_started_total.with_label_values(&[transport]);
        }

        this
    }

    pub fn session_opened(&self) {
        self.inner.sessions_opened_total.inc();
        self.inner.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.inner.active_sessions.dec();
    }

    pub fn admission_denied(&self, wire_code: &str) {
        self.inner
            .admission_denied_total
            .with_label_values(&[wire_code])
            .inc();
    }

    pub fn replay_started(&self, transport: &str) {
        self.inner
            .replays_started_total
            .with_label_values(&[transport])
            .inc();
    }

    pub fn replay_timed_out(&self) {
        self.inner.replay_timeouts_total.inc();
    }

    pub fn analysis_completed(&self) {
        self.inner.analyses_total.inc();
    }

    pub fn protocol_error(&self) {
        self.inner.protocol_errors_total.inc();
    }

    pub fn encode(&self) -> Vec<u8> {
        let metric_families = self.inner.registry.gather();
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&metric_families, &mut buf)
            .expect("prometheus encoding must succeed");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
