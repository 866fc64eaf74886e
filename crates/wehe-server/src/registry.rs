use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use crate::client::{ClientSession, Exception};
use crate::resources::ProbeOutcome;

/// Throughput samples the client is asked to take per replay. All released
/// clients adapt to whatever value permission grants.
pub const SAMPLES_PER_REPLAY: u32 = 100;

/// Process-wide session coordination.
///
/// Two maps, each behind its own mutex with lock windows covering map
/// operations only (never I/O):
///
/// - the per-IP single-flight map: at most one replay per public IP at any
///   time, and the UDP/TCP replay engines may only serve IPs present here;
/// - the unanalyzed-tests table used by the legacy protocol, so that a
///   reconnecting client finds its in-progress test and the legacy
///   analyzer endpoint can look results up by `(user_id, test_id)`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    client_ips: Mutex<HashMap<IpAddr, String>>,
    unanalyzed: Mutex<HashMap<(String, i64), Arc<Mutex<ClientSession>>>>,
}

/// Why admission was refused, with the wire code sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    UnknownReplay,
    IpInUse,
    LowResources,
    ResourceRetrievalFail,
}

impl DenyReason {
    pub fn wire_code(self) -> &'static str {
        match self {
            DenyReason::UnknownReplay => "1",
            DenyReason::IpInUse => "2",
            DenyReason::LowResources => "3",
            DenyReason::ResourceRetrievalFail => "4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { samples_per_replay: u32 },
    Denied { reason: DenyReason },
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, ip: IpAddr) -> bool {
        self.client_ips.lock().expect("registry mutex").contains_key(&ip)
    }

    pub fn get(&self, ip: IpAddr) -> Option<String> {
        self.client_ips.lock().expect("registry mutex").get(&ip).cloned()
    }

    pub fn add(&self, ip: IpAddr, replay_name: String) {
        self.client_ips.lock().expect("registry mutex").insert(ip, replay_name);
    }

    pub fn del(&self, ip: IpAddr) {
        self.client_ips.lock().expect("registry mutex").remove(&ip);
    }

    pub fn active_replays(&self) -> usize {
        self.client_ips.lock().expect("registry mutex").len()
    }

    /// Admission rules, evaluated in order with the first failure winning:
    /// the replay must exist in the catalog, the IP must not already be
    /// running a replay, and the resource probe must report headroom. On
    /// success the IP is bound to the replay name.
    pub fn ask_permission(
        &self,
        session: &mut ClientSession,
        catalog: &[String],
        probe: ProbeOutcome,
    ) -> Admission {
        let replay_name = match session.current_replay() {
            Some(replay) => replay.replay_name.clone(),
            None => {
                session.exception = Exception::protocol_error("no replay declared");
                return Admission::Denied {
                    reason: DenyReason::UnknownReplay,
                };
            }
        };

        if !catalog.iter().any(|name| name == &replay_name) {
            session.exception = Exception::unknown_replay_name();
            return Admission::Denied {
                reason: DenyReason::UnknownReplay,
            };
        }

        // Multiple clients behind one IP would skew each other's
        // throughputs, so only one replay per IP may run at a time. A
        // session re-asking for its own next replay keeps its slot.
        if !session.holds_ip_slot && self.has(session.public_ip) {
            session.exception = Exception::no_permission();
            return Admission::Denied {
                reason: DenyReason::IpInUse,
            };
        }

        match probe {
            ProbeOutcome::Headroom => {}
            ProbeOutcome::Overloaded { metric, value } => {
                session.exception =
                    Exception::overloaded(metric, value, self.active_replays());
                return Admission::Denied {
                    reason: DenyReason::LowResources,
                };
            }
            ProbeOutcome::Unavailable => {
                return Admission::Denied {
                    reason: DenyReason::ResourceRetrievalFail,
                };
            }
        }

        // Re-check under the lock: two sessions from one IP may both have
        // passed the unlocked check while the probe was sleeping.
        {
            let mut ips = self.client_ips.lock().expect("registry mutex");
            if !session.holds_ip_slot && ips.contains_key(&session.public_ip) {
                session.exception = Exception::no_permission();
                return Admission::Denied {
                    reason: DenyReason::IpInUse,
                };
            }
            ips.insert(session.public_ip, replay_name);
        }
        session.holds_ip_slot = true;

        Admission::Allowed {
            samples_per_replay: SAMPLES_PER_REPLAY,
        }
    }

    pub fn insert_unanalyzed(&self, session: Arc<Mutex<ClientSession>>) {
        let key = {
            let session = session.lock().expect("session mutex");
            (session.user_id.clone(), session.test_id)
        };
        self.unanalyzed
            .lock()
            .expect("unanalyzed mutex")
            .insert(key, session);
    }

    pub fn get_unanalyzed(
        &self,
        user_id: &str,
        test_id: i64,
    ) -> Option<Arc<Mutex<ClientSession>>> {
        self.unanalyzed
            .lock()
            .expect("unanalyzed mutex")
            .get(&(user_id.to_string(), test_id))
            .cloned()
    }

    pub fn remove_unanalyzed(&self, user_id: &str, test_id: i64) {
        self.unanalyzed
            .lock()
            .expect("unanalyzed mutex")
            .remove(&(user_id.to_string(), test_id));
    }
}
