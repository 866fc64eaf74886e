#![forbid(unsafe_code)]

pub mod analyzer_http;
pub mod client;
pub mod config;
pub mod geo;
pub mod metrics;
pub mod registry;
pub mod replay_tcp;
pub mod replay_udp;
pub mod resources;
pub mod sidechannel;
pub mod tls;
pub mod trace;

mod legacy;

pub use config::ServerConfig;
pub use registry::{Admission, DenyReason, SessionRegistry};
pub use sidechannel::{start_sidechannel, AppState, ServerHandle};
