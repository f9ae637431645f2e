//! Per-remote link handshake and the direct-link backend

mod backend;
mod dtls;
mod link;
mod orchestrator;

pub use backend::{LinkBackend, LinkEvent};
pub use dtls::DtlsBackend;
pub use link::{ConnectionState, Link, SignalingState};
pub use orchestrator::{LinkNotice, MAX_RESTARTS, Orchestrator};
