// src/proxy/mod.rs
mod backend;
mod forwarder;
mod relay;
mod upstream;

pub use backend::{Backend, BackendSet, BackendStatus, ConnectionGuard};
pub use forwarder::{relay, ConnectionState, Forwarder, RelayTotals};
pub use relay::{HttpRelay, RelayOutcome};
pub use upstream::{OutboundRequest, OutboundResponse, UpstreamTransport};
