// src/pool/mod.rs
mod pool;
mod target;

pub(crate) use pool::wait_for_tick;
pub use pool::{ProxyPool, TargetCounts, ValidationSummary};
pub use target::{
    Credentials, ResponseWindow, Target, TargetEndpoint, TargetKey, TargetKind, TargetSnapshot,
    RESPONSE_WINDOW,
};
