// src/lib.rs
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod server;

pub use context::ProxyContext;
pub use engine::{Engine, EngineStatus};
