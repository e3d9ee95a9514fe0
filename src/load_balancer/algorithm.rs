// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use std::sync::Arc;

/// Picks the next backend out of the currently healthy ones.
pub trait LoadBalancer: Send + Sync {
    /// `None` only when `backends` is empty.
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    /// Timer hook for policies that move on a schedule.
    fn advance(&self) {}

    fn name(&self) -> &'static str;
}

pub use crate::config::LoadBalancerAlgorithm;
