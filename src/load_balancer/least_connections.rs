// src/load_balancer/least_connections.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use std::sync::Arc;

/// Fewest in-flight connections wins; ties go to the earliest backend in
/// the order given.
#[derive(Default)]
pub struct LeastConnectionsBalancer;

impl LeastConnectionsBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // min_by_key keeps the first of equal minima.
        backends
            .iter()
            .min_by_key(|backend| backend.active_connections())
            .cloned()
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
