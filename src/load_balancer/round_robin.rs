// src/load_balancer/round_robin.rs
use crate::config::RoundRobinAdvance;
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct RoundRobinBalancer {
    counter: AtomicUsize,
    policy: RoundRobinAdvance,
}

impl RoundRobinBalancer {
    pub fn new(policy: RoundRobinAdvance) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            policy,
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_backend(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if backends.is_empty() {
            return None;
        }

        let position = match self.policy {
            RoundRobinAdvance::PerRequest => self.counter.fetch_add(1, Ordering::Relaxed),
            RoundRobinAdvance::PerTick => self.counter.load(Ordering::Relaxed),
        };
        Some(backends[position % backends.len()].clone())
    }

    fn advance(&self) {
        if self.policy == RoundRobinAdvance::PerTick {
            self.counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
