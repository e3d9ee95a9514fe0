// src/load_balancer/mod.rs
mod algorithm;
mod least_connections;
mod round_robin;

pub use algorithm::LoadBalancer; // trait
pub use least_connections::LeastConnectionsBalancer;
pub use round_robin::RoundRobinBalancer;
pub use crate::config::LoadBalancerAlgorithm; // enum exposed if needed

use crate::config::LoadBalancerConfig;
use std::sync::Arc;

pub fn create_load_balancer(config: &LoadBalancerConfig) -> Arc<dyn LoadBalancer> {
    match config.algorithm {
        LoadBalancerAlgorithm::RoundRobin => {
            Arc::new(RoundRobinBalancer::new(config.round_robin_advance))
        }
        LoadBalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new()),
    }
}
