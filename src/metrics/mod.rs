// src/metrics/mod.rs
mod collector;
mod stats;

pub use collector::{MetricsCollector, MetricsRegistry};
pub use stats::{
    MinuteCount, RequestRecord, StatsHandle, TrafficSnapshot, TrafficStats, MINUTE_BUCKETS,
};
