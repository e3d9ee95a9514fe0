// src/metrics/stats.rs
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One-minute buckets kept for the request-rate history.
pub const MINUTE_BUCKETS: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
struct MinuteBucket {
    /// Minutes since the Unix epoch.
    minute: i64,
    count: u64,
}

#[derive(Debug)]
struct MinuteRing {
    buckets: [MinuteBucket; MINUTE_BUCKETS],
}

impl MinuteRing {
    fn new() -> Self {
        Self {
            buckets: [MinuteBucket::default(); MINUTE_BUCKETS],
        }
    }

    fn bump(&mut self, minute: i64) {
        let slot = &mut self.buckets[minute.rem_euclid(MINUTE_BUCKETS as i64) as usize];
        if slot.minute != minute {
            *slot = MinuteBucket { minute, count: 0 };
        }
        slot.count += 1;
    }

    /// Buckets within the last hour ending at `now`, oldest first.
    fn recent(&self, now: i64) -> Vec<MinuteCount> {
        let mut recent: Vec<MinuteCount> = self
            .buckets
            .iter()
            .filter(|b| b.count > 0 && b.minute > now - MINUTE_BUCKETS as i64 && b.minute <= now)
            .map(|b| MinuteCount {
                minute: DateTime::from_timestamp(b.minute * 60, 0).unwrap_or_default(),
                requests: b.count,
            })
            .collect();
        recent.sort_by_key(|m| m.minute);
        recent
    }
}

/// Outcome of one relayed connection or request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestRecord {
    pub success: bool,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub elapsed: Duration,
}

/// Process-wide traffic counters. Monotonic; reset replaces the whole
/// structure through [`StatsHandle::reset`].
#[derive(Debug)]
pub struct TrafficStats {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    elapsed_micros: AtomicU64,
    start_time: DateTime<Utc>,
    per_minute: Mutex<MinuteRing>,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            elapsed_micros: AtomicU64::new(0),
            start_time: Utc::now(),
            per_minute: Mutex::new(MinuteRing::new()),
        }
    }

    pub fn record(&self, record: RequestRecord) {
        self.record_at(record, Utc::now());
    }

    fn record_at(&self, record: RequestRecord, at: DateTime<Utc>) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if record.success {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in.fetch_add(record.bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(record.bytes_out, Ordering::Relaxed);
        self.elapsed_micros
            .fetch_add(record.elapsed.as_micros() as u64, Ordering::Relaxed);

        let minute = at.timestamp().div_euclid(60);
        // A poisoned ring only loses rate history.
        if let Ok(mut ring) = self.per_minute.lock() {
            ring.bump(minute);
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let now = Utc::now();
        let total = self.total.load(Ordering::Relaxed);
        let elapsed_micros = self.elapsed_micros.load(Ordering::Relaxed);

        let requests_per_minute = self
            .per_minute
            .lock()
            .map(|ring| ring.recent(now.timestamp().div_euclid(60)))
            .unwrap_or_default();

        TrafficSnapshot {
            total,
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            avg_response_ms: if total == 0 {
                0.0
            } else {
                elapsed_micros as f64 / total as f64 / 1000.0
            },
            start_time: self.start_time,
            uptime_secs: (now - self.start_time).num_seconds().max(0) as u64,
            requests_per_minute,
        }
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MinuteCount {
    pub minute: DateTime<Utc>,
    pub requests: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficSnapshot {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub avg_response_ms: f64,
    pub start_time: DateTime<Utc>,
    pub uptime_secs: u64,
    pub requests_per_minute: Vec<MinuteCount>,
}

/// Shared handle; readers and writers never block a reset.
#[derive(Debug)]
pub struct StatsHandle {
    inner: ArcSwap<TrafficStats>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(TrafficStats::new()),
        }
    }

    pub fn record(&self, record: RequestRecord) {
        self.inner.load().record(record);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        self.inner.load().snapshot()
    }

    pub fn reset(&self) {
        self.inner.store(Arc::new(TrafficStats::new()));
    }
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(bytes_in: u64, bytes_out: u64) -> RequestRecord {
        RequestRecord {
            success: true,
            bytes_in,
            bytes_out,
            elapsed: Duration::from_millis(10),
        }
    }

    #[test]
    fn counts_success_and_failure() {
        let stats = StatsHandle::new();
        stats.record(ok(100, 2000));
        stats.record(RequestRecord::default());

        let snap = stats.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.success, 1);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.bytes_in, 100);
        assert_eq!(snap.bytes_out, 2000);
        assert!((snap.avg_response_ms - 5.0).abs() < f64::EPSILON);
        assert_eq!(snap.requests_per_minute.iter().map(|m| m.requests).sum::<u64>(), 2);
    }

    #[test]
    fn reset_replaces_everything() {
        let stats = StatsHandle::new();
        stats.record(ok(1, 1));
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.avg_response_ms, 0.0);
        assert!(snap.requests_per_minute.is_empty());
    }

    #[test]
    fn minute_ring_reuses_stale_slots() {
        let stats = TrafficStats::new();
        let base = DateTime::from_timestamp(6_000_000, 0).unwrap();
        stats.record_at(ok(0, 0), base);
        stats.record_at(ok(0, 0), base);
        // Same slot an hour later overwrites the old count.
        stats.record_at(ok(0, 0), base + chrono::Duration::minutes(60));

        let ring = stats.per_minute.lock().unwrap();
        let now = (base + chrono::Duration::minutes(60)).timestamp() / 60;
        let recent = ring.recent(now);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].requests, 1);
    }
}
