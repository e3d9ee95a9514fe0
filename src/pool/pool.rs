// src/pool/pool.rs
use super::target::{Target, TargetEndpoint, TargetKey, TargetSnapshot};
use crate::health::Probe;
use crate::metrics::MetricsCollector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct PoolState {
    targets: Vec<Target>,
    /// Position within the active subset, not within `targets`.
    cursor: usize,
    last_rotation: Option<DateTime<Utc>>,
}

impl PoolState {
    fn active_indices(&self) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_active())
            .map(|(i, _)| i)
            .collect()
    }

    fn current_index(&self) -> Option<usize> {
        let active = self.active_indices();
        if active.is_empty() {
            return None;
        }
        Some(active[self.cursor % active.len()])
    }

    fn normalize_cursor(&mut self) {
        let active = self.targets.iter().filter(|t| t.is_active()).count();
        self.cursor = if active == 0 { 0 } else { self.cursor % active };
    }

    fn find_mut(&mut self, key: &TargetKey) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.key() == key)
    }

    fn counts(&self) -> TargetCounts {
        let active = self.targets.iter().filter(|t| t.is_active()).count();
        TargetCounts {
            total: self.targets.len(),
            active,
            inactive: self.targets.len() - active,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetCounts {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub checked: usize,
    pub reachable: usize,
    pub unreachable: usize,
}

/// Owns every upstream target. All mutation goes through the write lock,
/// so the active subset and the cursor never disagree; readers get
/// point-in-time copies.
pub struct ProxyPool {
    state: RwLock<PoolState>,
    probe: Arc<dyn Probe>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ProxyPool {
    pub fn new(probe: Arc<dyn Probe>, metrics: Option<Arc<MetricsCollector>>) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            probe,
            metrics,
        }
    }

    /// False when a target with the same host and port already exists.
    pub async fn add(&self, target: Target) -> bool {
        let mut state = self.state.write().await;
        if state.targets.iter().any(|t| t.key() == target.key()) {
            debug!("Target {} already in pool", target.key());
            return false;
        }

        info!("Added target {} ({})", target.key(), target.kind());
        state.targets.push(target);
        self.publish_counts(&state);
        true
    }

    pub async fn remove(&self, key: &TargetKey) -> bool {
        let mut state = self.state.write().await;
        let before = state.targets.len();
        state.targets.retain(|t| t.key() != key);
        if state.targets.len() == before {
            return false;
        }

        state.normalize_cursor();
        self.publish_counts(&state);
        info!("Removed target {}", key);
        true
    }

    /// Target under the cursor, `None` when nothing is active.
    pub async fn current_target(&self) -> Option<Target> {
        let state = self.state.read().await;
        state.current_index().map(|i| state.targets[i].clone())
    }

    /// Current target for a forwarded request; stamps `last_used`.
    pub async fn checkout(&self) -> Option<TargetEndpoint> {
        let mut state = self.state.write().await;
        let index = state.current_index()?;
        let target = &mut state.targets[index];
        target.mark_used();
        Some(target.endpoint())
    }

    /// Advance to the next active target. No-op with one or none.
    pub async fn rotate(&self) {
        let mut state = self.state.write().await;
        let active = state.active_indices();
        if active.len() <= 1 {
            return;
        }

        state.cursor = (state.cursor + 1) % active.len();
        state.last_rotation = Some(Utc::now());

        let next = active[state.cursor];
        info!("Rotated to target {}", state.targets[next].key());
    }

    pub async fn last_rotation(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_rotation
    }

    pub async fn record_success(&self, key: &TargetKey, elapsed: Duration) {
        let mut state = self.state.write().await;
        if let Some(target) = state.find_mut(key) {
            target.record_success(elapsed);
        }
    }

    pub async fn record_failure(&self, key: &TargetKey) {
        let mut state = self.state.write().await;
        let deactivated = match state.find_mut(key) {
            Some(target) => target.record_failure(),
            None => return,
        };

        if deactivated {
            state.normalize_cursor();
            self.publish_counts(&state);
            warn!("Target {} deactivated after repeated failures", key);
        }
    }

    /// Probe every target in a snapshot taken up front. Probes run outside
    /// the lock; targets removed meanwhile are skipped when recording.
    pub async fn validate_all(&self) -> ValidationSummary {
        let endpoints: Vec<TargetEndpoint> = {
            let state = self.state.read().await;
            state.targets.iter().map(Target::endpoint).collect()
        };

        if endpoints.is_empty() {
            return ValidationSummary::default();
        }

        let probes = endpoints.iter().map(|endpoint| self.probe.probe(endpoint));
        let results = futures::future::join_all(probes).await;

        let mut summary = ValidationSummary {
            checked: endpoints.len(),
            ..Default::default()
        };

        let mut state = self.state.write().await;
        for (endpoint, result) in endpoints.iter().zip(results) {
            let Some(target) = state.find_mut(&endpoint.key) else {
                continue;
            };
            target.mark_validated();
            if let Some(metrics) = &self.metrics {
                metrics.record_validation(result.is_ok());
            }

            match result {
                Ok(elapsed) => {
                    summary.reachable += 1;
                    target.record_success(elapsed);
                    if target.try_reactivate() {
                        info!("Target {} reactivated", endpoint.key);
                    }
                    debug!("Target {} reachable in {:?}", endpoint.key, elapsed);
                }
                Err(e) => {
                    summary.unreachable += 1;
                    if target.record_failure() {
                        warn!("Target {} deactivated: {}", endpoint.key, e);
                    } else {
                        debug!("Target {} failed validation: {}", endpoint.key, e);
                    }
                }
            }
        }

        state.normalize_cursor();
        self.publish_counts(&state);
        drop(state);

        info!(
            "Validation complete: {} reachable, {} unreachable",
            summary.reachable, summary.unreachable
        );
        summary
    }

    pub async fn list(&self) -> Vec<TargetSnapshot> {
        let state = self.state.read().await;
        state.targets.iter().map(Target::snapshot).collect()
    }

    pub async fn counts(&self) -> TargetCounts {
        self.state.read().await.counts()
    }

    /// Add targets from a `host:port[:type]` file. Bad lines are skipped
    /// with a warning; returns how many new targets were added.
    pub async fn load_from_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<usize> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;

        let mut added = 0;
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match Target::parse_line(line) {
                Ok(target) => {
                    if self.add(target).await {
                        added += 1;
                    }
                }
                Err(e) => warn!(
                    "Skipping {}:{}: {}",
                    path.display(),
                    number + 1,
                    e
                ),
            }
        }

        info!("Loaded {} targets from {}", added, path.display());
        Ok(added)
    }

    /// Write every target as `host:port:type`, one per line.
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<usize> {
        let path = path.as_ref();
        let (contents, count) = {
            let state = self.state.read().await;
            let mut contents = String::new();
            for target in &state.targets {
                contents.push_str(&target.to_line());
                contents.push('\n');
            }
            (contents, state.targets.len())
        };

        tokio::fs::write(path, contents).await?;
        info!("Saved {} targets to {}", count, path.display());
        Ok(count)
    }

    pub async fn rotation_loop(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting rotation loop with interval: {:?}", every);
        while wait_for_tick(every, &mut shutdown).await {
            self.rotate().await;
        }
        info!("Rotation loop shutting down");
    }

    pub async fn validation_loop(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting validation loop with interval: {:?}", every);
        while wait_for_tick(every, &mut shutdown).await {
            self.validate_all().await;
        }
        info!("Validation loop shutting down");
    }

    fn publish_counts(&self, state: &PoolState) {
        if let Some(metrics) = &self.metrics {
            let counts = state.counts();
            metrics.update_target_counts(counts.active, counts.total);
        }
    }
}

/// Sleep one interval, then report whether the caller should keep going.
pub(crate) async fn wait_for_tick(every: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(every) => {}
        changed = shutdown.changed() => {
            // Sender gone means the engine is gone.
            if changed.is_err() {
                return false;
            }
        }
    }
    !*shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::pool::TargetKind;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Answers by port: listed ports succeed, everything else fails.
    struct ScriptedProbe {
        reachable: HashMap<u16, Duration>,
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, target: &TargetEndpoint) -> Result<Duration, ValidationError> {
            self.reachable
                .get(&target.key.port)
                .copied()
                .ok_or(ValidationError::Status(502))
        }
    }

    fn pool_with(reachable: &[u16]) -> ProxyPool {
        let probe = ScriptedProbe {
            reachable: reachable
                .iter()
                .map(|port| (*port, Duration::from_millis(15)))
                .collect(),
        };
        ProxyPool::new(Arc::new(probe), None)
    }

    fn target(port: u16) -> Target {
        Target::new("10.0.0.1", port, TargetKind::Http)
    }

    #[tokio::test]
    async fn duplicate_host_port_is_rejected() {
        let pool = pool_with(&[]);
        assert!(pool.add(target(3128)).await);
        assert!(!pool.add(Target::new("10.0.0.1", 3128, TargetKind::Socks5)).await);
        assert_eq!(pool.counts().await.total, 1);
    }

    #[tokio::test]
    async fn removing_absent_target_returns_false() {
        let pool = pool_with(&[]);
        pool.add(target(3128)).await;
        assert!(!pool.remove(&TargetKey::new("10.0.0.1", 9999)).await);
        assert!(pool.remove(&TargetKey::new("10.0.0.1", 3128)).await);
        assert!(pool.current_target().await.is_none());
    }

    #[tokio::test]
    async fn rotate_with_single_target_is_noop() {
        let pool = pool_with(&[]);
        pool.add(target(1)).await;
        pool.rotate().await;
        assert_eq!(pool.current_target().await.unwrap().key().port, 1);
        assert!(pool.last_rotation().await.is_none());
    }

    #[tokio::test]
    async fn rotate_cycles_through_active_targets() {
        let pool = pool_with(&[]);
        for port in 1..=4 {
            pool.add(target(port)).await;
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.current_target().await.unwrap().key().port);
            pool.rotate().await;
        }
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(pool.current_target().await.unwrap().key().port, 1);
    }

    #[tokio::test]
    async fn inactive_targets_are_never_current() {
        let pool = pool_with(&[]);
        pool.add(target(1)).await;
        for _ in 0..6 {
            pool.record_failure(&TargetKey::new("10.0.0.1", 1)).await;
        }
        assert!(pool.current_target().await.is_none());
        assert!(pool.checkout().await.is_none());
        assert_eq!(pool.counts().await.inactive, 1);
    }

    #[tokio::test]
    async fn validate_all_records_outcomes() {
        let pool = pool_with(&[1]);
        pool.add(target(1)).await;
        pool.add(target(2)).await;

        let summary = pool.validate_all().await;
        assert_eq!(summary.reachable, 1);
        assert_eq!(summary.unreachable, 1);

        let list = pool.list().await;
        assert_eq!(list[0].success_count, 1);
        assert!(list[0].avg_response_ms.is_some());
        assert!(list[0].last_validated.is_some());
        assert_eq!(list[1].failure_count, 1);
        assert!(list[1].active);
    }

    #[tokio::test]
    async fn validation_reactivates_recovered_target() {
        let pool = pool_with(&[1]);
        pool.add(target(1)).await;
        let key = TargetKey::new("10.0.0.1", 1);
        for _ in 0..6 {
            pool.record_failure(&key).await;
        }
        for _ in 0..3 {
            pool.record_success(&key, Duration::from_millis(5)).await;
        }
        assert!(pool.current_target().await.is_none());

        // 4 successes out of 10 clears the threshold.
        pool.validate_all().await;
        assert!(pool.current_target().await.is_some());
    }

    #[tokio::test]
    async fn checkout_stamps_last_used() {
        let pool = pool_with(&[]);
        pool.add(target(1)).await;
        let endpoint = pool.checkout().await.unwrap();
        assert_eq!(endpoint.key.port, 1);
        assert!(pool.list().await[0].last_used.is_some());
    }

    #[tokio::test]
    async fn load_skips_comments_and_malformed_lines() {
        let path = std::env::temp_dir().join(format!("targets-{}.txt", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            "# upstreams\n\n10.0.0.1:3128\n10.0.0.2:notaport\n10.0.0.3:1080:socks5\n10.0.0.1:3128:http\n",
        )
        .await
        .unwrap();

        let pool = pool_with(&[]);
        let added = pool.load_from_file(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.ok();

        assert_eq!(added, 2);
        let kinds: Vec<TargetKind> = pool.list().await.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TargetKind::Http, TargetKind::Socks5]);
    }

    #[tokio::test]
    async fn save_then_load_reproduces_targets() {
        let path = std::env::temp_dir().join(format!("targets-{}.txt", uuid::Uuid::new_v4()));
        let pool = pool_with(&[]);
        pool.add(Target::new("b.example", 8080, TargetKind::Https)).await;
        pool.add(Target::new("a.example", 1080, TargetKind::Socks4)).await;
        pool.save_to_file(&path).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.contains("a.example:1080:socks4\n"));

        let fresh = pool_with(&[]);
        assert_eq!(fresh.load_from_file(&path).await.unwrap(), 2);
        tokio::fs::remove_file(&path).await.ok();

        let mut original: Vec<_> = pool.list().await.into_iter().map(|t| (t.host, t.port, t.kind)).collect();
        let mut loaded: Vec<_> = fresh.list().await.into_iter().map(|t| (t.host, t.port, t.kind)).collect();
        original.sort_by(|a, b| a.0.cmp(&b.0));
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(original, loaded);
    }

    #[tokio::test]
    async fn loops_exit_after_shutdown() {
        let pool = Arc::new(pool_with(&[]));
        let (tx, rx) = watch::channel(false);
        let rotation = tokio::spawn(pool.clone().rotation_loop(Duration::from_secs(3600), rx.clone()));
        let validation = tokio::spawn(pool.clone().validation_loop(Duration::from_secs(3600), rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), rotation).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), validation).await.unwrap().unwrap();
    }
}
