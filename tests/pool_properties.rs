// tests/pool_properties.rs
use async_trait::async_trait;
use proptest::prelude::*;
use proxy_relay::error::ValidationError;
use proxy_relay::health::Probe;
use proxy_relay::pool::{ProxyPool, Target, TargetEndpoint, TargetKey, TargetKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Unreachable;

#[async_trait]
impl Probe for Unreachable {
    async fn probe(&self, _target: &TargetEndpoint) -> Result<Duration, ValidationError> {
        Err(ValidationError::Timeout)
    }
}

fn pool() -> ProxyPool {
    ProxyPool::new(Arc::new(Unreachable), None)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn kind_strategy() -> impl Strategy<Value = TargetKind> {
    prop_oneof![
        Just(TargetKind::Http),
        Just(TargetKind::Https),
        Just(TargetKind::Socks4),
        Just(TargetKind::Socks5),
        Just(TargetKind::Backend),
    ]
}

fn host_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("192.0.2.1"),
        Just("proxy.example.net"),
        Just("::1"),
        Just("2001:db8::5"),
    ]
}

proptest! {
    #[test]
    fn add_remove_never_duplicates(ops in prop::collection::vec((any::<bool>(), 1u16..6), 0..40)) {
        runtime().block_on(async {
            let pool = pool();
            let mut model = HashSet::new();

            for (add, port) in ops {
                if add {
                    let added = pool.add(Target::new("10.0.0.1", port, TargetKind::Http)).await;
                    prop_assert_eq!(added, model.insert(port));
                } else {
                    let removed = pool.remove(&TargetKey::new("10.0.0.1", port)).await;
                    prop_assert_eq!(removed, model.remove(&port));
                }
            }

            let listed = pool.list().await;
            let unique: HashSet<_> = listed.iter().map(|t| (t.host.clone(), t.port)).collect();
            prop_assert_eq!(unique.len(), listed.len());
            prop_assert_eq!(listed.len(), model.len());
            Ok(())
        })?;
    }

    #[test]
    fn rotation_visits_each_active_target_once_per_cycle(n in 1u16..10) {
        runtime().block_on(async {
            let pool = pool();
            for port in 1..=n {
                pool.add(Target::new("10.0.0.1", port, TargetKind::Socks5)).await;
            }

            let mut seen = Vec::new();
            for _ in 0..n {
                seen.push(pool.current_target().await.map(|t| t.key().port));
                pool.rotate().await;
            }
            let cycle: HashSet<_> = seen.iter().flatten().copied().collect();
            prop_assert_eq!(cycle.len(), n as usize);

            // A full cycle lands back at the start.
            prop_assert_eq!(pool.current_target().await.map(|t| t.key().port), seen[0]);
            Ok(())
        })?;
    }

    #[test]
    fn success_rate_stays_within_bounds(outcomes in prop::collection::vec(any::<bool>(), 0..60)) {
        runtime().block_on(async {
            let pool = pool();
            let key = TargetKey::new("10.0.0.9", 8080);
            pool.add(Target::new("10.0.0.9", 8080, TargetKind::Https)).await;

            for ok in &outcomes {
                if *ok {
                    pool.record_success(&key, Duration::from_millis(5)).await;
                } else {
                    pool.record_failure(&key).await;
                }
                let snapshot = &pool.list().await[0];
                prop_assert!((0.0..=100.0).contains(&snapshot.success_rate));
            }

            let snapshot = &pool.list().await[0];
            if outcomes.is_empty() {
                prop_assert_eq!(snapshot.success_rate, 0.0);
            }
            prop_assert_eq!(snapshot.success_count + snapshot.failure_count, outcomes.len() as u64);
            Ok(())
        })?;
    }

    #[test]
    fn save_then_load_reproduces_the_set(
        entries in prop::collection::hash_map((host_strategy(), 1u16..2000), kind_strategy(), 1..12)
    ) {
        runtime().block_on(async {
            let path = std::env::temp_dir().join(format!(
                "proxy-relay-prop-{}-{}.txt",
                std::process::id(),
                entries.len()
            ));

            let original = pool();
            for ((host, port), kind) in &entries {
                original.add(Target::new(*host, *port, *kind)).await;
            }
            original.save_to_file(&path).await.unwrap();

            let restored = pool();
            let loaded = restored.load_from_file(&path).await.unwrap();
            let _ = std::fs::remove_file(&path);
            prop_assert_eq!(loaded, entries.len());

            let expected: HashSet<_> = entries
                .iter()
                .map(|((h, p), k)| (h.to_string(), *p, *k))
                .collect();
            let actual: HashSet<_> = restored
                .list()
                .await
                .into_iter()
                .map(|t| (t.host, t.port, t.kind))
                .collect();
            prop_assert_eq!(actual, expected);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn six_failed_validations_deactivate_a_fresh_target() {
    let pool = pool();
    pool.add(Target::new("10.0.0.1", 3128, TargetKind::Http)).await;

    for _ in 0..5 {
        pool.validate_all().await;
    }
    assert!(pool.list().await[0].active);

    pool.validate_all().await;
    assert!(!pool.list().await[0].active);
    assert!(pool.current_target().await.is_none());
}
