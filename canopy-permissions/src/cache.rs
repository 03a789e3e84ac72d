//! Decision cache with single-flight memoization and pattern invalidation.
//!
//! Entries are keyed by the full decision tuple (target + resolved user
//! group) and hold booleans only: an undefined outcome is never stored, so a
//! "not yet created" entity can never leave a cached false negative behind.
//! Concurrent callers for the same key share one in-flight computation over
//! a watch channel instead of recomputing.

use canopy_core::{EngineResult, GroupId, InvalidationPattern, PermissionTarget};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{watch, Mutex};

/// Configuration for the decision cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether caching is active at all. Disabled caches compute through.
    pub enabled: bool,
    /// Entry count at which the cache flushes settled entries.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 10_000,
        }
    }
}

impl CacheConfig {
    /// Create a cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable caching.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the flush capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Hit/miss/eviction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

/// Key of one cached decision: the permission target plus the resolved
/// user group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub target: PermissionTarget,
    pub group: GroupId,
}

/// In-flight computations publish `None` while pending, then exactly one
/// settled outcome. A dropped sender signals a failed leader.
type FlightValue = Option<Option<bool>>;

enum Slot {
    Ready(bool),
    Pending {
        generation: u64,
        rx: watch::Receiver<FlightValue>,
    },
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<DecisionKey, Slot>,
    stats: CacheStats,
    next_generation: u64,
}

enum Role {
    Hit(bool),
    Waiter(watch::Receiver<FlightValue>),
    Leader {
        generation: u64,
        tx: watch::Sender<FlightValue>,
    },
}

/// Memoization layer over permission decisions.
pub struct PermissionCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl PermissionCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// The active configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot of the counters.
    pub async fn stats(&self) -> CacheStats {
        self.inner.lock().await.stats.clone()
    }

    /// Number of entries currently held (settled and in flight).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Return the cached decision for `key`, or run `compute` with
    /// at-most-one in-flight computation per key.
    ///
    /// `Some` outcomes are stored; `None` outcomes are returned to every
    /// caller of the flight but never stored. When the leading computation
    /// fails, its error goes to the leader and any waiter falls back to
    /// computing for itself, uncached.
    pub async fn memoize<F, Fut>(&self, key: DecisionKey, compute: F) -> EngineResult<Option<bool>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Option<bool>>>,
    {
        if !self.config.enabled {
            return compute().await;
        }

        let role = {
            let mut inner = self.inner.lock().await;
            match inner.entries.get(&key) {
                Some(Slot::Ready(value)) => {
                    let value = *value;
                    inner.stats.hits += 1;
                    Role::Hit(value)
                }
                Some(Slot::Pending { rx, .. }) => {
                    let rx = rx.clone();
                    inner.stats.hits += 1;
                    Role::Waiter(rx)
                }
                None => {
                    inner.stats.misses += 1;
                    inner.next_generation += 1;
                    let generation = inner.next_generation;
                    let (tx, rx) = watch::channel(None);
                    inner
                        .entries
                        .insert(key.clone(), Slot::Pending { generation, rx });
                    Role::Leader { generation, tx }
                }
            }
        };

        match role {
            Role::Hit(value) => Ok(Some(value)),
            Role::Waiter(mut rx) => loop {
                if let Some(outcome) = *rx.borrow() {
                    return Ok(outcome);
                }
                if rx.changed().await.is_err() {
                    // Leader failed; compute for ourselves, uncached.
                    return compute().await;
                }
            },
            Role::Leader { generation, tx } => {
                let result = compute().await;
                let mut inner = self.inner.lock().await;
                // Only our own pending slot gets replaced: an invalidation
                // that raced the computation has already removed it, and the
                // result must not be resurrected.
                let slot_is_ours = matches!(
                    inner.entries.get(&key),
                    Some(Slot::Pending { generation: g, .. }) if *g == generation
                );
                match &result {
                    Ok(outcome) => {
                        if slot_is_ours {
                            match outcome {
                                Some(value) => {
                                    inner.entries.insert(key.clone(), Slot::Ready(*value));
                                }
                                None => {
                                    inner.entries.remove(&key);
                                }
                            }
                        }
                        let _ = tx.send(Some(*outcome));
                        if inner.entries.len() > self.config.capacity {
                            let before = inner.entries.len();
                            inner
                                .entries
                                .retain(|_, slot| matches!(slot, Slot::Pending { .. }));
                            inner.stats.evictions += (before - inner.entries.len()) as u64;
                        }
                    }
                    Err(_) => {
                        if slot_is_ours {
                            inner.entries.remove(&key);
                        }
                        // Dropping the sender wakes waiters into their own
                        // computation.
                    }
                }
                result
            }
        }
    }

    /// Delete every entry matching `pattern`. Returns the number dropped.
    pub async fn invalidate(&self, pattern: &InvalidationPattern) -> u64 {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|key, _| !pattern.matches(&key.target, &key.group));
        let removed = (before - inner.entries.len()) as u64;
        inner.stats.invalidations += removed;
        removed
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::{actions, Element, PermissionKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key_for(record: &str) -> DecisionKey {
        DecisionKey {
            target: PermissionTarget::record(&Element::new(record, "shoes"), actions::ACCESS),
            group: GroupId::from("editors"),
        }
    }

    #[tokio::test]
    async fn test_memoize_caches_booleans() {
        let cache = PermissionCache::with_defaults();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let first = cache
            .memoize(key_for("A"), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(true))
            })
            .await
            .unwrap();
        let second = cache
            .memoize(key_for("A"), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(false))
            })
            .await
            .unwrap();

        assert_eq!(first, Some(true));
        assert_eq!(second, Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_undefined_outcomes_are_never_stored() {
        let cache = PermissionCache::with_defaults();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            let outcome = cache
                .memoize(key_for("A"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert_eq!(outcome, None);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_single_flight_shares_one_computation() {
        let cache = PermissionCache::with_defaults();
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            // Yield so the second caller joins the flight as a waiter.
            tokio::task::yield_now().await;
            Ok(Some(true))
        };

        let (first, second) = tokio::join!(
            cache.memoize(key_for("A"), compute),
            cache.memoize(key_for("A"), compute),
        );

        assert_eq!(first.unwrap(), Some(true));
        assert_eq!(second.unwrap(), Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_leader_lets_waiter_compute() {
        let cache = PermissionCache::with_defaults();

        let failing = || async {
            tokio::task::yield_now().await;
            Err(canopy_core::StorageError::Backend {
                reason: "boom".to_string(),
            }
            .into())
        };
        let succeeding = || async { Ok(Some(false)) };

        let (first, second) = tokio::join!(
            cache.memoize(key_for("A"), failing),
            cache.memoize(key_for("A"), succeeding),
        );

        assert!(first.is_err());
        assert_eq!(second.unwrap(), Some(false));
        // The failed flight left nothing behind.
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern() {
        let cache = PermissionCache::with_defaults();
        cache
            .memoize(key_for("A"), || async { Ok(Some(true)) })
            .await
            .unwrap();
        cache
            .memoize(key_for("B"), || async { Ok(Some(false)) })
            .await
            .unwrap();

        let other_library = DecisionKey {
            target: PermissionTarget::record(&Element::new("C", "hats"), actions::ACCESS),
            group: GroupId::from("editors"),
        };
        cache
            .memoize(other_library, || async { Ok(Some(true)) })
            .await
            .unwrap();

        let removed = cache
            .invalidate(&InvalidationPattern::for_kind_scope(
                PermissionKind::Record,
                "shoes",
            ))
            .await;
        assert_eq!(removed, 2);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.stats().await.invalidations, 2);
    }

    #[tokio::test]
    async fn test_invalidation_during_flight_wins() {
        let cache = PermissionCache::with_defaults();

        let cache_ref = &cache;
        let flight = cache.memoize(key_for("A"), move || async move {
            // Invalidate while the computation is in progress.
            cache_ref.invalidate(&InvalidationPattern::any()).await;
            Ok(Some(true))
        });
        let outcome = flight.await.unwrap();

        assert_eq!(outcome, Some(true));
        // The result was computed from pre-invalidation reads and must not
        // have been resurrected into the cache.
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_flush() {
        let cache = PermissionCache::new(CacheConfig::new().with_capacity(2));
        for record in ["A", "B", "C"] {
            cache
                .memoize(key_for(record), || async { Ok(Some(true)) })
                .await
                .unwrap();
        }

        assert!(cache.len().await <= 2);
        assert!(cache.stats().await.evictions > 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_computes_through() {
        let cache = PermissionCache::new(CacheConfig::new().with_enabled(false));
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..2 {
            cache
                .memoize(key_for("A"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(true))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty().await);
    }
}
