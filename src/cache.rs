//! Time-bounded result cache with single-flight fetch de-duplication
//!
//! Memoizes remote-call results so repeated lookups within a TTL window never
//! touch the upstream service. Backed by `moka`:
//!
//! - the entry API's `or_try_insert_with` gives the single-flight contract:
//!   of N concurrent callers for the same missing key, exactly one runs the
//!   fetch and all N observe its outcome; a failed fetch is surfaced to every
//!   waiter and never cached. Its freshness flag attributes the miss to the
//!   caller that fetched and a hit to everyone who shared the flight.
//! - A per-entry expiry policy carries the caller-supplied TTL, so categories
//!   with different freshness requirements coexist in one store.
//! - An eviction listener feeds the evictions counter; a periodic sweep
//!   (driven by [`crate::shutdown::ShutdownCoordinator`]) bounds growth from
//!   keys that are never re-accessed.
//!
//! Payloads are stored as opaque `serde_json::Value`s; typed access goes
//! through serde at the boundary.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use metrics::counter;
use moka::notification::RemovalCause;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A cached payload with the metadata expiry and invalidation need
#[derive(Clone)]
pub(crate) struct CachedEntry {
    value: Arc<serde_json::Value>,
    category: Arc<str>,
    ttl: Duration,
}

/// Expiry policy reading the TTL each entry was stored with
struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedEntry,
        _updated_at: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        // A refresh replaces the entry, so its TTL restarts from the new value
        Some(value.ttl)
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    /// `hits / (hits + misses)`, `0.0` if the cache was never consulted
    pub hit_rate: f64,
}

/// Time-bounded memoization of remote-call results
pub struct CacheStore {
    config: CacheConfig,
    entries: moka::future::Cache<String, CachedEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
}

impl CacheStore {
    /// Create a cache store from configuration
    pub fn new(config: CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));

        let listener_evictions = evictions.clone();
        let entries = moka::future::Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .eviction_listener(move |_key, _value: CachedEntry, cause| {
                // Replacement is a refresh, not an eviction
                if cause != RemovalCause::Replaced {
                    listener_evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .support_invalidation_closures()
            .build();

        Self {
            config,
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
        }
    }

    /// Non-suspending lookup; `None` if absent or expired
    ///
    /// Expired entries are treated as absent even between sweeps: the
    /// underlying store checks entry age on access.
    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if !self.config.enabled {
            return None;
        }
        match self.lookup(key).await {
            Some(entry) => self.decode_or_evict(key, &entry).await,
            None => None,
        }
    }

    /// Return the cached value for `key`, or run `fetch` to produce it
    ///
    /// On a miss, exactly one concurrent caller executes `fetch`; every other
    /// caller for the same key waits for that flight and shares its outcome.
    /// A failed fetch propagates [`Error::FetchFailed`] to all waiters and
    /// leaves no entry behind. The store's internal key lock is not held while
    /// `fetch` runs, so fetches are free to suspend on the rate governor and
    /// the client pool.
    pub async fn get_or_fetch<T, F>(
        &self,
        key: &str,
        category: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        if !self.config.enabled {
            return fetch.await;
        }

        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(category));
        let owned_key = key.to_string();
        let category: Arc<str> = category.into();

        let entry = match self
            .entries
            .entry(owned_key.clone())
            .or_try_insert_with(async move {
                let value = fetch.await.map_err(|e| Error::FetchFailed {
                    key: owned_key.clone(),
                    message: e.to_string(),
                })?;
                let json = serde_json::to_value(&value).map_err(|e| Error::FetchFailed {
                    key: owned_key,
                    message: format!("result not serializable: {e}"),
                })?;
                Ok(CachedEntry {
                    value: Arc::new(json),
                    category,
                    ttl,
                })
            })
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("apigov_cache_misses_total").increment(1);
                return Err(Error::clone(&e));
            }
        };

        // `is_fresh` is true only for the caller whose fetch populated the
        // entry; everyone who joined that flight or arrived later is a hit
        if entry.is_fresh() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!("apigov_cache_misses_total").increment(1);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!("apigov_cache_hits_total").increment(1);
        }

        let cached = entry.into_value();
        match serde_json::from_value((*cached.value).clone()) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("[CACHE] evicting undecodable entry '{}': {}", key, e);
                self.entries.invalidate(key).await;
                Err(Error::cache(format!(
                    "cached value for '{key}' undecodable: {e}"
                )))
            }
        }
    }

    /// Manual insert/overwrite, used to seed entries from write results
    pub async fn set<T>(&self, key: &str, category: &str, ttl: Option<Duration>, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        if !self.config.enabled {
            return Ok(());
        }
        let json = serde_json::to_value(value).map_err(|e| Error::cache(e.to_string()))?;
        let entry = CachedEntry {
            value: Arc::new(json),
            category: category.into(),
            ttl: ttl.unwrap_or_else(|| self.config.ttl_for(category)),
        };
        self.entries.insert(key.to_string(), entry).await;
        Ok(())
    }

    /// Remove a single entry
    pub async fn invalidate(&self, key: &str) {
        self.entries.invalidate(key).await;
    }

    /// Remove every entry tagged with `category`
    pub fn invalidate_category(&self, category: &str) -> Result<()> {
        let category = category.to_string();
        self.entries
            .invalidate_entries_if(move |_key, entry| entry.category.as_ref() == category)
            .map(|_| ())
            .map_err(|e| Error::cache(format!("invalidation predicate rejected: {e}")))
    }

    /// Remove all entries
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Drive expired-entry removal; called by the periodic sweep task
    pub async fn sweep(&self) {
        self.entries.run_pending_tasks().await;
        debug!(
            "[CACHE] sweep complete, {} entries resident",
            self.entries.entry_count()
        );
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Lookup with hit/miss accounting
    async fn lookup(&self, key: &str) -> Option<CachedEntry> {
        match self.entries.get(key).await {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!("apigov_cache_hits_total").increment(1);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                counter!("apigov_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// Decode an entry, evicting it when the stored payload no longer
    /// matches the requested type so the next caller refetches
    async fn decode_or_evict<T: DeserializeOwned>(&self, key: &str, entry: &CachedEntry) -> Option<T> {
        match serde_json::from_value((*entry.value).clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("[CACHE] evicting undecodable entry '{}': {}", key, e);
                self.entries.invalidate(key).await;
                None
            }
        }
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries.entry_count())
            .finish_non_exhaustive()
    }
}

/// Build a composite cache key from a category and identifying parts
pub fn cache_key(category: &str, parts: &[&str]) -> String {
    let mut key = String::from(category);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    fn store() -> CacheStore {
        CacheStore::new(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = store();
        cache
            .set("chat_info:42", "chat_info", None, &"payload".to_string())
            .await
            .unwrap();

        let value: Option<String> = cache.get("chat_info:42").await;
        assert_eq!(value.as_deref(), Some("payload"));

        let missing: Option<String> = cache.get("chat_info:43").await;
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = store();
        cache
            .set("k", "default", Some(Duration::from_millis(80)), &1u32)
            .await
            .unwrap();

        let before: Option<u32> = cache.get("k").await;
        assert_eq!(before, Some(1));

        tokio::time::sleep(Duration::from_millis(140)).await;
        let after: Option<u32> = cache.get("k").await;
        assert!(after.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
        assert!(stats.evictions >= 1);
    }

    #[tokio::test]
    async fn test_single_flight_fetch_runs_once() {
        let cache = Arc::new(store());
        let fetches = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .get_or_fetch("dialogs:me", "dialogs", None, async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("dialog-list".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value, "dialog-list");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_not_cached_and_propagated() {
        let cache = Arc::new(store());
        let fetches = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .get_or_fetch::<String, _>("user:7", "user_info", None, async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(Error::remote("user deactivated"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::FetchFailed { .. }), "got {err:?}");
        }
        // One flight for all four callers, and the failure left no entry
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        let result = cache
            .get_or_fetch("user:7", "user_info", None, async {
                Ok("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(result, "recovered");
    }

    #[tokio::test]
    async fn test_flight_waiters_counted_as_hits() {
        let cache = Arc::new(store());
        let barrier = Arc::new(Barrier::new(6));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                cache
                    .get_or_fetch("participants:42", "participants", None, async {
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        Ok(123u64)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 123);
        }

        // One miss for the fetching caller, hits for the five that shared it
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 5);
        assert!((stats.hit_rate - 5.0 / 6.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_undecodable_entry_evicted_and_refetched() {
        let cache = store();
        cache
            .set("k", "default", None, &"not a number".to_string())
            .await
            .unwrap();

        // Type-mismatched read drops the entry instead of pinning it
        let bad: Option<u32> = cache.get("k").await;
        assert!(bad.is_none());
        let value: u32 = cache
            .get_or_fetch("k", "default", None, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        // Same recovery when the mismatch is first seen through get_or_fetch
        cache
            .set("k2", "default", None, &"still text".to_string())
            .await
            .unwrap();
        let err = cache
            .get_or_fetch::<u32, _>("k2", "default", None, async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }), "got {err:?}");
        let value: u32 = cache
            .get_or_fetch("k2", "default", None, async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_hit_skips_fetch() {
        let cache = store();
        cache
            .set("contacts:all", "contacts", None, &vec![1u64, 2, 3])
            .await
            .unwrap();

        let value: Vec<u64> = cache
            .get_or_fetch("contacts:all", "contacts", None, async {
                panic!("fetch must not run on a hit")
            })
            .await
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_invalidate_category_leaves_others() {
        let cache = store();
        cache.set("messages:1", "messages", None, &1u32).await.unwrap();
        cache.set("messages:2", "messages", None, &2u32).await.unwrap();
        cache.set("contacts:1", "contacts", None, &3u32).await.unwrap();

        cache.invalidate_category("messages").unwrap();
        cache.stats().await; // flush pending invalidations

        let gone: Option<u32> = cache.get("messages:1").await;
        let also_gone: Option<u32> = cache.get("messages:2").await;
        let kept: Option<u32> = cache.get("contacts:1").await;
        assert!(gone.is_none());
        assert!(also_gone.is_none());
        assert_eq!(kept, Some(3));
    }

    #[tokio::test]
    async fn test_stats_hit_rate() {
        let cache = store();
        cache.set("a", "default", None, &0u8).await.unwrap();

        let _: Option<u8> = cache.get("a").await;
        let _: Option<u8> = cache.get("a").await;
        let _: Option<u8> = cache.get("b").await;

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_fetches() {
        let cache = CacheStore::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            let value: u32 = cache
                .get_or_fetch("k", "default", None, async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(5)
                })
                .await
                .unwrap();
            assert_eq!(value, 5);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_key_builder() {
        assert_eq!(cache_key("chat_info", &["42"]), "chat_info:42");
        assert_eq!(
            cache_key("messages", &["42", "limit=50"]),
            "messages:42:limit=50"
        );
        assert_eq!(cache_key("dialogs", &[]), "dialogs");
    }
}
