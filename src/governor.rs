//! Top-level facade wiring cache, rate control, pooling and bulk dispatch
//!
//! [`ApiGovernor`] owns one of each component and routes every remote call
//! through the same discipline: consult the cache, acquire a category rate
//! permit, lease a pooled client, run the call, feed throttle signals back.
//! It also owns the background cache sweep and a single shutdown path that
//! drains everything in order.

use crate::bulk::{BulkDispatcher, BulkOptions, BulkReport};
use crate::cache::{CacheStats, CacheStore};
use crate::config::GovernorConfig;
use crate::error::{Error, Result};
use crate::pool::{ClientPool, PoolHealth, PoolStats, RemoteClient};
use crate::rate::{GovernorStats, RateGovernor};
use crate::shutdown::ShutdownCoordinator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Aggregated statistics across every component
#[derive(Debug, Clone, Serialize)]
pub struct GovernorSnapshot {
    pub cache: CacheStats,
    pub rate: GovernorStats,
    pub pool: PoolStats,
}

/// The governance layer: every remote call goes through here
pub struct ApiGovernor<C: RemoteClient> {
    config: GovernorConfig,
    cache: Arc<CacheStore>,
    rate: Arc<RateGovernor>,
    pool: ClientPool<C>,
    bulk: BulkDispatcher<C>,
    coordinator: ShutdownCoordinator,
}

impl<C: RemoteClient> ApiGovernor<C> {
    /// Build every component and start the background cache sweep
    ///
    /// `factory` is called once per pool slot to create the remote clients.
    pub async fn initialize<F, Fut>(config: GovernorConfig, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        let rate = Arc::new(RateGovernor::new(config.rate.clone()));
        let pool = ClientPool::initialize(config.pool.clone(), factory).await?;
        let coordinator = ShutdownCoordinator::new();
        let bulk = BulkDispatcher::new(
            rate.clone(),
            pool.clone(),
            config.bulk.clone(),
            coordinator.child_token(),
        );

        if config.cache.enabled {
            let sweep_cache = cache.clone();
            coordinator.spawn_periodic("cache-sweep", config.cache.sweep_interval(), move || {
                let cache = sweep_cache.clone();
                async move { cache.sweep().await }
            });
        }

        info!(
            "[GOVERNOR] initialized: {} clients, {} rate categories, cache {}",
            pool.size(),
            config.rate.categories.len(),
            if config.cache.enabled { "on" } else { "off" }
        );
        Ok(Self {
            config,
            cache,
            rate,
            pool,
            bulk,
            coordinator,
        })
    }

    /// Run one governed remote call: rate permit, pooled client, throttle feedback
    pub async fn call<T, Op, Fut>(&self, category: &str, op: Op) -> Result<T>
    where
        Op: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.coordinator.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        self.rate.acquire(category).await;
        let result = self.pool.execute(op).await;
        if let Err(Error::RemoteThrottled {
            category,
            retry_after,
        }) = &result
        {
            self.rate.report_throttled(category, *retry_after);
        }
        result
    }

    /// Governed call memoized under `key`
    ///
    /// On a cache hit the remote is never touched and no rate permit is
    /// spent. On a miss exactly one concurrent caller per key runs the
    /// governed call; its failure reaches every waiter and is not cached.
    pub async fn cached_call<T, Op, Fut>(&self, key: &str, category: &str, op: Op) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        Op: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.coordinator.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        self.cache
            .get_or_fetch(key, category, None, self.call(category, op))
            .await
    }

    /// Run `operation` over every item with per-item governance and retries
    pub async fn run_bulk<I, V, Op, Fut>(
        &self,
        items: Vec<I>,
        options: BulkOptions,
        operation: Op,
    ) -> BulkReport<I, V>
    where
        I: Clone + Send,
        V: Send,
        Op: Fn(Arc<C>, I) -> Fut + Sync,
        Fut: Future<Output = Result<V>> + Send,
    {
        self.bulk.run(items, options, operation).await
    }

    /// Drop a cached entry, typically after a write made it stale
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Drop every cached entry of a category
    pub fn invalidate_category(&self, category: &str) -> Result<()> {
        self.cache.invalidate_category(category)
    }

    /// Probe every pooled client
    pub async fn health(&self) -> PoolHealth {
        self.pool.health_check().await
    }

    /// Aggregated statistics snapshot
    pub async fn stats(&self) -> GovernorSnapshot {
        GovernorSnapshot {
            cache: self.cache.stats().await,
            rate: self.rate.stats(),
            pool: self.pool.stats(),
        }
    }

    /// The cache component
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// The rate governor component
    pub fn rate(&self) -> &RateGovernor {
        &self.rate
    }

    /// The client pool component
    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }

    /// The configuration this governor was built with
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Stop admitting work, cancel batches, drain the pool, stop the sweep
    ///
    /// Returns `true` when background tasks and pool leases all drained
    /// within the configured grace period.
    pub async fn shutdown(&self) -> bool {
        info!("[GOVERNOR] shutting down");
        let grace = self.config.pool.shutdown_grace();
        // Cancel batches and the sweep first so the pool can actually drain
        let tasks_done = self.coordinator.shutdown(grace).await;
        let pool_done = self.pool.shutdown(Some(grace)).await;
        info!(
            "[GOVERNOR] shutdown complete (tasks drained: {}, pool drained: {})",
            tasks_done, pool_done
        );
        tasks_done && pool_done
    }
}
