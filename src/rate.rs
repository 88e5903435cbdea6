//! Multi-category token-bucket admission control
//!
//! Every remote call acquires a permit for its operation category (read,
//! write, media, ...) before touching the upstream service. Buckets refill
//! lazily from elapsed wall-clock time, so there is no tick timer to drift or
//! jitter. When the remote signals throttling (the FloodWait case),
//! [`RateGovernor::report_throttled`] pauses a single category without
//! touching the others.
//!
//! Fairness: waiters on one category queue on a `tokio::sync::Mutex`, whose
//! wakeups are first-come-first-served, so a burst of callers is admitted in
//! arrival order instead of racing on wake. The numeric bucket state lives in
//! a separate `std::sync::Mutex` that is never held across an await.

use crate::config::{BucketConfig, RateConfig};
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Numeric bucket state; mutated only under its lock, never across an await
struct BucketState {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
    throttle_until: Option<Instant>,
}

impl BucketState {
    fn new(config: BucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
            // A fresh bucket allows a full burst
            tokens: config.capacity,
            last_refill: Instant::now(),
            throttle_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report the minimal wait until one is available
    fn try_admit(&mut self, now: Instant) -> Option<Duration> {
        self.refill(now);
        if let Some(until) = self.throttle_until {
            if until > now {
                return Some(until - now);
            }
            self.throttle_until = None;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64(
                (1.0 - self.tokens) / self.refill_per_second,
            ))
        }
    }
}

/// One category's bucket plus its admission queue and counters
struct RateBucket {
    category: String,
    /// FIFO admission queue; held across the wait so arrival order is served order
    admission: tokio::sync::Mutex<()>,
    state: Mutex<BucketState>,
    waiters: AtomicUsize,
    total_granted: AtomicU64,
    delayed_requests: AtomicU64,
    flood_wait_count: AtomicU64,
    total_waited_micros: AtomicU64,
}

/// Decrements the waiter gauge even when the acquire future is dropped
/// mid-wait (caller-imposed deadline), so no queue slot leaks.
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl RateBucket {
    fn new(category: &str, config: BucketConfig) -> Self {
        Self {
            category: category.to_string(),
            admission: tokio::sync::Mutex::new(()),
            state: Mutex::new(BucketState::new(config)),
            waiters: AtomicUsize::new(0),
            total_granted: AtomicU64::new(0),
            delayed_requests: AtomicU64::new(0),
            flood_wait_count: AtomicU64::new(0),
            total_waited_micros: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn admit(&self) {
        let started = Instant::now();
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let _waiter = WaiterGuard(&self.waiters);
        let _queue_slot = self.admission.lock().await;

        let mut delayed = false;
        loop {
            let wait = self.state().try_admit(Instant::now());
            match wait {
                None => break,
                Some(duration) => {
                    if !delayed {
                        delayed = true;
                        self.delayed_requests.fetch_add(1, Ordering::Relaxed);
                        counter!("apigov_rate_delayed_total", "category" => self.category.clone())
                            .increment(1);
                    }
                    debug!(
                        "[RATE] '{}' waiting {:?} for a token",
                        self.category, duration
                    );
                    tokio::time::sleep(duration).await;
                }
            }
        }

        self.total_granted.fetch_add(1, Ordering::Relaxed);
        self.total_waited_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }
}

/// Per-category statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub tokens: f64,
    pub capacity: f64,
    pub waiters: usize,
    pub total_granted: u64,
    pub total_waited_seconds: f64,
    pub delayed_requests: u64,
    pub flood_wait_count: u64,
    pub throttled: bool,
}

/// Statistics for all categories
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStats {
    pub categories: BTreeMap<String, BucketStats>,
}

/// Per-category token-bucket admission control with reactive backoff
pub struct RateGovernor {
    buckets: DashMap<String, Arc<RateBucket>>,
    fallback: BucketConfig,
}

impl RateGovernor {
    /// Create a governor with one bucket per configured category
    pub fn new(config: RateConfig) -> Self {
        let buckets = DashMap::new();
        for (category, bucket) in &config.categories {
            buckets.insert(category.clone(), Arc::new(RateBucket::new(category, *bucket)));
        }
        Self {
            buckets,
            fallback: config.fallback,
        }
    }

    /// Acquire one permit for `category`, suspending until admitted
    ///
    /// Does not time out by design; callers needing a bound wrap this in
    /// their own deadline. A caller dropped mid-wait leaves no queue slot
    /// behind.
    pub async fn acquire(&self, category: &str) {
        let bucket = self.bucket(category);
        bucket.admit().await;
    }

    /// Pause admission for `category` because the remote asked us to back off
    ///
    /// Other categories are unaffected. Overlapping reports keep the furthest
    /// deadline.
    pub fn report_throttled(&self, category: &str, retry_after: Duration) {
        let bucket = self.bucket(category);
        let until = Instant::now() + retry_after;
        {
            let mut state = bucket.state();
            state.throttle_until = Some(match state.throttle_until {
                Some(existing) if existing > until => existing,
                _ => until,
            });
        }
        bucket.flood_wait_count.fetch_add(1, Ordering::Relaxed);
        counter!("apigov_rate_flood_waits_total", "category" => category.to_string()).increment(1);
        warn!(
            "[RATE] remote throttled '{}', pausing admission for {:?}",
            category, retry_after
        );
    }

    /// Create or reshape a category bucket; idempotent
    ///
    /// Degenerate shapes are rejected up front: a zero or negative refill
    /// rate would leave waiters computing an unbounded sleep.
    pub fn configure(&self, category: &str, capacity: f64, refill_per_second: f64) -> Result<()> {
        if !capacity.is_finite() || capacity < 1.0 {
            return Err(Error::invalid_argument(format!(
                "rate bucket '{category}': capacity must be at least 1"
            )));
        }
        if !refill_per_second.is_finite() || refill_per_second <= 0.0 {
            return Err(Error::invalid_argument(format!(
                "rate bucket '{category}': refill_per_second must be positive"
            )));
        }
        let config = BucketConfig {
            capacity,
            refill_per_second,
        };
        match self.buckets.entry(category.to_string()) {
            Entry::Occupied(existing) => {
                let mut state = existing.get().state();
                state.capacity = capacity;
                state.refill_per_second = refill_per_second;
                state.tokens = state.tokens.min(capacity);
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RateBucket::new(category, config)));
            }
        }
        Ok(())
    }

    /// Statistics snapshot for every known category
    pub fn stats(&self) -> GovernorStats {
        let now = Instant::now();
        let mut categories = BTreeMap::new();
        for entry in self.buckets.iter() {
            let bucket = entry.value();
            let (tokens, capacity, throttled) = {
                let mut state = bucket.state();
                state.refill(now);
                (
                    state.tokens,
                    state.capacity,
                    state.throttle_until.is_some_and(|until| until > now),
                )
            };
            categories.insert(
                entry.key().clone(),
                BucketStats {
                    tokens,
                    capacity,
                    waiters: bucket.waiters.load(Ordering::Relaxed),
                    total_granted: bucket.total_granted.load(Ordering::Relaxed),
                    total_waited_seconds: bucket.total_waited_micros.load(Ordering::Relaxed)
                        as f64
                        / 1_000_000.0,
                    delayed_requests: bucket.delayed_requests.load(Ordering::Relaxed),
                    flood_wait_count: bucket.flood_wait_count.load(Ordering::Relaxed),
                    throttled,
                },
            );
        }
        GovernorStats { categories }
    }

    /// Bucket for a category, falling back to the conservative default bucket
    fn bucket(&self, category: &str) -> Arc<RateBucket> {
        if let Some(bucket) = self.buckets.get(category) {
            return bucket.clone();
        }
        debug!(
            "[RATE] category '{}' not configured, using fallback bucket",
            category
        );
        self.buckets
            .entry(category.to_string())
            .or_insert_with(|| Arc::new(RateBucket::new(category, self.fallback)))
            .clone()
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("categories", &self.buckets.len())
            .finish_non_exhaustive()
    }
}
