//! Batch orchestration with partial-failure reporting
//!
//! [`BulkDispatcher`] runs one operation over many items: each item acquires
//! a rate permit and a pooled client, runs under a per-item deadline, and
//! retries transient failures up to a budget. One bad item never aborts the
//! batch; the caller gets a [`BulkReport`] listing exactly which items
//! succeeded and which failed, in the original submission order.
//!
//! When the remote throttles an item (FloodWait), the failure is fed back to
//! the [`RateGovernor`] so the whole category pauses instead of every item
//! discovering the backoff on its own.

use crate::config::BulkConfig;
use crate::error::{Error, Result};
use crate::pool::{ClientPool, RemoteClient};
use crate::rate::RateGovernor;
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-batch knobs; unset fields fall back to [`BulkConfig`]
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Rate category every item in the batch is charged against
    pub category: String,
    /// Concurrent in-flight items
    pub max_concurrency: Option<usize>,
    /// Per-item deadline covering permit wait, client wait and the call
    pub item_timeout: Option<Duration>,
    /// Retry budget for transient per-item failures
    pub max_retries: Option<u32>,
}

impl BulkOptions {
    pub fn new<S: Into<String>>(category: S) -> Self {
        Self {
            category: category.into(),
            max_concurrency: None,
            item_timeout: None,
            max_retries: None,
        }
    }
}

/// One item that made it through
#[derive(Debug, Clone, Serialize)]
pub struct ItemSuccess<I, V> {
    pub index: usize,
    pub item: I,
    pub value: V,
}

/// One item that exhausted its retries or failed permanently
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure<I> {
    pub index: usize,
    pub item: I,
    /// Stable tag from [`Error::kind`], e.g. `"remote_throttled"`
    pub error_kind: String,
    pub message: String,
}

/// Outcome of a batch run
///
/// `successful + failed + skipped == total` always holds; `skipped` is only
/// non-zero when the batch was cancelled mid-run.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport<I, V> {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// `successful / total`, `0.0` for an empty batch
    pub success_rate: f64,
    pub duration_seconds: f64,
    pub cancelled: bool,
    /// Successes in original submission order
    pub successful_items: Vec<ItemSuccess<I, V>>,
    /// Failures in original submission order
    pub failed_items: Vec<ItemFailure<I>>,
}

impl<I, V> BulkReport<I, V> {
    /// Every item succeeded
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

enum ItemOutcome<V> {
    Done(V),
    Failed(Error),
    Skipped,
}

/// Runs an operation over many items with bounded concurrency and retries
pub struct BulkDispatcher<C: RemoteClient> {
    rate: Arc<RateGovernor>,
    pool: ClientPool<C>,
    config: BulkConfig,
    cancel: CancellationToken,
}

impl<C: RemoteClient> BulkDispatcher<C> {
    pub fn new(
        rate: Arc<RateGovernor>,
        pool: ClientPool<C>,
        config: BulkConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rate,
            pool,
            config,
            cancel,
        }
    }

    /// Run `operation` over every item, collecting per-item outcomes
    ///
    /// Cancellation (via the token handed to [`BulkDispatcher::new`]) lets
    /// in-flight items finish and marks the not-yet-started remainder as
    /// skipped; the report still accounts for every submitted item.
    pub async fn run<I, V, Op, Fut>(
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
        let total = items.len();
        let concurrency = self.concurrency(&options);
        let started = Instant::now();
        info!(
            "[BULK] starting batch of {} items, category '{}', concurrency {}",
            total, options.category, concurrency
        );

        let operation = &operation;
        let options_ref = &options;
        let mut outcomes: Vec<(usize, I, ItemOutcome<V>)> = stream::iter(
            items.into_iter().enumerate(),
        )
        .map(|(index, item)| async move {
            if self.cancel.is_cancelled() {
                return (index, item, ItemOutcome::Skipped);
            }
            let outcome = match self.run_item(options_ref, operation, item.clone()).await {
                Ok(value) => ItemOutcome::Done(value),
                Err(e) => ItemOutcome::Failed(e),
            };
            (index, item, outcome)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut report = BulkReport {
            total,
            successful: 0,
            failed: 0,
            skipped: 0,
            success_rate: 0.0,
            duration_seconds: started.elapsed().as_secs_f64(),
            cancelled: self.cancel.is_cancelled(),
            successful_items: Vec::new(),
            failed_items: Vec::new(),
        };
        for (index, item, outcome) in outcomes {
            match outcome {
                ItemOutcome::Done(value) => {
                    report.successful += 1;
                    report.successful_items.push(ItemSuccess { index, item, value });
                }
                ItemOutcome::Failed(e) => {
                    report.failed += 1;
                    report.failed_items.push(ItemFailure {
                        index,
                        item,
                        error_kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
                ItemOutcome::Skipped => report.skipped += 1,
            }
        }
        if total > 0 {
            report.success_rate = report.successful as f64 / total as f64;
        }

        counter!("apigov_bulk_items_total", "result" => "ok").increment(report.successful as u64);
        counter!("apigov_bulk_items_total", "result" => "failed").increment(report.failed as u64);
        if report.failed > 0 || report.skipped > 0 {
            warn!(
                "[BULK] batch finished: {}/{} ok, {} failed, {} skipped in {:.2}s",
                report.successful, total, report.failed, report.skipped, report.duration_seconds
            );
        } else {
            info!(
                "[BULK] batch finished: {}/{} ok in {:.2}s",
                report.successful, total, report.duration_seconds
            );
        }
        report
    }

    async fn run_item<I, V, Op, Fut>(&self, options: &BulkOptions, operation: &Op, item: I) -> Result<V>
    where
        I: Clone + Send,
        V: Send,
        Op: Fn(Arc<C>, I) -> Fut + Sync,
        Fut: Future<Output = Result<V>> + Send,
    {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(options, operation, item.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    // Feed the remote's backoff into the governor so the
                    // whole category pauses, not just this item
                    if let Error::RemoteThrottled {
                        category,
                        retry_after,
                    } = &e
                    {
                        self.rate.report_throttled(category, *retry_after);
                    }
                    let retryable =
                        e.is_transient() && attempt <= max_retries && !self.cancel.is_cancelled();
                    if !retryable {
                        return Err(e);
                    }
                    debug!(
                        "[BULK] attempt {}/{} failed ({}), retrying: {}",
                        attempt,
                        max_retries + 1,
                        e.kind(),
                        e
                    );
                    counter!("apigov_bulk_retries_total").increment(1);
                }
            }
        }
    }

    /// One attempt: rate permit, pooled client, the call itself, all under
    /// the per-item deadline
    async fn attempt<I, V, Op, Fut>(&self, options: &BulkOptions, operation: &Op, item: I) -> Result<V>
    where
        I: Clone + Send,
        V: Send,
        Op: Fn(Arc<C>, I) -> Fut + Sync,
        Fut: Future<Output = Result<V>> + Send,
    {
        let deadline = options.item_timeout.unwrap_or_else(|| self.config.item_timeout());
        let work = async {
            self.rate.acquire(&options.category).await;
            let lease = self.pool.acquire(None).await?;
            let result = operation(lease.client(), item).await;
            self.pool.release(lease);
            result
        };
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout { elapsed: deadline }),
        }
    }

    fn concurrency(&self, options: &BulkOptions) -> usize {
        options
            .max_concurrency
            .or(match self.config.max_concurrency {
                0 => None,
                n => Some(n),
            })
            .unwrap_or_else(|| self.pool.size())
            .max(1)
    }
}
