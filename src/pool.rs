//! Bounded pool of reusable remote-connection handles
//!
//! Clients are created eagerly at startup and handed out as exclusive leases.
//! Acquisition is FIFO (a tokio semaphore queues waiters in arrival order),
//! bounded by a timeout, and every handle recovered from the idle set passes
//! a cheap health check first; an unhealthy handle is reconnected in place
//! before a caller ever sees it.
//!
//! Leases are RAII: the explicit [`ClientPool::release`] is the happy path,
//! and a lease dropped without release still returns its slot so a cancelled
//! caller (timeout, task abort) can never leak pool capacity.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The remote connection handle boundary
///
/// The pool only cares about connection lifecycle; everything else the remote
/// protocol offers stays behind the concrete client type.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// Cheap liveness probe, called before a handle is leased out
    async fn is_connected(&self) -> bool;
    /// (Re)establish the connection
    async fn connect(&self) -> Result<()>;
    /// Tear the connection down; called during pool shutdown
    async fn disconnect(&self);
}

struct IdleClient<C> {
    id: u64,
    client: Arc<C>,
}

struct PoolInner<C: RemoteClient> {
    config: PoolConfig,
    /// Every client ever created; health reports iterate this
    clients: Vec<Arc<C>>,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleClient<C>>>,
    /// Ids currently out on lease, with lease start time
    leased: DashMap<u64, Instant>,
    closing: CancellationToken,
    waiters: AtomicUsize,
    total_acquisitions: AtomicU64,
    reconnects: AtomicU64,
}

impl<C: RemoteClient> PoolInner<C> {
    fn idle_queue(&self) -> MutexGuard<'_, VecDeque<IdleClient<C>>> {
        match self.idle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn return_slot(&self, slot: IdleClient<C>, permit: Option<OwnedSemaphorePermit>) {
        if self.leased.remove(&slot.id).is_none() {
            warn!("[POOL] returning client {} that was not leased", slot.id);
        }
        if !self.closing.is_cancelled() {
            // Push before freeing the permit so the woken waiter finds a slot
            self.idle_queue().push_back(slot);
        }
        drop(permit);
    }
}

/// Exclusive lease on a pooled client
///
/// Return it with [`ClientPool::release`]; dropping it also returns the slot.
pub struct ClientLease<C: RemoteClient> {
    slot: Option<IdleClient<C>>,
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<PoolInner<C>>,
}

impl<C: RemoteClient> ClientLease<C> {
    /// Identity of the leased client
    pub fn id(&self) -> u64 {
        self.slot().id
    }

    /// Shared handle to the leased client
    pub fn client(&self) -> Arc<C> {
        self.slot().client.clone()
    }

    fn slot(&self) -> &IdleClient<C> {
        // Invariant: the slot is present until release/drop consumes the lease
        self.slot.as_ref().expect("lease already returned")
    }

    fn give_back(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.inner.return_slot(slot, self.permit.take());
        }
    }
}

impl<C: RemoteClient> std::ops::Deref for ClientLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.slot().client.as_ref()
    }
}

impl<C: RemoteClient> std::fmt::Debug for ClientLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease")
            .field("client_id", &self.slot.as_ref().map(|s| s.id))
            .finish_non_exhaustive()
    }
}

impl<C: RemoteClient> Drop for ClientLease<C> {
    fn drop(&mut self) {
        if let Some(id) = self.slot.as_ref().map(|s| s.id) {
            warn!("[POOL] lease on client {} returned on drop, not released", id);
            self.give_back();
        }
    }
}

/// Decrements the waiter gauge when an acquire future is dropped mid-wait
struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiters: usize,
    pub total_acquisitions: u64,
    pub reconnects: u64,
}

/// Per-client health report
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Bounded pool of remote clients with fair acquisition
pub struct ClientPool<C: RemoteClient> {
    inner: Arc<PoolInner<C>>,
}

// Hand-rolled so cloning the pool handle never requires `C: Clone`
impl<C: RemoteClient> Clone for ClientPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: RemoteClient> ClientPool<C> {
    /// Eagerly create `config.size` clients via `factory`
    ///
    /// Individual construction failures are tolerated down to
    /// `config.min_clients`; below that the pool refuses to start.
    pub async fn initialize<F, Fut>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn(usize) -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        config.validate()?;
        info!("[POOL] initializing {} clients", config.size);

        let mut clients = Vec::new();
        let mut idle = VecDeque::new();
        for i in 0..config.size {
            match factory(i).await {
                Ok(client) => {
                    let client = Arc::new(client);
                    let id = clients.len() as u64;
                    clients.push(client.clone());
                    idle.push_back(IdleClient { id, client });
                }
                Err(e) => {
                    warn!("[POOL] failed to create client {}: {}", i, e);
                }
            }
        }

        if clients.len() < config.min_clients {
            return Err(Error::pool_init(format!(
                "created {}/{} clients, minimum is {}",
                clients.len(),
                config.size,
                config.min_clients
            )));
        }
        info!("[POOL] initialized with {}/{} clients", clients.len(), config.size);

        let permits = clients.len();
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                clients,
                semaphore: Arc::new(Semaphore::new(permits)),
                idle: Mutex::new(idle),
                leased: DashMap::new(),
                closing: CancellationToken::new(),
                waiters: AtomicUsize::new(0),
                total_acquisitions: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        })
    }

    /// Number of clients the pool actually holds
    pub fn size(&self) -> usize {
        self.inner.clients.len()
    }

    /// Lease an idle, healthy client, waiting FIFO up to `timeout`
    ///
    /// `None` uses the configured default timeout. An unhealthy client is
    /// reconnected in place before being returned; the caller only sees
    /// [`Error::ClientUnhealthy`] when that reconnect fails.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<ClientLease<C>> {
        let inner = &self.inner;
        if inner.closing.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let wait = timeout.unwrap_or_else(|| inner.config.acquire_timeout());
        inner.waiters.fetch_add(1, Ordering::Relaxed);
        let waiter = WaiterGuard(&inner.waiters);

        let permit =
            match tokio::time::timeout(wait, inner.semaphore.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_closed)) => return Err(Error::ShuttingDown),
                Err(_elapsed) => {
                    counter!("apigov_pool_exhausted_total").increment(1);
                    return Err(Error::PoolExhausted { waited: wait });
                }
            };
        drop(waiter);

        // One idle slot exists per permit, unless shutdown drained the queue
        let Some(slot) = inner.idle_queue().pop_front() else {
            return Err(Error::ShuttingDown);
        };

        inner.leased.insert(slot.id, Instant::now());
        let mut lease = ClientLease {
            slot: Some(slot),
            permit: Some(permit),
            inner: inner.clone(),
        };

        if !lease.client().is_connected().await {
            warn!("[POOL] client {} unhealthy, reconnecting", lease.id());
            match lease.client().connect().await {
                Ok(()) => {
                    inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    debug!("[POOL] client {} reconnected", lease.id());
                }
                Err(e) => {
                    let client_id = lease.id();
                    lease.give_back();
                    return Err(Error::ClientUnhealthy {
                        client_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        inner.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        counter!("apigov_pool_acquisitions_total").increment(1);
        Ok(lease)
    }

    /// Return a lease to the pool and wake the oldest waiter
    ///
    /// Double release is unrepresentable (release consumes the lease); a
    /// lease from a different pool is rejected here and finds its way home
    /// through its own drop path.
    pub fn release(&self, mut lease: ClientLease<C>) {
        if !Arc::ptr_eq(&self.inner, &lease.inner) {
            warn!("[POOL] rejecting release of a lease from another pool");
            return;
        }
        lease.give_back();
    }

    /// Acquire, run `op`, release; the borrow-free convenience path
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.acquire(None).await?;
        let result = op(lease.client()).await;
        self.release(lease);
        result
    }

    /// Probe every client the pool holds
    pub async fn health_check(&self) -> PoolHealth {
        let mut healthy = 0;
        let mut unhealthy = 0;
        for client in &self.inner.clients {
            if client.is_connected().await {
                healthy += 1;
            } else {
                unhealthy += 1;
            }
        }
        PoolHealth {
            total: self.inner.clients.len(),
            healthy,
            unhealthy,
            idle: self.inner.idle_queue().len(),
            busy: self.inner.leased.len(),
        }
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_size: self.inner.clients.len(),
            idle: self.inner.idle_queue().len(),
            busy: self.inner.leased.len(),
            waiters: self.inner.waiters.load(Ordering::Relaxed),
            total_acquisitions: self.inner.total_acquisitions.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop admissions, wait up to `grace` for leases to return, then close
    ///
    /// Returns `true` when every lease came back within the grace period.
    /// Clients abandoned past the grace period are disconnected anyway, so
    /// shutdown never hangs on a leaked lease.
    pub async fn shutdown(&self, grace: Option<Duration>) -> bool {
        let inner = &self.inner;
        let grace = grace.unwrap_or_else(|| inner.config.shutdown_grace());
        info!(
            "[POOL] shutting down, {} leases outstanding, {}s grace",
            inner.leased.len(),
            grace.as_secs()
        );
        inner.closing.cancel();
        inner.semaphore.close();

        let deadline = Instant::now() + grace;
        let completed = loop {
            if inner.leased.is_empty() {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        };

        if !completed {
            warn!(
                "[POOL] grace period expired, force-closing {} leased clients",
                inner.leased.len()
            );
        }

        inner.idle_queue().clear();
        for client in &inner.clients {
            client.disconnect().await;
        }
        info!("[POOL] shutdown complete");
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct MockClient {
        connected: AtomicBool,
        fail_connect: bool,
        connects: AtomicUsize,
    }

    impl MockClient {
        fn new() -> Self {
            Self {
                connected: AtomicBool::new(true),
                fail_connect: false,
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteClient for MockClient {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(Error::remote("dial refused"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
    }

    fn pool_config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            min_clients: 1,
            acquire_timeout_seconds: 1,
            shutdown_grace_seconds: 1,
        }
    }

    async fn make_pool(size: usize) -> ClientPool<MockClient> {
        ClientPool::initialize(pool_config(size), |_| async { Ok(MockClient::new()) })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_and_stats() {
        let pool = make_pool(3).await;
        let stats = pool.stats();
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.waiters, 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_below_minimum() {
        let config = PoolConfig {
            size: 3,
            min_clients: 2,
            ..pool_config(3)
        };
        let created = AtomicUsize::new(0);
        let result = ClientPool::<MockClient>::initialize(config, |_| {
            let n = created.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(MockClient::new())
                } else {
                    Err(Error::remote("no sockets left"))
                }
            }
        })
        .await;
        assert!(matches!(result, Err(Error::PoolInit { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_waits_for_release() {
        let pool = make_pool(2).await;
        let first = pool.acquire(None).await.unwrap();
        let _second = pool.acquire(None).await.unwrap();

        let contended = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Some(Duration::from_secs(30))).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!contended.is_finished());
        assert_eq!(pool.stats().waiters, 1);

        pool.release(first);
        let lease = contended.await.unwrap().unwrap();
        assert_eq!(pool.stats().busy, 2);
        pool.release(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_is_pool_exhausted() {
        let pool = make_pool(1).await;
        let _held = pool.acquire(None).await.unwrap();

        let err = pool
            .acquire(Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        // The timed-out waiter left no queue slot behind
        assert_eq!(pool.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_client_reconnected_transparently() {
        let pool = make_pool(1).await;
        let lease = pool.acquire(None).await.unwrap();
        lease.client().connected.store(false, Ordering::SeqCst);
        pool.release(lease);

        let lease = pool.acquire(None).await.unwrap();
        assert!(lease.client().is_connected().await);
        assert_eq!(lease.client().connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().reconnects, 1);
    }

    #[tokio::test]
    async fn test_failed_reconnect_surfaces_unhealthy() {
        let pool = ClientPool::initialize(pool_config(1), |_| async {
            Ok(MockClient {
                connected: AtomicBool::new(false),
                fail_connect: true,
                connects: AtomicUsize::new(0),
            })
        })
        .await
        .unwrap();

        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, Error::ClientUnhealthy { .. }));
        // The slot went back, so the pool is not depleted
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_returns_slot() {
        let pool = make_pool(1).await;
        {
            let _lease = pool.acquire(None).await.unwrap();
            assert_eq!(pool.stats().busy, 1);
        }
        assert_eq!(pool.stats().busy, 0);
        let lease = pool.acquire(None).await.unwrap();
        assert!(format!("{lease:?}").contains("client_id"));
        pool.release(lease);
    }

    #[tokio::test]
    async fn test_release_to_wrong_pool_rejected() {
        let pool_a = make_pool(1).await;
        let pool_b = make_pool(1).await;

        let lease_b = pool_b.acquire(None).await.unwrap();
        pool_a.release(lease_b);

        // The misdirected lease went home through its drop path
        assert_eq!(pool_b.stats().busy, 0);
        let lease = pool_b.acquire(None).await.unwrap();
        pool_b.release(lease);
    }

    #[tokio::test]
    async fn test_execute_releases_after_op() {
        let pool = make_pool(1).await;
        let value = pool
            .execute(|client| async move {
                assert!(client.is_connected().await);
                Ok(99u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 99);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reclaims_abandoned_lease() {
        let pool = make_pool(2).await;
        let abandoned = pool.acquire(None).await.unwrap();

        let started = Instant::now();
        let completed = pool.shutdown(Some(Duration::from_millis(300))).await;
        assert!(!completed);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(2));

        // Pool refuses new work after shutdown
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown));
        drop(abandoned);
    }

    #[tokio::test]
    async fn test_shutdown_clean_when_leases_returned() {
        let pool = make_pool(2).await;
        let lease = pool.acquire(None).await.unwrap();
        pool.release(lease);

        let completed = pool.shutdown(Some(Duration::from_millis(100))).await;
        assert!(completed);
        let health = pool.health_check().await;
        assert_eq!(health.unhealthy, 2);
    }
}
