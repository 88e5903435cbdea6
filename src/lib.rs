//! Resource governance for rate-limited remote APIs
//!
//! Four cooperating components keep a client within a remote service's
//! limits while staying responsive:
//!
//! - [`cache::CacheStore`] memoizes call results with per-category TTLs and
//!   single-flight fetch de-duplication
//! - [`rate::RateGovernor`] enforces per-category token buckets and reacts
//!   to server-side throttle signals (FloodWait)
//! - [`pool::ClientPool`] hands out exclusive leases on a bounded set of
//!   connected clients, FIFO and health-checked
//! - [`bulk::BulkDispatcher`] runs batches with bounded concurrency,
//!   per-item retries and partial-failure reporting
//!
//! [`governor::ApiGovernor`] wires them together behind one call surface.

pub mod bulk;
pub mod cache;
pub mod config;
pub mod error;
pub mod governor;
pub mod pool;
pub mod rate;
pub mod shutdown;

pub use bulk::{BulkDispatcher, BulkOptions, BulkReport};
pub use cache::{cache_key, CacheStats, CacheStore};
pub use config::GovernorConfig;
pub use error::{Error, Result};
pub use governor::{ApiGovernor, GovernorSnapshot};
pub use pool::{ClientLease, ClientPool, RemoteClient};
pub use rate::RateGovernor;
pub use shutdown::ShutdownCoordinator;
