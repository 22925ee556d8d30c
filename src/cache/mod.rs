//! Time-bounded price cache between ingestion and serving.
//!
//! Two backends satisfy one contract: the in-memory map used by default and
//! a Redis backend for deployments that want the cache to survive process
//! restarts on a shared node. An instrumentation decorator composes around
//! either without changing semantics.

mod instrumented;
mod memory;
mod redis_backend;

pub use instrumented::InstrumentedCache;
pub use memory::MemoryCache;
pub use redis_backend::RedisCache;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

/// Storage contract for last-traded prices keyed by standard pair name.
///
/// Errors are only meaningful for remote backends; the in-memory
/// implementation never fails. A `get`/`get_many` only surfaces entries
/// younger than the backend's TTL.
#[async_trait]
pub trait PriceCache: Send + Sync {
    async fn set(&self, pair: &str, price: f64) -> Result<()>;

    async fn get(&self, pair: &str) -> Result<Option<f64>>;

    /// Write a batch so observers see either all of it or none of it.
    async fn set_many(&self, prices: &HashMap<String, f64>) -> Result<()>;

    /// Valid entries for the requested pairs. Missing or stale pairs are
    /// simply absent from the result.
    async fn get_many(&self, pairs: &[String]) -> Result<HashMap<String, f64>>;

    /// Entries regardless of age. Stale entries are retained rather than
    /// deleted, and this is the accessor for the degraded path that serves
    /// them when the upstream cannot be refreshed.
    async fn get_many_any(&self, pairs: &[String]) -> Result<HashMap<String, f64>>;

    /// Pairs with no entry or a stale one.
    async fn expired(&self, pairs: &[String]) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    /// Release backend resources. Further calls may fail.
    async fn close(&self) -> Result<()>;
}
