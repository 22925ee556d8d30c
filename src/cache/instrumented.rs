//! Metrics decorator for any cache backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;

use super::PriceCache;

/// Wraps a backend and records per-operation latency plus hit/miss counts.
/// Behavior is otherwise untouched: results and errors pass straight through.
pub struct InstrumentedCache {
    inner: Arc<dyn PriceCache>,
    backend: &'static str,
}

impl InstrumentedCache {
    pub fn new(inner: Arc<dyn PriceCache>, backend: &'static str) -> Self {
        Self { inner, backend }
    }

    fn record_latency(&self, op: &'static str, started: Instant) {
        metrics::histogram!(
            "ltp_cache_op_seconds",
            started.elapsed().as_secs_f64(),
            "op" => op,
            "backend" => self.backend,
        );
    }
}

#[async_trait]
impl PriceCache for InstrumentedCache {
    async fn set(&self, pair: &str, price: f64) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.set(pair, price).await;
        self.record_latency("set", started);
        result
    }

    async fn get(&self, pair: &str) -> Result<Option<f64>> {
        let started = Instant::now();
        let result = self.inner.get(pair).await;
        self.record_latency("get", started);

        if let Ok(found) = &result {
            let outcome = if found.is_some() { "hit" } else { "miss" };
            metrics::counter!(
                "ltp_cache_lookups_total", 1,
                "outcome" => outcome,
                "backend" => self.backend,
            );
        }
        result
    }

    async fn set_many(&self, prices: &HashMap<String, f64>) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.set_many(prices).await;
        self.record_latency("set_many", started);
        result
    }

    async fn get_many(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        let started = Instant::now();
        let result = self.inner.get_many(pairs).await;
        self.record_latency("get_many", started);

        if let Ok(found) = &result {
            let hits = found.len() as u64;
            let misses = pairs.len().saturating_sub(found.len()) as u64;
            metrics::counter!(
                "ltp_cache_lookups_total", hits,
                "outcome" => "hit",
                "backend" => self.backend,
            );
            metrics::counter!(
                "ltp_cache_lookups_total", misses,
                "outcome" => "miss",
                "backend" => self.backend,
            );
        }
        result
    }

    async fn get_many_any(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        let started = Instant::now();
        let result = self.inner.get_many_any(pairs).await;
        self.record_latency("get_many_any", started);
        result
    }

    async fn expired(&self, pairs: &[String]) -> Result<Vec<String>> {
        let started = Instant::now();
        let result = self.inner.expired(pairs).await;
        self.record_latency("expired", started);
        result
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn len(&self) -> Result<usize> {
        self.inner.len().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::time::Duration;

    #[tokio::test]
    async fn decorator_preserves_backend_semantics() {
        let inner = Arc::new(MemoryCache::new(Duration::from_secs(60)));
        let cache = InstrumentedCache::new(inner, "memory");

        cache.set("BTC/USD", 50000.0).await.unwrap();
        assert_eq!(cache.get("BTC/USD").await.unwrap(), Some(50000.0));
        assert_eq!(cache.get("ETH/USD").await.unwrap(), None);

        let mut batch = HashMap::new();
        batch.insert("BTC/EUR".to_string(), 46000.0);
        cache.set_many(&batch).await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.len().await.unwrap(), 0);
    }
}
