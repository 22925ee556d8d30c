//! Default in-process cache backend.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::Result;

use super::PriceCache;

#[derive(Debug, Clone, Copy)]
struct Entry {
    price: f64,
    written_at: Instant,
}

/// Price map behind a readers-writer lock. TTL is a strict bound: a stale
/// entry is invisible to readers even before anything overwrites it.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn is_valid(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.written_at) <= self.ttl
    }
}

#[async_trait]
impl PriceCache for MemoryCache {
    async fn set(&self, pair: &str, price: f64) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(
            pair.to_string(),
            Entry {
                price,
                written_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, pair: &str) -> Result<Option<f64>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(entries
            .get(pair)
            .filter(|entry| self.is_valid(entry, now))
            .map(|entry| entry.price))
    }

    async fn set_many(&self, prices: &HashMap<String, f64>) -> Result<()> {
        // One write lock for the whole batch keeps it atomic for readers.
        let written_at = Instant::now();
        let mut entries = self.entries.write();
        for (pair, price) in prices {
            entries.insert(
                pair.clone(),
                Entry {
                    price: *price,
                    written_at,
                },
            );
        }
        Ok(())
    }

    async fn get_many(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(pairs
            .iter()
            .filter_map(|pair| {
                entries
                    .get(pair)
                    .filter(|entry| self.is_valid(entry, now))
                    .map(|entry| (pair.clone(), entry.price))
            })
            .collect())
    }

    async fn get_many_any(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        let entries = self.entries.read();
        Ok(pairs
            .iter()
            .filter_map(|pair| entries.get(pair).map(|entry| (pair.clone(), entry.price)))
            .collect())
    }

    async fn expired(&self, pairs: &[String]) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read();
        Ok(pairs
            .iter()
            .filter(|pair| {
                entries
                    .get(pair.as_str())
                    .map_or(true, |entry| !self.is_valid(entry, now))
            })
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_what_set_wrote() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("BTC/USD", 50000.0).await.unwrap();

        assert_eq!(cache.get("BTC/USD").await.unwrap(), Some(50000.0));
        assert_eq!(cache.get("ETH/USD").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_entries_are_invisible() {
        let cache = MemoryCache::new(Duration::from_millis(30));
        cache.set("BTC/USD", 50000.0).await.unwrap();
        assert_eq!(cache.get("BTC/USD").await.unwrap(), Some(50000.0));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("BTC/USD").await.unwrap(), None);
        assert_eq!(
            cache.expired(&["BTC/USD".to_string()]).await.unwrap(),
            vec!["BTC/USD".to_string()]
        );
        // Staleness hides the entry but does not delete it.
        assert_eq!(cache.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_many_then_get_many_round_trips_exactly() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let mut batch = HashMap::new();
        batch.insert("BTC/USD".to_string(), 50000.0);
        batch.insert("BTC/EUR".to_string(), 46000.5);
        batch.insert("BTC/CHF".to_string(), 44100.25);

        cache.set_many(&batch).await.unwrap();
        let keys: Vec<String> = batch.keys().cloned().collect();
        assert_eq!(cache.get_many(&keys).await.unwrap(), batch);
    }

    #[tokio::test]
    async fn newer_write_wins() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("BTC/USD", 50000.0).await.unwrap();
        cache.set("BTC/USD", 50100.0).await.unwrap();

        assert_eq!(cache.get("BTC/USD").await.unwrap(), Some(50100.0));
    }

    #[tokio::test]
    async fn expired_lists_missing_and_stale_pairs() {
        let cache = MemoryCache::new(Duration::from_millis(30));
        cache.set("BTC/USD", 50000.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.set("BTC/EUR", 46000.0).await.unwrap();

        let pairs = vec![
            "BTC/USD".to_string(),
            "BTC/EUR".to_string(),
            "ETH/USD".to_string(),
        ];
        let expired = cache.expired(&pairs).await.unwrap();
        assert_eq!(
            expired,
            vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
        );
    }

    #[tokio::test]
    async fn get_many_any_still_sees_stale_entries() {
        let cache = MemoryCache::new(Duration::from_millis(30));
        cache.set("BTC/USD", 50000.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let pairs = vec!["BTC/USD".to_string(), "ETH/USD".to_string()];
        assert!(cache.get_many(&pairs).await.unwrap().is_empty());

        let any = cache.get_many_any(&pairs).await.unwrap();
        assert_eq!(any.get("BTC/USD"), Some(&50000.0));
        assert!(!any.contains_key("ETH/USD"));
    }

    #[tokio::test]
    async fn clear_empties_the_cache() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache.set("BTC/USD", 50000.0).await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(cache.len().await.unwrap(), 0);
        assert_eq!(cache.get("BTC/USD").await.unwrap(), None);
    }
}
