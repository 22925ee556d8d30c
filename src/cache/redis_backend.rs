//! Redis cache backend.
//!
//! Redis owns eviction through per-key TTLs; the reader still checks the
//! stored write time so a node with a skewed clock cannot serve an entry
//! older than the configured bound.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{LtpError, Result};

use super::PriceCache;

const KEY_PREFIX: &str = "ltp:price:";

#[derive(Debug, Serialize, Deserialize)]
struct StoredPrice {
    price: f64,
    /// Wall-clock write time; used for the defensive age check.
    written_at_ms: i64,
}

pub struct RedisCache {
    manager: ConnectionManager,
    ttl: Duration,
}

impl RedisCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LtpError::Config(format!("invalid redis url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis connect failed: {e}")))?;

        Ok(Self { manager, ttl })
    }

    fn key(pair: &str) -> String {
        format!("{KEY_PREFIX}{pair}")
    }

    fn encode(&self, price: f64) -> Result<String> {
        let stored = StoredPrice {
            price,
            written_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        serde_json::to_string(&stored)
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("encode cache entry: {e}")))
    }

    fn decode(&self, raw: &str) -> Option<f64> {
        decode_entry(raw, self.ttl)
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis().max(1) as u64
    }
}

#[async_trait]
impl PriceCache for RedisCache {
    async fn set(&self, pair: &str, price: f64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PSETEX")
            .arg(Self::key(pair))
            .arg(self.ttl_ms())
            .arg(self.encode(price)?)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis set {pair}: {e}")))
    }

    async fn get(&self, pair: &str) -> Result<Option<f64>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(pair))
            .query_async(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis get {pair}: {e}")))?;

        Ok(raw.and_then(|raw| self.decode(&raw)))
    }

    async fn set_many(&self, prices: &HashMap<String, f64>) -> Result<()> {
        if prices.is_empty() {
            return Ok(());
        }

        // MULTI/EXEC so readers never observe a half-written batch.
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (pair, price) in prices {
            pipe.cmd("PSETEX")
                .arg(Self::key(pair))
                .arg(self.ttl_ms())
                .arg(self.encode(*price)?)
                .ignore();
        }

        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis set_many: {e}")))
    }

    async fn get_many(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }

        let mut cmd = redis::cmd("MGET");
        for pair in pairs {
            cmd.arg(Self::key(pair));
        }

        let mut conn = self.manager.clone();
        let raws: Vec<Option<String>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis get_many: {e}")))?;

        Ok(pairs
            .iter()
            .zip(raws)
            .filter_map(|(pair, raw)| {
                raw.and_then(|raw| self.decode(&raw))
                    .map(|price| (pair.clone(), price))
            })
            .collect())
    }

    async fn get_many_any(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }

        // Redis already evicted anything past its TTL; skip the defensive
        // age check so a backend-retained entry can serve the degraded path.
        let mut cmd = redis::cmd("MGET");
        for pair in pairs {
            cmd.arg(Self::key(pair));
        }

        let mut conn = self.manager.clone();
        let raws: Vec<Option<String>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis get_many_any: {e}")))?;

        Ok(pairs
            .iter()
            .zip(raws)
            .filter_map(|(pair, raw)| {
                let stored: StoredPrice = serde_json::from_str(&raw?).ok()?;
                Some((pair.clone(), stored.price))
            })
            .collect())
    }

    async fn expired(&self, pairs: &[String]) -> Result<Vec<String>> {
        let valid = self.get_many(pairs).await?;
        Ok(pairs
            .iter()
            .filter(|pair| !valid.contains_key(pair.as_str()))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{KEY_PREFIX}*"))
            .query_async(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis clear scan: {e}")))?;

        if keys.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis clear: {e}")))
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{KEY_PREFIX}*"))
            .query_async(&mut conn)
            .await
            .map_err(|e| LtpError::Internal(anyhow::anyhow!("redis len: {e}")))?;
        Ok(keys.len())
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager has no explicit shutdown; dropping closes it.
        Ok(())
    }
}

/// Decode an entry, treating undecodable or over-age payloads as absent.
fn decode_entry(raw: &str, ttl: Duration) -> Option<f64> {
    let stored: StoredPrice = serde_json::from_str(raw).ok()?;
    let age_ms = chrono::Utc::now()
        .timestamp_millis()
        .saturating_sub(stored.written_at_ms);
    if age_ms < 0 || age_ms as u128 > ttl.as_millis() {
        return None;
    }
    Some(stored.price)
}
