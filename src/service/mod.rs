//! Last-traded-price service: validation, cache lookups, selective refresh
//! and response assembly.

pub mod refresher;

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::PriceCache;
use crate::error::{LtpError, Result};
use crate::pairs::PairMapper;
use crate::upstream::HybridClient;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LtpEntry {
    pub pair: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LtpResponse {
    pub ltp: Vec<LtpEntry>,
}

pub struct LtpService {
    cache: Arc<dyn PriceCache>,
    hybrid: Arc<HybridClient>,
    mapper: Arc<PairMapper>,
    /// Sorted standard pair names this deployment serves.
    configured_pairs: Vec<String>,
    /// Trips on shutdown so in-flight upstream waits stop promptly.
    shutdown: CancellationToken,
}

impl LtpService {
    pub fn new(
        cache: Arc<dyn PriceCache>,
        hybrid: Arc<HybridClient>,
        mapper: Arc<PairMapper>,
        mut configured_pairs: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        configured_pairs.sort();
        configured_pairs.dedup();
        Self {
            cache,
            hybrid,
            mapper,
            configured_pairs,
            shutdown,
        }
    }

    /// Last traded prices for the requested pairs, sorted by pair name. An
    /// empty request means the full configured set. Stale pairs are
    /// refreshed inline; a failed refresh degrades to whatever the cache
    /// still holds rather than failing the request outright.
    pub async fn get_ltp(&self, requested: &[String]) -> Result<LtpResponse> {
        let pairs = self.validate(requested)?;

        let mut prices = match self.cache.get_many(&pairs).await {
            Ok(prices) => prices,
            Err(e) => {
                warn!(error = %e, "cache read failed");
                HashMap::new()
            }
        };

        let stale = match self.cache.expired(&pairs).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "cache staleness check failed, treating all pairs as stale");
                pairs.clone()
            }
        };

        if !stale.is_empty() {
            debug!(count = stale.len(), "refreshing stale pairs");
            match self.fetch_fresh(&stale).await {
                Ok(fresh) => {
                    prices.extend(fresh);
                }
                Err(e) => {
                    warn!(error = %e, "price refresh failed, serving cached entries");
                    self.backfill_stale(&pairs, &mut prices).await;
                }
            }
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for pair in &pairs {
            match prices.get(pair) {
                Some(amount) => entries.push(LtpEntry {
                    pair: pair.clone(),
                    amount: *amount,
                }),
                None => return Err(LtpError::PriceUnavailable(pair.clone())),
            }
        }

        Ok(LtpResponse { ltp: entries })
    }

    /// Fetch and cache prices for the entire configured set. Used by the
    /// background refresher and the startup pre-warm; safe to repeat.
    pub async fn refresh_all(&self) -> Result<()> {
        let fresh = self.fetch_fresh(&self.configured_pairs).await?;
        debug!(count = fresh.len(), "refreshed configured pairs");
        Ok(())
    }

    /// Pairs this instance can actually serve right now.
    pub fn supported_pairs(&self) -> Vec<String> {
        if self.mapper.is_initialized() {
            self.configured_pairs
                .iter()
                .filter(|pair| self.mapper.is_supported(pair))
                .cloned()
                .collect()
        } else {
            self.configured_pairs.clone()
        }
    }

    /// Normalize, deduplicate and validate the requested set. Empty means
    /// everything configured.
    fn validate(&self, requested: &[String]) -> Result<Vec<String>> {
        if requested.is_empty() {
            return Ok(self.configured_pairs.clone());
        }

        let mut pairs: Vec<String> = requested.to_vec();
        pairs.sort();
        pairs.dedup();

        for pair in &pairs {
            if pair.is_empty() {
                return Err(LtpError::InvalidInput("empty pair name".to_string()));
            }
            if !self.configured_pairs.contains(pair) {
                return Err(LtpError::UnsupportedPair(pair.clone()));
            }
            if self.mapper.is_initialized() && !self.mapper.is_supported(pair) {
                return Err(LtpError::UnsupportedPair(pair.clone()));
            }
        }

        Ok(pairs)
    }

    /// Pull fresh tickers for `pairs`, translate back to standard naming,
    /// and write them through the cache.
    async fn fetch_fresh(&self, pairs: &[String]) -> Result<HashMap<String, f64>> {
        let result = self.hybrid.get_tickers(pairs, &self.shutdown).await?;

        let mut fresh = HashMap::new();
        for (upstream_name, ticker) in &result.tickers {
            let Some(std_pair) = self.mapper.from_pull(upstream_name) else {
                warn!(pair = %upstream_name, "upstream answered with an unmapped pair name");
                continue;
            };
            let Some(price) = ticker.last_price() else {
                warn!(pair = %upstream_name, "upstream ticker had no usable price");
                continue;
            };
            fresh.insert(std_pair, price);
        }

        if !fresh.is_empty() {
            if let Err(e) = self.cache.set_many(&fresh).await {
                warn!(error = %e, "cache write failed");
            }
        }

        Ok(fresh)
    }

    /// Degraded path: pull whatever entries still exist for pairs that have
    /// no valid price, stale or not.
    async fn backfill_stale(&self, pairs: &[String], prices: &mut HashMap<String, f64>) {
        let missing: Vec<String> = pairs
            .iter()
            .filter(|pair| !prices.contains_key(*pair))
            .cloned()
            .collect();
        if missing.is_empty() {
            return;
        }

        match self.cache.get_many_any(&missing).await {
            Ok(stale_prices) => {
                if !stale_prices.is_empty() {
                    warn!(count = stale_prices.len(), "serving stale cache entries");
                    prices.extend(stale_prices);
                }
            }
            Err(e) => warn!(error = %e, "stale cache read failed"),
        }
    }
}
