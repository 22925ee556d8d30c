//! Environment-driven service configuration.
//!
//! Every knob has a sensible default so the service starts with nothing but
//! `KRAKEN_*` reachability. Invalid values fail startup rather than being
//! silently replaced.

use anyhow::{bail, Context, Result};
use std::time::Duration;

/// Which backend holds the price cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Standard-form pairs this deployment serves, sorted and deduplicated.
    pub supported_pairs: Vec<String>,

    pub cache_ttl: Duration,
    pub cache_refresh_interval: Duration,
    pub cache_backend: CacheBackend,
    pub redis_url: Option<String>,

    pub rest_base_url: String,
    pub rest_timeout: Duration,
    pub rest_max_retries: u32,
    pub rest_base_backoff: Duration,

    pub ws_enabled: bool,
    pub ws_url: String,
    pub ws_ping_interval: Duration,
    pub ws_pong_timeout: Duration,
    pub ws_reconnect_delay: Duration,
    pub ws_max_reconnect_tries: u32,

    pub rate_limit_enabled: bool,
    pub rate_limit_conservative: bool,
    pub rate_limit_capacity: Option<u32>,
    pub rate_limit_refill_rate: Option<u32>,
    pub rate_limit_refill_period: Option<Duration>,

    pub mapper_refresh_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = env_parse("LTP_PORT", 8080u16)?;

        let mut supported_pairs: Vec<String> = std::env::var("LTP_SUPPORTED_PAIRS")
            .unwrap_or_else(|_| "BTC/USD,BTC/EUR,BTC/CHF".to_string())
            .split(',')
            .map(|s| s.trim().to_ascii_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        supported_pairs.sort();
        supported_pairs.dedup();

        if supported_pairs.is_empty() {
            bail!("LTP_SUPPORTED_PAIRS must name at least one pair");
        }
        for pair in &supported_pairs {
            if pair.split('/').filter(|part| !part.is_empty()).count() != 2 {
                bail!("malformed pair {pair:?} in LTP_SUPPORTED_PAIRS (expected BASE/QUOTE)");
            }
        }

        let cache_backend = match std::env::var("CACHE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" => CacheBackend::Memory,
            "redis" => CacheBackend::Redis,
            other => bail!("unknown CACHE_BACKEND {other:?} (expected memory or redis)"),
        };

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        if cache_backend == CacheBackend::Redis && redis_url.is_none() {
            bail!("CACHE_BACKEND=redis requires REDIS_URL");
        }

        let rate_limit_capacity = env_parse_opt::<u32>("RATE_LIMIT_CAPACITY")?;
        let rate_limit_refill_rate = env_parse_opt::<u32>("RATE_LIMIT_REFILL_RATE")?;
        let rate_limit_refill_period = env_parse_opt::<u64>("RATE_LIMIT_REFILL_SECS")?;
        for (name, value) in [
            ("RATE_LIMIT_CAPACITY", rate_limit_capacity),
            ("RATE_LIMIT_REFILL_RATE", rate_limit_refill_rate),
        ] {
            if value == Some(0) {
                bail!("{name} must be positive");
            }
        }
        if rate_limit_refill_period == Some(0) {
            bail!("RATE_LIMIT_REFILL_SECS must be positive");
        }

        Ok(Self {
            port,
            supported_pairs,
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", 60u64)?),
            cache_refresh_interval: Duration::from_secs(env_parse("CACHE_REFRESH_SECS", 30u64)?),
            cache_backend,
            redis_url,
            rest_base_url: std::env::var("KRAKEN_REST_URL")
                .unwrap_or_else(|_| "https://api.kraken.com".to_string()),
            rest_timeout: Duration::from_secs(env_parse("REST_TIMEOUT_SECS", 10u64)?),
            rest_max_retries: env_parse("REST_MAX_RETRIES", 3u32)?,
            rest_base_backoff: Duration::from_millis(env_parse("REST_BASE_BACKOFF_MS", 1000u64)?),
            ws_enabled: env_parse("WS_ENABLED", true)?,
            ws_url: std::env::var("KRAKEN_WS_URL")
                .unwrap_or_else(|_| "wss://ws.kraken.com/".to_string()),
            ws_ping_interval: Duration::from_secs(env_parse("WS_PING_SECS", 45u64)?),
            ws_pong_timeout: Duration::from_secs(env_parse("WS_PONG_TIMEOUT_SECS", 15u64)?),
            ws_reconnect_delay: Duration::from_secs(env_parse("WS_RECONNECT_DELAY_SECS", 5u64)?),
            ws_max_reconnect_tries: env_parse("WS_MAX_RECONNECT_TRIES", 5u32)?,
            rate_limit_enabled: env_parse("RATE_LIMIT_ENABLED", true)?,
            rate_limit_conservative: env_parse("RATE_LIMIT_CONSERVATIVE", false)?,
            rate_limit_capacity,
            rate_limit_refill_rate,
            rate_limit_refill_period: rate_limit_refill_period.map(Duration::from_secs),
            mapper_refresh_interval: Duration::from_secs(
                env_parse("MAPPER_REFRESH_HOURS", 24u64)? * 3600,
            ),
        })
    }
}

/// Parse an env var, falling back to `default` when unset. A set-but-invalid
/// value is an error, not a silent default.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_parse_opt<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(None),
    }
}
