//! Pair naming across the three conventions the exchange exposes.
//!
//! The same market has three spellings: the standard `BASE/QUOTE` form this
//! service speaks (`BTC/USD`), the REST key (`XXBTZUSD`) and the WebSocket
//! name (`XBT/USD`). The mapper owns the translation tables, built from the
//! exchange's AssetPairs catalog and rebuilt on a daily cadence. When the
//! catalog cannot be fetched at startup the mapper stays uninitialized and
//! lookups fall back to a small static table of majors.

use anyhow::Context;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{LtpError, Result};

/// REST / WebSocket names for the majors, used while the catalog is
/// unavailable. Triples are (standard, rest key, ws name).
const LEGACY_PAIRS: &[(&str, &str, &str)] = &[
    ("BTC/USD", "XXBTZUSD", "XBT/USD"),
    ("BTC/EUR", "XXBTZEUR", "XBT/EUR"),
    ("BTC/CHF", "XBTCHF", "XBT/CHF"),
    ("ETH/USD", "XETHZUSD", "ETH/USD"),
    ("ETH/EUR", "XETHZEUR", "ETH/EUR"),
];

/// One entry of `GET /0/public/AssetPairs`. Pairs without a `wsname` are not
/// streamable and are dropped.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPairInfo {
    #[serde(default)]
    pub wsname: Option<String>,
    pub base: String,
    pub quote: String,
}

#[derive(Debug, Deserialize)]
struct AssetPairsResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, AssetPairInfo>,
}

/// The four lookup tables. Rebuilt wholesale on refresh and swapped in under
/// the write lock, so readers always see one consistent generation.
#[derive(Debug, Default)]
struct MapTables {
    std_to_pull: HashMap<String, String>,
    pull_to_std: HashMap<String, String>,
    std_to_push: HashMap<String, String>,
    push_to_std: HashMap<String, String>,
}

#[derive(Debug)]
struct MapperState {
    initialized: bool,
    tables: MapTables,
    last_update: Option<Instant>,
}

pub struct PairMapper {
    http: reqwest::Client,
    base_url: String,
    refresh_interval: Duration,
    state: RwLock<MapperState>,
}

impl PairMapper {
    pub fn new(http: reqwest::Client, base_url: String, refresh_interval: Duration) -> Self {
        Self {
            http,
            base_url,
            refresh_interval,
            state: RwLock::new(MapperState {
                initialized: false,
                tables: MapTables::default(),
                last_update: None,
            }),
        }
    }

    /// Fetch the catalog and build the tables. On failure the mapper keeps
    /// whatever it had: nothing after a cold start, the previous generation
    /// after a refresh.
    pub async fn refresh(&self) -> Result<()> {
        let url = format!("{}/0/public/AssetPairs", self.base_url);
        let response: AssetPairsResponse = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LtpError::UpstreamUnavailable(format!("asset pair catalog: {e}")))?
            .json()
            .await
            .context("asset pair catalog body was not valid JSON")?;

        if !response.error.is_empty() {
            return Err(LtpError::Upstream(response.error.join(", ")));
        }

        let tables = build_tables(&response.result);
        let pair_count = tables.std_to_pull.len();

        let mut state = self.state.write();
        state.tables = tables;
        state.initialized = true;
        state.last_update = Some(Instant::now());
        drop(state);

        info!(pairs = pair_count, "pair mapping tables rebuilt from catalog");
        Ok(())
    }

    /// Refresh when the current tables are missing or older than the
    /// configured interval. A failed refresh keeps the previous tables.
    pub async fn refresh_if_stale(&self) -> Result<()> {
        let stale = {
            let state = self.state.read();
            match state.last_update {
                Some(at) if state.initialized => at.elapsed() >= self.refresh_interval,
                _ => true,
            }
        };

        if !stale {
            return Ok(());
        }

        match self.refresh().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "pair mapping refresh failed; keeping previous tables");
                Err(e)
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Standard name → REST key. Falls back to the legacy table while the
    /// catalog has never been fetched.
    pub fn to_pull(&self, std_pair: &str) -> Option<String> {
        let state = self.state.read();
        if state.initialized {
            state.tables.std_to_pull.get(std_pair).cloned()
        } else {
            legacy_to_pull(std_pair)
        }
    }

    /// Standard name → WebSocket name.
    pub fn to_push(&self, std_pair: &str) -> Option<String> {
        let state = self.state.read();
        if state.initialized {
            state.tables.std_to_push.get(std_pair).cloned()
        } else {
            legacy_to_push(std_pair)
        }
    }

    /// REST key → standard name. Unknown keys additionally probe the legacy
    /// table: the exchange answers with its own primary keys even when asked
    /// with an alternate spelling, so a thin catalog must not strand them.
    pub fn from_pull(&self, pull_name: &str) -> Option<String> {
        let state = self.state.read();
        if state.initialized {
            if let Some(std_pair) = state.tables.pull_to_std.get(pull_name) {
                return Some(std_pair.clone());
            }
        }
        legacy_from_pull(pull_name)
    }

    /// WebSocket name → standard name.
    pub fn from_push(&self, push_name: &str) -> Option<String> {
        let state = self.state.read();
        if state.initialized {
            if let Some(std_pair) = state.tables.push_to_std.get(push_name) {
                return Some(std_pair.clone());
            }
        }
        legacy_from_push(push_name)
    }

    pub fn is_supported(&self, std_pair: &str) -> bool {
        self.to_pull(std_pair).is_some()
    }

    /// All standard names the exchange currently exposes, sorted.
    pub fn supported_pairs(&self) -> Vec<String> {
        let state = self.state.read();
        let mut pairs: Vec<String> = if state.initialized {
            state.tables.std_to_pull.keys().cloned().collect()
        } else {
            LEGACY_PAIRS.iter().map(|(s, _, _)| s.to_string()).collect()
        };
        pairs.sort();
        pairs
    }
}

/// Build all four tables from a catalog. Each usable entry contributes four
/// edges; entries without a `wsname` are dropped.
fn build_tables(catalog: &HashMap<String, AssetPairInfo>) -> MapTables {
    let mut tables = MapTables::default();

    for (pull_name, info) in catalog {
        let Some(push_name) = info.wsname.as_deref() else {
            debug!(pair = %pull_name, "catalog entry has no ws name, skipping");
            continue;
        };

        let std_pair = format!(
            "{}/{}",
            normalize_asset(&info.base),
            normalize_asset(&info.quote)
        );

        tables
            .std_to_pull
            .insert(std_pair.clone(), pull_name.clone());
        tables
            .pull_to_std
            .insert(pull_name.clone(), std_pair.clone());
        tables
            .std_to_push
            .insert(std_pair.clone(), push_name.to_string());
        tables.push_to_std.insert(push_name.to_string(), std_pair);
    }

    tables
}

/// Collapse the exchange's asset spellings to the common ticker symbol.
///
/// Known aliases map directly; any other asset longer than one character
/// that carries the exchange's X/Z class prefix loses it.
pub fn normalize_asset(raw: &str) -> String {
    let upper = raw.to_ascii_uppercase();

    match upper.as_str() {
        "XXBT" | "XBT" => return "BTC".to_string(),
        "XETH" => return "ETH".to_string(),
        "XLTC" => return "LTC".to_string(),
        "ZUSD" => return "USD".to_string(),
        "ZEUR" => return "EUR".to_string(),
        "ZGBP" => return "GBP".to_string(),
        "ZCAD" => return "CAD".to_string(),
        "ZJPY" => return "JPY".to_string(),
        "ZAUD" => return "AUD".to_string(),
        "ZCHF" => return "CHF".to_string(),
        _ => {}
    }

    if upper.len() > 1 && (upper.starts_with('X') || upper.starts_with('Z')) {
        upper[1..].to_string()
    } else {
        upper
    }
}

fn legacy_to_pull(std_pair: &str) -> Option<String> {
    LEGACY_PAIRS
        .iter()
        .find(|(s, _, _)| *s == std_pair)
        .map(|(_, pull, _)| pull.to_string())
}

fn legacy_to_push(std_pair: &str) -> Option<String> {
    LEGACY_PAIRS
        .iter()
        .find(|(s, _, _)| *s == std_pair)
        .map(|(_, _, push)| push.to_string())
}

fn legacy_from_pull(pull_name: &str) -> Option<String> {
    LEGACY_PAIRS
        .iter()
        .find(|(_, pull, _)| *pull == pull_name)
        .map(|(s, _, _)| s.to_string())
}

fn legacy_from_push(push_name: &str) -> Option<String> {
    LEGACY_PAIRS
        .iter()
        .find(|(_, _, push)| *push == push_name)
        .map(|(s, _, _)| s.to_string())
}
