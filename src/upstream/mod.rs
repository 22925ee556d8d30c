//! Exchange clients: the REST pull path, the WebSocket push path, and the
//! hybrid facade the service talks to.

pub mod hybrid;
pub mod rest;
pub mod ws;

pub use hybrid::{HybridClient, Mode, ModeState};
pub use rest::{RestClient, RestConfig};
pub use ws::{PushClient, PushConfig, UpdateCallback};

use serde::Deserialize;
use std::collections::HashMap;

/// One ticker entry as the exchange reports it. Only the `c` field (last
/// trade closed: `[price, lot volume]`) matters to this service; the other
/// ticker fields are not deserialized.
#[derive(Debug, Clone, Deserialize)]
pub struct TickerInfo {
    #[serde(default)]
    pub c: Vec<String>,
}

impl TickerInfo {
    /// Last traded price, if present, parseable, finite and non-negative.
    pub fn last_price(&self) -> Option<f64> {
        self.c
            .first()?
            .parse::<f64>()
            .ok()
            .filter(|price| price.is_finite() && *price >= 0.0)
    }

    /// Synthesize an entry from an already-parsed price, for responses
    /// assembled out of the streaming snapshot.
    pub fn from_price(price: f64) -> Self {
        Self {
            c: vec![price.to_string(), "0.00000000".to_string()],
        }
    }
}

/// Ticker data keyed by the exchange's own pair naming. Translating back to
/// standard names is the caller's job.
#[derive(Debug, Clone, Default)]
pub struct TickerResult {
    pub tickers: HashMap<String, TickerInfo>,
}
