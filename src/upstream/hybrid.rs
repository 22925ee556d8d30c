//! Hybrid upstream facade: stream when healthy, poll when not.
//!
//! The service only ever asks this type for tickers. Reads are served from
//! the streaming snapshot while it is connected and fresh; any doubt flips
//! the client into fallback mode and the REST path takes over. The next
//! streaming update flips it back.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pairs::PairMapper;
use crate::upstream::{PushClient, RestClient, TickerInfo, TickerResult};

/// Snapshot entries older than this are not trusted even while connected.
const MAX_SNAPSHOT_AGE: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Streaming,
    Fallback,
}

/// Mode state shared between the hybrid client and the push client's update
/// callback. The callback gets a handle to this at construction time; there
/// is no back-pointer from the push client into the hybrid.
pub struct ModeState {
    mode: Mutex<Mode>,
    last_push_activity: Mutex<Option<Instant>>,
}

impl ModeState {
    pub fn new(initial: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(initial),
            last_push_activity: Mutex::new(None),
        })
    }

    pub fn current(&self) -> Mode {
        *self.mode.lock()
    }

    /// Called from the streaming reader on every accepted update. Cheap and
    /// non-blocking by contract.
    pub fn mark_push_activity(&self) {
        *self.last_push_activity.lock() = Some(Instant::now());
        let mut mode = self.mode.lock();
        if *mode == Mode::Fallback {
            info!("streaming feed recovered, leaving fallback mode");
            *mode = Mode::Streaming;
        }
    }

    fn enter_fallback(&self, reason: &str) {
        let mut mode = self.mode.lock();
        if *mode == Mode::Streaming {
            warn!(reason, "switching to REST fallback");
            metrics::counter!("ltp_stream_fallbacks_total", 1);
            *mode = Mode::Fallback;
        }
    }
}

pub struct HybridClient {
    rest: RestClient,
    push: Option<Arc<PushClient>>,
    mapper: Arc<PairMapper>,
    mode: Arc<ModeState>,
}

impl HybridClient {
    /// `mode` must be the same handle the push client's callback was built
    /// around, otherwise recovery notifications go nowhere.
    pub fn new(
        rest: RestClient,
        push: Option<Arc<PushClient>>,
        mapper: Arc<PairMapper>,
        mode: Arc<ModeState>,
    ) -> Self {
        Self {
            rest,
            push,
            mapper,
            mode,
        }
    }

    /// Bring up the streaming side. A push failure is not an error here:
    /// the REST path needs no setup and keeps the service serviceable.
    pub fn start(&self, std_pairs: &[String]) -> Result<()> {
        let Some(push) = &self.push else {
            return Ok(());
        };

        if let Err(e) = push.start(std_pairs) {
            warn!(error = %e, "streaming start failed, staying in fallback");
            self.mode.enter_fallback("streaming start failed");
        }
        Ok(())
    }

    pub fn close(&self) {
        if let Some(push) = &self.push {
            push.close();
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode.current()
    }

    pub async fn get_tickers(
        &self,
        pairs: &[String],
        cancel: &CancellationToken,
    ) -> Result<TickerResult> {
        if let Some(push) = &self.push {
            if self.mode.current() == Mode::Streaming {
                if push.is_connected() {
                    if let Some(result) = self.from_snapshot(push, pairs) {
                        return Ok(result);
                    }
                    self.mode.enter_fallback("streaming snapshot empty or stale");
                } else {
                    self.mode.enter_fallback("streaming connection down");
                }
            }
        }

        self.rest.get_tickers(pairs, cancel).await
    }

    /// Build a ticker result from the streaming snapshot, or `None` when the
    /// snapshot cannot answer (empty, stale, or covering none of `pairs`).
    fn from_snapshot(&self, push: &PushClient, pairs: &[String]) -> Option<TickerResult> {
        let snapshot = push.latest_prices();
        if snapshot.is_empty() {
            return None;
        }

        let fresh = push
            .last_update()
            .map(|at| at.elapsed() <= MAX_SNAPSHOT_AGE)
            .unwrap_or(false);
        if !fresh {
            return None;
        }

        let mut tickers = HashMap::new();
        for pair in pairs {
            if let Some(price) = snapshot.get(pair) {
                // Keep the result in upstream naming, as the REST path does.
                let name = self.mapper.to_pull(pair).unwrap_or_else(|| pair.clone());
                tickers.insert(name, TickerInfo::from_price(*price));
            }
        }

        if tickers.is_empty() {
            return None;
        }

        debug!(pairs = tickers.len(), "served tickers from streaming snapshot");
        Some(TickerResult { tickers })
    }
}
