//! Admission control for pull requests against the exchange.
//!
//! The exchange meters public REST endpoints per client; the limiter keeps
//! this service inside that allowance. The bucket itself is generic, and
//! this module is the policy layer: named presets, an off switch for test
//! rigs, and a stats view for the health surface.

mod bucket;

pub use bucket::TokenBucket;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Preset parameter sets for the exchange's public-endpoint allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterMode {
    /// capacity 15, one token per second.
    Default,
    /// capacity 10, one token per two seconds. For deployments sharing an
    /// egress IP with other consumers of the same exchange.
    Conservative,
    /// Operator-supplied parameters.
    Custom,
}

impl LimiterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterMode::Default => "default",
            LimiterMode::Conservative => "conservative",
            LimiterMode::Custom => "custom",
        }
    }
}

/// Read-only snapshot of limiter state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LimiterStats {
    pub enabled: bool,
    pub mode: &'static str,
    pub capacity: u32,
    pub available: u32,
}

pub struct UpstreamLimiter {
    bucket: TokenBucket,
    enabled: bool,
    mode: LimiterMode,
}

impl UpstreamLimiter {
    pub fn new(enabled: bool, mode: LimiterMode) -> Self {
        let bucket = match mode {
            LimiterMode::Default => TokenBucket::new(15, 1, Duration::from_secs(1)),
            LimiterMode::Conservative => TokenBucket::new(10, 1, Duration::from_secs(2)),
            LimiterMode::Custom => {
                panic!("custom mode requires explicit parameters; use with_params")
            }
        };

        Self {
            bucket,
            enabled,
            mode,
        }
    }

    pub fn with_params(
        enabled: bool,
        capacity: u32,
        refill_rate: u32,
        refill_period: Duration,
    ) -> Self {
        Self {
            bucket: TokenBucket::new(capacity, refill_rate, refill_period),
            enabled,
            mode: LimiterMode::Custom,
        }
    }

    /// Non-blocking admission check. Always passes when disabled.
    pub fn try_acquire(&self) -> bool {
        if !self.enabled {
            return true;
        }
        self.bucket.try_acquire()
    }

    /// Wait for admission. Returns immediately when disabled; returns
    /// `false` only if `cancel` fired before a token became available.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if !self.enabled {
            return true;
        }
        self.bucket.acquire(cancel).await
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            enabled: self.enabled,
            mode: self.mode.as_str(),
            capacity: self.bucket.capacity(),
            available: self.bucket.available(),
        }
    }
}
