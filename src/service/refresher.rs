//! Background cache refresh and startup pre-warm.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pairs::PairMapper;
use crate::service::LtpService;

/// Periodically re-fetch prices for the configured set so client requests
/// mostly hit a warm cache. Failures are logged and the next tick tries
/// again; only the shutdown signal stops the task.
pub fn spawn_refresher(
    service: Arc<LtpService>,
    mapper: Arc<PairMapper>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // First tick lands one full interval out; the pre-warm already ran.
        let start = tokio::time::Instant::now() + interval;
        let mut tick = tokio::time::interval_at(start, interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs(), "cache refresher running");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cache refresher stopping");
                    return;
                }
                _ = tick.tick() => {
                    // The mapping tables age on a much slower clock; this is
                    // a no-op almost every tick.
                    if let Err(e) = mapper.refresh_if_stale().await {
                        warn!(error = %e, "pair mapping refresh failed");
                    }

                    match service.refresh_all().await {
                        Ok(()) => debug!("background refresh completed"),
                        Err(e) => warn!(error = %e, "background refresh failed"),
                    }
                }
            }
        }
    })
}

/// One refresh before the listener opens, so the first request does not pay
/// the upstream round-trip. A cold start with a dead upstream still boots:
/// the cache fills on the first successful refresh instead.
pub async fn prewarm(service: &LtpService) {
    match service.refresh_all().await {
        Ok(()) => info!("price cache pre-warmed"),
        Err(e) => warn!(error = %e, "cache pre-warm failed, continuing with a cold cache"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, PriceCache};
    use crate::ratelimit::UpstreamLimiter;
    use crate::upstream::{HybridClient, Mode, ModeState, RestClient, RestConfig};

    async fn service_against(server: &mockito::Server) -> (Arc<LtpService>, Arc<PairMapper>) {
        let mapper = Arc::new(PairMapper::new(
            reqwest::Client::new(),
            server.url(),
            Duration::from_secs(3600),
        ));
        let rest = RestClient::new(
            RestConfig {
                base_url: server.url(),
                timeout: Duration::from_secs(5),
                max_retries: 1,
                base_backoff: Duration::from_millis(10),
            },
            Arc::new(UpstreamLimiter::with_params(
                false,
                1,
                1,
                Duration::from_secs(1),
            )),
            Arc::clone(&mapper),
        )
        .unwrap();
        let hybrid = Arc::new(HybridClient::new(
            rest,
            None,
            Arc::clone(&mapper),
            ModeState::new(Mode::Fallback),
        ));
        let cache: Arc<dyn PriceCache> = Arc::new(MemoryCache::new(Duration::from_secs(60)));

        (
            Arc::new(LtpService::new(
                cache,
                hybrid,
                Arc::clone(&mapper),
                vec!["BTC/USD".to_string()],
                CancellationToken::new(),
            )),
            mapper,
        )
    }

    #[tokio::test]
    async fn prewarm_fills_the_cache() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/0/public/Ticker")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"error":[],"result":{"XXBTZUSD":{"c":["50000.0","0"]}}}"#)
            .create_async()
            .await;

        let (service, _mapper) = service_against(&server).await;
        prewarm(&service).await;

        let response = service.get_ltp(&["BTC/USD".to_string()]).await.unwrap();
        assert_eq!(response.ltp[0].amount, 50000.0);
    }

    #[tokio::test]
    async fn prewarm_failure_does_not_panic() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/0/public/Ticker")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let (service, _mapper) = service_against(&server).await;
        prewarm(&service).await;
    }

    #[tokio::test]
    async fn refresher_stops_on_shutdown() {
        let server = mockito::Server::new_async().await;
        let (service, mapper) = service_against(&server).await;
        let shutdown = CancellationToken::new();

        let handle = spawn_refresher(
            service,
            mapper,
            Duration::from_secs(3600),
            shutdown.clone(),
        );
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher should stop promptly")
            .unwrap();
    }
}
