//! Service entrypoint: wire the components, pre-warm the cache, serve.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ltp_service::api::{router, AppState};
use ltp_service::cache::{InstrumentedCache, MemoryCache, PriceCache, RedisCache};
use ltp_service::config::{CacheBackend, Config};
use ltp_service::pairs::PairMapper;
use ltp_service::ratelimit::{LimiterMode, UpstreamLimiter};
use ltp_service::service::{refresher, LtpService};
use ltp_service::upstream::{
    HybridClient, Mode, ModeState, PushClient, PushConfig, RestClient, RestConfig, UpdateCallback,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    info!(
        pairs = ?config.supported_pairs,
        ws_enabled = config.ws_enabled,
        backend = ?config.cache_backend,
        "starting ltp-service"
    );

    let shutdown = CancellationToken::new();

    // Upstream plumbing: limiter, mapper, REST, WebSocket, hybrid facade.
    let limiter = Arc::new(build_limiter(&config));

    let mapper = Arc::new(PairMapper::new(
        reqwest::Client::new(),
        config.rest_base_url.clone(),
        config.mapper_refresh_interval,
    ));
    if let Err(e) = mapper.refresh().await {
        warn!(error = %e, "asset catalog unavailable, using the static pair table");
    }

    let rest = RestClient::new(
        RestConfig {
            base_url: config.rest_base_url.clone(),
            timeout: config.rest_timeout,
            max_retries: config.rest_max_retries,
            base_backoff: config.rest_base_backoff,
        },
        Arc::clone(&limiter),
        Arc::clone(&mapper),
    )?;

    let initial_mode = if config.ws_enabled {
        Mode::Streaming
    } else {
        Mode::Fallback
    };
    let mode = ModeState::new(initial_mode);

    let push = if config.ws_enabled {
        let callback: UpdateCallback = {
            let mode = Arc::clone(&mode);
            Arc::new(move |_pair: &str, _price: f64| mode.mark_push_activity())
        };
        Some(PushClient::new(
            PushConfig {
                url: config.ws_url.clone(),
                connect_timeout: config.rest_timeout,
                ping_interval: config.ws_ping_interval,
                pong_timeout: config.ws_pong_timeout,
                reconnect_delay: config.ws_reconnect_delay,
                max_reconnect_tries: config.ws_max_reconnect_tries,
            },
            Arc::clone(&mapper),
            Some(callback),
        ))
    } else {
        None
    };

    let hybrid = Arc::new(HybridClient::new(
        rest,
        push,
        Arc::clone(&mapper),
        Arc::clone(&mode),
    ));
    hybrid.start(&config.supported_pairs)?;

    let cache = build_cache(&config).await?;

    let service = Arc::new(LtpService::new(
        Arc::clone(&cache),
        Arc::clone(&hybrid),
        Arc::clone(&mapper),
        config.supported_pairs.clone(),
        shutdown.clone(),
    ));

    // Warm the cache once, then keep it warm in the background.
    refresher::prewarm(&service).await;
    let refresher_handle = refresher::spawn_refresher(
        Arc::clone(&service),
        Arc::clone(&mapper),
        config.cache_refresh_interval,
        shutdown.clone(),
    );

    let state = AppState {
        service,
        hybrid: Arc::clone(&hybrid),
        limiter,
        started_at: Instant::now(),
    };
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await
        .context("http server failed")?;

    info!("shutting down");
    shutdown.cancel();
    hybrid.close();
    let _ = refresher_handle.await;
    if let Err(e) = cache.close().await {
        warn!(error = %e, "cache close failed");
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ltp_service=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_limiter(config: &Config) -> UpstreamLimiter {
    match (
        config.rate_limit_capacity,
        config.rate_limit_refill_rate,
        config.rate_limit_refill_period,
    ) {
        (Some(capacity), Some(rate), Some(period)) => {
            UpstreamLimiter::with_params(config.rate_limit_enabled, capacity, rate, period)
        }
        _ if config.rate_limit_conservative => {
            UpstreamLimiter::new(config.rate_limit_enabled, LimiterMode::Conservative)
        }
        _ => UpstreamLimiter::new(config.rate_limit_enabled, LimiterMode::Default),
    }
}

async fn build_cache(config: &Config) -> Result<Arc<dyn PriceCache>> {
    let inner: Arc<dyn PriceCache> = match config.cache_backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(config.cache_ttl)),
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("redis backend selected without REDIS_URL")?;
            Arc::new(
                RedisCache::connect(url, config.cache_ttl)
                    .await
                    .context("failed to connect to redis")?,
            )
        }
    };

    let backend = match config.cache_backend {
        CacheBackend::Memory => "memory",
        CacheBackend::Redis => "redis",
    };
    Ok(Arc::new(InstrumentedCache::new(inner, backend)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
