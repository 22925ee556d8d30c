//! End-to-end tests against a stubbed exchange.
//!
//! The stub serves the AssetPairs catalog and Ticker endpoint in-process,
//! with a configurable number of leading failures so retry behavior can be
//! observed on the wire.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use ltp_service::api::{router, AppState};
use ltp_service::cache::{MemoryCache, PriceCache};
use ltp_service::pairs::PairMapper;
use ltp_service::ratelimit::UpstreamLimiter;
use ltp_service::service::LtpService;
use ltp_service::upstream::{HybridClient, Mode, ModeState, RestClient, RestConfig};

#[derive(Clone)]
struct StubState {
    catalog: Arc<serde_json::Value>,
    ticker: Arc<serde_json::Value>,
    ticker_hits: Arc<AtomicUsize>,
    /// Number of leading ticker requests answered with 503.
    failures_left: Arc<AtomicUsize>,
}

struct StubUpstream {
    base_url: String,
    ticker_hits: Arc<AtomicUsize>,
}

async fn spawn_stub(
    catalog: serde_json::Value,
    ticker: serde_json::Value,
    leading_failures: usize,
) -> StubUpstream {
    let state = StubState {
        catalog: Arc::new(catalog),
        ticker: Arc::new(ticker),
        ticker_hits: Arc::new(AtomicUsize::new(0)),
        failures_left: Arc::new(AtomicUsize::new(leading_failures)),
    };
    let ticker_hits = Arc::clone(&state.ticker_hits);

    let app = Router::new()
        .route("/0/public/AssetPairs", get(stub_asset_pairs))
        .route("/0/public/Ticker", get(stub_ticker))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StubUpstream {
        base_url: format!("http://{addr}"),
        ticker_hits,
    }
}

async fn stub_asset_pairs(State(state): State<StubState>) -> Json<serde_json::Value> {
    Json(state.catalog.as_ref().clone())
}

async fn stub_ticker(State(state): State<StubState>) -> Response {
    state.ticker_hits.fetch_add(1, Ordering::SeqCst);

    let fail = state
        .failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if fail {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response();
    }

    Json(state.ticker.as_ref().clone()).into_response()
}

fn default_catalog() -> serde_json::Value {
    serde_json::json!({
        "error": [],
        "result": {
            "XXBTZUSD": {"altname": "XBTUSD", "wsname": "XBT/USD", "base": "XXBT", "quote": "ZUSD"},
            "XXBTZEUR": {"altname": "XBTEUR", "wsname": "XBT/EUR", "base": "XXBT", "quote": "ZEUR"},
            "XBTCHF":   {"altname": "XBTCHF", "wsname": "XBT/CHF", "base": "XXBT", "quote": "CHF"}
        }
    })
}

fn default_ticker() -> serde_json::Value {
    serde_json::json!({
        "error": [],
        "result": {
            "XXBTZUSD": {"c": ["50123.5", "0.002"]},
            "XXBTZEUR": {"c": ["46200.1", "0.010"]},
            "XBTCHF":   {"c": ["44100.9", "0.001"]}
        }
    })
}

struct Stack {
    service: Arc<LtpService>,
    hybrid: Arc<HybridClient>,
    limiter: Arc<UpstreamLimiter>,
    cache: Arc<dyn PriceCache>,
    mapper: Arc<PairMapper>,
}

/// Full wiring minus the WebSocket side, pointed at the stub.
async fn build_stack(stub: &StubUpstream, ttl: Duration, rate_limited: bool) -> Stack {
    let limiter = Arc::new(if rate_limited {
        UpstreamLimiter::with_params(true, 1, 1, Duration::from_millis(200))
    } else {
        UpstreamLimiter::with_params(false, 1, 1, Duration::from_secs(1))
    });

    let mapper = Arc::new(PairMapper::new(
        reqwest::Client::new(),
        stub.base_url.clone(),
        Duration::from_secs(3600),
    ));
    mapper.refresh().await.unwrap();

    let rest = RestClient::new(
        RestConfig {
            base_url: stub.base_url.clone(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            base_backoff: Duration::from_millis(10),
        },
        Arc::clone(&limiter),
        Arc::clone(&mapper),
    )
    .unwrap();

    let hybrid = Arc::new(HybridClient::new(
        rest,
        None,
        Arc::clone(&mapper),
        ModeState::new(Mode::Fallback),
    ));
    let cache: Arc<dyn PriceCache> = Arc::new(MemoryCache::new(ttl));

    let service = Arc::new(LtpService::new(
        Arc::clone(&cache),
        Arc::clone(&hybrid),
        Arc::clone(&mapper),
        vec![
            "BTC/USD".to_string(),
            "BTC/EUR".to_string(),
            "BTC/CHF".to_string(),
        ],
        CancellationToken::new(),
    ));

    Stack {
        service,
        hybrid,
        limiter,
        cache,
        mapper,
    }
}

/// Serve the API router on an ephemeral port.
async fn spawn_api(stack: &Stack) -> String {
    let state = AppState {
        service: Arc::clone(&stack.service),
        hybrid: Arc::clone(&stack.hybrid),
        limiter: Arc::clone(&stack.limiter),
        started_at: Instant::now(),
    };
    let app = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{addr}")
}

#[tokio::test]
async fn cached_price_is_served_without_an_upstream_call() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;
    stack.cache.set("BTC/USD", 50000.0).await.unwrap();

    let api = spawn_api(&stack).await;
    let body: serde_json::Value = reqwest::get(format!("{api}/api/v1/ltp?pair=BTC/USD"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        body,
        serde_json::json!({"ltp": [{"pair": "BTC/USD", "amount": 50000.0}]})
    );
    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_entry_is_refreshed_from_upstream() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_millis(40), false).await;
    stack.cache.set("BTC/USD", 49000.0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let response = stack
        .service
        .get_ltp(&["BTC/USD".to_string()])
        .await
        .unwrap();

    assert_eq!(response.ltp[0].amount, 50123.5);
    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 1);
    // The cache was rewritten: an immediate re-read stays local.
    let again = stack
        .service
        .get_ltp(&["BTC/USD".to_string()])
        .await
        .unwrap();
    assert_eq!(again.ltp[0].amount, 50123.5);
    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_upstream_failures_are_retried() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 1).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let response = stack
        .service
        .get_ltp(&["BTC/EUR".to_string()])
        .await
        .unwrap();

    assert_eq!(response.ltp[0].amount, 46200.1);
    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unsupported_pair_is_rejected_without_an_upstream_call() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let response = reqwest::get(format!("{api}/api/v1/ltp?pair=BTC/USD&pair=BTC/ZZZ"))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_pair");
    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_request_returns_all_configured_pairs_sorted() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let body: serde_json::Value = reqwest::get(format!("{api}/api/v1/ltp"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let pairs: Vec<&str> = body["ltp"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["pair"].as_str().unwrap())
        .collect();
    assert_eq!(pairs, vec!["BTC/CHF", "BTC/EUR", "BTC/USD"]);
}

#[tokio::test]
async fn csv_parameter_style_works_too() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let body: serde_json::Value =
        reqwest::get(format!("{api}/api/v1/ltp?pairs=BTC/USD,BTC/EUR"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

    assert_eq!(body["ltp"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn exhausted_upstream_with_empty_cache_is_service_unavailable() {
    let stub = spawn_stub(default_catalog(), default_ticker(), usize::MAX).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let response = reqwest::get(format!("{api}/api/v1/ltp?pair=BTC/USD"))
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "price_unavailable");
}

#[tokio::test]
async fn catalog_drives_all_three_naming_conventions() {
    let stub = spawn_stub(
        serde_json::json!({
            "error": [],
            "result": {
                "XBTUSD": {"altname": "XBTUSD", "wsname": "XBT/USD", "base": "XXBT", "quote": "ZUSD"}
            }
        }),
        default_ticker(),
        0,
    )
    .await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    assert_eq!(stack.mapper.to_pull("BTC/USD").unwrap(), "XBTUSD");
    assert_eq!(stack.mapper.to_push("BTC/USD").unwrap(), "XBT/USD");
    assert_eq!(stack.mapper.from_push("XBT/USD").unwrap(), "BTC/USD");
}

#[tokio::test]
async fn rate_limiter_spaces_sequential_upstream_calls() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    // capacity 1, refill every 200ms; the catalog fetch is not metered.
    let stack = build_stack(&stub, Duration::from_millis(1), true).await;

    let started = Instant::now();
    for _ in 0..3 {
        stack
            .service
            .get_ltp(&["BTC/USD".to_string()])
            .await
            .unwrap();
        // Let the entry lapse so every request goes back upstream.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(stub.ticker_hits.load(Ordering::SeqCst), 3);
    // First call spends the initial token; the next two wait ~200ms each.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn pairs_endpoint_lists_supported_pairs() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let body: serde_json::Value = reqwest::get(format!("{api}/api/v1/pairs"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(
        body,
        serde_json::json!({"pairs": ["BTC/CHF", "BTC/EUR", "BTC/USD"]})
    );
}

#[tokio::test]
async fn health_endpoint_reports_mode_and_limiter() {
    let stub = spawn_stub(default_catalog(), default_ticker(), 0).await;
    let stack = build_stack(&stub, Duration::from_secs(60), false).await;

    let api = spawn_api(&stack).await;
    let body: serde_json::Value = reqwest::get(format!("{api}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["upstream_mode"], "fallback");
    assert_eq!(body["rate_limiter"]["enabled"], false);
}
