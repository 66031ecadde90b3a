use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::Router;
use pulse_market_backend::{
    build_app,
    config::Config,
    models::{iso8601_millis, now_millis, Candle, Quote, QuoteSource},
    upstream::{UpstreamDataSource, UpstreamError},
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

struct ScriptedUpstream {
    failing: AtomicBool,
    quote_calls: AtomicU64,
}

impl ScriptedUpstream {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(false),
            quote_calls: AtomicU64::new(0),
        })
    }

    fn live_quote(symbol: &str, price: f64) -> Quote {
        let timestamp = now_millis();
        Quote {
            symbol: symbol.to_string(),
            price,
            bid: price - 0.05,
            ask: price + 0.05,
            volume: 125_000.0,
            change: 1.25,
            change_percent: 0.66,
            high: price + 2.0,
            low: price - 2.0,
            open: price - 1.0,
            previous_close: price - 1.25,
            timestamp,
            datetime: iso8601_millis(timestamp),
            source: QuoteSource::Live,
        }
    }
}

#[async_trait]
impl UpstreamDataSource for ScriptedUpstream {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamError> {
        let call = self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Request("scripted outage".to_string()));
        }
        Ok(Self::live_quote(symbol, 100.0 + call as f64 * 0.25))
    }

    async fn fetch_historical(
        &self,
        _symbol: &str,
        _interval: &str,
        outputsize: usize,
    ) -> Result<Vec<Candle>, UpstreamError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Request("scripted outage".to_string()));
        }
        let now = now_millis();
        Ok((0..outputsize)
            .rev()
            .map(|index| {
                let timestamp = now - 60_000 * (index as u64 + 1);
                (timestamp, 100.0, 101.0, 99.0, 100.5, 10_000.0)
            })
            .collect())
    }
}

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        upstream_base_url: "http://127.0.0.1:1".to_string(),
        upstream_timeout_ms: 20,
        quote_ttl_ms: 5_000,
        min_update_interval_ms: 50,
        max_update_interval_ms: 5_000,
        idle_grace_ms: 100,
        subscriber_queue_capacity: 64,
        max_batch_symbols: 50,
        depth_window_ticks: 10,
    })
}

async fn spawn_server(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("http://127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

#[tokio::test]
async fn quote_endpoint_returns_live_envelope() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let body: Value = reqwest::get(format!("{base_url}/v1/quote/aapl"))
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("body should be JSON");

    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["symbol"], json!("AAPL"));
    assert_eq!(body["data"]["source"], json!("live"));
    assert!(body["data"]["price"].as_f64().expect("price present") > 0.0);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn quote_endpoint_serves_fallback_during_outage() {
    let upstream = ScriptedUpstream::new();
    upstream.failing.store(true, Ordering::SeqCst);
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let body: Value = reqwest::get(format!("{base_url}/v1/quote/TSLA"))
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("body should be JSON");

    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["source"], json!("fallback"));
    let price = body["data"]["price"].as_f64().expect("price present");
    assert!(price.is_finite() && price > 0.0);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn batch_quotes_skip_invalid_symbols_without_failing() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let client = reqwest::Client::new();
    let body: Value = client
        .post(format!("{base_url}/v1/quotes"))
        .json(&json!({"symbols": ["AAPL", "MSFT", "INVALID$YM"]}))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("body should be JSON");

    assert_eq!(body["success"], json!(true));
    let quotes = body["data"].as_array().expect("data should be an array");
    assert_eq!(quotes.len(), 2);
    assert_eq!(quotes[0]["symbol"], json!("AAPL"));
    assert_eq!(quotes[1]["symbol"], json!("MSFT"));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn oversized_batch_is_rejected() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let symbols: Vec<String> = (0..51).map(|index| format!("SYM{index}")).collect();
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base_url}/v1/quotes"))
        .json(&json!({ "symbols": symbols }))
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("body should be JSON");
    assert_eq!(body["success"], json!(false));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn historical_endpoint_returns_ordered_candles() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let body: Value = reqwest::get(format!(
        "{base_url}/v1/historical/AAPL?interval=1min&outputsize=10"
    ))
    .await
    .expect("request should succeed")
    .json()
    .await
    .expect("body should be JSON");

    assert_eq!(body["success"], json!(true));
    let candles = body["data"].as_array().expect("data should be an array");
    assert_eq!(candles.len(), 10);
    let timestamps: Vec<u64> = candles
        .iter()
        .map(|candle| candle[0].as_u64().expect("timestamp present"))
        .collect();
    for pair in timestamps.windows(2) {
        assert!(pair[0] < pair[1], "candles must be oldest-first");
    }

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn historical_rejects_unknown_interval() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let response = reqwest::get(format!("{base_url}/v1/historical/AAPL?interval=7min"))
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn subscription_lifecycle_shows_in_status_and_populates_the_book() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream.clone())).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base_url}/v1/subscribe"))
        .json(&json!({"symbol": "NVDA", "intervalMs": 50, "sessionId": "session-a"}))
        .send()
        .await
        .expect("subscribe should succeed")
        .json()
        .await
        .expect("body should be JSON");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["symbol"], json!("NVDA"));
    assert_eq!(body["data"]["intervalMs"], json!(50));

    // Let a few ticks run so the scheduler fills the book.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status: Value = client
        .get(format!("{base_url}/v1/status"))
        .send()
        .await
        .expect("status should succeed")
        .json()
        .await
        .expect("body should be JSON");
    let actives = status["data"]["activeSymbols"]
        .as_array()
        .expect("activeSymbols present");
    assert_eq!(actives.len(), 1);
    assert_eq!(actives[0]["symbol"], json!("NVDA"));
    assert_eq!(actives[0]["subscribers"], json!(1));

    let book: Value = client
        .get(format!("{base_url}/v1/orderbook/NVDA"))
        .send()
        .await
        .expect("orderbook should succeed")
        .json()
        .await
        .expect("body should be JSON");
    let bids = book["data"]["bids"].as_array().expect("bids present");
    let asks = book["data"]["asks"].as_array().expect("asks present");
    assert!(!bids.is_empty() && !asks.is_empty());
    let best_bid = bids[0][0].as_f64().expect("bid price");
    let best_ask = asks[0][0].as_f64().expect("ask price");
    assert!(best_bid < best_ask);

    let depth: Value = client
        .get(format!("{base_url}/v1/depth/NVDA"))
        .send()
        .await
        .expect("depth should succeed")
        .json()
        .await
        .expect("body should be JSON");
    let imbalance = depth["data"]["imbalance"].as_f64().expect("imbalance");
    assert!((-1.0..=1.0).contains(&imbalance));
    let pressure = depth["data"]["pressureIndex"].as_f64().expect("pressure");
    assert!((-100.0..=100.0).contains(&pressure));

    // Unsubscribe twice: the second call must still be a success no-op.
    for _ in 0..2 {
        let body: Value = client
            .post(format!("{base_url}/v1/unsubscribe"))
            .json(&json!({"symbol": "NVDA", "sessionId": "session-a"}))
            .send()
            .await
            .expect("unsubscribe should succeed")
            .json()
            .await
            .expect("body should be JSON");
        assert_eq!(body["success"], json!(true));
    }

    // Past the grace period, the scheduler must go silent.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let settled = upstream.quote_calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        upstream.quote_calls.load(Ordering::SeqCst),
        settled,
        "no upstream fetches may happen after teardown"
    );

    let status: Value = client
        .get(format!("{base_url}/v1/status"))
        .send()
        .await
        .expect("status should succeed")
        .json()
        .await
        .expect("body should be JSON");
    assert_eq!(status["data"]["totalSubscribers"], json!(0));

    let _ = shutdown.send(());
    let _ = task.await;
}

#[tokio::test]
async fn invalid_symbol_is_a_400() {
    let upstream = ScriptedUpstream::new();
    let (base_url, shutdown, task) = spawn_server(build_app(test_config(), upstream)).await;

    let response = reqwest::get(format!("{base_url}/v1/quote/BAD$YM"))
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("body should be JSON");
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().expect("error present").contains("symbol"));

    let _ = shutdown.send(());
    let _ = task.await;
}
