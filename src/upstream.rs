use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::warn;

use crate::models::{iso8601_millis, now_millis, Candle, Quote, QuoteSource, Side};

pub const HISTORICAL_INTERVALS: &[(&str, u64)] = &[
    ("1min", 60_000),
    ("5min", 300_000),
    ("15min", 900_000),
    ("30min", 1_800_000),
    ("1h", 3_600_000),
    ("4h", 14_400_000),
    ("1day", 86_400_000),
];

pub const DEFAULT_HISTORICAL_INTERVAL: &str = "1min";
pub const MAX_HISTORICAL_OUTPUTSIZE: usize = 500;

const FALLBACK_JITTER_PCT: f64 = 0.015;
const DEPTH_LADDER_LEVELS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Request(String),
    #[error("upstream response invalid: {0}")]
    Data(String),
}

pub fn interval_to_ms(interval: &str) -> Option<u64> {
    HISTORICAL_INTERVALS
        .iter()
        .find(|(name, _)| *name == interval)
        .map(|(_, ms)| *ms)
}

/// Seam between the scheduler/web layer and whatever feeds us prices. Live
/// fetches may fail; the fallback policy lives in [`QuoteProvider`], above
/// this trait, so fakes in tests can fail deterministically.
#[async_trait]
pub trait UpstreamDataSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamError>;

    async fn fetch_historical(
        &self,
        symbol: &str,
        interval: &str,
        outputsize: usize,
    ) -> Result<Vec<Candle>, UpstreamError>;

    /// Level updates derived from the freshest quote: a small ladder around
    /// bid/ask with geometrically decaying size. `None` when the quote has no
    /// usable two-sided market.
    fn fetch_depth(&self, quote: &Quote) -> Option<Vec<(Side, f64, f64)>> {
        derive_depth_ladder(quote)
    }
}

pub fn derive_depth_ladder(quote: &Quote) -> Option<Vec<(Side, f64, f64)>> {
    if !(quote.bid.is_finite() && quote.ask.is_finite()) {
        return None;
    }
    if quote.bid <= 0.0 || quote.ask <= 0.0 || quote.bid >= quote.ask {
        return None;
    }

    let step = ((quote.ask - quote.bid) / 2.0).max(quote.price.abs() * 0.0001);
    let base_size = (quote.volume / 1_000.0).clamp(10.0, 10_000.0);

    let mut levels = Vec::with_capacity(DEPTH_LADDER_LEVELS * 2);
    for depth in 0..DEPTH_LADDER_LEVELS {
        let decay = 0.7_f64.powi(depth as i32);
        let bid_price = quote.bid - step * depth as f64;
        if bid_price > 0.0 {
            levels.push((Side::Bid, bid_price, base_size * decay));
        }
        levels.push((
            Side::Ask,
            quote.ask + step * depth as f64,
            base_size * decay,
        ));
    }
    Some(levels)
}

/// HTTP upstream speaking a plain JSON quote API. Field extraction is lossy
/// on purpose: upstream payloads mix numbers and numeric strings, and missing
/// fields substitute `0` rather than poisoning the Quote with NaN/null.
pub struct HttpUpstream {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: String, timeout_ms: u64) -> Result<Self, anyhow::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self {
            http_client,
            base_url,
        })
    }

    async fn get_json(&self, url: &str) -> Result<Value, UpstreamError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;

        if status != StatusCode::OK {
            return Err(UpstreamError::Request(format!(
                "status={status} body={}",
                truncate(&body, 240)
            )));
        }

        serde_json::from_str::<Value>(&body)
            .map_err(|err| UpstreamError::Data(format!("invalid JSON body: {err}")))
    }
}

#[async_trait]
impl UpstreamDataSource for HttpUpstream {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, UpstreamError> {
        let url = format!("{}/quote/{symbol}", self.base_url);
        let value = self.get_json(&url).await?;
        normalize_quote(symbol, &value)
    }

    async fn fetch_historical(
        &self,
        symbol: &str,
        interval: &str,
        outputsize: usize,
    ) -> Result<Vec<Candle>, UpstreamError> {
        let url = format!(
            "{}/historical/{symbol}?interval={interval}&outputsize={outputsize}",
            self.base_url
        );
        let value = self.get_json(&url).await?;
        normalize_candles(&value, outputsize)
    }
}

fn normalize_quote(symbol: &str, value: &Value) -> Result<Quote, UpstreamError> {
    let data = value.get("data").unwrap_or(value);

    let price = field_f64(data, &["price", "last", "close"])
        .ok_or_else(|| UpstreamError::Data("payload has no usable price".to_string()))?;
    if !price.is_finite() || price <= 0.0 {
        return Err(UpstreamError::Data(format!(
            "payload price is not usable: {price}"
        )));
    }

    let bid = field_f64(data, &["bid"]).unwrap_or(0.0);
    let ask = field_f64(data, &["ask"]).unwrap_or(0.0);
    let open = field_f64(data, &["open"]).unwrap_or(0.0);
    let previous_close = field_f64(data, &["previousClose", "prevClose"]).unwrap_or(0.0);
    let change = field_f64(data, &["change"]).unwrap_or_else(|| {
        if previous_close > 0.0 {
            price - previous_close
        } else {
            0.0
        }
    });
    let change_percent = field_f64(data, &["changePercent", "percentChange"]).unwrap_or_else(|| {
        if previous_close > 0.0 {
            (price - previous_close) / previous_close * 100.0
        } else {
            0.0
        }
    });
    let timestamp = field_u64(data, &["timestamp", "time"]).unwrap_or_else(now_millis);

    Ok(Quote {
        symbol: symbol.to_string(),
        price,
        bid: sanitize(bid),
        ask: sanitize(ask),
        volume: sanitize(field_f64(data, &["volume"]).unwrap_or(0.0)),
        change: if change.is_finite() { change } else { 0.0 },
        change_percent: if change_percent.is_finite() {
            change_percent
        } else {
            0.0
        },
        high: sanitize(field_f64(data, &["high"]).unwrap_or(price)),
        low: sanitize(field_f64(data, &["low"]).unwrap_or(price)),
        open: sanitize(open),
        previous_close: sanitize(previous_close),
        timestamp,
        datetime: iso8601_millis(timestamp),
        source: QuoteSource::Live,
    })
}

fn normalize_candles(value: &Value, outputsize: usize) -> Result<Vec<Candle>, UpstreamError> {
    let rows = value
        .get("data")
        .unwrap_or(value)
        .as_array()
        .ok_or_else(|| UpstreamError::Data("historical payload is not an array".to_string()))?;

    let mut candles = Vec::with_capacity(rows.len().min(outputsize));
    for row in rows {
        let Some(timestamp) = field_u64(row, &["timestamp", "time"]) else {
            continue;
        };
        let Some(close) = field_f64(row, &["close"]) else {
            continue;
        };
        if !close.is_finite() {
            continue;
        }

        candles.push((
            timestamp,
            sanitize(field_f64(row, &["open"]).unwrap_or(close)),
            sanitize(field_f64(row, &["high"]).unwrap_or(close)),
            sanitize(field_f64(row, &["low"]).unwrap_or(close)),
            close,
            sanitize(field_f64(row, &["volume"]).unwrap_or(0.0)),
        ));
    }

    candles.sort_by_key(|candle| candle.0);
    if candles.len() > outputsize {
        let excess = candles.len() - outputsize;
        candles.drain(..excess);
    }
    Ok(candles)
}

fn field_f64(value: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| value.get(key).and_then(parse_f64_lossy))
}

fn field_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| value.get(key).and_then(parse_u64_lossy))
}

pub fn parse_f64_lossy(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|parsed| parsed.is_finite())
}

pub fn parse_u64_lossy(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().map(|float| float.max(0.0) as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        0.0
    }
}

fn truncate(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }

    let shortened: String = value.chars().take(limit).collect();
    format!("{shortened}...")
}

/// Infallible quote/candle source: live data when the upstream cooperates,
/// visibly tagged synthetic data when it does not. Callers always get
/// something usable to render.
pub struct QuoteProvider {
    upstream: Arc<dyn UpstreamDataSource>,
    last_live_price: RwLock<HashMap<String, f64>>,
}

impl QuoteProvider {
    pub fn new(upstream: Arc<dyn UpstreamDataSource>) -> Self {
        Self {
            upstream,
            last_live_price: RwLock::new(HashMap::new()),
        }
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamDataSource> {
        &self.upstream
    }

    pub async fn quote(&self, symbol: &str) -> Quote {
        match self.upstream.fetch_quote(symbol).await {
            Ok(quote) => {
                self.record_live_price(symbol, quote.price);
                quote
            }
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "upstream quote fetch failed, serving fallback");
                self.fallback_quote(symbol)
            }
        }
    }

    pub async fn historical(&self, symbol: &str, interval: &str, outputsize: usize) -> Vec<Candle> {
        match self
            .upstream
            .fetch_historical(symbol, interval, outputsize)
            .await
        {
            Ok(candles) if !candles.is_empty() => candles,
            Ok(_) => {
                warn!(symbol = %symbol, "upstream returned no candles, synthesizing history");
                self.fallback_candles(symbol, interval, outputsize)
            }
            Err(err) => {
                warn!(symbol = %symbol, error = %err, "upstream historical fetch failed, synthesizing history");
                self.fallback_candles(symbol, interval, outputsize)
            }
        }
    }

    pub fn fallback_quote(&self, symbol: &str) -> Quote {
        let base = self.base_price(symbol);
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-FALLBACK_JITTER_PCT..=FALLBACK_JITTER_PCT);
        let price = (base * (1.0 + jitter)).max(0.01);
        let spread = (price * 0.0005).max(0.01);
        let timestamp = now_millis();

        Quote {
            symbol: symbol.to_string(),
            price,
            bid: (price - spread).max(0.01),
            ask: price + spread,
            volume: rng.gen_range(10_000.0..1_000_000.0),
            change: price - base,
            change_percent: (price - base) / base * 100.0,
            high: price.max(base) * 1.001,
            low: price.min(base) * 0.999,
            open: base,
            previous_close: base,
            timestamp,
            datetime: iso8601_millis(timestamp),
            source: QuoteSource::Fallback,
        }
    }

    fn fallback_candles(&self, symbol: &str, interval: &str, outputsize: usize) -> Vec<Candle> {
        let step_ms = interval_to_ms(interval).unwrap_or(60_000);
        let base = self.base_price(symbol);
        let mut rng = rand::thread_rng();
        let now = now_millis();

        let mut candles = Vec::with_capacity(outputsize);
        let mut close = base;
        for index in (0..outputsize).rev() {
            let timestamp = now.saturating_sub(step_ms * (index as u64 + 1));
            let open = close;
            let drift = rng.gen_range(-0.005..=0.005);
            close = (open * (1.0 + drift)).max(0.01);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.002));
            let low = (open.min(close) * (1.0 - rng.gen_range(0.0..0.002))).max(0.01);
            let volume = rng.gen_range(5_000.0..500_000.0);
            candles.push((timestamp, open, high, low, close, volume));
        }
        candles
    }

    fn record_live_price(&self, symbol: &str, price: f64) {
        if !(price.is_finite() && price > 0.0) {
            return;
        }
        let mut guard = self
            .last_live_price
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(symbol.to_string(), price);
    }

    /// Anchor for synthetic data: last live price if we ever saw one, else a
    /// built-in table entry, else a deterministic symbol-derived price so the
    /// same symbol keeps the same neighborhood across ticks.
    fn base_price(&self, symbol: &str) -> f64 {
        {
            let guard = self
                .last_live_price
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(price) = guard.get(symbol) {
                return *price;
            }
        }

        match symbol {
            "AAPL" => 190.0,
            "MSFT" => 410.0,
            "GOOGL" => 165.0,
            "AMZN" => 185.0,
            "TSLA" => 250.0,
            "NVDA" => 125.0,
            "META" => 500.0,
            "SPY" => 520.0,
            "QQQ" => 445.0,
            _ => {
                let hash = symbol
                    .bytes()
                    .fold(7_u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u64));
                10.0 + (hash % 490) as f64
            }
        }
    }
}
