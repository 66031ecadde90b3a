use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_SYMBOL_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Live,
    Fallback,
}

/// Last-known normalized quote for one symbol. Immutable once built; a new
/// Quote replaces the cached one wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    pub change: f64,
    pub change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub open: f64,
    pub previous_close: f64,
    pub timestamp: u64,
    pub datetime: Option<String>,
    pub source: QuoteSource,
}

pub type Candle = (u64, f64, f64, f64, f64, f64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// Price-descending.
    pub bids: Vec<(f64, f64)>,
    /// Price-ascending.
    pub asks: Vec<(f64, f64)>,
    pub last_update: u64,
}

impl OrderBookSnapshot {
    pub fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            last_update: 0,
        }
    }

    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(price, _)| *price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(price, _)| *price)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDepth {
    pub symbol: String,
    pub bid_depth: f64,
    pub ask_depth: f64,
    pub imbalance: f64,
    pub pressure_index: f64,
}

/// One fan-out event, produced once per scheduler tick and shared by every
/// subscriber of the symbol.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketUpdate {
    pub symbol: String,
    pub sequence: u64,
    pub timestamp: u64,
    pub quote: Quote,
    pub depth: Option<MarketDepth>,
    pub book: Option<OrderBookSnapshot>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchQuotesRequest {
    pub symbols: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub symbol: String,
    pub interval_ms: Option<u64>,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub symbol: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalQuery {
    pub interval: Option<String>,
    pub outputsize: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthQuery {
    pub window: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub handle_id: u64,
    pub symbol: String,
    pub interval_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolStatus {
    pub symbol: String,
    pub subscribers: usize,
    pub interval_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_ms: u64,
    pub active_symbols: Vec<SymbolStatus>,
    pub total_subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub fn iso8601_millis(timestamp: u64) -> Option<String> {
    chrono::DateTime::<Utc>::from_timestamp_millis(timestamp as i64)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Canonical symbol form: trimmed, uppercased, 1..=12 chars of [A-Z0-9.-].
pub fn normalize_symbol(raw: &str) -> Result<String, String> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err("`symbol` cannot be empty".to_string());
    }
    if symbol.len() > MAX_SYMBOL_LEN {
        return Err(format!("`symbol` cannot exceed {MAX_SYMBOL_LEN} characters"));
    }
    if !symbol
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '.' || ch == '-')
    {
        return Err(format!("`{symbol}` is not a valid symbol"));
    }
    Ok(symbol)
}
