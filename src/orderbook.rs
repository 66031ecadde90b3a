use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, RwLock},
};

use ordered_float::OrderedFloat;
use tracing::error;

use crate::models::{now_millis, MarketDepth, OrderBookSnapshot, Side};

type Price = OrderedFloat<f64>;

/// Window over which level arrivals feed the pressure index.
const ARRIVAL_WINDOW_MS: u64 = 10_000;
const IMBALANCE_PRESSURE_WEIGHT: f64 = 75.0;
const ARRIVAL_PRESSURE_WEIGHT: f64 = 25.0;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BookError {
    #[error("invalid price: {0}")]
    InvalidPrice(f64),
    #[error("invalid size: {0}")]
    InvalidSize(f64),
    #[error("rejected inverting update: bid {bid} >= ask {ask}")]
    WouldInvert { bid: f64, ask: f64 },
}

#[derive(Default)]
struct Book {
    bids: BTreeMap<Price, f64>,
    asks: BTreeMap<Price, f64>,
    last_update: u64,
    arrivals: VecDeque<(u64, Side)>,
}

impl Book {
    fn best_bid(&self) -> Option<f64> {
        self.bids.keys().next_back().map(|price| price.0)
    }

    fn best_ask(&self) -> Option<f64> {
        self.asks.keys().next().map(|price| price.0)
    }

    fn upsert(&mut self, side: Side, price: f64, size: f64, now: u64) -> Result<(), BookError> {
        if !price.is_finite() || price <= 0.0 {
            return Err(BookError::InvalidPrice(price));
        }
        if !size.is_finite() || size < 0.0 {
            return Err(BookError::InvalidSize(size));
        }

        let key = OrderedFloat(price);
        if size == 0.0 {
            match side {
                Side::Bid => self.bids.remove(&key),
                Side::Ask => self.asks.remove(&key),
            };
            self.last_update = now;
            return Ok(());
        }

        // An inverted book is a data defect, never a valid state. The prior
        // book stays untouched so every derived read remains consistent.
        match side {
            Side::Bid => {
                if let Some(best_ask) = self.best_ask() {
                    if price >= best_ask {
                        return Err(BookError::WouldInvert {
                            bid: price,
                            ask: best_ask,
                        });
                    }
                }
                self.bids.insert(key, size);
            }
            Side::Ask => {
                if let Some(best_bid) = self.best_bid() {
                    if price <= best_bid {
                        return Err(BookError::WouldInvert {
                            bid: best_bid,
                            ask: price,
                        });
                    }
                }
                self.asks.insert(key, size);
            }
        }

        self.last_update = now;
        self.arrivals.push_back((now, side));
        let cutoff = now.saturating_sub(ARRIVAL_WINDOW_MS);
        while matches!(self.arrivals.front(), Some((when, _)) if *when < cutoff) {
            self.arrivals.pop_front();
        }
        Ok(())
    }

    fn snapshot(&self, symbol: &str) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(price, size)| (price.0, *size))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(price, size)| (price.0, *size))
                .collect(),
            last_update: self.last_update,
        }
    }

    fn depth(&self, symbol: &str, window_ticks: u32, now: u64) -> MarketDepth {
        let bid_depth = self.best_bid().map_or(0.0, |best| {
            let window = price_window(best, window_ticks);
            self.bids
                .range(OrderedFloat(best - window)..)
                .map(|(_, size)| *size)
                .sum()
        });
        let ask_depth = self.best_ask().map_or(0.0, |best| {
            let window = price_window(best, window_ticks);
            self.asks
                .range(..=OrderedFloat(best + window))
                .map(|(_, size)| *size)
                .sum()
        });

        let imbalance = if bid_depth + ask_depth > 0.0 {
            (bid_depth - ask_depth) / (bid_depth + ask_depth)
        } else {
            0.0
        };

        MarketDepth {
            symbol: symbol.to_string(),
            bid_depth,
            ask_depth,
            imbalance,
            pressure_index: pressure_index(imbalance, self.arrival_balance(now)),
        }
    }

    /// Signed bid-vs-ask share of recently accepted level arrivals, in [-1,1].
    fn arrival_balance(&self, now: u64) -> f64 {
        let cutoff = now.saturating_sub(ARRIVAL_WINDOW_MS);
        let mut bid_arrivals = 0.0;
        let mut ask_arrivals = 0.0;
        for (when, side) in &self.arrivals {
            if *when < cutoff {
                continue;
            }
            match side {
                Side::Bid => bid_arrivals += 1.0,
                Side::Ask => ask_arrivals += 1.0,
            }
        }
        if bid_arrivals + ask_arrivals > 0.0 {
            (bid_arrivals - ask_arrivals) / (bid_arrivals + ask_arrivals)
        } else {
            0.0
        }
    }
}

/// `pressure = 75*imbalance + 25*arrival_balance`, clamped to [-100, 100].
/// Monotonic in imbalance: the arrival term never depends on it.
fn pressure_index(imbalance: f64, arrival_balance: f64) -> f64 {
    (imbalance * IMBALANCE_PRESSURE_WEIGHT + arrival_balance * ARRIVAL_PRESSURE_WEIGHT)
        .clamp(-100.0, 100.0)
}

/// Price window covered by `window_ticks`, with the tick size inferred from
/// price magnitude so "10 ticks" stays meaningful from penny stocks to BTC.
fn price_window(best_price: f64, window_ticks: u32) -> f64 {
    let tick = if best_price < 1.0 {
        0.0001
    } else if best_price < 100.0 {
        0.01
    } else if best_price < 1_000.0 {
        0.1
    } else {
        1.0
    };
    tick * f64::from(window_ticks)
}

/// Per-symbol in-memory books. The update scheduler is the sole mutator for a
/// given symbol; request handlers only take snapshots under short read locks.
#[derive(Clone)]
pub struct OrderBookStore {
    books: Arc<RwLock<HashMap<String, Book>>>,
}

impl Default for OrderBookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBookStore {
    pub fn new() -> Self {
        Self {
            books: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn upsert_level(
        &self,
        symbol: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<(), BookError> {
        let now = now_millis();
        let mut guard = self
            .books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let book = guard.entry(symbol.to_string()).or_default();
        book.upsert(side, price, size, now).inspect_err(|err| {
            error!(symbol = %symbol, ?side, price, size, error = %err, "rejected order book update");
        })
    }

    /// Batched upserts from one scheduler tick. Rejected levels are dropped
    /// individually; the rest still apply. Returns the accepted count.
    pub fn apply_levels(&self, symbol: &str, levels: &[(Side, f64, f64)]) -> usize {
        let now = now_millis();
        let mut guard = self
            .books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let book = guard.entry(symbol.to_string()).or_default();

        let mut accepted = 0;
        for (side, price, size) in levels {
            match book.upsert(*side, *price, *size, now) {
                Ok(()) => accepted += 1,
                Err(err) => {
                    error!(symbol = %symbol, ?side, price, size, error = %err, "rejected order book update");
                }
            }
        }
        accepted
    }

    /// Drop resting levels a fresh two-sided quote has crossed, so the
    /// scheduler can re-ladder around the new market without tripping the
    /// inversion guard. Returns the number of retired levels.
    pub fn retire_crossed_levels(&self, symbol: &str, bid: f64, ask: f64) -> usize {
        if !(bid.is_finite() && ask.is_finite()) || bid <= 0.0 || bid >= ask {
            return 0;
        }

        let mut guard = self
            .books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(book) = guard.get_mut(symbol) else {
            return 0;
        };

        let before = book.bids.len() + book.asks.len();
        book.bids.retain(|price, _| price.0 < ask);
        book.asks.retain(|price, _| price.0 > bid);
        let retired = before - (book.bids.len() + book.asks.len());
        if retired > 0 {
            book.last_update = now_millis();
        }
        retired
    }

    pub fn get_book(&self, symbol: &str) -> OrderBookSnapshot {
        let guard = self
            .books
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(symbol)
            .map(|book| book.snapshot(symbol))
            .unwrap_or_else(|| OrderBookSnapshot::empty(symbol))
    }

    pub fn get_depth(&self, symbol: &str, window_ticks: u32) -> MarketDepth {
        let guard = self
            .books
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.get(symbol) {
            Some(book) => book.depth(symbol, window_ticks, now_millis()),
            None => MarketDepth {
                symbol: symbol.to_string(),
                bid_depth: 0.0,
                ask_depth: 0.0,
                imbalance: 0.0,
                pressure_index: 0.0,
            },
        }
    }

    pub fn evict(&self, symbol: &str) {
        let mut guard = self
            .books
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(symbol);
    }
}
