use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use tracing::debug;

use crate::models::{now_millis, Quote};

/// How many inserts between opportunistic sweeps of expired entries.
const SWEEP_EVERY_INSERTS: u64 = 64;

struct CachedQuote {
    quote: Quote,
    inserted_at: u64,
}

/// Short-TTL store of the last-known quote per symbol. Expired entries read
/// as absent but stay in the map until the next sweep; `get_stale` ignores
/// the TTL for callers that prefer stale data over none.
#[derive(Clone)]
pub struct QuoteCache {
    inner: Arc<RwLock<HashMap<String, CachedQuote>>>,
    ttl_ms: u64,
    insert_counter: Arc<AtomicU64>,
}

impl QuoteCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            ttl_ms,
            insert_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Quote> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = guard.get(symbol)?;
        if self.is_expired(entry, now_millis()) {
            return None;
        }
        Some(entry.quote.clone())
    }

    /// Last-known quote regardless of TTL. Used by the scheduler when a tick's
    /// live fetch fails and stale data still beats none.
    pub fn get_stale(&self, symbol: &str) -> Option<Quote> {
        let guard = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(symbol).map(|entry| entry.quote.clone())
    }

    pub fn set(&self, quote: Quote) {
        let symbol = quote.symbol.clone();
        {
            let mut guard = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.insert(
                symbol,
                CachedQuote {
                    quote,
                    inserted_at: now_millis(),
                },
            );
        }

        let inserts = self.insert_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % SWEEP_EVERY_INSERTS == 0 {
            self.sweep();
        }
    }

    pub fn evict(&self, symbol: &str) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.remove(symbol);
    }

    pub fn sweep(&self) {
        let now = now_millis();
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = guard.len();
        guard.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - guard.len();
        if removed > 0 {
            debug!(removed, "swept expired quote cache entries");
        }
    }

    fn is_expired(&self, entry: &CachedQuote, now: u64) -> bool {
        now.saturating_sub(entry.inserted_at) > self.ttl_ms
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    #[cfg(test)]
    fn backdate(&self, symbol: &str, age_ms: u64) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = guard.get_mut(symbol) {
            entry.inserted_at = entry.inserted_at.saturating_sub(age_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteSource;

    fn sample_quote(symbol: &str, price: f64) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            price,
            bid: price - 0.01,
            ask: price + 0.01,
            volume: 1_000.0,
            change: 0.5,
            change_percent: 0.25,
            high: price + 1.0,
            low: price - 1.0,
            open: price - 0.5,
            previous_close: price - 0.5,
            timestamp: now_millis(),
            datetime: None,
            source: QuoteSource::Live,
        }
    }

    #[test]
    fn fresh_entry_is_readable() {
        let cache = QuoteCache::new(5_000);
        cache.set(sample_quote("AAPL", 190.0));
        let quote = cache.get("AAPL").expect("fresh entry should be present");
        assert_eq!(quote.price, 190.0);
    }

    #[test]
    fn expired_entry_reads_as_absent_but_is_retained() {
        let cache = QuoteCache::new(100);
        cache.set(sample_quote("AAPL", 190.0));
        cache.backdate("AAPL", 1_000);

        assert!(cache.get("AAPL").is_none());
        assert_eq!(cache.len(), 1, "expiry must be lazy, not eager");
        assert!(cache.get_stale("AAPL").is_some());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = QuoteCache::new(100);
        cache.set(sample_quote("AAPL", 190.0));
        cache.set(sample_quote("MSFT", 410.0));
        cache.backdate("AAPL", 1_000);

        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("MSFT").is_some());
        assert!(cache.get_stale("AAPL").is_none());
    }

    #[test]
    fn newer_quote_replaces_older_atomically() {
        let cache = QuoteCache::new(5_000);
        cache.set(sample_quote("AAPL", 190.0));
        cache.set(sample_quote("AAPL", 191.5));
        let quote = cache.get("AAPL").expect("entry should be present");
        assert_eq!(quote.price, 191.5);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evict_removes_entry() {
        let cache = QuoteCache::new(5_000);
        cache.set(sample_quote("AAPL", 190.0));
        cache.evict("AAPL");
        assert!(cache.get_stale("AAPL").is_none());
    }
}
