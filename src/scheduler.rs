use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    cache::QuoteCache,
    models::{now_millis, MarketUpdate, Quote, QuoteSource},
    orderbook::OrderBookStore,
    registry::SubscriptionRegistry,
    upstream::QuoteProvider,
};

/// Consecutive fallback ticks before the failure escalates to a warning.
const FAILURE_ESCALATION_THRESHOLD: u32 = 3;

pub struct SchedulerContext {
    pub symbol: String,
    pub provider: Arc<QuoteProvider>,
    pub cache: QuoteCache,
    pub books: OrderBookStore,
    pub registry: SubscriptionRegistry,
    pub depth_window_ticks: u32,
    pub shutdown: watch::Receiver<bool>,
    pub interval: watch::Receiver<Duration>,
}

/// The update loop for one Active symbol. One task per symbol, so upstream
/// call volume is bounded by distinct symbols, not subscriber count, and tick
/// N+1 can never start before tick N finishes.
pub async fn run_symbol_loop(mut context: SchedulerContext) {
    let mut period = *context.interval.borrow();
    info!(symbol = %context.symbol, interval_ms = period.as_millis() as u64, "update scheduler started");

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut sequence: u64 = 0;
    let mut failure_streak: u32 = 0;

    loop {
        tokio::select! {
            changed = context.shutdown.changed() => {
                if changed.is_err() || *context.shutdown.borrow() {
                    break;
                }
            }
            changed = context.interval.changed() => {
                let Ok(()) = changed else { break };
                let next_period = *context.interval.borrow();
                if next_period != period {
                    period = next_period;
                    ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    debug!(symbol = %context.symbol, interval_ms = period.as_millis() as u64, "tick interval updated");
                }
            }
            _ = ticker.tick() => {
                sequence += 1;
                run_tick(&context, sequence, &mut failure_streak).await;
            }
        }
    }

    info!(symbol = %context.symbol, "update scheduler stopped");
}

async fn run_tick(context: &SchedulerContext, sequence: u64, failure_streak: &mut u32) {
    let fetched = context.provider.quote(&context.symbol).await;

    let quote = match fetched.source {
        QuoteSource::Live => {
            *failure_streak = 0;
            context.cache.set(fetched.clone());
            fetched
        }
        QuoteSource::Fallback => {
            *failure_streak += 1;
            if *failure_streak == FAILURE_ESCALATION_THRESHOLD {
                warn!(
                    symbol = %context.symbol,
                    streak = *failure_streak,
                    "repeated upstream failures, continuing on cached/fallback data"
                );
            }
            // A stale real quote beats a synthetic one.
            stale_or_fallback(&context.cache, &context.symbol, fetched)
        }
    };

    if let Some(levels) = context.provider.upstream().fetch_depth(&quote) {
        // Levels left behind by an earlier tick may now cross the fresh
        // market; retire them first or the inversion guard rejects the
        // re-laddered side forever.
        context
            .books
            .retire_crossed_levels(&context.symbol, quote.bid, quote.ask);
        context.books.apply_levels(&context.symbol, &levels);
    }

    let book = context.books.get_book(&context.symbol);
    let depth = (!book.bids.is_empty() || !book.asks.is_empty())
        .then(|| context.books.get_depth(&context.symbol, context.depth_window_ticks));

    let update = MarketUpdate {
        symbol: context.symbol.clone(),
        sequence,
        timestamp: now_millis(),
        quote,
        depth,
        book: Some(book),
    };

    context
        .registry
        .publish(&context.symbol, Arc::new(update))
        .await;
}

fn stale_or_fallback(cache: &QuoteCache, symbol: &str, fallback: Quote) -> Quote {
    cache.get_stale(symbol).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::iso8601_millis;

    fn live_quote(symbol: &str, price: f64) -> Quote {
        let timestamp = now_millis();
        Quote {
            symbol: symbol.to_string(),
            price,
            bid: price - 0.05,
            ask: price + 0.05,
            volume: 250_000.0,
            change: 1.0,
            change_percent: 0.5,
            high: price + 1.0,
            low: price - 1.0,
            open: price - 0.5,
            previous_close: price - 1.0,
            timestamp,
            datetime: iso8601_millis(timestamp),
            source: QuoteSource::Live,
        }
    }

    #[test]
    fn stale_cached_quote_wins_over_fallback() {
        let cache = QuoteCache::new(1);
        let cached = live_quote("AAPL", 190.0);
        cache.set(cached.clone());

        let mut fallback = live_quote("AAPL", 50.0);
        fallback.source = QuoteSource::Fallback;

        let chosen = stale_or_fallback(&cache, "AAPL", fallback);
        assert_eq!(chosen.price, 190.0);
        assert_eq!(chosen.source, QuoteSource::Live);
    }

    #[test]
    fn fallback_is_used_when_nothing_is_cached() {
        let cache = QuoteCache::new(1);
        let mut fallback = live_quote("AAPL", 50.0);
        fallback.source = QuoteSource::Fallback;

        let chosen = stale_or_fallback(&cache, "AAPL", fallback);
        assert_eq!(chosen.source, QuoteSource::Fallback);
        assert_eq!(chosen.price, 50.0);
    }
}
