use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use crate::{
    cache::QuoteCache,
    config::Config,
    models::{MarketUpdate, StatusResponse, SymbolStatus},
    orderbook::OrderBookStore,
    scheduler::{self, SchedulerContext},
    upstream::QuoteProvider,
};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub min_update_interval_ms: u64,
    pub max_update_interval_ms: u64,
    pub idle_grace_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub depth_window_ticks: u32,
}

impl RegistryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_update_interval_ms: config.min_update_interval_ms,
            max_update_interval_ms: config.max_update_interval_ms,
            idle_grace_ms: config.idle_grace_ms,
            subscriber_queue_capacity: config.subscriber_queue_capacity,
            depth_window_ticks: config.depth_window_ticks,
        }
    }

    fn clamp_interval_ms(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.min_update_interval_ms)
            .clamp(self.min_update_interval_ms, self.max_update_interval_ms)
    }
}

/// A live subscription: the receiving end of that subscriber's bounded event
/// queue plus the handle id used to unsubscribe.
pub struct SubscriptionHandle {
    pub id: u64,
    pub symbol: String,
    pub interval_ms: u64,
    pub receiver: mpsc::Receiver<Arc<MarketUpdate>>,
}

struct Subscriber {
    session_id: String,
    interval_ms: u64,
    sender: mpsc::Sender<Arc<MarketUpdate>>,
}

struct ActiveSymbol {
    subscribers: HashMap<u64, Subscriber>,
    shutdown: watch::Sender<bool>,
    interval: watch::Sender<Duration>,
    /// Bumped each time the symbol goes idle; lets a grace task detect that
    /// its teardown decision is stale.
    idle_epoch: u64,
}

impl ActiveSymbol {
    fn effective_interval(&self) -> Option<Duration> {
        self.subscribers
            .values()
            .map(|subscriber| subscriber.interval_ms)
            .min()
            .map(Duration::from_millis)
    }
}

#[derive(Default)]
struct RegistryState {
    symbols: HashMap<String, ActiveSymbol>,
    handle_index: HashMap<u64, String>,
}

/// Owns the subscriber-count invariant that starts and stops per-symbol
/// schedulers, and fans scheduler events out to per-subscriber queues.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    next_handle_id: AtomicU64,
    config: RegistryConfig,
    provider: Arc<QuoteProvider>,
    cache: QuoteCache,
    books: OrderBookStore,
}

impl SubscriptionRegistry {
    pub fn new(
        config: RegistryConfig,
        provider: Arc<QuoteProvider>,
        cache: QuoteCache,
        books: OrderBookStore,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                next_handle_id: AtomicU64::new(1),
                config,
                provider,
                cache,
                books,
            }),
        }
    }

    /// Register a subscriber for `symbol`. The count bump and the
    /// start-scheduler decision happen under one write lock, so concurrent
    /// subscribes can neither double-start a scheduler nor drop an update.
    pub async fn subscribe(
        &self,
        symbol: &str,
        session_id: &str,
        requested_interval_ms: Option<u64>,
    ) -> SubscriptionHandle {
        let interval_ms = self.inner.config.clamp_interval_ms(requested_interval_ms);
        let handle_id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.config.subscriber_queue_capacity);

        let subscriber = Subscriber {
            session_id: session_id.to_string(),
            interval_ms,
            sender,
        };

        let mut spawn_context = None;
        {
            let mut state = self.inner.state.write().await;
            state.handle_index.insert(handle_id, symbol.to_string());

            if let Some(active) = state.symbols.get_mut(symbol) {
                active.subscribers.insert(handle_id, subscriber);
                if let Some(interval) = active.effective_interval() {
                    let _ = active.interval.send(interval);
                }
            } else {
                let (shutdown_sender, shutdown_receiver) = watch::channel(false);
                let (interval_sender, interval_receiver) =
                    watch::channel(Duration::from_millis(interval_ms));

                let mut subscribers = HashMap::new();
                subscribers.insert(handle_id, subscriber);
                state.symbols.insert(
                    symbol.to_string(),
                    ActiveSymbol {
                        subscribers,
                        shutdown: shutdown_sender,
                        interval: interval_sender,
                        idle_epoch: 0,
                    },
                );

                spawn_context = Some(SchedulerContext {
                    symbol: symbol.to_string(),
                    provider: self.inner.provider.clone(),
                    cache: self.inner.cache.clone(),
                    books: self.inner.books.clone(),
                    registry: self.clone(),
                    depth_window_ticks: self.inner.config.depth_window_ticks,
                    shutdown: shutdown_receiver,
                    interval: interval_receiver,
                });
            }
        }

        if let Some(context) = spawn_context {
            tokio::spawn(scheduler::run_symbol_loop(context));
        }

        info!(
            symbol = %symbol,
            session_id = %session_id,
            handle_id,
            interval_ms,
            "subscriber added"
        );

        SubscriptionHandle {
            id: handle_id,
            symbol: symbol.to_string(),
            interval_ms,
            receiver,
        }
    }

    /// Remove one subscription. Unknown or already-removed handles are
    /// no-ops: client cleanup code must be free to over-unsubscribe.
    pub async fn unsubscribe(&self, handle_id: u64) {
        let mut grace = None;
        {
            let mut state = self.inner.state.write().await;
            let Some(symbol) = state.handle_index.remove(&handle_id) else {
                return;
            };
            let Some(active) = state.symbols.get_mut(&symbol) else {
                return;
            };
            if active.subscribers.remove(&handle_id).is_none() {
                return;
            }

            if active.subscribers.is_empty() {
                active.idle_epoch += 1;
                grace = Some((symbol.clone(), active.idle_epoch));
            } else if let Some(interval) = active.effective_interval() {
                let _ = active.interval.send(interval);
            }
            info!(symbol = %symbol, handle_id, "subscriber removed");
        }

        if let Some((symbol, epoch)) = grace {
            let registry = self.clone();
            let delay = Duration::from_millis(self.inner.config.idle_grace_ms);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                registry.retire_if_idle(&symbol, epoch).await;
            });
        }
    }

    /// Remove every subscription a session holds on `symbol`. No-op when the
    /// session holds none.
    pub async fn unsubscribe_session(&self, symbol: &str, session_id: &str) {
        let handle_ids: Vec<u64> = {
            let state = self.inner.state.read().await;
            match state.symbols.get(symbol) {
                Some(active) => active
                    .subscribers
                    .iter()
                    .filter(|(_, subscriber)| subscriber.session_id == session_id)
                    .map(|(id, _)| *id)
                    .collect(),
                None => Vec::new(),
            }
        };

        for handle_id in handle_ids {
            self.unsubscribe(handle_id).await;
        }
    }

    pub async fn subscriber_count(&self, symbol: &str) -> usize {
        let state = self.inner.state.read().await;
        state
            .symbols
            .get(symbol)
            .map(|active| active.subscribers.len())
            .unwrap_or(0)
    }

    /// Deliver one event to every subscriber of `symbol`. Each delivery is
    /// isolated: a full or closed queue logs, marks that subscriber for
    /// removal, and never blocks the others. Per-subscriber mpsc queues keep
    /// events in production order for each subscriber.
    pub async fn publish(&self, symbol: &str, update: Arc<MarketUpdate>) {
        let mut failed = Vec::new();
        {
            let state = self.inner.state.read().await;
            let Some(active) = state.symbols.get(symbol) else {
                return;
            };
            for (handle_id, subscriber) in &active.subscribers {
                match subscriber.sender.try_send(update.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(symbol = %symbol, handle_id, "subscriber queue full, dropping subscriber");
                        failed.push(*handle_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(symbol = %symbol, handle_id, "subscriber queue closed, dropping subscriber");
                        failed.push(*handle_id);
                    }
                }
            }
        }

        for handle_id in failed {
            self.unsubscribe(handle_id).await;
        }
    }

    pub async fn status(&self, uptime_ms: u64) -> StatusResponse {
        let state = self.inner.state.read().await;
        let mut active_symbols: Vec<SymbolStatus> = state
            .symbols
            .iter()
            .map(|(symbol, active)| SymbolStatus {
                symbol: symbol.clone(),
                subscribers: active.subscribers.len(),
                interval_ms: active
                    .effective_interval()
                    .map(|interval| interval.as_millis() as u64)
                    .unwrap_or(0),
            })
            .collect();
        active_symbols.sort_by(|left, right| left.symbol.cmp(&right.symbol));

        let total_subscribers = active_symbols.iter().map(|status| status.subscribers).sum();
        StatusResponse {
            uptime_ms,
            active_symbols,
            total_subscribers,
        }
    }

    /// Grace-period callback: tear the symbol down only if it is still idle
    /// and no resubscribe has happened since the epoch was captured.
    async fn retire_if_idle(&self, symbol: &str, epoch: u64) {
        let retired = {
            let mut state = self.inner.state.write().await;
            match state.symbols.get(symbol) {
                Some(active) if active.subscribers.is_empty() && active.idle_epoch == epoch => {
                    state.symbols.remove(symbol)
                }
                _ => None,
            }
        };

        if let Some(active) = retired {
            let _ = active.shutdown.send(true);
            self.inner.books.evict(symbol);
            self.inner.cache.evict(symbol);
            info!(symbol = %symbol, "idle symbol retired");
        }
    }

    #[cfg(test)]
    pub(crate) async fn active_symbol_count(&self) -> usize {
        self.inner.state.read().await.symbols.len()
    }
}
