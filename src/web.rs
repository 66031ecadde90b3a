use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{channel, error::TrySendError, Receiver, Sender},
        Notify,
    },
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    cache::QuoteCache,
    config::Config,
    errors::{ok, ApiError, DataEnvelope},
    models::{
        normalize_symbol, BatchQuotesRequest, Candle, DepthQuery, HealthResponse, HistoricalQuery,
        MarketDepth, MarketUpdate, OrderBookSnapshot, Quote, QuoteSource, StatusResponse,
        SubscribeRequest, SubscribeResponse, UnsubscribeRequest,
    },
    orderbook::OrderBookStore,
    registry::SubscriptionRegistry,
    upstream::{interval_to_ms, QuoteProvider, DEFAULT_HISTORICAL_INTERVAL, MAX_HISTORICAL_OUTPUTSIZE},
};

const CLIENT_OUTGOING_QUEUE_CAPACITY: usize = 256;
const DEFAULT_HISTORICAL_OUTPUTSIZE: usize = 30;

static WS_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct AppState {
    pub registry: SubscriptionRegistry,
    pub provider: Arc<QuoteProvider>,
    pub cache: QuoteCache,
    pub books: OrderBookStore,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: SubscriptionRegistry,
        provider: Arc<QuoteProvider>,
        cache: QuoteCache,
        books: OrderBookStore,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            provider,
            cache,
            books,
            config,
            started_at: Instant::now(),
        }
    }

    /// Cached quote when fresh, on-demand fetch otherwise. Live fetches
    /// repopulate the cache; fallback quotes are served but never cached.
    async fn quote_for(&self, symbol: &str) -> Quote {
        if let Some(quote) = self.cache.get(symbol) {
            return quote;
        }
        let quote = self.provider.quote(symbol).await;
        if quote.source == QuoteSource::Live {
            self.cache.set(quote.clone());
        }
        quote
    }
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub async fn get_quote(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<DataEnvelope<Quote>>, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(ApiError::Validation)?;
    Ok(ok(state.quote_for(&symbol).await))
}

pub async fn batch_quotes(
    State(state): State<AppState>,
    Json(request): Json<BatchQuotesRequest>,
) -> Result<Json<DataEnvelope<Vec<Quote>>>, ApiError> {
    if request.symbols.is_empty() {
        return Err(ApiError::Validation(
            "`symbols` cannot be empty".to_string(),
        ));
    }
    if request.symbols.len() > state.config.max_batch_symbols {
        return Err(ApiError::Validation(format!(
            "`symbols` cannot exceed {} entries",
            state.config.max_batch_symbols
        )));
    }

    let mut quotes = Vec::with_capacity(request.symbols.len());
    for raw in &request.symbols {
        match normalize_symbol(raw) {
            Ok(symbol) => quotes.push(state.quote_for(&symbol).await),
            Err(err) => {
                // One bad symbol never fails the whole batch.
                warn!(symbol = %raw, error = %err, "skipping invalid symbol in batch request");
            }
        }
    }
    Ok(ok(quotes))
}

pub async fn get_historical(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<DataEnvelope<Vec<Candle>>>, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(ApiError::Validation)?;

    let interval = query
        .interval
        .unwrap_or_else(|| DEFAULT_HISTORICAL_INTERVAL.to_string());
    if interval_to_ms(&interval).is_none() {
        return Err(ApiError::Validation(format!(
            "unsupported interval `{interval}`"
        )));
    }

    let outputsize = query
        .outputsize
        .unwrap_or(DEFAULT_HISTORICAL_OUTPUTSIZE)
        .clamp(1, MAX_HISTORICAL_OUTPUTSIZE);

    let candles = state.provider.historical(&symbol, &interval, outputsize).await;
    Ok(ok(candles))
}

pub async fn get_order_book(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<DataEnvelope<OrderBookSnapshot>>, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(ApiError::Validation)?;
    Ok(ok(state.books.get_book(&symbol)))
}

pub async fn get_depth(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<DataEnvelope<MarketDepth>>, ApiError> {
    let symbol = normalize_symbol(&symbol).map_err(ApiError::Validation)?;
    let window = query.window.unwrap_or(state.config.depth_window_ticks);
    if window == 0 {
        return Err(ApiError::Validation(
            "`window` must be greater than 0".to_string(),
        ));
    }
    Ok(ok(state.books.get_depth(&symbol, window)))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Json<DataEnvelope<SubscribeResponse>>, ApiError> {
    let symbol = normalize_symbol(&request.symbol).map_err(ApiError::Validation)?;
    let session_id = request.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::Validation(
            "`sessionId` cannot be empty".to_string(),
        ));
    }

    let handle = state
        .registry
        .subscribe(&symbol, session_id, request.interval_ms)
        .await;

    let response = SubscribeResponse {
        handle_id: handle.id,
        symbol: handle.symbol.clone(),
        interval_ms: handle.interval_ms,
    };

    // REST subscriptions are polling handles: clients read the cache while
    // the subscription keeps the symbol's scheduler alive. Drain the queue so
    // the subscriber is never pruned as a slow consumer.
    tokio::spawn(drain_polling_handle(handle.symbol, handle.receiver));

    Ok(ok(response))
}

async fn drain_polling_handle(symbol: String, mut receiver: Receiver<Arc<MarketUpdate>>) {
    while receiver.recv().await.is_some() {}
    debug!(symbol = %symbol, "polling handle drained and closed");
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    Json(request): Json<UnsubscribeRequest>,
) -> Result<Json<DataEnvelope<bool>>, ApiError> {
    let symbol = normalize_symbol(&request.symbol).map_err(ApiError::Validation)?;
    let session_id = request.session_id.trim();
    if session_id.is_empty() {
        return Err(ApiError::Validation(
            "`sessionId` cannot be empty".to_string(),
        ));
    }

    // Unknown symbol/session pairs are deliberate no-ops.
    state.registry.unsubscribe_session(&symbol, session_id).await;
    Ok(ok(true))
}

pub async fn status(
    State(state): State<AppState>,
) -> Result<Json<DataEnvelope<StatusResponse>>, ApiError> {
    let uptime_ms = state.started_at.elapsed().as_millis() as u64;
    Ok(ok(state.registry.status(uptime_ms).await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStreamCommand {
    op: String,
    symbol: Option<String>,
    interval_ms: Option<u64>,
}

enum ParsedStreamCommand {
    Subscribe { symbol: String, interval_ms: Option<u64> },
    Unsubscribe { symbol: String },
    Ping,
}

struct ClientSubscription {
    handle_id: u64,
    forward_task: JoinHandle<()>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsErrorMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsAckMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    op: &'static str,
    symbol: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WsUpdateMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    data: &'a MarketUpdate,
}

#[derive(Serialize)]
struct WsPongMessage {
    #[serde(rename = "type")]
    message_type: &'static str,
}

pub async fn market_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_market_stream_socket(socket, state))
}

async fn handle_market_stream_socket(socket: WebSocket, state: AppState) {
    let session_id = format!(
        "ws-{}",
        WS_CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outgoing_sender, mut outgoing_receiver) =
        channel::<Message>(CLIENT_OUTGOING_QUEUE_CAPACITY);
    let close_signal = Arc::new(Notify::new());

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outgoing_receiver.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<String, ClientSubscription> = HashMap::new();

    loop {
        let next_message = tokio::select! {
            _ = close_signal.notified() => {
                warn!(session_id = %session_id, "closing websocket client after forwarder backpressure");
                break;
            }
            next_message = ws_receiver.next() => next_message,
        };

        let Some(next_message) = next_message else {
            break;
        };

        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "client websocket read error");
                break;
            }
        };

        match message {
            Message::Ping(payload) => {
                if outgoing_sender.try_send(Message::Pong(payload)).is_err() {
                    break;
                }
            }
            Message::Close(_) => {
                break;
            }
            other => {
                let text = match ws_message_to_text(other) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(err) => {
                        if !send_ws_error(&outgoing_sender, "INVALID_MESSAGE", err) {
                            break;
                        }
                        continue;
                    }
                };

                let command = match parse_stream_command(&text) {
                    Ok(command) => command,
                    Err(err) => {
                        if !send_ws_error(&outgoing_sender, "INVALID_COMMAND", err) {
                            break;
                        }
                        continue;
                    }
                };

                if !handle_stream_command(
                    &state,
                    &session_id,
                    command,
                    &outgoing_sender,
                    &close_signal,
                    &mut subscriptions,
                )
                .await
                {
                    break;
                }
            }
        }
    }

    for (_, subscription) in subscriptions {
        subscription.forward_task.abort();
        state.registry.unsubscribe(subscription.handle_id).await;
    }

    drop(outgoing_sender);
    let _ = writer_task.await;
}

async fn handle_stream_command(
    state: &AppState,
    session_id: &str,
    command: ParsedStreamCommand,
    outgoing_sender: &Sender<Message>,
    close_signal: &Arc<Notify>,
    subscriptions: &mut HashMap<String, ClientSubscription>,
) -> bool {
    match command {
        ParsedStreamCommand::Ping => send_ws_json(
            outgoing_sender,
            &WsPongMessage {
                message_type: "pong",
            },
        ),
        ParsedStreamCommand::Subscribe { symbol, interval_ms } => {
            if subscriptions.contains_key(&symbol) {
                return send_ws_json(
                    outgoing_sender,
                    &WsAckMessage {
                        message_type: "alreadySubscribed",
                        op: "subscribe",
                        symbol: &symbol,
                    },
                );
            }

            let handle = state
                .registry
                .subscribe(&symbol, session_id, interval_ms)
                .await;

            let forward_task = spawn_update_forwarder(
                handle.receiver,
                outgoing_sender.clone(),
                close_signal.clone(),
            );

            subscriptions.insert(
                symbol.clone(),
                ClientSubscription {
                    handle_id: handle.id,
                    forward_task,
                },
            );

            send_ws_json(
                outgoing_sender,
                &WsAckMessage {
                    message_type: "subscribed",
                    op: "subscribe",
                    symbol: &symbol,
                },
            )
        }
        ParsedStreamCommand::Unsubscribe { symbol } => {
            let Some(existing) = subscriptions.remove(&symbol) else {
                return send_ws_error(
                    outgoing_sender,
                    "NOT_SUBSCRIBED",
                    "symbol is not currently subscribed on this connection",
                );
            };

            existing.forward_task.abort();
            state.registry.unsubscribe(existing.handle_id).await;

            send_ws_json(
                outgoing_sender,
                &WsAckMessage {
                    message_type: "unsubscribed",
                    op: "unsubscribe",
                    symbol: &symbol,
                },
            )
        }
    }
}

fn spawn_update_forwarder(
    mut receiver: Receiver<Arc<MarketUpdate>>,
    outgoing_sender: Sender<Message>,
    close_signal: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = receiver.recv().await {
            if !send_ws_json(
                &outgoing_sender,
                &WsUpdateMessage {
                    message_type: "update",
                    data: update.as_ref(),
                },
            ) {
                close_signal.notify_one();
                return;
            }
        }
    })
}

fn parse_stream_command(payload: &str) -> Result<ParsedStreamCommand, String> {
    let command = serde_json::from_str::<ClientStreamCommand>(payload)
        .map_err(|err| format!("invalid JSON command: {err}"))?;

    let op = command.op.trim().to_ascii_lowercase();
    match op.as_str() {
        "ping" => Ok(ParsedStreamCommand::Ping),
        "subscribe" | "unsubscribe" => {
            let symbol = normalize_symbol(&command.symbol.unwrap_or_default())?;
            if op == "subscribe" {
                Ok(ParsedStreamCommand::Subscribe {
                    symbol,
                    interval_ms: command.interval_ms,
                })
            } else {
                Ok(ParsedStreamCommand::Unsubscribe { symbol })
            }
        }
        other => Err(format!(
            "unsupported op `{other}`; expected `subscribe`, `unsubscribe`, or `ping`"
        )),
    }
}

fn ws_message_to_text(message: Message) -> Result<Option<String>, String> {
    match message {
        Message::Text(text) => Ok(Some(text.to_string())),
        Message::Binary(binary) => String::from_utf8(binary.to_vec())
            .map(Some)
            .map_err(|err| format!("invalid UTF-8 websocket payload: {err}")),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => Ok(None),
    }
}

fn send_ws_error(
    outgoing_sender: &Sender<Message>,
    code: &'static str,
    message: impl Into<String>,
) -> bool {
    send_ws_json(
        outgoing_sender,
        &WsErrorMessage {
            message_type: "error",
            code,
            message: message.into(),
        },
    )
}

fn send_ws_json<T: Serialize>(outgoing_sender: &Sender<Message>, payload: &T) -> bool {
    let encoded = match serde_json::to_string(payload) {
        Ok(encoded) => encoded,
        Err(err) => {
            warn!(error = %err, "failed to serialize websocket message");
            return false;
        }
    };

    match outgoing_sender.try_send(Message::Text(encoded.into())) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("closing websocket client: outgoing queue is full");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
