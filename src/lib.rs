pub mod cache;
pub mod config;
pub mod errors;
pub mod models;
pub mod orderbook;
pub mod registry;
pub mod scheduler;
pub mod upstream;
pub mod web;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use cache::QuoteCache;
use config::Config;
use orderbook::OrderBookStore;
use registry::{RegistryConfig, SubscriptionRegistry};
use upstream::{QuoteProvider, UpstreamDataSource};
use web::AppState;

/// Wire the service together around an upstream source. Tests inject fakes
/// here; `main` passes the HTTP upstream.
pub fn build_app(config: Arc<Config>, upstream: Arc<dyn UpstreamDataSource>) -> Router {
    let provider = Arc::new(QuoteProvider::new(upstream));
    let cache = QuoteCache::new(config.quote_ttl_ms);
    let books = OrderBookStore::new();
    let registry = SubscriptionRegistry::new(
        RegistryConfig::from_config(&config),
        provider.clone(),
        cache.clone(),
        books.clone(),
    );

    let state = AppState::new(registry, provider, cache, books, config);

    Router::new()
        .route("/healthz", get(web::health))
        .route("/v1/quote/{symbol}", get(web::get_quote))
        .route("/v1/quotes", post(web::batch_quotes))
        .route("/v1/historical/{symbol}", get(web::get_historical))
        .route("/v1/orderbook/{symbol}", get(web::get_order_book))
        .route("/v1/depth/{symbol}", get(web::get_depth))
        .route("/v1/subscribe", post(web::subscribe))
        .route("/v1/unsubscribe", post(web::unsubscribe))
        .route("/v1/status", get(web::status))
        .route("/v1/stream", get(web::market_stream_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
