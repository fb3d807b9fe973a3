// src/main.rs
mod api;
mod auth;
mod broker;
mod config;
mod db;
mod error;
mod models;
mod pipeline;
mod pnl;
mod prices;
mod scheduler;
mod websocket;

use crate::api::AppState;
use crate::broker::{NeoClient, QuoteSource, SimulatedQuotes};
use crate::config::{Config, QuoteSourceKind, StoreBackend};
use crate::db::{ScyllaBackend, Store};
use crate::pipeline::Pipeline;
use crate::prices::PriceBook;
use crate::scheduler::CleanupPolicy;
use env_logger::Builder;
use log::{error, info, warn, LevelFilter};
use std::sync::Arc;
use tokio::sync::Notify;

const PRICE_BROADCAST_CAPACITY: usize = 256;

#[tokio::main]
async fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };

    let store = match config.store_backend {
        StoreBackend::Scylla => {
            match ScyllaBackend::connect(&config.scylla_node, &config.scylla_keyspace).await {
                Ok(backend) => Store::new(Arc::new(backend)),
                Err(e) => {
                    error!("Failed to initialize database: {}", e);
                    return;
                }
            }
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart");
            Store::in_memory()
        }
    };
    info!("Store ready");

    let neo = match NeoClient::new(&config.neo_base_url, &config.neo_consumer_key, config.api_timeout) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build broker client: {}", e);
            return;
        }
    };
    let quotes: Arc<dyn QuoteSource> = match config.quote_source {
        QuoteSourceKind::Neo => neo.clone(),
        QuoteSourceKind::Simulated => {
            info!("Using simulated quotes");
            Arc::new(SimulatedQuotes::default())
        }
    };

    let book = Arc::new(PriceBook::new(PRICE_BROADCAST_CAPACITY));
    let pipeline = Arc::new(Pipeline::new(store.clone(), book.clone(), quotes, &config));
    let (scheduler, worker) = scheduler::spawn(
        pipeline.clone(),
        config.refresh_interval,
        CleanupPolicy {
            hour_ist: config.cleanup_hour_ist,
            retention_days: config.quote_retention_days,
        },
    );

    let feed_shutdown = Arc::new(Notify::new());
    let feed = match config.neo_feed_url.clone() {
        Some(url) => {
            let symbols = match pipeline.tracked_symbols().await {
                Ok(symbols) => symbols,
                Err(e) => {
                    warn!("Could not list open positions for the feed: {}", e);
                    config.tracked_symbols.clone()
                }
            };
            info!("Starting broker quote feed for {} symbols", symbols.len());
            Some(tokio::spawn(websocket::run_feed(
                url,
                symbols,
                book.clone(),
                feed_shutdown.clone(),
            )))
        }
        None => None,
    };

    let bind_addr = config.bind_addr;
    let state = AppState::new(store, book, neo, scheduler.clone(), config);
    let routes = api::routes(state);

    let served = warp::serve(routes).try_bind_with_graceful_shutdown(bind_addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Could not listen for shutdown signal: {}", e);
        }
    });
    match served {
        Ok((addr, server)) => {
            info!("Server running on http://{}", addr);
            server.await;
        }
        Err(e) => error!("Could not bind {}: {}", bind_addr, e),
    }

    info!("Shutting down");
    scheduler.stop().await;
    if let Err(e) = worker.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Some(feed) = feed {
        feed_shutdown.notify_one();
        if let Err(e) = feed.await {
            error!("Quote feed task failed: {}", e);
        }
    }
}
