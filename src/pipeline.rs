// src/pipeline.rs
//! One price refresh cycle: quotes in, repriced positions out.

use crate::broker::QuoteSource;
use crate::config::Config;
use crate::db::Store;
use crate::error::{BrokerError, StoreError};
use crate::models::{trading_date, PriceTick, Quote, SignalStatus};
use crate::pnl::Priced;
use crate::prices::{PriceBook, UpdateOrigin};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    pub symbols: usize,
    pub updated: usize,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub positions_updated: usize,
    pub expired_signals: usize,
    pub breaker_tripped: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub quotes_deleted: usize,
    pub ticks_deleted: usize,
    pub ran_at: Option<DateTime<Utc>>,
}

// Active records seen at the start of a cycle. Only symbols and ids are
// trusted; records are re-read before every write.
struct OpenPositions {
    signals: Vec<crate::models::AdminTradeSignal>,
    trades: Vec<crate::models::EtfSignalTrade>,
    deals: Vec<crate::models::UserDeal>,
}

fn ids_for<T: Priced>(records: &[T], symbol: &str, id: fn(&T) -> Uuid) -> Vec<Uuid> {
    records
        .iter()
        .filter(|r| r.symbol().eq_ignore_ascii_case(symbol))
        .map(id)
        .collect()
}

pub struct Pipeline {
    store: Store,
    book: Arc<PriceBook>,
    source: Arc<dyn QuoteSource>,
    tracked_symbols: Vec<String>,
    max_retries: u32,
    breaker_threshold: u32,
    retry_backoff: Duration,
}

impl Pipeline {
    pub fn new(store: Store, book: Arc<PriceBook>, source: Arc<dyn QuoteSource>, config: &Config) -> Self {
        Pipeline {
            store,
            book,
            source,
            tracked_symbols: config.tracked_symbols.clone(),
            max_retries: config.max_api_retries.max(1),
            breaker_threshold: config.breaker_threshold.max(1),
            retry_backoff: config.retry_backoff,
        }
    }

    async fn open_positions(&self) -> Result<OpenPositions, StoreError> {
        Ok(OpenPositions {
            signals: self.store.active_signals().await?,
            trades: self.store.active_trades().await?,
            deals: self.store.active_deals().await?,
        })
    }

    /// Configured symbols plus every symbol an open record refers to.
    fn symbols_for(&self, open: &OpenPositions) -> Vec<String> {
        let mut symbols: BTreeSet<String> = self
            .tracked_symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .collect();
        symbols.extend(open.signals.iter().map(|s| s.symbol.trim().to_uppercase()));
        symbols.extend(open.trades.iter().map(|t| t.symbol.trim().to_uppercase()));
        symbols.extend(open.deals.iter().map(|d| d.symbol.trim().to_uppercase()));
        symbols.retain(|s| !s.is_empty());
        symbols.into_iter().collect()
    }

    pub async fn tracked_symbols(&self) -> Result<Vec<String>, StoreError> {
        let open = self.open_positions().await?;
        Ok(self.symbols_for(&open))
    }

    async fn expire_signals(&self, open: &mut OpenPositions, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut expired = 0;
        for id in open.signals.iter().filter(|s| s.is_expired_at(now)).map(|s| s.id) {
            let mut signal = match self.store.get_signal(id).await? {
                Some(signal) if signal.is_active() => signal,
                _ => continue,
            };
            signal.status = SignalStatus::Expired;
            signal.updated_at = now;
            self.store.save_signal(&signal).await?;
            info!("Signal {} for {} expired", signal.id, signal.symbol);
            expired += 1;
        }
        open.signals.retain(|s| !s.is_expired_at(now));
        Ok(expired)
    }

    async fn fetch_with_retry(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let mut attempt = 1;
        loop {
            let result = match self.source.fetch_quote(symbol).await {
                Ok(quote) if quote.ltp > 0.0 => Ok(quote),
                Ok(_) => Err(BrokerError::NoQuote(symbol.to_string())),
                Err(e) => Err(e),
            };
            match result {
                Ok(quote) => return Ok(quote),
                Err(e) if attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    warn!(
                        "Quote fetch for {} failed (attempt {}/{}): {}",
                        symbol, attempt, self.max_retries, e
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Persists one quote and pushes its price to every open record of the
    /// symbol. Each record is re-read just before the write so edits made
    /// since the cycle started survive; only the price fields change.
    /// Returns the number of records repriced.
    async fn apply_quote(&self, quote: Quote, open: &OpenPositions) -> Result<usize, StoreError> {
        let symbol = quote.symbol.clone();
        let price = quote.ltp;
        let at = quote.timestamp;

        self.store.upsert_daily_quote(quote.clone()).await?;
        self.store
            .append_tick(&PriceTick {
                symbol: symbol.clone(),
                timestamp: at,
                price,
            })
            .await?;
        self.book.update(quote, UpdateOrigin::Poll).await;

        let mut repriced = 0;
        for id in ids_for(&open.signals, &symbol, |s| s.id) {
            if let Some(mut signal) = self.store.get_signal(id).await?.filter(|s| s.is_active()) {
                signal.apply_price(price, at);
                self.store.save_signal(&signal).await?;
                repriced += 1;
            }
        }
        for id in ids_for(&open.trades, &symbol, |t| t.id) {
            if let Some(mut trade) = self.store.get_trade(id).await?.filter(|t| t.is_active()) {
                trade.apply_price(price, at);
                self.store.save_trade(&trade).await?;
                repriced += 1;
            }
        }
        for id in ids_for(&open.deals, &symbol, |d| d.id) {
            if let Some(mut deal) = self.store.get_deal(id).await?.filter(|d| d.is_active()) {
                deal.apply_price(price, at);
                self.store.save_deal(&deal).await?;
                repriced += 1;
            }
        }
        Ok(repriced)
    }

    pub async fn run_cycle(&self) -> Result<RefreshReport, StoreError> {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut open = self.open_positions().await?;
        let expired_signals = self.expire_signals(&mut open, started_at).await?;
        let symbols = self.symbols_for(&open);

        let mut report = RefreshReport {
            symbols: symbols.len(),
            expired_signals,
            started_at: Some(started_at),
            ..RefreshReport::default()
        };
        let mut consecutive_failures = 0;

        for (index, symbol) in symbols.iter().enumerate() {
            if consecutive_failures >= self.breaker_threshold {
                error!(
                    "{} consecutive quote failures, skipping the remaining {} symbols",
                    consecutive_failures,
                    symbols.len() - index
                );
                report.breaker_tripped = true;
                report.skipped.extend(symbols[index..].iter().cloned());
                break;
            }

            let quote = match self.fetch_with_retry(symbol).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!("No quote for {}: {}", symbol, e);
                    consecutive_failures += 1;
                    report.failed.push(symbol.clone());
                    continue;
                }
            };
            consecutive_failures = 0;

            match self.apply_quote(quote, &open).await {
                Ok(repriced) => {
                    debug!("{} updated, {} positions repriced", symbol, repriced);
                    report.updated += 1;
                    report.positions_updated += repriced;
                }
                Err(e) => {
                    error!("Failed to store quote for {}: {}", symbol, e);
                    report.failed.push(symbol.clone());
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis();
        info!(
            "Refresh cycle: {}/{} symbols updated, {} failed, {} skipped, {} positions repriced",
            report.updated,
            report.symbols,
            report.failed.len(),
            report.skipped.len(),
            report.positions_updated
        );
        Ok(report)
    }

    /// Removes stored quotes and ticks older than `retention_days`.
    pub async fn cleanup(&self, now: DateTime<Utc>, retention_days: i64) -> Result<CleanupReport, StoreError> {
        let cutoff = now - ChronoDuration::days(retention_days);
        let quotes_deleted = self.store.delete_quotes_before(trading_date(cutoff)).await?;
        let ticks_deleted = self.store.delete_ticks_before(cutoff).await?;
        info!(
            "Cleanup removed {} daily quotes and {} price ticks older than {}",
            quotes_deleted,
            ticks_deleted,
            cutoff.format("%Y-%m-%d")
        );
        Ok(CleanupReport {
            quotes_deleted,
            ticks_deleted,
            ran_at: Some(now),
        })
    }
}
