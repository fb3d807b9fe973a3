// src/prices.rs
use crate::models::{DailyQuote, Quote};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateOrigin {
    Poll,
    Feed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub symbol: String,
    pub ltp: f64,
    pub percent_change: f64,
    pub timestamp: DateTime<Utc>,
    pub origin: UpdateOrigin,
}

/// Where a resolved price came from, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriceSource {
    Live,
    Stored,
    SignalData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPrice {
    pub price: f64,
    pub source: PriceSource,
    pub as_of: Option<DateTime<Utc>>,
    pub quote: Option<Quote>,
}

/// Latest known price per symbol. Every update is broadcast to subscribers.
pub struct PriceBook {
    latest: RwLock<HashMap<String, Quote>>,
    tx: broadcast::Sender<PriceUpdate>,
}

impl PriceBook {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        PriceBook {
            latest: RwLock::new(HashMap::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PriceUpdate> {
        self.tx.subscribe()
    }

    /// Stores `quote` unless a newer one for the symbol is already held.
    /// Returns whether the book changed.
    pub async fn update(&self, quote: Quote, origin: UpdateOrigin) -> bool {
        let update = PriceUpdate {
            symbol: quote.symbol.clone(),
            ltp: quote.ltp,
            percent_change: quote.percent_change,
            timestamp: quote.timestamp,
            origin,
        };
        {
            let mut latest = self.latest.write().await;
            if let Some(held) = latest.get(&quote.symbol) {
                if held.timestamp > quote.timestamp {
                    return false;
                }
            }
            latest.insert(quote.symbol.clone(), quote);
        }
        // No subscribers is not an error.
        let _ = self.tx.send(update);
        true
    }

    /// Applies a bare price tick, keeping the rest of the held quote.
    pub async fn apply_tick(
        &self,
        symbol: &str,
        ltp: f64,
        percent_change: Option<f64>,
        at: DateTime<Utc>,
    ) -> bool {
        let base = self.latest.read().await.get(symbol).cloned();
        let quote = match base {
            Some(mut q) => {
                q.ltp = ltp;
                if let Some(pc) = percent_change {
                    q.percent_change = pc;
                }
                q.timestamp = at;
                q
            }
            None => Quote {
                symbol: symbol.to_string(),
                trading_symbol: symbol.to_string(),
                token: None,
                exchange: "NSE".to_string(),
                ltp,
                open: ltp,
                high: ltp,
                low: ltp,
                close: 0.0,
                net_change: 0.0,
                percent_change: percent_change.unwrap_or(0.0),
                volume: 0,
                bid: 0.0,
                ask: 0.0,
                week_52_high: 0.0,
                week_52_low: 0.0,
                timestamp: at,
            },
        };
        self.update(quote, UpdateOrigin::Feed).await
    }

    pub async fn get(&self, symbol: &str) -> Option<Quote> {
        self.latest.read().await.get(symbol).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, Quote> {
        self.latest.read().await.clone()
    }

    /// The one accessor for "current price of a symbol": live book first,
    /// then the stored daily quote, then the record's own price.
    pub async fn resolve(
        &self,
        symbol: &str,
        stored: Option<&DailyQuote>,
        fallback: f64,
    ) -> ResolvedPrice {
        if let Some(quote) = self.get(symbol).await {
            return ResolvedPrice {
                price: quote.ltp,
                source: PriceSource::Live,
                as_of: Some(quote.timestamp),
                quote: Some(quote),
            };
        }
        if let Some(row) = stored {
            return ResolvedPrice {
                price: row.quote.ltp,
                source: PriceSource::Stored,
                as_of: Some(row.quote.timestamp),
                quote: Some(row.quote.clone()),
            };
        }
        ResolvedPrice {
            price: fallback,
            source: PriceSource::SignalData,
            as_of: None,
            quote: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::quote;
    use chrono::Duration;

    #[tokio::test]
    async fn stale_quotes_do_not_overwrite_newer_ones() {
        let book = PriceBook::new(8);
        let now = Utc::now();
        assert!(book.update(quote("NIFTYBEES", 251.0, now), UpdateOrigin::Poll).await);
        assert!(
            !book
                .update(quote("NIFTYBEES", 249.0, now - Duration::seconds(30)), UpdateOrigin::Poll)
                .await
        );
        assert_eq!(book.get("NIFTYBEES").await.unwrap().ltp, 251.0);
    }

    #[tokio::test]
    async fn subscribers_see_each_update() {
        let book = PriceBook::new(8);
        let mut rx = book.subscribe();
        book.update(quote("BANKBEES", 520.0, Utc::now()), UpdateOrigin::Poll)
            .await;
        let update = rx.recv().await.unwrap();
        assert_eq!(update.symbol, "BANKBEES");
        assert_eq!(update.ltp, 520.0);
        assert_eq!(update.origin, UpdateOrigin::Poll);
    }

    #[tokio::test]
    async fn ticks_keep_the_rest_of_the_quote() {
        let book = PriceBook::new(8);
        let now = Utc::now();
        let mut q = quote("ITBEES", 40.0, now);
        q.volume = 5000;
        book.update(q, UpdateOrigin::Poll).await;
        book.apply_tick("ITBEES", 41.0, Some(2.5), now + Duration::seconds(1))
            .await;
        let held = book.get("ITBEES").await.unwrap();
        assert_eq!(held.ltp, 41.0);
        assert_eq!(held.percent_change, 2.5);
        assert_eq!(held.volume, 5000);
    }

    #[tokio::test]
    async fn resolve_falls_back_in_order() {
        let book = PriceBook::new(8);
        let now = Utc::now();

        let none = book.resolve("GOLDSHARE", None, 45.0).await;
        assert_eq!((none.price, none.source), (45.0, PriceSource::SignalData));

        let stored = DailyQuote::merge(None, quote("GOLDSHARE", 46.0, now));
        let from_store = book.resolve("GOLDSHARE", Some(&stored), 45.0).await;
        assert_eq!((from_store.price, from_store.source), (46.0, PriceSource::Stored));

        book.update(quote("GOLDSHARE", 47.0, now), UpdateOrigin::Poll)
            .await;
        let live = book.resolve("GOLDSHARE", Some(&stored), 45.0).await;
        assert_eq!((live.price, live.source), (47.0, PriceSource::Live));
    }
}
