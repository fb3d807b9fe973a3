// src/db.rs
use crate::error::StoreError;
use crate::models::{
    AdminTradeSignal, DailyQuote, EtfSignalTrade, Notification, PriceTick, User, UserDeal,
    UserSession,
};
use crate::pnl::Priced;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use scylla::{frame::response::result::CqlValue, query::Query, Session, SessionBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Users,
    Sessions,
    Signals,
    EtfTrades,
    Deals,
    Notifications,
    DailyQuotes,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Users,
        Table::Sessions,
        Table::Signals,
        Table::EtfTrades,
        Table::Deals,
        Table::Notifications,
        Table::DailyQuotes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Sessions => "user_sessions",
            Table::Signals => "admin_trade_signals",
            Table::EtfTrades => "etf_signal_trades",
            Table::Deals => "user_deals",
            Table::Notifications => "user_notifications",
            Table::DailyQuotes => "daily_quotes",
        }
    }
}

/// Key/value persistence of JSON bodies, plus the per-symbol price series.
/// `put` on an existing key replaces it.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn put(&self, table: Table, key: &str, body: String) -> Result<(), StoreError>;
    async fn get(&self, table: Table, key: &str) -> Result<Option<String>, StoreError>;
    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>, StoreError>;
    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError>;

    async fn append_tick(&self, tick: &PriceTick) -> Result<(), StoreError>;
    /// Ticks of one symbol within `[start, end]`, newest first.
    async fn ticks_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceTick>, StoreError>;
    async fn delete_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

const PRICE_HISTORY: &str = "price_history";

fn query_error(e: impl std::fmt::Display) -> StoreError {
    StoreError::Query(e.to_string())
}

pub struct ScyllaBackend {
    session: Session,
    keyspace: String,
}

impl ScyllaBackend {
    pub async fn connect(node: &str, keyspace: &str) -> Result<Self, StoreError> {
        let session = SessionBuilder::new()
            .known_node(node)
            .build()
            .await
            .map_err(query_error)?;

        let create_keyspace = format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = {{'class': 'SimpleStrategy', 'replication_factor': 1}}",
            keyspace
        );
        session
            .query(Query::new(create_keyspace), &[])
            .await
            .map_err(query_error)?;

        for table in Table::ALL {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {}.{} (key TEXT PRIMARY KEY, body TEXT)",
                keyspace,
                table.name()
            );
            session
                .query(Query::new(ddl), &[])
                .await
                .map_err(query_error)?;
        }
        let history = format!(
            "CREATE TABLE IF NOT EXISTS {}.{} (symbol TEXT, timestamp TIMESTAMP, price DOUBLE, PRIMARY KEY (symbol, timestamp)) WITH CLUSTERING ORDER BY (timestamp DESC)",
            keyspace, PRICE_HISTORY
        );
        session
            .query(Query::new(history), &[])
            .await
            .map_err(query_error)?;

        info!("Connected to ScyllaDB at {}, keyspace {}", node, keyspace);
        Ok(ScyllaBackend {
            session,
            keyspace: keyspace.to_string(),
        })
    }

    fn qualified(&self, table: Table) -> String {
        format!("{}.{}", self.keyspace, table.name())
    }
}

#[async_trait]
impl Backend for ScyllaBackend {
    async fn put(&self, table: Table, key: &str, body: String) -> Result<(), StoreError> {
        let query = Query::new(format!(
            "INSERT INTO {} (key, body) VALUES (?, ?)",
            self.qualified(table)
        ));
        self.session
            .query(query, (key, body))
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<String>, StoreError> {
        let query = Query::new(format!(
            "SELECT body FROM {} WHERE key = ?",
            self.qualified(table)
        ));
        let result = self
            .session
            .query(query, (key,))
            .await
            .map_err(query_error)?;

        Ok(result
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|row| {
                row.columns
                    .into_iter()
                    .next()
                    .flatten()
                    .and_then(|v| v.as_text().cloned())
            }))
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>, StoreError> {
        let query = Query::new(format!("SELECT key, body FROM {}", self.qualified(table)));
        let result = self
            .session
            .query(query, &[])
            .await
            .map_err(query_error)?;

        let rows = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                let key = row.columns.get(0)?.as_ref()?.as_text()?.clone();
                let body = row.columns.get(1)?.as_ref()?.as_text()?.clone();
                Some((key, body))
            })
            .collect();
        Ok(rows)
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        let query = Query::new(format!("DELETE FROM {} WHERE key = ?", self.qualified(table)));
        self.session
            .query(query, (key,))
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn append_tick(&self, tick: &PriceTick) -> Result<(), StoreError> {
        let query = Query::new(format!(
            "INSERT INTO {}.{} (symbol, timestamp, price) VALUES (?, ?, ?)",
            self.keyspace, PRICE_HISTORY
        ));
        self.session
            .query(
                query,
                (tick.symbol.as_str(), tick.timestamp.timestamp_millis(), tick.price),
            )
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn ticks_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceTick>, StoreError> {
        let query = Query::new(format!(
            "SELECT timestamp, price FROM {}.{} WHERE symbol = ? AND timestamp >= ? AND timestamp <= ? LIMIT ?",
            self.keyspace, PRICE_HISTORY
        ));
        let limit = i32::try_from(limit).unwrap_or(i32::MAX);
        let result = self
            .session
            .query(
                query,
                (symbol, start.timestamp_millis(), end.timestamp_millis(), limit),
            )
            .await
            .map_err(query_error)?;

        let ticks = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| {
                let millis = match row.columns.get(0)?.as_ref()? {
                    CqlValue::Timestamp(ts) => ts.num_milliseconds(),
                    _ => return None,
                };
                let price = row.columns.get(1)?.as_ref()?.as_double()?;
                match DateTime::<Utc>::from_timestamp_millis(millis) {
                    Some(timestamp) => Some(PriceTick {
                        symbol: symbol.to_string(),
                        timestamp,
                        price,
                    }),
                    None => {
                        error!("Dropping tick for {} with bad timestamp {}", symbol, millis);
                        None
                    }
                }
            })
            .collect();
        Ok(ticks)
    }

    async fn delete_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let table = format!("{}.{}", self.keyspace, PRICE_HISTORY);
        let symbols: Vec<String> = self
            .session
            .query(Query::new(format!("SELECT DISTINCT symbol FROM {}", table)), &[])
            .await
            .map_err(query_error)?
            .rows
            .unwrap_or_default()
            .into_iter()
            .filter_map(|row| row.columns.get(0)?.as_ref()?.as_text().cloned())
            .collect();

        let count = Query::new(format!(
            "SELECT COUNT(*) FROM {} WHERE symbol = ? AND timestamp < ?",
            table
        ));
        let delete = Query::new(format!(
            "DELETE FROM {} WHERE symbol = ? AND timestamp < ?",
            table
        ));
        let before = cutoff.timestamp_millis();
        let mut deleted = 0;
        for symbol in &symbols {
            let stale = self
                .session
                .query(count.clone(), (symbol.as_str(), before))
                .await
                .map_err(query_error)?
                .rows
                .unwrap_or_default()
                .into_iter()
                .next()
                .and_then(|row| row.columns.into_iter().next().flatten())
                .and_then(|v| v.as_bigint())
                .unwrap_or(0);
            if stale > 0 {
                self.session
                    .query(delete.clone(), (symbol.as_str(), before))
                    .await
                    .map_err(query_error)?;
                deleted += stale as usize;
            }
        }
        Ok(deleted)
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, BTreeMap<String, String>>>,
    ticks: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, f64>>>,
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn put(&self, table: Table, key: &str, body: String) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .entry(table)
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, table: Table, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    async fn scan(&self, table: Table) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StoreError> {
        if let Some(rows) = self.tables.write().await.get_mut(&table) {
            rows.remove(key);
        }
        Ok(())
    }

    async fn append_tick(&self, tick: &PriceTick) -> Result<(), StoreError> {
        self.ticks
            .write()
            .await
            .entry(tick.symbol.clone())
            .or_default()
            .insert(tick.timestamp, tick.price);
        Ok(())
    }

    async fn ticks_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceTick>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .ticks
            .read()
            .await
            .get(symbol)
            .map(|series| {
                series
                    .range(start..=end)
                    .rev()
                    .take(limit)
                    .map(|(at, price)| PriceTick {
                        symbol: symbol.to_string(),
                        timestamp: *at,
                        price: *price,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for series in self.ticks.write().await.values_mut() {
            let kept = series.split_off(&cutoff);
            deleted += series.len();
            *series = kept;
        }
        Ok(deleted)
    }
}

/// Typed record access on top of a [`Backend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Store { backend }
    }

    pub fn in_memory() -> Self {
        Store::new(Arc::new(MemoryBackend::default()))
    }

    async fn put_doc<T: Serialize>(&self, table: Table, key: &str, doc: &T) -> Result<(), StoreError> {
        let body = serde_json::to_string(doc)?;
        self.backend.put(table, key, body).await
    }

    async fn get_doc<T: DeserializeOwned>(&self, table: Table, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(table, key).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    async fn scan_docs<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, StoreError> {
        self.backend
            .scan(table)
            .await?
            .into_iter()
            .map(|(_, body)| serde_json::from_str(&body).map_err(StoreError::from))
            .collect()
    }

    // Users

    pub async fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.put_doc(Table::Users, &user.id.to_string(), user).await
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.get_doc(Table::Users, &id.to_string()).await
    }

    pub async fn find_user_by_ucc(&self, ucc: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .list_users()
            .await?
            .into_iter()
            .find(|u| u.ucc.eq_ignore_ascii_case(ucc)))
    }

    pub async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let mut users: Vec<User> = self.scan_docs(Table::Users).await?;
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(users)
    }

    // Sessions

    pub async fn save_session(&self, session: &UserSession) -> Result<(), StoreError> {
        self.put_doc(Table::Sessions, &session.id.to_string(), session)
            .await
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<UserSession>, StoreError> {
        self.get_doc(Table::Sessions, &id.to_string()).await
    }

    pub async fn deactivate_sessions(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let sessions: Vec<UserSession> = self.scan_docs(Table::Sessions).await?;
        let mut count = 0;
        for mut session in sessions
            .into_iter()
            .filter(|s| s.user_id == user_id && s.is_active)
        {
            session.is_active = false;
            self.save_session(&session).await?;
            count += 1;
        }
        Ok(count)
    }

    // Admin trade signals

    pub async fn save_signal(&self, signal: &AdminTradeSignal) -> Result<(), StoreError> {
        self.put_doc(Table::Signals, &signal.id.to_string(), signal)
            .await
    }

    pub async fn get_signal(&self, id: Uuid) -> Result<Option<AdminTradeSignal>, StoreError> {
        self.get_doc(Table::Signals, &id.to_string()).await
    }

    async fn signals_where<F>(&self, keep: F) -> Result<Vec<AdminTradeSignal>, StoreError>
    where
        F: Fn(&AdminTradeSignal) -> bool,
    {
        let mut signals: Vec<AdminTradeSignal> = self.scan_docs(Table::Signals).await?;
        signals.retain(|s| keep(s));
        signals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(signals)
    }

    pub async fn signals_sent_by(&self, admin_id: Uuid) -> Result<Vec<AdminTradeSignal>, StoreError> {
        self.signals_where(|s| s.admin_user_id == admin_id).await
    }

    pub async fn signals_for(&self, target_id: Uuid) -> Result<Vec<AdminTradeSignal>, StoreError> {
        self.signals_where(|s| s.target_user_id == target_id).await
    }

    pub async fn active_signals(&self) -> Result<Vec<AdminTradeSignal>, StoreError> {
        self.signals_where(|s| s.is_active()).await
    }

    // ETF signal trades

    pub async fn save_trade(&self, trade: &EtfSignalTrade) -> Result<(), StoreError> {
        self.put_doc(Table::EtfTrades, &trade.id.to_string(), trade)
            .await
    }

    pub async fn get_trade(&self, id: Uuid) -> Result<Option<EtfSignalTrade>, StoreError> {
        self.get_doc(Table::EtfTrades, &id.to_string()).await
    }

    /// A trade is only visible to the user who recorded it.
    pub async fn get_trade_for(&self, user_id: Uuid, id: Uuid) -> Result<EtfSignalTrade, StoreError> {
        self.get_trade(id)
            .await?
            .filter(|t| t.user_id == user_id)
            .ok_or(StoreError::NotFound("Position"))
    }

    pub async fn delete_trade(&self, id: Uuid) -> Result<(), StoreError> {
        self.backend.delete(Table::EtfTrades, &id.to_string()).await
    }

    pub async fn trades_for(&self, user_id: Uuid) -> Result<Vec<EtfSignalTrade>, StoreError> {
        let mut trades: Vec<EtfSignalTrade> = self.scan_docs(Table::EtfTrades).await?;
        trades.retain(|t| t.user_id == user_id);
        trades.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(trades)
    }

    pub async fn active_trades(&self) -> Result<Vec<EtfSignalTrade>, StoreError> {
        let mut trades: Vec<EtfSignalTrade> = self.scan_docs(Table::EtfTrades).await?;
        trades.retain(|t| t.is_active());
        Ok(trades)
    }

    // User deals

    pub async fn save_deal(&self, deal: &UserDeal) -> Result<(), StoreError> {
        self.put_doc(Table::Deals, &deal.id.to_string(), deal).await
    }

    pub async fn get_deal(&self, id: Uuid) -> Result<Option<UserDeal>, StoreError> {
        self.get_doc(Table::Deals, &id.to_string()).await
    }

    /// A deal is only visible to the user who owns it.
    pub async fn get_deal_for(&self, user_id: Uuid, id: Uuid) -> Result<UserDeal, StoreError> {
        self.get_deal(id)
            .await?
            .filter(|d| d.user_id == user_id)
            .ok_or(StoreError::NotFound("Deal"))
    }

    pub async fn deals_for(&self, user_id: Uuid) -> Result<Vec<UserDeal>, StoreError> {
        let mut deals: Vec<UserDeal> = self.scan_docs(Table::Deals).await?;
        deals.retain(|d| d.user_id == user_id);
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deals)
    }

    pub async fn active_deals(&self) -> Result<Vec<UserDeal>, StoreError> {
        let mut deals: Vec<UserDeal> = self.scan_docs(Table::Deals).await?;
        deals.retain(|d| d.is_active());
        Ok(deals)
    }

    // Notifications

    pub async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.put_doc(
            Table::Notifications,
            &notification.id.to_string(),
            notification,
        )
        .await
    }

    pub async fn notifications_for(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<(Vec<Notification>, usize), StoreError> {
        let mut notes: Vec<Notification> = self.scan_docs(Table::Notifications).await?;
        notes.retain(|n| n.user_id == user_id);
        let unread = notes.iter().filter(|n| !n.is_read).count();
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        notes.truncate(limit);
        Ok((notes, unread))
    }

    pub async fn mark_notification_read(
        &self,
        user_id: Uuid,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Notification, StoreError> {
        let mut note = self
            .get_doc::<Notification>(Table::Notifications, &id.to_string())
            .await?
            .filter(|n| n.user_id == user_id)
            .ok_or(StoreError::NotFound("Notification"))?;
        note.is_read = true;
        note.read_at = Some(at);
        self.save_notification(&note).await?;
        Ok(note)
    }

    // Quotes

    /// Writes the quote row for `(symbol, trading date)`; repeated calls on
    /// one day replace the same row.
    pub async fn upsert_daily_quote(&self, quote: crate::models::Quote) -> Result<DailyQuote, StoreError> {
        let date = crate::models::trading_date(quote.timestamp);
        let key = DailyQuote::key(&quote.symbol, date);
        let existing = self.get_doc::<DailyQuote>(Table::DailyQuotes, &key).await?;
        let row = DailyQuote::merge(existing, quote);
        self.put_doc(Table::DailyQuotes, &key, &row).await?;
        Ok(row)
    }

    pub async fn daily_quotes(&self) -> Result<Vec<DailyQuote>, StoreError> {
        self.scan_docs(Table::DailyQuotes).await
    }

    pub async fn latest_quote(&self, symbol: &str) -> Result<Option<DailyQuote>, StoreError> {
        Ok(self.latest_quotes(&[symbol.to_string()]).await?.remove(symbol))
    }

    /// Newest stored row per symbol; all symbols when `symbols` is empty.
    pub async fn latest_quotes(&self, symbols: &[String]) -> Result<HashMap<String, DailyQuote>, StoreError> {
        let mut latest: HashMap<String, DailyQuote> = HashMap::new();
        for row in self.daily_quotes().await? {
            if !symbols.is_empty() && !symbols.iter().any(|s| s == &row.quote.symbol) {
                continue;
            }
            let newer = latest
                .get(&row.quote.symbol)
                .map_or(true, |cur| row.quote.timestamp > cur.quote.timestamp);
            if newer {
                latest.insert(row.quote.symbol.clone(), row);
            }
        }
        Ok(latest)
    }

    pub async fn delete_quotes_before(&self, cutoff: NaiveDate) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for (key, body) in self.backend.scan(Table::DailyQuotes).await? {
            let row: DailyQuote = serde_json::from_str(&body)?;
            if row.trading_date < cutoff {
                self.backend.delete(Table::DailyQuotes, &key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    pub async fn append_tick(&self, tick: &PriceTick) -> Result<(), StoreError> {
        self.backend.append_tick(tick).await
    }

    pub async fn ticks_between(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PriceTick>, StoreError> {
        self.backend.ticks_between(symbol, start, end, limit).await
    }

    pub async fn delete_ticks_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.backend.delete_ticks_before(cutoff).await
    }
}
