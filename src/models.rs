// src/models.rs
use crate::pnl::{change_percent, Direction, PnlInputs, Priced};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// India Standard Time, the exchange clock.
pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap_or_else(|| Utc.fix())
}

pub fn trading_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&ist()).date_naive()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub ucc: String,
    pub mobile_number: String,
    pub greeting_name: Option<String>,
    pub broker_user_id: Option<String>,
    pub client_code: Option<String>,
    pub product_code: Option<String>,
    pub account_type: Option<String>,
    pub branch_code: Option<String>,
    pub is_trial_account: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_token: Option<String>,
    pub session_token: Option<String>,
    pub sid: Option<String>,
    pub rid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl UserSession {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalType::Buy => "BUY",
            SignalType::Sell => "SELL",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            SignalType::Buy => Direction::Long,
            SignalType::Sell => Direction::Short,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalStatus {
    Active,
    Expired,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DealType {
    Signal,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminTradeSignal {
    pub id: Uuid,
    pub admin_user_id: Uuid,
    pub target_user_id: Uuid,
    pub symbol: String,
    pub trading_symbol: String,
    pub token: Option<String>,
    pub exchange: String,
    pub signal_type: SignalType,
    pub entry_price: f64,
    pub current_price: f64,
    pub target_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub quantity: i64,
    pub signal_title: String,
    pub signal_description: Option<String>,
    pub notes: Option<String>,
    pub priority: Priority,
    pub status: SignalStatus,
    pub is_read: bool,
    pub is_executed: bool,
    pub change_percent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl AdminTradeSignal {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

impl Priced for AdminTradeSignal {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn is_active(&self) -> bool {
        self.status == SignalStatus::Active
    }

    fn pnl_inputs(&self) -> PnlInputs {
        PnlInputs {
            entry_price: self.entry_price,
            current_price: self.current_price,
            quantity: self.quantity,
            direction: self.signal_type.direction(),
            target_price: self.target_price,
        }
    }

    fn apply_price(&mut self, price: f64, at: DateTime<Utc>) {
        self.change_percent = change_percent(self.current_price, price);
        self.current_price = price;
        self.last_update_time = Some(at);
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtfSignalTrade {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub trading_symbol: String,
    pub exchange: String,
    pub position_type: Direction,
    pub quantity: i64,
    pub entry_price: f64,
    pub current_price: f64,
    pub target_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: PositionStatus,
    pub change_percent: f64,
    pub notes: Option<String>,
    pub entry_date: NaiveDate,
    #[serde(default)]
    pub exit_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_price_update: Option<DateTime<Utc>>,
}

impl EtfSignalTrade {
    pub fn close(&mut self, exit_price: f64, at: DateTime<Utc>, note: Option<&str>) {
        self.apply_price(exit_price, at);
        self.status = PositionStatus::Closed;
        self.exit_date = Some(at);
        append_close_note(&mut self.notes, note);
    }
}

impl Priced for EtfSignalTrade {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    fn pnl_inputs(&self) -> PnlInputs {
        PnlInputs {
            entry_price: self.entry_price,
            current_price: self.current_price,
            quantity: self.quantity,
            direction: self.position_type,
            target_price: self.target_price,
        }
    }

    fn apply_price(&mut self, price: f64, at: DateTime<Utc>) {
        self.change_percent = change_percent(self.current_price, price);
        self.current_price = price;
        self.last_price_update = Some(at);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDeal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub signal_id: Option<Uuid>,
    pub symbol: String,
    pub trading_symbol: String,
    pub exchange: String,
    pub position_type: Direction,
    pub quantity: i64,
    pub entry_price: f64,
    pub current_price: f64,
    pub target_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: PositionStatus,
    pub deal_type: DealType,
    pub change_percent: f64,
    pub notes: Option<String>,
    pub tags: Option<String>,
    pub exit_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_price_update: Option<DateTime<Utc>>,
}

impl UserDeal {
    pub fn close(&mut self, exit_price: f64, at: DateTime<Utc>, note: Option<&str>) {
        self.apply_price(exit_price, at);
        self.status = PositionStatus::Closed;
        self.exit_date = Some(at);
        append_close_note(&mut self.notes, note);
    }
}

fn append_close_note(notes: &mut Option<String>, note: Option<&str>) {
    if let Some(note) = note.filter(|n| !n.is_empty()) {
        let mut text = notes.take().unwrap_or_default();
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("Closed: ");
        text.push_str(note);
        *notes = Some(text);
    }
}

impl Priced for UserDeal {
    fn symbol(&self) -> &str {
        &self.symbol
    }

    fn is_active(&self) -> bool {
        self.status == PositionStatus::Active
    }

    fn pnl_inputs(&self) -> PnlInputs {
        PnlInputs {
            entry_price: self.entry_price,
            current_price: self.current_price,
            quantity: self.quantity,
            direction: self.position_type,
            target_price: self.target_price,
        }
    }

    fn apply_price(&mut self, price: f64, at: DateTime<Utc>) {
        self.change_percent = change_percent(self.current_price, price);
        self.current_price = price;
        self.last_price_update = Some(at);
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    TradeSignal,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationKind,
    pub priority: Priority,
    pub related_signal_id: Option<Uuid>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One market snapshot for a symbol as delivered by a quote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub trading_symbol: String,
    pub token: Option<String>,
    pub exchange: String,
    pub ltp: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub net_change: f64,
    pub percent_change: f64,
    pub volume: i64,
    pub bid: f64,
    pub ask: f64,
    pub week_52_high: f64,
    pub week_52_low: f64,
    pub timestamp: DateTime<Utc>,
}

/// The stored quote of one symbol for one trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyQuote {
    pub trading_date: NaiveDate,
    pub first_seen: DateTime<Utc>,
    pub updates: u32,
    #[serde(flatten)]
    pub quote: Quote,
}

impl DailyQuote {
    pub fn key(symbol: &str, date: NaiveDate) -> String {
        format!("{}:{}", symbol, date.format("%Y-%m-%d"))
    }

    /// Folds a fresh quote into the row for its trading date.
    pub fn merge(existing: Option<DailyQuote>, quote: Quote) -> DailyQuote {
        let trading_date = trading_date(quote.timestamp);
        match existing {
            Some(prev) if prev.trading_date == trading_date => DailyQuote {
                trading_date,
                first_seen: prev.first_seen,
                updates: prev.updates + 1,
                quote,
            },
            _ => DailyQuote {
                trading_date,
                first_seen: quote.timestamp,
                updates: 1,
                quote,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn quote(symbol: &str, ltp: f64, at: DateTime<Utc>) -> Quote {
        Quote {
            symbol: symbol.to_string(),
            trading_symbol: format!("{}-EQ", symbol),
            token: None,
            exchange: "NSE".to_string(),
            ltp,
            open: ltp,
            high: ltp,
            low: ltp,
            close: ltp,
            net_change: 0.0,
            percent_change: 0.0,
            volume: 1000,
            bid: ltp,
            ask: ltp,
            week_52_high: ltp,
            week_52_low: ltp,
            timestamp: at,
        }
    }

    pub fn signal(symbol: &str, entry: f64, qty: i64) -> AdminTradeSignal {
        let now = Utc::now();
        AdminTradeSignal {
            id: Uuid::new_v4(),
            admin_user_id: Uuid::new_v4(),
            target_user_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            trading_symbol: symbol.to_string(),
            token: None,
            exchange: "NSE".to_string(),
            signal_type: SignalType::Buy,
            entry_price: entry,
            current_price: entry,
            target_price: None,
            stop_loss: None,
            quantity: qty,
            signal_title: format!("{} entry", symbol),
            signal_description: None,
            notes: None,
            priority: Priority::Medium,
            status: SignalStatus::Active,
            is_read: false,
            is_executed: false,
            change_percent: 0.0,
            created_at: now,
            updated_at: now,
            expires_at: None,
            last_update_time: None,
        }
    }

    pub fn deal(user_id: Uuid, symbol: &str, entry: f64, qty: i64) -> UserDeal {
        let now = Utc::now();
        UserDeal {
            id: Uuid::new_v4(),
            user_id,
            signal_id: None,
            symbol: symbol.to_string(),
            trading_symbol: symbol.to_string(),
            exchange: "NSE".to_string(),
            position_type: Direction::Long,
            quantity: qty,
            entry_price: entry,
            current_price: entry,
            target_price: None,
            stop_loss: None,
            status: PositionStatus::Active,
            deal_type: DealType::Manual,
            change_percent: 0.0,
            notes: None,
            tags: None,
            exit_date: None,
            created_at: now,
            updated_at: now,
            last_price_update: None,
        }
    }

    pub fn trade(user_id: Uuid, symbol: &str, entry: f64, qty: i64) -> EtfSignalTrade {
        let now = Utc::now();
        EtfSignalTrade {
            id: Uuid::new_v4(),
            user_id,
            symbol: symbol.to_string(),
            trading_symbol: format!("{}-EQ", symbol),
            exchange: "NSE".to_string(),
            position_type: Direction::Long,
            quantity: qty,
            entry_price: entry,
            current_price: entry,
            target_price: None,
            stop_loss: None,
            status: PositionStatus::Active,
            change_percent: 0.0,
            notes: None,
            entry_date: trading_date(now),
            exit_date: None,
            created_at: now,
            last_price_update: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn trading_date_uses_india_time() {
        // 20:00 UTC is already the next morning in India.
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 20, 0, 0).unwrap();
        assert_eq!(trading_date(at), NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn applying_a_price_tracks_the_move() {
        let mut signal = signal("NIFTYBEES", 200.0, 10);
        let at = Utc::now();
        signal.apply_price(210.0, at);
        assert_eq!(signal.current_price, 210.0);
        assert_eq!(signal.change_percent, 5.0);
        assert_eq!(signal.last_update_time, Some(at));
        assert_eq!(signal.pnl().pnl, 100.0);
    }

    #[test]
    fn sell_signal_gains_when_price_drops() {
        let mut signal = signal("BANKBEES", 500.0, 2);
        signal.signal_type = SignalType::Sell;
        signal.apply_price(480.0, Utc::now());
        assert_eq!(signal.pnl().pnl, 40.0);
    }

    #[test]
    fn closing_a_deal_appends_the_note() {
        let mut deal = deal(Uuid::new_v4(), "ITBEES", 40.0, 100);
        deal.notes = Some("swing".to_string());
        deal.close(42.0, Utc::now(), Some("target hit"));
        assert_eq!(deal.status, PositionStatus::Closed);
        assert!(deal.exit_date.is_some());
        assert_eq!(deal.notes.as_deref(), Some("swing\nClosed: target hit"));
        assert_eq!(deal.pnl().pnl, 200.0);
    }

    #[test]
    fn merge_keeps_first_seen_within_the_day() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 5, 4, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 3, 5, 7, 0, 0).unwrap();
        let first = DailyQuote::merge(None, quote("NIFTYBEES", 250.0, morning));
        let second = DailyQuote::merge(Some(first), quote("NIFTYBEES", 252.0, noon));
        assert_eq!(second.first_seen, morning);
        assert_eq!(second.updates, 2);
        assert_eq!(second.quote.ltp, 252.0);

        let next_day = Utc.with_ymd_and_hms(2024, 3, 6, 4, 0, 0).unwrap();
        let fresh = DailyQuote::merge(Some(second), quote("NIFTYBEES", 255.0, next_day));
        assert_eq!(fresh.updates, 1);
        assert_eq!(fresh.first_seen, next_day);
    }

    #[test]
    fn expiry_is_inclusive() {
        let mut signal = signal("GOLDSHARE", 50.0, 1);
        let now = Utc::now();
        assert!(!signal.is_expired_at(now));
        signal.expires_at = Some(now);
        assert!(signal.is_expired_at(now));
    }
}
