// src/broker.rs
use crate::error::BrokerError;
use crate::models::Quote;
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use rand::Rng;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

// Paths below are relative to NEO_BASE_URL.
const TOTP_LOGIN_PATH: &str = "/login/1.0/login/v6/totp/login";
const TOTP_VALIDATE_PATH: &str = "/login/1.0/login/v6/totp/validate";
const PLACE_ORDER_PATH: &str = "/Orders/2.0/quick/order/rule/ms/place";
const MODIFY_ORDER_PATH: &str = "/Orders/2.0/quick/order/vr/modify";
const CANCEL_ORDER_PATH: &str = "/Orders/2.0/quick/order/cancel";
const ORDER_BOOK_PATH: &str = "/Orders/2.0/quick/user/orders";
const POSITIONS_PATH: &str = "/Orders/2.0/quick/user/positions";
const LIMITS_PATH: &str = "/Orders/2.0/quick/user/limits";
const HOLDINGS_PATH: &str = "/Portfolio/1.0/portfolio/v1/holdings";
const QUOTES_PATH: &str = "/script-details/1.0/quotes/neosymbol";

#[derive(Debug, Clone, Deserialize)]
pub struct LoginCredentials {
    #[serde(default)]
    pub mobile_number: String,
    #[serde(default)]
    pub ucc: String,
    #[serde(default)]
    pub totp: String,
    #[serde(default)]
    pub mpin: String,
}

impl LoginCredentials {
    pub fn trimmed(&self) -> LoginCredentials {
        LoginCredentials {
            mobile_number: self.mobile_number.trim().to_string(),
            ucc: self.ucc.trim().to_uppercase(),
            totp: self.totp.trim().to_string(),
            mpin: self.mpin.trim().to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        [&self.mobile_number, &self.ucc, &self.totp, &self.mpin]
            .iter()
            .all(|field| !field.is_empty())
    }
}

/// Tokens the broker hands back after a successful login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: Option<String>,
    pub session_token: Option<String>,
    pub sid: Option<String>,
    pub rid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerSession {
    pub tokens: SessionTokens,
    pub greeting_name: Option<String>,
    pub broker_user_id: Option<String>,
    pub client_code: Option<String>,
    pub product_code: Option<String>,
    pub account_type: Option<String>,
    pub branch_code: Option<String>,
    pub is_trial_account: bool,
}

/// An order as submitted by a client of this service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderRequest {
    pub order_type: Option<String>,
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub trading_symbol: String,
    pub quantity: Option<i64>,
    pub product: Option<String>,
    pub exchange_segment: Option<String>,
    pub price: Option<f64>,
    pub trigger_price: Option<f64>,
    pub validity: Option<String>,
    pub amo: Option<String>,
    pub disclosed_quantity: Option<i64>,
    pub market_protection: Option<String>,
    pub pf: Option<String>,
    pub tag: Option<String>,
}

/// The broker's order body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeoOrder {
    #[serde(rename = "es")]
    pub exchange_segment: String,
    #[serde(rename = "pc")]
    pub product: String,
    #[serde(rename = "pr")]
    pub price: String,
    #[serde(rename = "pt")]
    pub order_type: String,
    #[serde(rename = "qt")]
    pub quantity: String,
    #[serde(rename = "rt")]
    pub validity: String,
    #[serde(rename = "ts")]
    pub trading_symbol: String,
    #[serde(rename = "tt")]
    pub transaction_type: String,
    #[serde(rename = "am")]
    pub amo: String,
    #[serde(rename = "dq")]
    pub disclosed_quantity: String,
    #[serde(rename = "mp")]
    pub market_protection: String,
    pub pf: String,
    #[serde(rename = "tp")]
    pub trigger_price: String,
    pub tag: String,
}

impl OrderRequest {
    pub fn normalize(&self) -> Result<NeoOrder, BrokerError> {
        let raw_type = self
            .order_type
            .clone()
            .unwrap_or_else(|| "MARKET".to_string())
            .to_uppercase();
        let (order_type, price, trigger) = match raw_type.as_str() {
            "MARKET" | "MKT" => ("MKT", 0.0, 0.0),
            "LIMIT" | "L" => ("L", self.price.unwrap_or(0.0), 0.0),
            "STOPLOSS" | "SL" => (
                "SL",
                self.price.unwrap_or(0.0),
                self.trigger_price.unwrap_or(0.0),
            ),
            _ => return Err(BrokerError::UnsupportedOrderType(raw_type)),
        };

        Ok(NeoOrder {
            exchange_segment: self
                .exchange_segment
                .clone()
                .unwrap_or_else(|| "nse_cm".to_string()),
            product: self.product.clone().unwrap_or_else(|| "CNC".to_string()),
            price: price.to_string(),
            order_type: order_type.to_string(),
            quantity: self.quantity.unwrap_or(1).to_string(),
            validity: self.validity.clone().unwrap_or_else(|| "DAY".to_string()),
            trading_symbol: self.trading_symbol.clone(),
            transaction_type: self
                .transaction_type
                .clone()
                .unwrap_or_else(|| "BUY".to_string())
                .to_uppercase(),
            amo: self.amo.clone().unwrap_or_else(|| "NO".to_string()),
            disclosed_quantity: self.disclosed_quantity.unwrap_or(0).to_string(),
            market_protection: self
                .market_protection
                .clone()
                .unwrap_or_else(|| "0".to_string()),
            pf: self.pf.clone().unwrap_or_else(|| "N".to_string()),
            trigger_price: trigger.to_string(),
            tag: self.tag.clone().unwrap_or_else(|| {
                format!("API_ORDER_{}", Utc::now().format("%Y%m%d_%H%M%S"))
            }),
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModifyOrderRequest {
    pub order_id: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "one")]
    pub quantity: i64,
    #[serde(default)]
    pub disclosed_quantity: i64,
    #[serde(default)]
    pub trigger_price: f64,
    #[serde(default = "day")]
    pub validity: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CancelOrderRequest {
    pub order_id: String,
    #[serde(default = "yes", rename = "isVerify")]
    pub is_verify: bool,
}

fn one() -> i64 {
    1
}

fn day() -> String {
    "DAY".to_string()
}

fn yes() -> bool {
    true
}

#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;
}

#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn login(&self, credentials: &LoginCredentials) -> Result<BrokerSession, BrokerError>;
    async fn positions(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError>;
    async fn holdings(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError>;
    async fn limits(&self, tokens: &SessionTokens) -> Result<Value, BrokerError>;
    async fn order_book(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError>;
    async fn place_order(&self, tokens: &SessionTokens, order: &NeoOrder) -> Result<Value, BrokerError>;
    async fn modify_order(
        &self,
        tokens: &SessionTokens,
        order: &ModifyOrderRequest,
    ) -> Result<Value, BrokerError>;
    async fn cancel_order(
        &self,
        tokens: &SessionTokens,
        order: &CancelOrderRequest,
    ) -> Result<Value, BrokerError>;
}

pub struct NeoClient {
    client: Client,
    base_url: String,
    consumer_key: String,
    // Tokens of the latest login, used for server-side quote polling.
    service_tokens: RwLock<Option<SessionTokens>>,
}

impl NeoClient {
    pub fn new(base_url: &str, consumer_key: &str, timeout: Duration) -> Result<Self, BrokerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(NeoClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            consumer_key: consumer_key.to_string(),
            service_tokens: RwLock::new(None),
        })
    }

    fn headers(&self, tokens: Option<&SessionTokens>) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();
        if let Ok(value) = header::HeaderValue::from_str(&format!("Bearer {}", self.consumer_key)) {
            headers.insert(header::AUTHORIZATION, value);
        }
        headers.insert("neo-fin-key", header::HeaderValue::from_static("neotradeapi"));
        if let Some(tokens) = tokens {
            if let Some(value) = tokens
                .session_token
                .as_deref()
                .and_then(|t| header::HeaderValue::from_str(t).ok())
            {
                headers.insert("auth", value);
            }
            if let Some(value) = tokens
                .sid
                .as_deref()
                .and_then(|t| header::HeaderValue::from_str(t).ok())
            {
                headers.insert("sid", value);
            }
        }
        headers
    }

    async fn read(&self, response: reqwest::Response) -> Result<Value, BrokerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        tokens: Option<&SessionTokens>,
    ) -> Result<Value, BrokerError> {
        let response = request.headers(self.headers(tokens)).send().await?;
        self.read(response).await
    }

    async fn get(&self, path: &str, tokens: &SessionTokens) -> Result<Value, BrokerError> {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        session_checked(self.send(request, Some(tokens)).await)
    }

    async fn post(&self, path: &str, tokens: &SessionTokens, body: &Value) -> Result<Value, BrokerError> {
        let request = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        session_checked(self.send(request, Some(tokens)).await)
    }

    // Login steps report a refusal as a plain status; there is no session to expire yet.
    async fn post_login(&self, path: &str, tokens: Option<&SessionTokens>, body: &Value) -> Result<Value, BrokerError> {
        let request = self.client.post(format!("{}{}", self.base_url, path)).json(body);
        self.send(request, tokens).await
    }

    async fn service_tokens(&self) -> Result<SessionTokens, BrokerError> {
        self.service_tokens
            .read()
            .await
            .clone()
            .ok_or(BrokerError::SessionExpired)
    }
}

/// Turns a 401, or a reply asking for a fresh 2FA, into `SessionExpired`.
fn session_checked(result: Result<Value, BrokerError>) -> Result<Value, BrokerError> {
    match result {
        Err(BrokerError::Status { status: 401, .. }) => Err(BrokerError::SessionExpired),
        Ok(value) => {
            let expired = value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_lowercase)
                .map_or(false, |m| m.contains("2fa") || m.contains("invalid jwt"));
            if expired {
                Err(BrokerError::SessionExpired)
            } else {
                Ok(value)
            }
        }
        Err(e) => Err(e),
    }
}

/// Picks the `data` list out of a broker reply; a bare list is accepted too.
pub fn data_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other],
        },
        _ => Vec::new(),
    }
}

fn num(value: &Value, key: &str) -> f64 {
    match value.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds a [`Quote`] from the broker's short-keyed quote payload.
pub fn parse_quote(symbol: &str, raw: &Value) -> Result<Quote, BrokerError> {
    let ltp = num(raw, "lp");
    if ltp <= 0.0 {
        return Err(BrokerError::NoQuote(symbol.to_string()));
    }
    let close = num(raw, "c");
    let net_change = if close > 0.0 { ltp - close } else { 0.0 };
    let percent_change = match raw.get("prctyp") {
        Some(_) => num(raw, "prctyp"),
        None => crate::pnl::change_percent(close, ltp),
    };
    Ok(Quote {
        symbol: symbol.to_string(),
        trading_symbol: text(raw, "tsym").unwrap_or_else(|| format!("{}-EQ", symbol)),
        token: text(raw, "tk"),
        exchange: text(raw, "exch").unwrap_or_else(|| "NSE".to_string()),
        ltp,
        open: num(raw, "o"),
        high: num(raw, "h"),
        low: num(raw, "l"),
        close,
        net_change,
        percent_change,
        volume: num(raw, "v") as i64,
        bid: num(raw, "bp1"),
        ask: num(raw, "sp1"),
        week_52_high: num(raw, "h52"),
        week_52_low: num(raw, "l52"),
        timestamp: Utc::now(),
    })
}

#[async_trait]
impl QuoteSource for NeoClient {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let tokens = self.service_tokens().await?;
        let path = format!("{}/nse_cm|{}-EQ/all", QUOTES_PATH, symbol);
        let value = self.get(&path, &tokens).await?;
        let first = data_list(value)
            .into_iter()
            .next()
            .ok_or_else(|| BrokerError::NoQuote(symbol.to_string()))?;
        parse_quote(symbol, &first)
    }
}

#[async_trait]
impl BrokerApi for NeoClient {
    async fn login(&self, credentials: &LoginCredentials) -> Result<BrokerSession, BrokerError> {
        info!("Attempting TOTP login for {}", credentials.ucc);
        let view = self
            .post_login(
                TOTP_LOGIN_PATH,
                None,
                &json!({
                    "mobileNumber": credentials.mobile_number,
                    "ucc": credentials.ucc,
                    "totp": credentials.totp,
                }),
            )
            .await?;
        let view_data = view
            .get("data")
            .cloned()
            .ok_or_else(|| BrokerError::Payload("TOTP login returned no data".into()))?;

        let view_tokens = SessionTokens {
            access_token: text(&view_data, "token"),
            session_token: text(&view_data, "token"),
            sid: text(&view_data, "sid"),
            rid: text(&view_data, "rid"),
        };
        let validated = self
            .post_login(
                TOTP_VALIDATE_PATH,
                Some(&view_tokens),
                &json!({ "mpin": credentials.mpin }),
            )
            .await?;
        let data = validated
            .get("data")
            .cloned()
            .ok_or_else(|| BrokerError::Payload("MPIN validation returned no data".into()))?;

        let session = BrokerSession {
            tokens: SessionTokens {
                access_token: view_tokens.access_token.clone(),
                session_token: text(&data, "token"),
                sid: text(&data, "sid").or(view_tokens.sid),
                rid: text(&data, "rid").or(view_tokens.rid),
            },
            greeting_name: text(&data, "greetingName"),
            broker_user_id: text(&data, "userId"),
            client_code: text(&data, "clientCode"),
            product_code: text(&data, "productCode"),
            account_type: text(&data, "accountType"),
            branch_code: text(&data, "branchCode"),
            is_trial_account: data
                .get("isTrialAccount")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        *self.service_tokens.write().await = Some(session.tokens.clone());
        info!("TOTP login completed for {}", credentials.ucc);
        Ok(session)
    }

    async fn positions(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError> {
        Ok(data_list(self.get(POSITIONS_PATH, tokens).await?))
    }

    async fn holdings(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError> {
        Ok(data_list(self.get(HOLDINGS_PATH, tokens).await?))
    }

    async fn limits(&self, tokens: &SessionTokens) -> Result<Value, BrokerError> {
        let value = self
            .post(LIMITS_PATH, tokens, &json!({"seg": "ALL", "exch": "ALL", "prod": "ALL"}))
            .await?;
        Ok(value.get("data").cloned().unwrap_or(value))
    }

    async fn order_book(&self, tokens: &SessionTokens) -> Result<Vec<Value>, BrokerError> {
        Ok(data_list(self.get(ORDER_BOOK_PATH, tokens).await?))
    }

    async fn place_order(&self, tokens: &SessionTokens, order: &NeoOrder) -> Result<Value, BrokerError> {
        info!(
            "Placing {} {} order for {} of {}",
            order.transaction_type, order.order_type, order.quantity, order.trading_symbol
        );
        let body = serde_json::to_value(order).map_err(|e| BrokerError::Payload(e.to_string()))?;
        let reply = self.post(PLACE_ORDER_PATH, tokens, &body).await?;
        match reply.get("data") {
            Some(data) => Ok(data.clone()),
            None => {
                warn!("Order placement rejected: {}", reply);
                Err(BrokerError::Payload(format!("Order placement failed: {}", reply)))
            }
        }
    }

    async fn modify_order(
        &self,
        tokens: &SessionTokens,
        order: &ModifyOrderRequest,
    ) -> Result<Value, BrokerError> {
        let body = json!({
            "no": order.order_id,
            "pr": order.price.to_string(),
            "qt": order.quantity.to_string(),
            "dq": order.disclosed_quantity.to_string(),
            "tp": order.trigger_price.to_string(),
            "vd": order.validity,
        });
        let reply = self.post(MODIFY_ORDER_PATH, tokens, &body).await?;
        reply
            .get("data")
            .cloned()
            .ok_or_else(|| BrokerError::Payload("Order modification failed".into()))
    }

    async fn cancel_order(
        &self,
        tokens: &SessionTokens,
        order: &CancelOrderRequest,
    ) -> Result<Value, BrokerError> {
        let body = json!({ "on": order.order_id, "am": if order.is_verify { "YES" } else { "NO" } });
        let reply = self.post(CANCEL_ORDER_PATH, tokens, &body).await?;
        reply
            .get("data")
            .cloned()
            .ok_or_else(|| BrokerError::Payload("Order cancellation failed".into()))
    }
}

/// Development quote source: a fixed base price per ETF moved up to ±2%.
pub struct SimulatedQuotes {
    base_prices: HashMap<String, f64>,
}

impl Default for SimulatedQuotes {
    fn default() -> Self {
        let base_prices = [
            ("NIFTYBEES", 290.50),
            ("JUNIORBEES", 45.20),
            ("BANKBEES", 520.75),
            ("ITBEES", 75.30),
            ("LIQUIDBEES", 999.85),
            ("GOLDSHARE", 45.60),
            ("HDFCNIFTY", 180.25),
            ("ICICINIFTY", 175.40),
            ("KOTAKNV20", 94.80),
            ("KOTAKPSU", 12.15),
            ("KOTAKSILV", 65.90),
            ("HDFCGOLD", 85.20),
            ("AXISGOLD", 78.40),
            ("RELGOLD", 92.30),
            ("ICICINXT50", 209.15),
            ("ICICIPRUH", 142.80),
            ("ICICIB22", 98.60),
            ("PSUBNKBEES", 15.25),
            ("AXISBNK", 110.75),
            ("CPSE ETF", 42.90),
        ]
        .iter()
        .map(|(s, p)| (s.to_string(), *p))
        .collect();
        SimulatedQuotes { base_prices }
    }
}

impl SimulatedQuotes {
    pub fn base_price(&self, symbol: &str) -> f64 {
        self.base_prices.get(symbol).copied().unwrap_or(100.0)
    }
}

#[async_trait]
impl QuoteSource for SimulatedQuotes {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let base = self.base_price(symbol);
        let (movement, volume) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-0.02..=0.02), rng.gen_range(10_000..=500_000))
        };
        let ltp = crate::pnl::round2(base * (1.0 + movement));
        Ok(Quote {
            symbol: symbol.to_string(),
            trading_symbol: format!("{}-EQ", symbol),
            token: None,
            exchange: "NSE".to_string(),
            ltp,
            open: base,
            high: ltp.max(base),
            low: ltp.min(base),
            close: base,
            net_change: crate::pnl::round2(ltp - base),
            percent_change: crate::pnl::round2(movement * 100.0),
            volume,
            bid: ltp,
            ask: ltp,
            week_52_high: 0.0,
            week_52_low: 0.0,
            timestamp: Utc::now(),
        })
    }
}
