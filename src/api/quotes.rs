// src/api/quotes.rs
use super::{with_auth, with_state, AppState};
use crate::auth::AuthUser;
use crate::error::{reject, ApiError, StoreError};
use crate::models::DailyQuote;
use crate::prices::PriceSource;
use crate::websocket;
use chrono::{Duration, Utc};
use log::info;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use warp::{Filter, Rejection, Reply};

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let get_quotes = warp::path!("get_quotes")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(get_quotes_handler);

    let realtime = warp::path!("api" / "realtime-quotes")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(realtime_quotes_handler);

    let refresh = warp::path!("api" / "realtime-quotes" / "refresh")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(refresh_handler);

    let status = warp::path!("api" / "scheduler" / "status")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(scheduler_status_handler);

    let history = warp::path!("api" / "price-history" / String)
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(price_history_handler);

    let stream = warp::path!("ws" / "quotes")
        .and(warp::ws())
        .and(with_state(state))
        .map(|ws: warp::ws::Ws, state: AppState| {
            let book = state.book.clone();
            ws.on_upgrade(move |socket| websocket::stream_quotes(socket, book))
        });

    get_quotes
        .or(realtime)
        .or(refresh)
        .or(status)
        .or(history)
        .or(stream)
}

async fn get_quotes_handler(
    _caller: AuthUser,
    state: AppState,
    query: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let symbols: Vec<String> = query
        .get("symbols")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if symbols.is_empty() {
        return Err(reject(ApiError::BadRequest(
            "symbols parameter is required".to_string(),
        )));
    }

    let stored = state.store.latest_quotes(&symbols).await.map_err(reject)?;
    let mut quotes = Map::new();
    let mut missing = Vec::new();
    for symbol in &symbols {
        let resolved = state.book.resolve(symbol, stored.get(symbol), 0.0).await;
        match (resolved.source, resolved.quote) {
            (PriceSource::SignalData, _) | (_, None) => missing.push(symbol.clone()),
            (source, Some(quote)) => {
                let mut entry = serde_json::to_value(&quote)
                    .map_err(|e| reject(StoreError::from(e)))?;
                entry["source"] = json!(source);
                quotes.insert(symbol.clone(), entry);
            }
        }
    }
    Ok(warp::reply::json(&json!({
        "success": true,
        "quotes": Value::Object(quotes),
        "missing": missing,
    })))
}

async fn realtime_quotes_handler(_caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let mut rows: Vec<DailyQuote> = state
        .store
        .latest_quotes(&[])
        .await
        .map_err(reject)?
        .into_values()
        .collect();
    rows.sort_by(|a, b| a.quote.symbol.cmp(&b.quote.symbol));
    let last_updated = rows.iter().map(|r| r.quote.timestamp).max();
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": rows.len(),
        "last_updated": last_updated,
        "quotes": rows,
    })))
}

fn query_number<T: std::str::FromStr>(
    query: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ApiError> {
    match query.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid {}: {}", key, raw))),
        None => Ok(default),
    }
}

async fn price_history_handler(
    symbol: String,
    _caller: AuthUser,
    state: AppState,
    query: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let symbol = symbol.trim().to_uppercase();
    let hours: i64 = query_number(&query, "hours", 24).map_err(reject)?;
    let limit: usize = query_number(&query, "limit", 500).map_err(reject)?;
    // Nothing older than the retention window is kept.
    let hours = hours.clamp(1, state.config.quote_retention_days * 24);
    let end = Utc::now();
    let start = end - Duration::hours(hours);
    let ticks = state
        .store
        .ticks_between(&symbol, start, end, limit)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "symbol": symbol,
        "count": ticks.len(),
        "ticks": ticks,
    })))
}

async fn refresh_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    info!("{} requested a quote refresh", caller.user.ucc);
    let report = state
        .scheduler
        .refresh_now()
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": format!("Refreshed {} of {} symbols", report.updated, report.symbols),
        "report": report,
    })))
}

async fn scheduler_status_handler(_caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let status = state.scheduler.status().await;
    Ok(warp::reply::json(&json!({
        "success": true,
        "status": status,
    })))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::models::fixtures;
    use chrono::Utc;

    #[tokio::test]
    async fn quotes_come_from_the_book_then_the_store() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        h.state
            .store
            .upsert_daily_quote(fixtures::quote("GOLDSHARE", 61.5, Utc::now()))
            .await
            .unwrap();

        let (status, body) = call(
            &h.state,
            "GET",
            "/get_quotes?symbols=niftybees,GOLDSHARE,UNKNOWN",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["quotes"]["NIFTYBEES"]["ltp"], 250.0);
        assert_eq!(body["quotes"]["NIFTYBEES"]["source"], "LIVE");
        assert_eq!(body["quotes"]["GOLDSHARE"]["source"], "STORED");
        assert_eq!(body["missing"][0], "UNKNOWN");
    }

    #[tokio::test]
    async fn quotes_need_symbols() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, body) = call(&h.state, "GET", "/get_quotes", Some(&token), None).await;
        assert_eq!(status, 400);
        assert_eq!(body["message"], "symbols parameter is required");
    }

    #[tokio::test]
    async fn refresh_runs_a_cycle_and_updates_status() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        h.quotes.set("NIFTYBEES", 255.0);

        let (status, body) =
            call(&h.state, "POST", "/api/realtime-quotes/refresh", Some(&token), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["report"]["updated"], 2);

        let (_, quotes) = call(&h.state, "GET", "/api/realtime-quotes", Some(&token), None).await;
        assert_eq!(quotes["count"], 2);
        assert_eq!(quotes["quotes"][1]["symbol"], "NIFTYBEES");
        assert_eq!(quotes["quotes"][1]["ltp"], 255.0);
        assert_eq!(quotes["quotes"][1]["updates"], 2);

        let (_, status) = call(&h.state, "GET", "/api/scheduler/status", Some(&token), None).await;
        assert_eq!(status["status"]["running"], true);
        assert_eq!(status["status"]["runs_completed"], 2);
    }

    #[tokio::test]
    async fn price_history_lists_recent_ticks() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, body) = call(
            &h.state,
            "GET",
            "/api/price-history/bankbees?hours=2",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["symbol"], "BANKBEES");
        assert_eq!(body["count"], 1);
        assert_eq!(body["ticks"][0]["price"], 520.0);

        let (status, _) = call(
            &h.state,
            "GET",
            "/api/price-history/BANKBEES?limit=lots",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn price_history_caps_the_window_at_retention() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, body) = call(
            &h.state,
            "GET",
            "/api/price-history/BANKBEES?hours=9000000000000000",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);

        let (status, body) = call(
            &h.state,
            "GET",
            "/api/price-history/BANKBEES?hours=-5",
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 1);
    }

    #[tokio::test]
    async fn quote_stream_opens_with_a_snapshot() {
        let h = harness().await;
        let mut client = warp::test::ws()
            .path("/ws/quotes")
            .handshake(super::super::routes(h.state.clone()))
            .await
            .unwrap();
        let hello = client.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(hello.to_str().unwrap()).unwrap();
        assert_eq!(value["type"], "snapshot");
        assert_eq!(value["quotes"]["BANKBEES"]["ltp"], 520.0);
    }
}
