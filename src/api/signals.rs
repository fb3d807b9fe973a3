// src/api/signals.rs
use super::{priced_views, require_admin, required, with_auth, with_state, AppState, PricedView};
use crate::auth::AuthUser;
use crate::error::{reject, ApiError};
use crate::models::{
    AdminTradeSignal, Notification, NotificationKind, Priority, SignalStatus, SignalType,
};
use crate::pnl::PortfolioSummary;
use chrono::{DateTime, Utc};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

const DEFAULT_NOTIFICATION_LIMIT: usize = 50;

#[derive(Debug, Deserialize)]
struct SendSignalRequest {
    target_user_id: Option<Uuid>,
    symbol: Option<String>,
    trading_symbol: Option<String>,
    token: Option<String>,
    exchange: Option<String>,
    signal_type: Option<SignalType>,
    entry_price: Option<f64>,
    target_price: Option<f64>,
    stop_loss: Option<f64>,
    quantity: Option<i64>,
    signal_title: Option<String>,
    signal_description: Option<String>,
    notes: Option<String>,
    priority: Option<Priority>,
    expires_at: Option<DateTime<Utc>>,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let send = warp::path!("api" / "admin" / "send-signal")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(send_signal_handler);

    let sent = warp::path!("api" / "admin" / "signals")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(sent_signals_handler);

    let cancel = warp::path!("api" / "admin" / "signals" / Uuid / "cancel")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(cancel_signal_handler);

    let board = warp::path!("api" / "admin-trade-signals")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(signal_board_handler);

    let one = warp::path!("api" / "admin-trade-signals" / Uuid)
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(signal_detail_handler);

    let received = warp::path!("api" / "received-signals")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(received_signals_handler);

    let read = warp::path!("api" / "signals" / Uuid / "read")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(mark_signal_read_handler);

    let execute = warp::path!("api" / "signals" / Uuid / "execute")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(execute_signal_handler);

    let notifications = warp::path!("api" / "notifications")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::query::<HashMap<String, String>>())
        .and_then(notifications_handler);

    let notification_read = warp::path!("api" / "notifications" / Uuid / "read")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state))
        .and_then(mark_notification_read_handler);

    send.or(sent)
        .or(cancel)
        .or(board)
        .or(one)
        .or(received)
        .or(read)
        .or(execute)
        .or(notifications)
        .or(notification_read)
}

fn display_name(caller: &AuthUser) -> String {
    caller
        .user
        .greeting_name
        .clone()
        .unwrap_or_else(|| caller.user.ucc.clone())
}

fn sort_by_pnl(views: &mut [PricedView<AdminTradeSignal>]) {
    views.sort_by(|a, b| {
        b.pnl
            .pnl
            .partial_cmp(&a.pnl.pnl)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

async fn send_signal_handler(
    caller: AuthUser,
    state: AppState,
    body: SendSignalRequest,
) -> Result<impl Reply, Rejection> {
    require_admin(&state, &caller).map_err(reject)?;
    let target_id = required(body.target_user_id, "target_user_id").map_err(reject)?;
    let symbol = required(body.symbol, "symbol")
        .map_err(reject)?
        .trim()
        .to_uppercase();
    let signal_type = required(body.signal_type, "signal_type").map_err(reject)?;
    let entry_price = required(body.entry_price, "entry_price").map_err(reject)?;
    if symbol.is_empty() {
        return Err(reject(ApiError::BadRequest("Missing required field: symbol".into())));
    }
    if entry_price <= 0.0 {
        return Err(reject(ApiError::BadRequest("Entry price must be positive".into())));
    }
    let quantity = body.quantity.unwrap_or(1);
    if quantity <= 0 {
        return Err(reject(ApiError::BadRequest("Quantity must be positive".into())));
    }

    let target = state
        .store
        .get_user(target_id)
        .await
        .map_err(reject)?
        .ok_or_else(|| reject(ApiError::NotFound("Target user")))?;

    let stored = state.store.latest_quote(&symbol).await.map_err(reject)?;
    let market = state.book.resolve(&symbol, stored.as_ref(), entry_price).await;
    let now = Utc::now();
    let priority = body.priority.unwrap_or_default();
    let title = body
        .signal_title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| format!("{} {}", signal_type.as_str(), symbol));

    let signal = AdminTradeSignal {
        id: Uuid::new_v4(),
        admin_user_id: caller.user.id,
        target_user_id: target.id,
        trading_symbol: body
            .trading_symbol
            .or_else(|| market.quote.as_ref().map(|q| q.trading_symbol.clone()))
            .unwrap_or_else(|| format!("{}-EQ", symbol)),
        token: body
            .token
            .or_else(|| market.quote.as_ref().and_then(|q| q.token.clone())),
        exchange: body.exchange.unwrap_or_else(|| "NSE".to_string()),
        symbol,
        signal_type,
        entry_price,
        current_price: market.price,
        target_price: body.target_price,
        stop_loss: body.stop_loss,
        quantity,
        signal_title: title,
        signal_description: body.signal_description,
        notes: body.notes,
        priority,
        status: SignalStatus::Active,
        is_read: false,
        is_executed: false,
        change_percent: 0.0,
        created_at: now,
        updated_at: now,
        expires_at: body.expires_at,
        last_update_time: market.as_of,
    };
    state.store.save_signal(&signal).await.map_err(reject)?;

    let notification = Notification {
        id: Uuid::new_v4(),
        user_id: target.id,
        title: "New Trade Signal".to_string(),
        message: format!(
            "{} {} x{} @ ₹{:.2}: {}",
            signal.signal_type.as_str(),
            signal.symbol,
            signal.quantity,
            signal.entry_price,
            signal.signal_title
        ),
        notification_type: NotificationKind::TradeSignal,
        priority,
        related_signal_id: Some(signal.id),
        is_read: false,
        read_at: None,
        created_at: now,
    };
    state
        .store
        .save_notification(&notification)
        .await
        .map_err(reject)?;

    info!(
        "{} sent {} {} signal to {}",
        caller.user.ucc,
        signal.signal_type.as_str(),
        signal.symbol,
        target.ucc
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Signal sent successfully",
        "signal_id": signal.id,
        "notification_id": notification.id,
    })))
}

async fn sent_signals_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    require_admin(&state, &caller).map_err(reject)?;
    let signals = state
        .store
        .signals_sent_by(caller.user.id)
        .await
        .map_err(reject)?;
    let views = priced_views(&state, signals).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": views.len(),
        "signals": views,
    })))
}

/// Withdraws an active signal; only the admin who sent it may do so.
async fn cancel_signal_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    require_admin(&state, &caller).map_err(reject)?;
    let mut signal = state
        .store
        .get_signal(id)
        .await
        .map_err(reject)?
        .filter(|s| s.admin_user_id == caller.user.id)
        .ok_or_else(|| reject(ApiError::NotFound("Signal")))?;
    if signal.status != SignalStatus::Active {
        return Err(reject(ApiError::BadRequest(
            "Signal is no longer active".to_string(),
        )));
    }

    let now = Utc::now();
    signal.status = SignalStatus::Cancelled;
    signal.updated_at = now;
    state.store.save_signal(&signal).await.map_err(reject)?;

    let notification = Notification {
        id: Uuid::new_v4(),
        user_id: signal.target_user_id,
        title: "Signal Cancelled".to_string(),
        message: format!(
            "{} {} was withdrawn by {}",
            signal.signal_type.as_str(),
            signal.symbol,
            display_name(&caller)
        ),
        notification_type: NotificationKind::Info,
        priority: signal.priority,
        related_signal_id: Some(signal.id),
        is_read: false,
        read_at: None,
        created_at: now,
    };
    state
        .store
        .save_notification(&notification)
        .await
        .map_err(reject)?;

    info!("{} cancelled signal {}", caller.user.ucc, signal.id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Signal cancelled",
    })))
}

/// Active signals the caller sent or received, valued at market.
async fn signal_board_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let me = caller.user.id;
    let signals: Vec<AdminTradeSignal> = state
        .store
        .active_signals()
        .await
        .map_err(reject)?
        .into_iter()
        .filter(|s| s.target_user_id == me || s.admin_user_id == me)
        .collect();
    let mut views = priced_views(&state, signals).await.map_err(reject)?;
    sort_by_pnl(&mut views);
    let summary = PortfolioSummary::from_snapshots(views.iter().map(|v| &v.pnl));
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": views.len(),
        "signals": views,
        "summary": summary,
        "last_updated": Utc::now(),
    })))
}

async fn visible_signal(
    state: &AppState,
    caller: &AuthUser,
    id: Uuid,
) -> Result<AdminTradeSignal, ApiError> {
    state
        .store
        .get_signal(id)
        .await?
        .filter(|s| s.target_user_id == caller.user.id || s.admin_user_id == caller.user.id)
        .ok_or(ApiError::NotFound("Signal"))
}

async fn signal_detail_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let signal = visible_signal(&state, &caller, id).await.map_err(reject)?;
    let view = priced_views(&state, vec![signal])
        .await
        .map_err(reject)?
        .pop()
        .ok_or_else(|| reject(ApiError::NotFound("Signal")))?;
    Ok(warp::reply::json(&json!({ "success": true, "signal": view })))
}

async fn received_signals_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let signals = state
        .store
        .signals_for(caller.user.id)
        .await
        .map_err(reject)?;
    let unread = signals.iter().filter(|s| !s.is_read).count();
    let views = priced_views(&state, signals).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": views.len(),
        "unread_count": unread,
        "signals": views,
    })))
}

async fn received_signal(
    state: &AppState,
    caller: &AuthUser,
    id: Uuid,
) -> Result<AdminTradeSignal, ApiError> {
    state
        .store
        .get_signal(id)
        .await?
        .filter(|s| s.target_user_id == caller.user.id)
        .ok_or(ApiError::NotFound("Signal"))
}

async fn mark_signal_read_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let mut signal = received_signal(&state, &caller, id).await.map_err(reject)?;
    signal.is_read = true;
    signal.updated_at = Utc::now();
    state.store.save_signal(&signal).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Signal marked as read",
    })))
}

async fn execute_signal_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let mut signal = received_signal(&state, &caller, id).await.map_err(reject)?;
    if signal.status != SignalStatus::Active {
        return Err(reject(ApiError::BadRequest(
            "Signal is no longer active".to_string(),
        )));
    }
    if signal.is_executed {
        return Err(reject(ApiError::BadRequest(
            "Signal already executed".to_string(),
        )));
    }

    let now = Utc::now();
    signal.is_executed = true;
    signal.is_read = true;
    signal.updated_at = now;
    state.store.save_signal(&signal).await.map_err(reject)?;

    let notification = Notification {
        id: Uuid::new_v4(),
        user_id: signal.admin_user_id,
        title: "Signal Executed".to_string(),
        message: format!(
            "{} executed {} {}",
            display_name(&caller),
            signal.signal_type.as_str(),
            signal.symbol
        ),
        notification_type: NotificationKind::Info,
        priority: signal.priority,
        related_signal_id: Some(signal.id),
        is_read: false,
        read_at: None,
        created_at: now,
    };
    state
        .store
        .save_notification(&notification)
        .await
        .map_err(reject)?;

    info!("{} executed signal {}", caller.user.ucc, signal.id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Signal marked as executed",
    })))
}

async fn notifications_handler(
    caller: AuthUser,
    state: AppState,
    query: HashMap<String, String>,
) -> Result<impl Reply, Rejection> {
    let limit = match query.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| reject(ApiError::BadRequest(format!("Invalid limit: {}", raw))))?,
        None => DEFAULT_NOTIFICATION_LIMIT,
    };
    let (notifications, unread) = state
        .store
        .notifications_for(caller.user.id, limit)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "notifications": notifications,
        "unread_count": unread,
    })))
}

async fn mark_notification_read_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    state
        .store
        .mark_notification_read(caller.user.id, id, Utc::now())
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Notification marked as read",
    })))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::test_config;
    use serde_json::{json, Value};

    async fn send(state: &super::AppState, token: &str, target: &str, body: Value) -> (u16, Value) {
        let mut body = body;
        body["target_user_id"] = json!(target);
        call(state, "POST", "/api/admin/send-signal", Some(token), Some(body)).await
    }

    #[tokio::test]
    async fn signal_reaches_the_target_with_a_notification() {
        let h = harness().await;
        let (admin, _) = login(&h.state, "ADMIN1").await;
        let (trader, trader_id) = login(&h.state, "TRADER1").await;

        let (status, body) = send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "niftybees", "signal_type": "BUY", "entry_price": 240.0, "quantity": 10, "priority": "HIGH"}),
        )
        .await;
        assert_eq!(status, 200, "{}", body);
        let signal_id = body["signal_id"].as_str().unwrap().to_string();

        let (_, notes) = call(&h.state, "GET", "/api/notifications", Some(&trader), None).await;
        assert_eq!(notes["unread_count"], 1);
        assert_eq!(notes["notifications"][0]["title"], "New Trade Signal");
        assert_eq!(notes["notifications"][0]["priority"], "HIGH");

        let (_, received) = call(&h.state, "GET", "/api/received-signals", Some(&trader), None).await;
        assert_eq!(received["count"], 1);
        let signal = &received["signals"][0];
        assert_eq!(signal["symbol"], "NIFTYBEES");
        assert_eq!(signal["market"]["source"], "LIVE");
        assert_eq!(signal["market"]["price"], 250.0);
        assert_eq!(signal["pnl"]["pnl"], 100.0);

        let path = format!("/api/signals/{}/execute", signal_id);
        let (status, _) = call(&h.state, "POST", &path, Some(&trader), None).await;
        assert_eq!(status, 200);
        let (status, again) = call(&h.state, "POST", &path, Some(&trader), None).await;
        assert_eq!(status, 400);
        assert_eq!(again["message"], "Signal already executed");

        let (_, admin_notes) = call(&h.state, "GET", "/api/notifications", Some(&admin), None).await;
        assert_eq!(admin_notes["notifications"][0]["title"], "Signal Executed");
    }

    #[tokio::test]
    async fn missing_fields_are_named() {
        let h = harness().await;
        let (admin, _) = login(&h.state, "ADMIN1").await;
        let (_, trader_id) = login(&h.state, "TRADER1").await;
        let (status, body) = send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "NIFTYBEES", "signal_type": "BUY"}),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["message"], "Missing required field: entry_price");
    }

    #[tokio::test]
    async fn non_admins_cannot_send() {
        let mut h = harness().await;
        let mut config = test_config();
        config.admin_uccs.insert("ADMIN1".to_string());
        h.state.config = std::sync::Arc::new(config);

        let (trader, _) = login(&h.state, "TRADER1").await;
        let (_, admin_id) = login(&h.state, "ADMIN1").await;
        let (status, body) = send(
            &h.state,
            &trader,
            &admin_id,
            json!({"symbol": "NIFTYBEES", "signal_type": "SELL", "entry_price": 250.0}),
        )
        .await;
        assert_eq!(status, 403);
        assert_eq!(body["message"], "Admin access required");
    }

    #[tokio::test]
    async fn board_sorts_by_pnl_and_summarises() {
        let h = harness().await;
        let (admin, _) = login(&h.state, "ADMIN1").await;
        let (trader, trader_id) = login(&h.state, "TRADER1").await;
        send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "BANKBEES", "signal_type": "BUY", "entry_price": 530.0, "quantity": 1}),
        )
        .await;
        send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "NIFTYBEES", "signal_type": "BUY", "entry_price": 245.0, "quantity": 2}),
        )
        .await;

        let (status, body) = call(&h.state, "GET", "/api/admin-trade-signals", Some(&trader), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["count"], 2);
        assert_eq!(body["signals"][0]["symbol"], "NIFTYBEES");
        assert_eq!(body["signals"][1]["symbol"], "BANKBEES");
        assert_eq!(body["summary"]["total_pnl"], 0.0);
        assert_eq!(body["summary"]["winning"], 1);
        assert_eq!(body["summary"]["losing"], 1);
    }

    #[tokio::test]
    async fn strangers_cannot_see_a_signal() {
        let h = harness().await;
        let (admin, _) = login(&h.state, "ADMIN1").await;
        let (_, trader_id) = login(&h.state, "TRADER1").await;
        let (other, _) = login(&h.state, "OTHER1").await;
        let (_, body) = send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "NIFTYBEES", "signal_type": "BUY", "entry_price": 250.0}),
        )
        .await;
        let path = format!("/api/admin-trade-signals/{}", body["signal_id"].as_str().unwrap());

        let (status, _) = call(&h.state, "GET", &path, Some(&admin), None).await;
        assert_eq!(status, 200);
        let (status, body) = call(&h.state, "GET", &path, Some(&other), None).await;
        assert_eq!(status, 404);
        assert_eq!(body["message"], "Signal not found");
    }

    #[tokio::test]
    async fn cancelled_signals_leave_the_board() {
        let h = harness().await;
        let (admin, _) = login(&h.state, "ADMIN1").await;
        let (trader, trader_id) = login(&h.state, "TRADER1").await;
        let (_, body) = send(
            &h.state,
            &admin,
            &trader_id,
            json!({"symbol": "BANKBEES", "signal_type": "SELL", "entry_price": 525.0}),
        )
        .await;
        let id = body["signal_id"].as_str().unwrap().to_string();
        let cancel_path = format!("/api/admin/signals/{}/cancel", id);

        let (status, _) = call(&h.state, "POST", &cancel_path, Some(&trader), None).await;
        assert_eq!(status, 404);
        let (status, _) = call(&h.state, "POST", &cancel_path, Some(&admin), None).await;
        assert_eq!(status, 200);
        let (status, again) = call(&h.state, "POST", &cancel_path, Some(&admin), None).await;
        assert_eq!(status, 400);
        assert_eq!(again["message"], "Signal is no longer active");

        let (_, board) = call(&h.state, "GET", "/api/admin-trade-signals", Some(&trader), None).await;
        assert_eq!(board["count"], 0);
        let (_, received) = call(&h.state, "GET", "/api/received-signals", Some(&trader), None).await;
        assert_eq!(received["signals"][0]["status"], "CANCELLED");
        let (status, _) = call(
            &h.state,
            "POST",
            &format!("/api/signals/{}/execute", id),
            Some(&trader),
            None,
        )
        .await;
        assert_eq!(status, 400);

        let (_, notes) = call(&h.state, "GET", "/api/notifications", Some(&trader), None).await;
        assert_eq!(notes["notifications"][0]["title"], "Signal Cancelled");
    }
}
