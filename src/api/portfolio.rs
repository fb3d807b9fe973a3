// src/api/portfolio.rs
use super::{priced_views, required, with_auth, with_state, AppState};
use crate::auth::AuthUser;
use crate::error::{reject, ApiError};
use crate::models::{trading_date, DealType, EtfSignalTrade, PositionStatus, UserDeal};
use crate::pnl::{round2, Direction, PortfolioSummary, Priced};
use chrono::Utc;
use log::info;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize)]
struct CreateDealRequest {
    symbol: Option<String>,
    trading_symbol: Option<String>,
    exchange: Option<String>,
    position_type: Option<Direction>,
    quantity: Option<i64>,
    entry_price: Option<f64>,
    target_price: Option<f64>,
    stop_loss: Option<f64>,
    notes: Option<String>,
    tags: Option<String>,
    signal_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
struct CloseDealRequest {
    exit_price: Option<f64>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateDealRequest {
    target_price: Option<f64>,
    stop_loss: Option<f64>,
    notes: Option<String>,
    tags: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddPositionRequest {
    symbol: Option<String>,
    trading_symbol: Option<String>,
    position_type: Option<Direction>,
    quantity: Option<i64>,
    entry_price: Option<f64>,
    target_price: Option<f64>,
    stop_loss: Option<f64>,
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdatePositionRequest {
    quantity: Option<i64>,
    target_price: Option<f64>,
    stop_loss: Option<f64>,
    notes: Option<String>,
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let create = warp::path!("api" / "deals" / "create")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(create_deal_handler);

    let list = warp::path!("api" / "deals" / "user")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(user_deals_handler);

    let close = warp::path!("api" / "deals" / Uuid / "close")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(optional_json::<CloseDealRequest>())
        .and_then(close_deal_handler);

    let update = warp::path!("api" / "deals" / Uuid / "update")
        .and(warp::put())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(update_deal_handler);

    let stats = warp::path!("api" / "deals" / "stats")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(deal_stats_handler);

    let etf_positions = warp::path!("etf" / "positions")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(etf_positions_handler);

    let add_position = warp::path!("etf" / "add-position")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(add_position_handler);

    let update_position = warp::path!("etf" / "positions" / Uuid)
        .and(warp::put())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(update_position_handler);

    let close_position = warp::path!("etf" / "positions" / Uuid / "close")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(optional_json::<CloseDealRequest>())
        .and_then(close_position_handler);

    let delete_position = warp::path!("etf" / "positions" / Uuid)
        .and(warp::delete())
        .and(with_auth(&state))
        .and(with_state(state))
        .and_then(delete_position_handler);

    create
        .or(list)
        .or(close)
        .or(update)
        .or(stats)
        .or(etf_positions)
        .or(add_position)
        .or(update_position)
        .or(close_position)
        .or(delete_position)
}

/// A JSON body that may be left out entirely.
fn optional_json<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
where
    T: Default + serde::de::DeserializeOwned + Send,
{
    warp::body::bytes().and_then(|bytes: warp::hyper::body::Bytes| async move {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice::<T>(&bytes).map_err(|e| {
            reject(ApiError::BadRequest(format!("Invalid request body: {}", e)))
        })
    })
}

fn positive(value: f64, field: &str) -> Result<f64, ApiError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(ApiError::BadRequest(format!("{} must be positive", field)))
    }
}

fn symbol_of(raw: Option<String>) -> Result<String, ApiError> {
    let symbol = required(raw, "symbol")?.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(ApiError::BadRequest("Missing required field: symbol".to_string()));
    }
    Ok(symbol)
}

async fn create_deal_handler(
    caller: AuthUser,
    state: AppState,
    body: CreateDealRequest,
) -> Result<impl Reply, Rejection> {
    let symbol = symbol_of(body.symbol).map_err(reject)?;
    let position_type = required(body.position_type, "position_type").map_err(reject)?;
    let quantity = required(body.quantity, "quantity").map_err(reject)?;
    let entry_price = required(body.entry_price, "entry_price")
        .and_then(|p| positive(p, "Entry price"))
        .map_err(reject)?;
    if quantity <= 0 {
        return Err(reject(ApiError::BadRequest("Quantity must be positive".into())));
    }

    if let Some(signal_id) = body.signal_id {
        let visible = state
            .store
            .get_signal(signal_id)
            .await
            .map_err(reject)?
            .map_or(false, |s| s.target_user_id == caller.user.id);
        if !visible {
            return Err(reject(ApiError::NotFound("Signal")));
        }
    }

    let stored = state.store.latest_quote(&symbol).await.map_err(reject)?;
    let market = state.book.resolve(&symbol, stored.as_ref(), entry_price).await;
    let now = Utc::now();
    let deal = UserDeal {
        id: Uuid::new_v4(),
        user_id: caller.user.id,
        signal_id: body.signal_id,
        trading_symbol: body
            .trading_symbol
            .unwrap_or_else(|| format!("{}-EQ", symbol)),
        exchange: body.exchange.unwrap_or_else(|| "NSE".to_string()),
        symbol,
        position_type,
        quantity,
        entry_price,
        current_price: market.price,
        target_price: body.target_price,
        stop_loss: body.stop_loss,
        status: PositionStatus::Active,
        deal_type: if body.signal_id.is_some() {
            DealType::Signal
        } else {
            DealType::Manual
        },
        change_percent: 0.0,
        notes: body.notes,
        tags: body.tags,
        exit_date: None,
        created_at: now,
        updated_at: now,
        last_price_update: market.as_of,
    };
    state.store.save_deal(&deal).await.map_err(reject)?;
    info!("{} opened deal {} on {}", caller.user.ucc, deal.id, deal.symbol);

    let view = priced_views(&state, vec![deal])
        .await
        .map_err(reject)?
        .pop();
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Deal created successfully",
        "deal": view,
    })))
}

async fn user_deals_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let deals = state.store.deals_for(caller.user.id).await.map_err(reject)?;
    let views = priced_views(&state, deals).await.map_err(reject)?;
    let summary = PortfolioSummary::from_snapshots(
        views
            .iter()
            .filter(|v| v.record.is_active())
            .map(|v| &v.pnl),
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": views.len(),
        "deals": views,
        "summary": summary,
    })))
}

async fn close_deal_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
    body: CloseDealRequest,
) -> Result<impl Reply, Rejection> {
    let mut deal = state
        .store
        .get_deal_for(caller.user.id, id)
        .await
        .map_err(reject)?;
    if deal.status == PositionStatus::Closed {
        return Err(reject(ApiError::BadRequest("Deal is already closed".into())));
    }

    let exit_price = match body.exit_price {
        Some(price) => positive(price, "Exit price").map_err(reject)?,
        None => {
            let stored = state.store.latest_quote(&deal.symbol).await.map_err(reject)?;
            state
                .book
                .resolve(&deal.symbol, stored.as_ref(), deal.current_price)
                .await
                .price
        }
    };
    deal.close(exit_price, Utc::now(), body.notes.as_deref());
    state.store.save_deal(&deal).await.map_err(reject)?;

    let pnl = deal.pnl();
    info!(
        "{} closed deal {} at {} (P&L {:.2})",
        caller.user.ucc, deal.id, exit_price, pnl.pnl
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Deal closed successfully",
        "pnl": pnl,
        "deal": deal,
    })))
}

async fn update_deal_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
    body: UpdateDealRequest,
) -> Result<impl Reply, Rejection> {
    let mut deal = state
        .store
        .get_deal_for(caller.user.id, id)
        .await
        .map_err(reject)?;
    if let Some(target) = body.target_price {
        deal.target_price = Some(positive(target, "Target price").map_err(reject)?);
    }
    if let Some(stop) = body.stop_loss {
        deal.stop_loss = Some(positive(stop, "Stop loss").map_err(reject)?);
    }
    if body.notes.is_some() {
        deal.notes = body.notes;
    }
    if body.tags.is_some() {
        deal.tags = body.tags;
    }
    deal.updated_at = Utc::now();
    state.store.save_deal(&deal).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Deal updated successfully",
        "deal": deal,
    })))
}

async fn deal_stats_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let deals = state.store.deals_for(caller.user.id).await.map_err(reject)?;
    let views = priced_views(&state, deals).await.map_err(reject)?;

    let active = views.iter().filter(|v| v.record.is_active()).count();
    let closed: Vec<_> = views.iter().filter(|v| !v.record.is_active()).collect();
    let winning = closed.iter().filter(|v| v.pnl.pnl > 0.0).count();
    let losing = closed.iter().filter(|v| v.pnl.pnl < 0.0).count();
    let realized: f64 = closed.iter().map(|v| v.pnl.pnl).sum();
    let unrealized: f64 = views
        .iter()
        .filter(|v| v.record.is_active())
        .map(|v| v.pnl.pnl)
        .sum();
    let investment: f64 = views.iter().map(|v| v.pnl.investment).sum();
    let success_rate = if closed.is_empty() {
        0.0
    } else {
        winning as f64 * 100.0 / closed.len() as f64
    };

    Ok(warp::reply::json(&json!({
        "success": true,
        "stats": {
            "total_deals": views.len(),
            "active_deals": active,
            "closed_deals": closed.len(),
            "winning_deals": winning,
            "losing_deals": losing,
            "total_investment": round2(investment),
            "realized_pnl": round2(realized),
            "unrealized_pnl": round2(unrealized),
            "total_pnl": round2(realized + unrealized),
            "success_rate": round2(success_rate),
        },
    })))
}

async fn etf_positions_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let trades = state.store.trades_for(caller.user.id).await.map_err(reject)?;
    let views = priced_views(&state, trades).await.map_err(reject)?;
    let summary = PortfolioSummary::from_snapshots(
        views
            .iter()
            .filter(|v| v.record.is_active())
            .map(|v| &v.pnl),
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "positions": views,
        "summary": summary,
    })))
}

async fn add_position_handler(
    caller: AuthUser,
    state: AppState,
    body: AddPositionRequest,
) -> Result<impl Reply, Rejection> {
    let symbol = symbol_of(body.symbol).map_err(reject)?;
    let quantity = required(body.quantity, "quantity").map_err(reject)?;
    let entry_price = required(body.entry_price, "entry_price")
        .and_then(|p| positive(p, "Entry price"))
        .map_err(reject)?;
    if quantity <= 0 {
        return Err(reject(ApiError::BadRequest("Quantity must be positive".into())));
    }

    let stored = state.store.latest_quote(&symbol).await.map_err(reject)?;
    let market = state.book.resolve(&symbol, stored.as_ref(), entry_price).await;
    let now = Utc::now();
    let trade = EtfSignalTrade {
        id: Uuid::new_v4(),
        user_id: caller.user.id,
        trading_symbol: body
            .trading_symbol
            .unwrap_or_else(|| format!("{}-EQ", symbol)),
        symbol,
        exchange: "NSE".to_string(),
        position_type: body.position_type.unwrap_or(Direction::Long),
        quantity,
        entry_price,
        current_price: market.price,
        target_price: body.target_price,
        stop_loss: body.stop_loss,
        status: PositionStatus::Active,
        change_percent: 0.0,
        notes: body.notes,
        entry_date: trading_date(now),
        exit_date: None,
        created_at: now,
        last_price_update: market.as_of,
    };
    state.store.save_trade(&trade).await.map_err(reject)?;
    info!("{} added ETF position {} on {}", caller.user.ucc, trade.id, trade.symbol);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Position added successfully",
        "position_id": trade.id,
    })))
}

async fn update_position_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
    body: UpdatePositionRequest,
) -> Result<impl Reply, Rejection> {
    let mut trade = state
        .store
        .get_trade_for(caller.user.id, id)
        .await
        .map_err(reject)?;
    if trade.status == PositionStatus::Closed {
        return Err(reject(ApiError::BadRequest("Position is already closed".into())));
    }
    if let Some(quantity) = body.quantity {
        if quantity <= 0 {
            return Err(reject(ApiError::BadRequest("Quantity must be positive".into())));
        }
        trade.quantity = quantity;
    }
    if let Some(target) = body.target_price {
        trade.target_price = Some(positive(target, "Target price").map_err(reject)?);
    }
    if let Some(stop) = body.stop_loss {
        trade.stop_loss = Some(positive(stop, "Stop loss").map_err(reject)?);
    }
    if body.notes.is_some() {
        trade.notes = body.notes;
    }
    state.store.save_trade(&trade).await.map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Position updated successfully",
        "position": trade,
    })))
}

async fn close_position_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
    body: CloseDealRequest,
) -> Result<impl Reply, Rejection> {
    let mut trade = state
        .store
        .get_trade_for(caller.user.id, id)
        .await
        .map_err(reject)?;
    if trade.status == PositionStatus::Closed {
        return Err(reject(ApiError::BadRequest("Position is already closed".into())));
    }

    let exit_price = match body.exit_price {
        Some(price) => positive(price, "Exit price").map_err(reject)?,
        None => {
            let stored = state.store.latest_quote(&trade.symbol).await.map_err(reject)?;
            state
                .book
                .resolve(&trade.symbol, stored.as_ref(), trade.current_price)
                .await
                .price
        }
    };
    trade.close(exit_price, Utc::now(), body.notes.as_deref());
    state.store.save_trade(&trade).await.map_err(reject)?;

    let pnl = trade.pnl();
    info!(
        "{} closed ETF position {} at {} (P&L {:.2})",
        caller.user.ucc, trade.id, exit_price, pnl.pnl
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Position closed successfully",
        "pnl": pnl,
        "position": trade,
    })))
}

async fn delete_position_handler(
    id: Uuid,
    caller: AuthUser,
    state: AppState,
) -> Result<impl Reply, Rejection> {
    let trade = state
        .store
        .get_trade_for(caller.user.id, id)
        .await
        .map_err(reject)?;
    state.store.delete_trade(trade.id).await.map_err(reject)?;
    info!("{} deleted ETF position {}", caller.user.ucc, trade.id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Position deleted successfully",
    })))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use serde_json::json;

    #[tokio::test]
    async fn deal_creation_names_the_missing_field() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, body) = call(
            &h.state,
            "POST",
            "/api/deals/create",
            Some(&token),
            Some(json!({"symbol": "NIFTYBEES", "position_type": "LONG", "quantity": 5})),
        )
        .await;
        assert_eq!(status, 400);
        assert_eq!(body["message"], "Missing required field: entry_price");
    }

    #[tokio::test]
    async fn deal_lifecycle_derives_pnl() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, created) = call(
            &h.state,
            "POST",
            "/api/deals/create",
            Some(&token),
            Some(json!({"symbol": "NIFTYBEES", "position_type": "LONG", "quantity": 4, "entry_price": 240.0})),
        )
        .await;
        assert_eq!(status, 200, "{}", created);
        assert_eq!(created["deal"]["deal_type"], "MANUAL");
        assert_eq!(created["deal"]["current_price"], 250.0);
        assert_eq!(created["deal"]["pnl"]["pnl"], 40.0);
        let id = created["deal"]["id"].as_str().unwrap().to_string();

        let (status, updated) = call(
            &h.state,
            "PUT",
            &format!("/api/deals/{}/update", id),
            Some(&token),
            Some(json!({"target_price": 270.0, "tags": "swing"})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(updated["deal"]["target_price"], 270.0);
        assert_eq!(updated["deal"]["tags"], "swing");

        let close_path = format!("/api/deals/{}/close", id);
        let (status, closed) = call(
            &h.state,
            "POST",
            &close_path,
            Some(&token),
            Some(json!({"exit_price": 260.0, "notes": "target near"})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(closed["pnl"]["pnl"], 80.0);
        assert_eq!(closed["deal"]["status"], "CLOSED");
        assert_eq!(closed["deal"]["notes"], "Closed: target near");

        let (status, again) = call(&h.state, "POST", &close_path, Some(&token), None).await;
        assert_eq!(status, 400);
        assert_eq!(again["message"], "Deal is already closed");

        let (_, stats) = call(&h.state, "GET", "/api/deals/stats", Some(&token), None).await;
        assert_eq!(stats["stats"]["closed_deals"], 1);
        assert_eq!(stats["stats"]["winning_deals"], 1);
        assert_eq!(stats["stats"]["realized_pnl"], 80.0);
        assert_eq!(stats["stats"]["success_rate"], 100.0);
    }

    #[tokio::test]
    async fn closing_without_a_price_uses_the_market() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (_, created) = call(
            &h.state,
            "POST",
            "/api/deals/create",
            Some(&token),
            Some(json!({"symbol": "BANKBEES", "position_type": "SHORT", "quantity": 2, "entry_price": 530.0})),
        )
        .await;
        let id = created["deal"]["id"].as_str().unwrap();
        let (status, closed) = call(
            &h.state,
            "POST",
            &format!("/api/deals/{}/close", id),
            Some(&token),
            None,
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(closed["deal"]["current_price"], 520.0);
        assert_eq!(closed["pnl"]["pnl"], 20.0);
    }

    #[tokio::test]
    async fn deals_of_other_users_are_not_found() {
        let h = harness().await;
        let (owner, _) = login(&h.state, "TRADER1").await;
        let (other, _) = login(&h.state, "TRADER2").await;
        let (_, created) = call(
            &h.state,
            "POST",
            "/api/deals/create",
            Some(&owner),
            Some(json!({"symbol": "NIFTYBEES", "position_type": "BUY", "quantity": 1, "entry_price": 250.0})),
        )
        .await;
        let id = created["deal"]["id"].as_str().unwrap();
        let (status, body) = call(
            &h.state,
            "POST",
            &format!("/api/deals/{}/close", id),
            Some(&other),
            None,
        )
        .await;
        assert_eq!(status, 404);
        assert_eq!(body["message"], "Deal not found");
    }

    #[tokio::test]
    async fn etf_positions_carry_a_summary() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (status, _) = call(
            &h.state,
            "POST",
            "/etf/add-position",
            Some(&token),
            Some(json!({"symbol": "NIFTYBEES", "quantity": 10, "entry_price": 245.0})),
        )
        .await;
        assert_eq!(status, 200);

        let (status, body) = call(&h.state, "GET", "/etf/positions", Some(&token), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["positions"][0]["position_type"], "LONG");
        assert_eq!(body["summary"]["total_positions"], 1);
        assert_eq!(body["summary"]["total_pnl"], 50.0);
        assert_eq!(body["summary"]["total_investment"], 2450.0);
    }

    #[tokio::test]
    async fn etf_positions_can_be_updated_closed_and_deleted() {
        let h = harness().await;
        let (token, _) = login(&h.state, "TRADER1").await;
        let (other, _) = login(&h.state, "TRADER2").await;
        let (_, added) = call(
            &h.state,
            "POST",
            "/etf/add-position",
            Some(&token),
            Some(json!({"symbol": "NIFTYBEES", "quantity": 10, "entry_price": 240.0})),
        )
        .await;
        let id = added["position_id"].as_str().unwrap().to_string();
        let path = format!("/etf/positions/{}", id);

        let (status, updated) = call(
            &h.state,
            "PUT",
            &path,
            Some(&token),
            Some(json!({"quantity": 4, "target_price": 270.0})),
        )
        .await;
        assert_eq!(status, 200, "{}", updated);
        assert_eq!(updated["position"]["quantity"], 4);
        assert_eq!(updated["position"]["target_price"], 270.0);

        let (status, _) = call(&h.state, "PUT", &path, Some(&other), Some(json!({"quantity": 1}))).await;
        assert_eq!(status, 404);

        let close_path = format!("{}/close", path);
        let (status, closed) = call(
            &h.state,
            "POST",
            &close_path,
            Some(&token),
            Some(json!({"exit_price": 255.0})),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(closed["position"]["status"], "CLOSED");
        assert_eq!(closed["pnl"]["pnl"], 60.0);
        assert!(closed["position"]["exit_date"].is_string());

        let (status, again) = call(&h.state, "POST", &close_path, Some(&token), None).await;
        assert_eq!(status, 400);
        assert_eq!(again["message"], "Position is already closed");
        assert!(h.state.store.active_trades().await.unwrap().is_empty());

        let (status, _) = call(&h.state, "DELETE", &path, Some(&other), None).await;
        assert_eq!(status, 404);
        let (status, _) = call(&h.state, "DELETE", &path, Some(&token), None).await;
        assert_eq!(status, 200);
        let (_, listed) = call(&h.state, "GET", "/etf/positions", Some(&token), None).await;
        assert_eq!(listed["positions"].as_array().unwrap().len(), 0);
    }
}
