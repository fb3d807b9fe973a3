// src/api/account.rs
use super::{require_admin, with_auth, with_state, AppState};
use crate::auth::{create_token, AuthUser};
use crate::broker::{
    BrokerSession, CancelOrderRequest, LoginCredentials, ModifyOrderRequest, OrderRequest,
    SessionTokens,
};
use crate::db::Store;
use crate::error::{reject, ApiError, BrokerError, StoreError};
use crate::models::{User, UserSession};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde_json::{json, Value};
use uuid::Uuid;
use warp::{Filter, Rejection, Reply};

const RECENT_ORDERS: usize = 10;

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let login = warp::path!("login")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(login_handler);

    let logout = warp::path!("logout")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(logout_handler);

    let dashboard = warp::path!("api" / "dashboard_data")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(dashboard_handler);

    let positions = warp::path!("api" / "positions_data")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(positions_handler);

    let holdings = warp::path!("api" / "holdings_data")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(holdings_handler);

    let place = warp::path!("place_order")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(place_order_handler);

    let modify = warp::path!("modify_order")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(modify_order_handler);

    let cancel = warp::path!("cancel_order")
        .and(warp::post())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and(warp::body::json())
        .and_then(cancel_order_handler);

    let admin_status = warp::path!("api" / "user" / "admin-status")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state.clone()))
        .and_then(admin_status_handler);

    let admin_users = warp::path!("api" / "admin" / "users")
        .and(warp::get())
        .and(with_auth(&state))
        .and(with_state(state))
        .and_then(admin_users_handler);

    login
        .or(logout)
        .or(dashboard)
        .or(positions)
        .or(holdings)
        .or(place)
        .or(modify)
        .or(cancel)
        .or(admin_status)
        .or(admin_users)
}

fn tokens(session: &UserSession) -> SessionTokens {
    SessionTokens {
        access_token: session.access_token.clone(),
        session_token: session.session_token.clone(),
        sid: session.sid.clone(),
        rid: session.rid.clone(),
    }
}

/// Degrades a failed broker read to an empty value; an expired broker
/// session still fails the request.
fn soft<T: Default>(what: &str, result: Result<T, BrokerError>) -> Result<T, ApiError> {
    match result {
        Ok(value) => Ok(value),
        Err(BrokerError::SessionExpired) => Err(BrokerError::SessionExpired.into()),
        Err(e) => {
            warn!("Could not load {}: {}", what, e);
            Ok(T::default())
        }
    }
}

async fn upsert_user(
    store: &Store,
    creds: &LoginCredentials,
    broker: &BrokerSession,
    now: DateTime<Utc>,
) -> Result<User, StoreError> {
    let mut user = match store.find_user_by_ucc(&creds.ucc).await? {
        Some(user) => user,
        None => User {
            id: Uuid::new_v4(),
            ucc: creds.ucc.clone(),
            mobile_number: creds.mobile_number.clone(),
            greeting_name: None,
            broker_user_id: None,
            client_code: None,
            product_code: None,
            account_type: None,
            branch_code: None,
            is_trial_account: false,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_login: None,
        },
    };
    user.mobile_number = creds.mobile_number.clone();
    user.greeting_name = broker.greeting_name.clone().or(user.greeting_name);
    user.broker_user_id = broker.broker_user_id.clone().or(user.broker_user_id);
    user.client_code = broker.client_code.clone().or(user.client_code);
    user.product_code = broker.product_code.clone().or(user.product_code);
    user.account_type = broker.account_type.clone().or(user.account_type);
    user.branch_code = broker.branch_code.clone().or(user.branch_code);
    user.is_trial_account = broker.is_trial_account;
    user.updated_at = now;
    user.last_login = Some(now);
    store.save_user(&user).await?;
    Ok(user)
}

async fn login_handler(state: AppState, body: LoginCredentials) -> Result<impl Reply, Rejection> {
    let creds = body.trimmed();
    if !creds.is_complete() {
        return Err(reject(ApiError::BadRequest(
            "Mobile number, UCC, TOTP and MPIN are all required".to_string(),
        )));
    }

    let broker_session = state.broker.login(&creds).await.map_err(|e| {
        warn!("Login failed for {}: {}", creds.ucc, e);
        match e {
            BrokerError::Status { .. } | BrokerError::Payload(_) => {
                reject(ApiError::BadRequest(format!("Login failed: {}", e)))
            }
            other => reject(other),
        }
    })?;

    let now = Utc::now();
    let user = upsert_user(&state.store, &creds, &broker_session, now)
        .await
        .map_err(reject)?;
    let session = UserSession {
        id: Uuid::new_v4(),
        user_id: user.id,
        access_token: broker_session.tokens.access_token,
        session_token: broker_session.tokens.session_token,
        sid: broker_session.tokens.sid,
        rid: broker_session.tokens.rid,
        created_at: now,
        expires_at: now + state.config.session_lifetime,
        is_active: true,
    };
    state.store.save_session(&session).await.map_err(reject)?;
    let token = create_token(&session, &state.secret).map_err(reject)?;

    info!("User {} logged in", user.ucc);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Login successful",
        "token": token,
        "expires_at": session.expires_at,
        "is_admin": state.config.is_admin(&user.ucc),
        "user": user,
    })))
}

async fn logout_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let closed = state
        .store
        .deactivate_sessions(caller.user.id)
        .await
        .map_err(reject)?;
    info!("User {} logged out, {} sessions closed", caller.user.ucc, closed);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Logged out",
        "sessions_closed": closed,
    })))
}

async fn dashboard_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let tokens = tokens(&caller.session);
    let broker = &state.broker;
    let positions = soft("positions", broker.positions(&tokens).await).map_err(reject)?;
    let holdings = soft("holdings", broker.holdings(&tokens).await).map_err(reject)?;
    let limits = soft("limits", broker.limits(&tokens).await).map_err(reject)?;
    let mut orders = soft("order book", broker.order_book(&tokens).await).map_err(reject)?;
    let total_orders = orders.len();
    orders.truncate(RECENT_ORDERS);

    Ok(warp::reply::json(&json!({
        "success": true,
        "data": {
            "user": caller.user,
            "positions": positions,
            "holdings": holdings,
            "limits": limits,
            "recent_orders": orders,
            "summary": {
                "total_positions": positions.len(),
                "total_holdings": holdings.len(),
                "total_orders": total_orders,
            },
        },
    })))
}

async fn positions_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let positions: Vec<Value> =
        soft("positions", state.broker.positions(&tokens(&caller.session)).await).map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "total_positions": positions.len(),
        "positions": positions,
    })))
}

async fn holdings_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    let holdings: Vec<Value> =
        soft("holdings", state.broker.holdings(&tokens(&caller.session)).await).map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "success": true,
        "total_holdings": holdings.len(),
        "holdings": holdings,
    })))
}

async fn place_order_handler(
    caller: AuthUser,
    state: AppState,
    order: OrderRequest,
) -> Result<impl Reply, Rejection> {
    if order.trading_symbol.trim().is_empty() {
        return Err(reject(ApiError::BadRequest(
            "Missing required field: trading_symbol".to_string(),
        )));
    }
    if matches!(order.quantity, Some(q) if q <= 0) {
        return Err(reject(ApiError::BadRequest(
            "Quantity must be positive".to_string(),
        )));
    }
    let order = order.normalize().map_err(reject)?;
    let data = state
        .broker
        .place_order(&tokens(&caller.session), &order)
        .await
        .map_err(reject)?;
    info!(
        "{} placed {} {} x{}",
        caller.user.ucc, order.transaction_type, order.trading_symbol, order.quantity
    );
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Order placed successfully",
        "data": data,
    })))
}

async fn modify_order_handler(
    caller: AuthUser,
    state: AppState,
    order: ModifyOrderRequest,
) -> Result<impl Reply, Rejection> {
    let data = state
        .broker
        .modify_order(&tokens(&caller.session), &order)
        .await
        .map_err(reject)?;
    info!("{} modified order {}", caller.user.ucc, order.order_id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Order modified successfully",
        "data": data,
    })))
}

async fn cancel_order_handler(
    caller: AuthUser,
    state: AppState,
    order: CancelOrderRequest,
) -> Result<impl Reply, Rejection> {
    let data = state
        .broker
        .cancel_order(&tokens(&caller.session), &order)
        .await
        .map_err(reject)?;
    info!("{} cancelled order {}", caller.user.ucc, order.order_id);
    Ok(warp::reply::json(&json!({
        "success": true,
        "message": "Order cancelled successfully",
        "data": data,
    })))
}

async fn admin_status_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&json!({
        "success": true,
        "ucc": caller.user.ucc,
        "is_admin": state.config.is_admin(&caller.user.ucc),
    })))
}

async fn admin_users_handler(caller: AuthUser, state: AppState) -> Result<impl Reply, Rejection> {
    require_admin(&state, &caller).map_err(reject)?;
    let users: Vec<User> = state
        .store
        .list_users()
        .await
        .map_err(reject)?
        .into_iter()
        .filter(|u| u.id != caller.user.id && u.is_active)
        .collect();
    Ok(warp::reply::json(&json!({
        "success": true,
        "count": users.len(),
        "users": users,
    })))
}
