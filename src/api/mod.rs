// src/api/mod.rs
mod account;
mod portfolio;
mod quotes;
mod signals;

use crate::auth::{self, AuthUser};
use crate::broker::BrokerApi;
use crate::config::Config;
use crate::db::Store;
use crate::error::{handle_rejection, ApiError};
use crate::pnl::{PnlSnapshot, Priced};
use crate::prices::{PriceBook, ResolvedPrice};
use crate::scheduler::SchedulerHandle;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::{Filter, Rejection, Reply};

/// Everything a handler may need, cloned into each route.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub book: Arc<PriceBook>,
    pub broker: Arc<dyn BrokerApi>,
    pub scheduler: SchedulerHandle,
    pub config: Arc<Config>,
    pub secret: Arc<String>,
}

impl AppState {
    pub fn new(
        store: Store,
        book: Arc<PriceBook>,
        broker: Arc<dyn BrokerApi>,
        scheduler: SchedulerHandle,
        config: Config,
    ) -> Self {
        let secret = Arc::new(config.session_secret.clone());
        AppState {
            store,
            book,
            broker,
            scheduler,
            config: Arc::new(config),
            secret,
        }
    }
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    account::routes(state.clone())
        .or(signals::routes(state.clone()))
        .or(portfolio::routes(state.clone()))
        .or(quotes::routes(state))
        .recover(handle_rejection)
}

fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn with_auth(state: &AppState) -> impl Filter<Extract = (AuthUser,), Error = Rejection> + Clone {
    auth::with_auth(state.store.clone(), state.secret.clone())
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::BadRequest(format!("Missing required field: {}", field)))
}

fn require_admin(state: &AppState, caller: &AuthUser) -> Result<(), ApiError> {
    if state.config.is_admin(&caller.user.ucc) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Admin access required".to_string()))
    }
}

/// A record rendered with its derived P&L and, while open, the market price
/// it was valued at.
#[derive(Debug, Serialize)]
pub(crate) struct PricedView<T: Serialize> {
    #[serde(flatten)]
    pub record: T,
    pub pnl: PnlSnapshot,
    pub market: Option<ResolvedPrice>,
}

/// Values each open record at the current market price: price book, then
/// stored quote, then the record's own price.
async fn priced_views<T>(state: &AppState, records: Vec<T>) -> Result<Vec<PricedView<T>>, ApiError>
where
    T: Priced + Serialize,
{
    let mut symbols: Vec<String> = records.iter().map(|r| r.symbol().to_string()).collect();
    symbols.sort();
    symbols.dedup();
    let stored = if symbols.is_empty() {
        HashMap::new()
    } else {
        state.store.latest_quotes(&symbols).await?
    };

    let mut views = Vec::with_capacity(records.len());
    for record in records {
        if !record.is_active() {
            views.push(PricedView {
                pnl: record.pnl(),
                record,
                market: None,
            });
            continue;
        }
        let mut inputs = record.pnl_inputs();
        let fallback = if inputs.current_price > 0.0 {
            inputs.current_price
        } else {
            inputs.entry_price
        };
        let market = state
            .book
            .resolve(record.symbol(), stored.get(record.symbol()), fallback)
            .await;
        inputs.current_price = market.price;
        views.push(PricedView {
            pnl: inputs.snapshot(),
            record,
            market: Some(market),
        });
    }
    Ok(views)
}


#[cfg(test)]
mod tests {
    use super::testing::*;

    #[tokio::test]
    async fn unknown_paths_get_a_json_404() {
        let h = harness().await;
        let (status, body) = call(&h.state, "GET", "/nowhere", None, None).await;
        assert_eq!(status, 404);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let h = harness().await;
        let (status, body) = call(&h.state, "GET", "/api/deals/user", None, None).await;
        assert_eq!(status, 401);
        assert_eq!(body["message"], "Not authenticated");

        let (status, _) = call(&h.state, "GET", "/api/deals/user", Some("garbage"), None).await;
        assert_eq!(status, 401);
    }
}
