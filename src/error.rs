// src/error.rs
use log::error;
use serde_json::json;
use std::convert::Infallible;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reject::Reject;
use warp::{Rejection, Reply};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),
    #[error("could not encode or decode record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("request to broker failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("broker returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected broker payload: {0}")]
    Payload(String),
    #[error("broker session expired")]
    SessionExpired,
    #[error("Unsupported order type: {0}")]
    UnsupportedOrderType(String),
    #[error("no quote available for {0}")]
    NoQuote(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(StoreError),
    #[error("could not issue session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("{0}")]
    Unavailable(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => ApiError::Store(other),
        }
    }
}

impl From<crate::scheduler::SchedulerError> for ApiError {
    fn from(err: crate::scheduler::SchedulerError) -> Self {
        match err {
            crate::scheduler::SchedulerError::Store(e) => e.into(),
            stopped => ApiError::Unavailable(stopped.to_string()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Broker(BrokerError::SessionExpired) => StatusCode::UNAUTHORIZED,
            ApiError::Broker(BrokerError::UnsupportedOrderType(_)) => StatusCode::BAD_REQUEST,
            ApiError::Broker(_) => StatusCode::BAD_GATEWAY,
            ApiError::Store(_) | ApiError::Token(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl Reject for ApiError {}

pub fn reject(err: impl Into<ApiError>) -> Rejection {
    warp::reject::custom(err.into())
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(api) = err.find::<ApiError>() {
        if api.status().is_server_error() {
            error!("Request failed: {}", api);
        }
        (api.status(), api.to_string())
    } else if let Some(body) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", body))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else if err.find::<warp::reject::MissingHeader>().is_some() {
        (StatusCode::UNAUTHORIZED, ApiError::Unauthorized.to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "success": false, "message": message })),
        status,
    ))
}
