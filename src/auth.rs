// src/auth.rs
use crate::db::Store;
use crate::error::{reject, ApiError};
use crate::models::{User, UserSession};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use warp::{Filter, Rejection};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub sid: String,
    pub exp: usize,
}

/// The caller of an authenticated route.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub session: UserSession,
}

pub fn create_token(session: &UserSession, secret: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: session.user_id.to_string(),
        sid: session.id.to_string(),
        exp: session.expires_at.timestamp().max(0) as usize,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?)
}

pub fn verify_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        debug!("Rejected token: {}", e);
        ApiError::Unauthorized
    })
}

async fn authorize(
    header: String,
    store: Store,
    secret: Arc<String>,
    now: DateTime<Utc>,
) -> Result<AuthUser, ApiError> {
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?
        .trim();
    let claims = verify_token(token, &secret)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| ApiError::Unauthorized)?;
    let session_id = Uuid::parse_str(&claims.sid).map_err(|_| ApiError::Unauthorized)?;

    let session = store
        .get_session(session_id)
        .await?
        .filter(|s| s.user_id == user_id && s.is_valid_at(now))
        .ok_or(ApiError::Unauthorized)?;
    let user = store
        .get_user(user_id)
        .await?
        .filter(|u| u.is_active)
        .ok_or(ApiError::Unauthorized)?;
    Ok(AuthUser { user, session })
}

/// Resolves the bearer token to an active user and session.
pub fn with_auth(
    store: Store,
    secret: Arc<String>,
) -> impl Filter<Extract = (AuthUser,), Error = Rejection> + Clone {
    warp::header::<String>("authorization").and_then(move |header: String| {
        let store = store.clone();
        let secret = secret.clone();
        async move {
            authorize(header, store, secret, Utc::now())
                .await
                .map_err(reject)
        }
    })
}
