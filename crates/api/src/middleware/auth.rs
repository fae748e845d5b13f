//! JWT credential validation.
//!
//! Tokens are minted elsewhere; this service only validates them. `encode_jwt`
//! exists for tests and operators.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use beacon_common::error::AppError;

use crate::state::AppState;

/// JWT claims stored in the token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the user's id
    pub sub: String,
    /// Expiration time (UNIX timestamp)
    pub exp: i64,
    /// Issued at (UNIX timestamp)
    pub iat: i64,
}

/// Who is behind a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    User(i64),
    Anonymous,
}

/// Authenticated user extracted from the `Authorization: Bearer` header.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub claims: Claims,
}

/// Encode a JWT token for a user.
pub fn encode_jwt(user_id: i64, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let exp = now + Duration::hours(expiry_hours as i64);

    let claims = Claims {
        sub: user_id.to_string(),
        exp: exp.timestamp(),
        iat: now.timestamp(),
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))?;

    Ok(token)
}

/// Decode and validate a JWT token.
pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

fn user_id_from(claims: &Claims) -> Result<i64, AppError> {
    claims
        .sub
        .parse()
        .map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))
}

/// Map an optional raw token to an identity. Anything that does not validate
/// is anonymous.
pub fn resolve_identity(token: Option<&str>, secret: &str) -> Identity {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Identity::Anonymous;
    };

    match decode_jwt(token, secret).and_then(|claims| user_id_from(&claims)) {
        Ok(user_id) => Identity::User(user_id),
        Err(e) => {
            tracing::debug!(error = %e, "Rejected credential");
            Identity::Anonymous
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.strip_prefix("Bearer "))
            .ok_or_else(|| {
                AppError::Auth(
                    "Missing or invalid Authorization header. Use 'Bearer <JWT>'".to_string(),
                )
            })?;

        let claims = decode_jwt(token, &state.config.jwt_secret)?;
        let user_id = user_id_from(&claims)?;
        Ok(AuthUser { user_id, claims })
    }
}
