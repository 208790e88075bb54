//! Bearer-token auth: HS256 JWTs carrying the actor identity, plus the
//! argon2 password helpers the login handler and CLI bootstrap use.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::domain::{Actor, User};
use crate::error::{OpsdeckError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id
    sub: String,
    /// Display name recorded on audit events
    name: String,
    iat: i64,
    exp: i64,
}

pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration: Duration,
}

impl AuthKeys {
    pub fn new(secret: &str, expiration_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiration: Duration::seconds(expiration_secs as i64),
        }
    }

    /// Issue a token for the user; returns the token and its expiry.
    pub fn issue(&self, user: &User) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.expiration;
        let claims = Claims {
            sub: user.id.to_string(),
            name: user.username.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| OpsdeckError::Internal(format!("failed to sign token: {e}")))?;
        Ok((token, expires_at))
    }

    /// Verify a token and recover the actor identity.
    pub fn verify(&self, token: &str) -> Result<Actor> {
        let data = decode::<Claims>(token, &self.decoding, &Validation::default())
            .map_err(|e| OpsdeckError::Unauthorized(format!("invalid token: {e}")))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| OpsdeckError::Unauthorized("invalid token subject".to_string()))?;
        Ok(Actor {
            id,
            name: data.claims.name,
        })
    }
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| OpsdeckError::Internal(format!("failed to hash password: {e}")))
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.strip_prefix("Bearer ")
                .or_else(|| raw.strip_prefix("bearer "))
        })
        .map(str::trim)
}

/// Middleware guarding every route except `/health` and `/auth/login`.
/// The verified actor is made available to handlers as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let token = bearer_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;
    let actor = state.auth.verify(token).map_err(ApiError::from)?;
    request.extensions_mut().insert(actor);
    Ok(next.run(request).await)
}
