//! Caller identity.
//!
//! Sessions are issued by the external auth module; this service only
//! resolves `Authorization: Bearer <token>` against the `sessions` table. A
//! user id is never read from request bodies.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub id: Uuid,
}

/// Bearer token from the `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Resolve a session token to its user. Unknown or expired tokens yield `None`.
pub async fn authenticated_user(
    db: &SqlitePool,
    token: Option<&str>,
) -> Result<Option<AuthUser>, sqlx::Error> {
    let Some(token) = token else {
        return Ok(None);
    };
    let row: Option<(Uuid, Option<DateTime<Utc>>)> =
        sqlx::query_as("SELECT user_id, expires_at FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(db)
            .await?;

    Ok(row.and_then(|(id, expires_at)| match expires_at {
        Some(at) if at <= Utc::now() => None,
        _ => Some(AuthUser { id }),
    }))
}

/// The authenticated caller, or `None` for anonymous requests.
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub Option<AuthUser>);

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers);
        let user = authenticated_user(&state.db, token).await.map_err(|err| {
            tracing::warn!(error = %err, "session lookup failed");
            AppError::internal("Failed to verify session.")
        })?;
        Ok(Caller(user))
    }
}
