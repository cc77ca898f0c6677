//! Request identity for the REST surface.
//!
//! Session-based authentication is an external collaborator: by the time a
//! request reaches this server the session layer has resolved the account
//! and forwards it as an `X-User-Id` header. The extractor validates that
//! the id still resolves to a user record.

use axum::extract::FromRequestParts;
use axum::http::{request::Parts, StatusCode};

use crate::state::AppState;

/// The authenticated account behind a REST request.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.parse::<i64>().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        match state.store.get_user(user_id).await {
            Ok(Some(_)) => Ok(CurrentUser(user_id)),
            Ok(None) => Err(StatusCode::UNAUTHORIZED),
            Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}
