//! Bearer token extraction.
//!
//! With `AUTH_SECRET` set every request must carry it as a bearer token.
//! Without it the server runs open, which is meant for local development.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" when auth is off
    #[allow(dead_code)]
    pub token: String,
}

impl AuthUser {
    /// Check an `Authorization` header value against the configured secret.
    pub fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<Self, AppError> {
        let token = match header {
            Some(header) => header
                .strip_prefix("Bearer ")
                .ok_or(AppError::Unauthorized("Invalid authorization header format"))?,
            None if secret.is_none() => {
                return Ok(AuthUser {
                    token: "anonymous".to_string(),
                })
            }
            None => return Err(AppError::Unauthorized("Missing authorization header")),
        };

        if token.is_empty() {
            return Err(AppError::Unauthorized("Empty bearer token"));
        }
        if let Some(secret) = secret {
            if token != secret {
                return Err(AppError::Unauthorized("Invalid bearer token"));
            }
        }

        Ok(AuthUser {
            token: token.to_string(),
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        AuthUser::authenticate(header, state.config.auth_secret.as_deref())
    }
}
