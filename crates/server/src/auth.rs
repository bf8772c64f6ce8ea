// crates/server/src/auth.rs
//! Bearer-token extractors.
//!
//! `Authorization: Bearer <token>` and a bare `Authorization: <token>` are
//! both accepted. SSE clients (EventSource) cannot set headers, so the stream
//! endpoint also takes `?token=`.

use std::sync::Arc;

use axum::extract::{FromRequestParts, Query};
use axum::http::{header::AUTHORIZATION, request::Parts};
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Guard for routes that require the API token in the `Authorization` header.
pub struct RequireToken;

/// Like `RequireToken`, but also accepts a `token` query parameter.
pub struct StreamToken;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn header_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    Some(value.strip_prefix("Bearer ").unwrap_or(value).trim())
}

fn token_matches(presented: Option<&str>, expected: &str) -> bool {
    presented.is_some_and(|token| !token.is_empty() && token == expected)
}

impl FromRequestParts<Arc<AppState>> for RequireToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        if token_matches(header_token(parts), &state.api_token) {
            Ok(Self)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}

impl FromRequestParts<Arc<AppState>> for StreamToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        if token_matches(header_token(parts), &state.api_token) {
            return Ok(Self);
        }
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri).ok();
        let token = query.as_ref().and_then(|q| q.token.as_deref());
        if token_matches(token, &state.api_token) {
            Ok(Self)
        } else {
            Err(ApiError::Unauthorized)
        }
    }
}
