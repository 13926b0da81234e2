// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! API-key authentication.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use tracing::debug;

use super::AppState;
use crate::error::{Error, Result};
use crate::services::{Context, Principal};

/// Request context of the caller named by the `Authorization: Bearer <key>`
/// header.
pub struct Caller(pub Context);

/// Bearer token of `headers`.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| Error::Unauthorized("missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| Error::Unauthorized("invalid authorization header".to_string()))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| Error::Unauthorized("invalid authorization scheme".to_string()))
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(&parts.headers)?;
        let platform = &state.platform;
        let Some(user) = platform.user_by_api_key(token) else {
            debug!(path = %parts.uri.path(), "Unknown API key");
            return Err(Error::Unauthorized("invalid API key".to_string()));
        };
        let principal = Principal::from_user(user, &platform.config.roles);
        Ok(Self(Context::new(platform.clone(), principal)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers).unwrap_err().status_code(), 401);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer key-1"));
        assert_eq!(bearer_token(&headers).unwrap(), "key-1");
    }
}
