// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error responses and request body decoding.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::error::Error;

/// Message shown instead of the text of non-public errors.
const INTERNAL_MESSAGE: &str = "internal server error";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let message = if self.is_public() {
            self.to_string()
        } else {
            error!(code = self.error_code(), error = %self, "Request failed");
            INTERNAL_MESSAGE.to_string()
        };
        let body = Json(serde_json::json!({
            "error": message,
            "code": self.error_code(),
        }));
        (status, body).into_response()
    }
}

/// JSON request body whose decoding failures are reported as
/// [`Error::Validation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection_error(rejection)),
        }
    }
}

fn rejection_error(rejection: JsonRejection) -> Error {
    Error::Validation(rejection.body_text())
}
