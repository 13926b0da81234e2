// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface.
//!
//! Every route below `/v1` requires an `Authorization: Bearer <api key>`
//! header naming a user from the platform file. Write routes accept an
//! optional `jobId` query parameter; resubmitting with the same value returns
//! the first submission. Errors are returned as `{"error", "code"}` with the
//! status of [`Error::status_code`](crate::error::Error::status_code).
//!
//! | Routes | Module |
//! |--------|--------|
//! | `/v1/deployments...` | `deployments` |
//! | `/v1/vms...` | `vms` |
//! | `/v1/storageManagers`, `/v1/notifications` | `account` |
//! | `/v1/resourceMigrations`, `/v1/users` | `account` |
//! | `/v1/status`, `/v1/zones`, `/v1/jobs/{id}`, `/v1/hooks/...` | `system` |

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use deploy_core::model::Pagination;

use crate::platform::Platform;

mod account;
pub mod auth;
mod deployments;
pub mod error;
mod system;
mod vms;

pub use auth::Caller;
pub use error::ApiJson;

/// Default page size when only `page` is given.
const DEFAULT_PAGE_SIZE: u32 = 50;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Platform state.
    pub platform: Arc<Platform>,
}

/// Query of list routes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListQuery {
    /// Admins only: include every user's resources.
    #[serde(default)]
    pub all: bool,
    /// Zero-based page.
    #[serde(default)]
    pub page: Option<u32>,
    /// Page size.
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl ListQuery {
    pub(crate) fn pagination(&self) -> Option<Pagination> {
        if self.page.is_none() && self.page_size.is_none() {
            return None;
        }
        Some(Pagination {
            page: self.page.unwrap_or(0),
            page_size: self.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1),
        })
    }
}

/// Query of write routes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubmitQuery {
    /// Caller-chosen job ID.
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Build the router.
pub fn router(platform: Arc<Platform>) -> Router {
    let v1 = Router::new()
        .merge(deployments::router())
        .merge(vms::router())
        .merge(account::router())
        .merge(system::router());
    Router::new()
        .nest("/v1", v1)
        .merge(system::hooks())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { platform })
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("HTTP server stopped");
    Ok(())
}
