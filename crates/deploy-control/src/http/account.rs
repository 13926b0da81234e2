// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-user routes: storage managers, notifications, owner transfers and
//! user records.

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::routing::get;

use deploy_core::model::Notification;

use super::auth::Caller;
use super::error::ApiJson;
use super::{AppState, SubmitQuery};
use crate::api::system::{self, UserRead};
use crate::error::Result;
use crate::services::migrations::{self, MigrationAccept, MigrationCreate, MigrationRead};
use crate::services::storage_managers::{self, StorageManagerCreate, StorageManagerRead};
use crate::services::{Accepted, notifications};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/storageManagers",
            get(list_storage_managers).post(create_storage_manager),
        )
        .route(
            "/storageManagers/{id}",
            get(read_storage_manager)
                .post(repair_storage_manager)
                .delete(delete_storage_manager),
        )
        .route("/notifications", get(list_notifications))
        .route(
            "/notifications/{id}",
            get(read_notification).delete(delete_notification),
        )
        .route(
            "/resourceMigrations",
            get(list_migrations).post(create_migration),
        )
        .route(
            "/resourceMigrations/{id}",
            get(read_migration)
                .post(accept_migration)
                .delete(delete_migration),
        )
        .route("/users", get(list_users))
        .route("/users/{id}", get(read_user))
}

async fn list_storage_managers(Caller(ctx): Caller) -> Result<Json<Vec<StorageManagerRead>>> {
    Ok(Json(storage_managers::list(&ctx).await?))
}

async fn read_storage_manager(
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<StorageManagerRead>> {
    Ok(Json(storage_managers::get(&ctx, &id).await?))
}

async fn create_storage_manager(
    Caller(ctx): Caller,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<StorageManagerCreate>,
) -> Result<Json<Accepted>> {
    let accepted = storage_managers::create(&ctx, submit.job_id.as_deref(), req).await?;
    Ok(Json(accepted))
}

async fn repair_storage_manager(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
) -> Result<Json<Accepted>> {
    let accepted = storage_managers::repair(&ctx, &id, submit.job_id.as_deref()).await?;
    Ok(Json(accepted))
}

async fn delete_storage_manager(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
) -> Result<Json<Accepted>> {
    let accepted = storage_managers::delete(&ctx, &id, submit.job_id.as_deref()).await?;
    Ok(Json(accepted))
}

async fn list_notifications(Caller(ctx): Caller) -> Result<Json<Vec<Notification>>> {
    Ok(Json(notifications::list(&ctx).await?))
}

async fn read_notification(
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<Notification>> {
    Ok(Json(notifications::get(&ctx, &id).await?))
}

async fn delete_notification(Caller(ctx): Caller, Path(id): Path<String>) -> Result<StatusCode> {
    notifications::delete(&ctx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_migrations(Caller(ctx): Caller) -> Result<Json<Vec<MigrationRead>>> {
    Ok(Json(migrations::list(&ctx).await?))
}

async fn read_migration(
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<MigrationRead>> {
    Ok(Json(migrations::get(&ctx, &id).await?))
}

async fn create_migration(
    Caller(ctx): Caller,
    ApiJson(req): ApiJson<MigrationCreate>,
) -> Result<Json<Accepted>> {
    Ok(Json(migrations::create(&ctx, req).await?))
}

async fn accept_migration(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<MigrationAccept>,
) -> Result<Json<Accepted>> {
    Ok(Json(migrations::accept(&ctx, &id, req).await?))
}

async fn delete_migration(Caller(ctx): Caller, Path(id): Path<String>) -> Result<StatusCode> {
    migrations::delete(&ctx, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_users(Caller(ctx): Caller) -> Result<Json<Vec<UserRead>>> {
    Ok(Json(system::users(&ctx).await?))
}

async fn read_user(Caller(ctx): Caller, Path(id): Path<String>) -> Result<Json<UserRead>> {
    Ok(Json(system::user(&ctx, &id).await?))
}
