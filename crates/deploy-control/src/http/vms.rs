// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `/v1/vms` routes.

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query};
use axum::routing::{get, post};

use super::auth::Caller;
use super::error::ApiJson;
use super::{AppState, ListQuery, SubmitQuery};
use crate::error::Result;
use crate::services::Accepted;
use crate::services::gpus::{self, GpuRead};
use crate::services::vms::{self, VmCommand, VmCreate, VmRead, VmUpdate};

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/vms", get(list).post(create))
        .route("/vms/gpus", get(list_gpus))
        .route("/vms/{id}", get(read).post(update).delete(delete))
        .route("/vms/{id}/command", post(command))
}

async fn list(Caller(ctx): Caller, Query(query): Query<ListQuery>) -> Result<Json<Vec<VmRead>>> {
    Ok(Json(vms::list(&ctx, query.all, query.pagination()).await?))
}

async fn read(Caller(ctx): Caller, Path(id): Path<String>) -> Result<Json<VmRead>> {
    Ok(Json(vms::get(&ctx, &id).await?))
}

async fn create(
    Caller(ctx): Caller,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<VmCreate>,
) -> Result<Json<Accepted>> {
    Ok(Json(vms::create(&ctx, submit.job_id.as_deref(), req).await?))
}

async fn update(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<VmUpdate>,
) -> Result<Json<Accepted>> {
    Ok(Json(vms::update(&ctx, &id, submit.job_id.as_deref(), req).await?))
}

async fn delete(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
) -> Result<Json<Accepted>> {
    Ok(Json(vms::delete(&ctx, &id, submit.job_id.as_deref()).await?))
}

async fn command(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<VmCommand>,
) -> Result<Json<Accepted>> {
    Ok(Json(vms::command(&ctx, &id, submit.job_id.as_deref(), req).await?))
}

async fn list_gpus(Caller(ctx): Caller) -> Result<Json<Vec<GpuRead>>> {
    Ok(Json(gpus::list(&ctx).await?))
}
