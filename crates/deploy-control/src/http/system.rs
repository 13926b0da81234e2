// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status, zones, jobs and webhook routes.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;

use deploy_core::model::{JobRecord, JobStatus};

use super::AppState;
use super::auth::Caller;
use super::error::ApiJson;
use crate::api::system::{self, StatusRead};
use crate::api::webhooks::{self, GithubDelivery, HookOutcome};
use crate::error::{Error, Result};
use crate::generators::github::GITHUB_HOOK_PATH;
use crate::generators::harbor::HARBOR_HOOK_PATH;
use crate::zones::ZoneInfo;

/// `POST /v1/jobs/{id}` body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JobUpdate {
    status: JobStatus,
}

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/zones", get(zones))
        .route("/jobs/{id}", get(read_job).post(update_job))
}

/// Webhook routes; they authenticate themselves and take no API key.
pub(super) fn hooks() -> Router<AppState> {
    Router::new()
        .route(GITHUB_HOOK_PATH, post(github_hook))
        .route(HARBOR_HOOK_PATH, post(harbor_hook))
}

async fn status(Caller(ctx): Caller) -> Result<Json<StatusRead>> {
    Ok(Json(system::status(&ctx).await?))
}

async fn zones(Caller(ctx): Caller) -> Json<Vec<ZoneInfo>> {
    Json(system::zones(&ctx))
}

async fn read_job(Caller(ctx): Caller, Path(id): Path<String>) -> Result<Json<JobRecord>> {
    Ok(Json(system::job(&ctx, &id).await?))
}

async fn update_job(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<JobUpdate>,
) -> Result<Json<JobRecord>> {
    if req.status != JobStatus::Terminated {
        return Err(Error::Validation(format!(
            "jobs can only be moved to {}",
            JobStatus::Terminated
        )));
    }
    Ok(Json(system::terminate_job(&ctx, &id).await?))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn hook_response(outcome: HookOutcome) -> Response {
    match outcome {
        HookOutcome::Ignored => StatusCode::NO_CONTENT.into_response(),
        HookOutcome::Queued {
            job_id,
            deployment_ids,
        } => Json(serde_json::json!({ "jobId": job_id, "ids": deployment_ids })).into_response(),
    }
}

async fn github_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let delivery = GithubDelivery {
        event: header(&headers, "x-github-event"),
        hook_id: header(&headers, "x-github-hook-id"),
        signature: header(&headers, "x-hub-signature-256"),
        body: &body,
    };
    let outcome = webhooks::github_push(&state.platform, delivery).await?;
    Ok(hook_response(outcome))
}

async fn harbor_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let authorization = header(&headers, AUTHORIZATION.as_str());
    let outcome = webhooks::harbor_push(&state.platform, authorization, &body).await?;
    Ok(hook_response(outcome))
}
