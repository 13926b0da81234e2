// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `/v1/deployments` routes.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use futures::Stream;
use tracing::debug;

use super::auth::Caller;
use super::error::ApiJson;
use super::{AppState, ListQuery, SubmitQuery};
use crate::error::Result;
use crate::services::Accepted;
use crate::services::deployments::{
    self, CiConfig, DeploymentCommand, DeploymentCreate, DeploymentRead, DeploymentUpdate,
    LogSource,
};

/// Log lines fetched per workload and poll.
const LOG_TAIL: usize = 100;

/// Interval between log polls.
const LOG_POLL: Duration = Duration::from_secs(2);

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/deployments", get(list).post(create))
        .route("/deployments/{id}", get(read).post(update).delete(delete))
        .route("/deployments/{id}/command", post(command))
        .route("/deployments/{id}/logs", get(logs))
        .route("/deployments/{id}/ciConfig", get(ci_config))
}

async fn list(
    Caller(ctx): Caller,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeploymentRead>>> {
    Ok(Json(deployments::list(&ctx, query.all, query.pagination()).await?))
}

async fn read(Caller(ctx): Caller, Path(id): Path<String>) -> Result<Json<DeploymentRead>> {
    Ok(Json(deployments::get(&ctx, &id).await?))
}

async fn create(
    Caller(ctx): Caller,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<DeploymentCreate>,
) -> Result<Json<Accepted>> {
    Ok(Json(deployments::create(&ctx, submit.job_id.as_deref(), req).await?))
}

async fn update(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<DeploymentUpdate>,
) -> Result<Json<Accepted>> {
    Ok(Json(deployments::update(&ctx, &id, submit.job_id.as_deref(), req).await?))
}

async fn delete(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
) -> Result<Json<Accepted>> {
    Ok(Json(deployments::delete(&ctx, &id, submit.job_id.as_deref()).await?))
}

async fn command(
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Query(submit): Query<SubmitQuery>,
    ApiJson(req): ApiJson<DeploymentCommand>,
) -> Result<Json<Accepted>> {
    Ok(Json(deployments::command(&ctx, &id, submit.job_id.as_deref(), req).await?))
}

async fn ci_config(Caller(ctx): Caller, Path(id): Path<String>) -> Result<Json<CiConfig>> {
    Ok(Json(deployments::ci_config(&ctx, &id).await?))
}

async fn logs(
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let source = deployments::log_source(&ctx, &id).await?;
    debug!(deployment_id = %id, workloads = source.workloads.len(), "Log stream opened");
    Ok(Sse::new(log_stream(source)).keep_alive(KeepAlive::default()))
}

/// Index in `current` of the first line not sent yet, given the lines sent
/// from the previous poll.
fn unsent_from(sent: &[String], current: &[String]) -> usize {
    let Some(last) = sent.last() else {
        return 0;
    };
    current
        .iter()
        .rposition(|line| line == last)
        .map_or(0, |i| i + 1)
}

/// Poll the workloads of `source` and emit every new line as `[workload] line`.
/// The stream ends when the workloads can no longer be read.
fn log_stream(source: LogSource) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    async_stream::stream! {
        let mut sent: HashMap<String, Vec<String>> = HashMap::new();
        let mut ticker = tokio::time::interval(LOG_POLL);
        loop {
            ticker.tick().await;
            for workload in &source.workloads {
                let lines = match source
                    .kube
                    .workload_logs(&source.namespace, workload, LOG_TAIL)
                    .await
                {
                    Ok(lines) => lines,
                    Err(e) => {
                        yield Ok(Event::default().event("error").data(e.to_string()));
                        return;
                    }
                };
                let previous = sent.entry(workload.clone()).or_default();
                let start = unsent_from(previous, &lines);
                for line in &lines[start..] {
                    yield Ok(Event::default().data(format!("[{workload}] {line}")));
                }
                *previous = lines;
            }
        }
    }
}
