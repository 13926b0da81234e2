// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager commands. A user has at most one storage manager per zone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use deploy_core::Activity;
use deploy_core::model::{ResourceStatus, StorageManager, StorageManagerSpec};
use deploy_core::persistence::ResourceFilter;

use super::{Accepted, Context, begin, existing_submission, submit_started};
use crate::config::Capability;
use crate::error::{Error, Result};
use crate::generators::naming;
use crate::jobs::Job;
use crate::platform::Platform;

/// `POST /v1/storageManagers` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageManagerCreate {
    /// Zone; the first deployment zone with storage when omitted.
    #[serde(default)]
    pub zone: Option<String>,
}

/// Storage manager as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManagerRead {
    /// ID.
    pub id: String,
    /// Owner.
    pub owner_id: String,
    /// Zone.
    pub zone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// File browser URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// In-progress operations.
    pub activities: Vec<Activity>,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Status detail.
    pub status_message: String,
}

impl StorageManagerRead {
    /// API view of `sm`.
    pub fn new(platform: &Platform, sm: &StorageManager) -> Self {
        Self {
            id: sm.id.clone(),
            owner_id: sm.owner_id.clone(),
            zone: sm.zone.clone(),
            created_at: sm.created_at,
            url: platform
                .zones
                .get(&sm.zone)
                .map(|zone| format!("https://{}", zone.storage_host(&sm.owner_id))),
            activities: sm.activities.iter().copied().collect(),
            status: sm.status_code,
            status_message: sm.status_message.clone(),
        }
    }
}

/// Storage managers of the caller; everyone's for administrators.
pub async fn list(ctx: &Context) -> Result<Vec<StorageManagerRead>> {
    let filter = ResourceFilter {
        owner_ids: (!ctx.principal.admin).then(|| vec![ctx.principal.user_id.clone()]),
        ..Default::default()
    };
    Ok(ctx
        .platform
        .storage_managers
        .list(&filter, None)
        .await?
        .iter()
        .map(|sm| StorageManagerRead::new(&ctx.platform, sm))
        .collect())
}

/// Storage manager `id`.
pub async fn get(ctx: &Context, id: &str) -> Result<StorageManagerRead> {
    let sm = ctx.storage_manager(id).await?;
    Ok(StorageManagerRead::new(&ctx.platform, &sm))
}

/// Create the caller's storage manager in a zone.
pub async fn create(
    ctx: &Context,
    job_id: Option<&str>,
    req: StorageManagerCreate,
) -> Result<Accepted> {
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    let platform = &ctx.platform;
    let zone = match &req.zone {
        Some(name) => platform.zone(name, Capability::Deployment)?,
        None => platform
            .zones
            .iter()
            .find(|z| z.has(Capability::Deployment) && z.storage.is_some())
            .ok_or_else(|| Error::Validation("no zone offers storage".to_string()))?,
    };
    if zone.storage.is_none() {
        return Err(Error::Validation(format!("zone {} has no storage", zone.name)));
    }

    let owner_id = &ctx.principal.user_id;
    let filter = ResourceFilter {
        owner_ids: Some(vec![owner_id.clone()]),
        zone: Some(zone.name.clone()),
        ..Default::default()
    };
    if !platform.storage_managers.list(&filter, None).await?.is_empty() {
        return Err(Error::Conflict(format!(
            "{owner_id} already has a storage manager in zone {}",
            zone.name
        )));
    }

    let id = Uuid::new_v4().to_string();
    let sm = StorageManager::new(
        id.clone(),
        naming::storage_manager_name(owner_id),
        owner_id.clone(),
        zone.name.clone(),
        StorageManagerSpec::default(),
    );
    platform.storage_managers.create(&sm).await?;
    info!(storage_manager_id = %id, zone = %sm.zone, "Storage manager created");
    submit_started(ctx, &platform.storage_managers, job_id, &Job::CreateSm { id }).await
}

/// Delete storage manager `id`.
pub async fn delete(ctx: &Context, id: &str, job_id: Option<&str>) -> Result<Accepted> {
    let platform = &ctx.platform;
    ctx.storage_manager(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    begin(&platform.storage_managers, id, Activity::BeingDeleted).await?;
    platform
        .storage_managers
        .set_status(id, ResourceStatus::ResourceBeingDeleted, "Resource is being deleted")
        .await?;
    let job = Job::DeleteSm { id: id.to_string() };
    submit_started(ctx, &platform.storage_managers, job_id, &job).await
}

/// Re-converge storage manager `id` now.
pub async fn repair(ctx: &Context, id: &str, job_id: Option<&str>) -> Result<Accepted> {
    let platform = &ctx.platform;
    ctx.storage_manager(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    begin(&platform.storage_managers, id, Activity::Repairing).await?;
    let job = Job::RepairSm { id: id.to_string() };
    submit_started(ctx, &platform.storage_managers, job_id, &job).await
}
