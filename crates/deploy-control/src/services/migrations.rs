// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource migrations: transferring a resource to another owner.
//!
//! A user creates a migration; the receiving user gets a notification with
//! a one-time code and accepts with it. Acceptance submits the owner-update
//! job, which closes the migration when it finishes. Administrators skip the
//! code exchange.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use deploy_core::Activity;
use deploy_core::model::{
    MigrationStatus, MigrationType, Notification, ResourceKind, ResourceMigration,
    UpdateOwnerParams,
};

use super::{Accepted, Context, begin, submit_started};
use crate::error::{Error, Result};
use crate::jobs::Job;

const CODE_LENGTH: usize = 8;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Notification type carrying a migration code.
pub const NOTIFICATION_TYPE: &str = "resourceTransfer";

/// `POST /v1/resourceMigrations` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationCreate {
    /// Resource to transfer.
    pub resource_id: String,
    /// Kind of the resource.
    pub resource_type: ResourceKind,
    /// Receiving user.
    pub new_owner_id: String,
}

/// `POST /v1/resourceMigrations/{id}` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MigrationAccept {
    /// Code from the notification; administrators may omit it.
    #[serde(default)]
    pub code: Option<String>,
}

/// A migration as returned by the API. The code is never returned.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRead {
    /// ID.
    pub id: String,
    /// Migrated resource.
    pub resource_id: String,
    /// Kind of the resource.
    pub resource_type: ResourceKind,
    /// Migration type.
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    /// Creator.
    pub user_id: String,
    /// Status.
    pub status: MigrationStatus,
    /// Transfer parameters.
    pub update_owner: UpdateOwnerParams,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<ResourceMigration> for MigrationRead {
    fn from(m: ResourceMigration) -> Self {
        Self {
            id: m.id,
            resource_id: m.resource_id,
            resource_type: m.resource_type,
            migration_type: m.migration_type,
            user_id: m.user_id,
            status: m.status,
            update_owner: m.update_owner,
            created_at: m.created_at,
        }
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn is_party(ctx: &Context, m: &ResourceMigration) -> bool {
    ctx.principal.admin
        || m.user_id == ctx.principal.user_id
        || m.update_owner.new_owner_id == ctx.principal.user_id
}

/// Migrations created by or addressed to the caller; all of them for
/// administrators.
pub async fn list(ctx: &Context) -> Result<Vec<MigrationRead>> {
    let user = (!ctx.principal.admin).then_some(ctx.principal.user_id.as_str());
    Ok(ctx
        .platform
        .persistence
        .list_migrations(user)
        .await?
        .into_iter()
        .map(MigrationRead::from)
        .collect())
}

async fn load(ctx: &Context, id: &str) -> Result<ResourceMigration> {
    ctx.platform
        .persistence
        .get_migration(id)
        .await?
        .filter(|m| is_party(ctx, m))
        .ok_or_else(|| Error::NotFound(format!("resource migration {id}")))
}

/// Migration `id`.
pub async fn get(ctx: &Context, id: &str) -> Result<MigrationRead> {
    Ok(load(ctx, id).await?.into())
}

/// Start transferring a resource. Administrators' migrations are accepted
/// at once; everyone else's wait for the receiving user.
pub async fn create(ctx: &Context, req: MigrationCreate) -> Result<Accepted> {
    let platform = &ctx.platform;
    let old_owner_id = match req.resource_type {
        ResourceKind::Deployment => ctx.deployment(&req.resource_id).await?.owner_id,
        ResourceKind::Vm => ctx.vm(&req.resource_id).await?.owner_id,
        ResourceKind::StorageManager => {
            return Err(Error::Validation(
                "storage managers cannot change owner".to_string(),
            ));
        }
    };
    if platform.user(&req.new_owner_id).is_none() {
        return Err(Error::NotFound(format!("user {}", req.new_owner_id)));
    }
    if req.new_owner_id == old_owner_id {
        return Err(Error::Validation(format!(
            "{} already owns {}",
            req.new_owner_id, req.resource_id
        )));
    }
    if platform
        .persistence
        .get_migration_by_resource(&req.resource_id)
        .await?
        .is_some()
    {
        return Err(Error::Conflict(format!(
            "{} already has a migration",
            req.resource_id
        )));
    }

    let admin = ctx.principal.admin;
    let migration = ResourceMigration {
        id: Uuid::new_v4().to_string(),
        resource_id: req.resource_id,
        resource_type: req.resource_type,
        migration_type: MigrationType::UpdateOwner,
        user_id: ctx.principal.user_id.clone(),
        status: if admin {
            MigrationStatus::Accepted
        } else {
            MigrationStatus::Pending
        },
        code: (!admin).then(generate_code),
        update_owner: UpdateOwnerParams {
            new_owner_id: req.new_owner_id,
            old_owner_id,
        },
        created_at: Utc::now(),
        deleted_at: None,
    };

    platform.persistence.insert_migration(&migration).await?;
    if admin {
        if let Err(e) = begin_transfer(ctx, &migration).await {
            platform
                .persistence
                .delete_migration(&migration.id, Utc::now())
                .await?;
            return Err(e);
        }
        info!(
            migration_id = %migration.id,
            resource_id = %migration.resource_id,
            "Resource migration accepted"
        );
        return submit_transfer(ctx, &migration).await;
    }

    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        user_id: migration.update_owner.new_owner_id.clone(),
        notification_type: NOTIFICATION_TYPE.to_string(),
        content: json!({
            "migrationId": migration.id,
            "resourceId": migration.resource_id,
            "resourceType": migration.resource_type,
            "fromUserId": migration.user_id,
            "code": migration.code,
        }),
        created_at: Utc::now(),
        read_at: None,
    };
    platform.persistence.insert_notification(&notification).await?;
    info!(
        migration_id = %migration.id,
        resource_id = %migration.resource_id,
        new_owner_id = %migration.update_owner.new_owner_id,
        "Resource migration created"
    );
    Ok(Accepted {
        id: migration.id,
        job_id: None,
    })
}

/// Accept migration `id`. Only the receiving user (with the code) or an
/// administrator may accept.
pub async fn accept(ctx: &Context, id: &str, req: MigrationAccept) -> Result<Accepted> {
    let migration = load(ctx, id).await?;
    let principal = &ctx.principal;
    if !principal.admin {
        if migration.update_owner.new_owner_id != principal.user_id {
            return Err(Error::Forbidden(
                "only the receiving user can accept a migration".to_string(),
            ));
        }
        if req.code.is_none() || req.code != migration.code {
            return Err(Error::Forbidden("invalid migration code".to_string()));
        }
    }
    if migration.status != MigrationStatus::Pending {
        return Err(Error::Conflict(format!("migration {id} was already accepted")));
    }

    begin_transfer(ctx, &migration).await?;
    ctx.platform
        .persistence
        .set_migration_status(id, MigrationStatus::Accepted)
        .await?;
    info!(migration_id = %id, "Resource migration accepted");
    submit_transfer(ctx, &migration).await
}

/// Withdraw pending migration `id`.
pub async fn delete(ctx: &Context, id: &str) -> Result<()> {
    let migration = load(ctx, id).await?;
    if migration.status != MigrationStatus::Pending && !ctx.principal.admin {
        return Err(Error::Conflict(format!("migration {id} is in progress")));
    }
    ctx.platform
        .persistence
        .delete_migration(id, Utc::now())
        .await?;
    info!(migration_id = %id, "Resource migration deleted");
    Ok(())
}

async fn begin_transfer(ctx: &Context, m: &ResourceMigration) -> Result<()> {
    let platform = &ctx.platform;
    match m.resource_type {
        ResourceKind::Deployment => {
            begin(&platform.deployments, &m.resource_id, Activity::Updating).await
        }
        ResourceKind::Vm => begin(&platform.vms, &m.resource_id, Activity::Updating).await,
        ResourceKind::StorageManager => Err(Error::Internal(format!(
            "migration {} targets a storage manager",
            m.id
        ))),
    }
}

async fn submit_transfer(ctx: &Context, m: &ResourceMigration) -> Result<Accepted> {
    let platform = &ctx.platform;
    let id = m.resource_id.clone();
    let new_owner_id = m.update_owner.new_owner_id.clone();
    let migration_id = Some(m.id.clone());
    let accepted = match m.resource_type {
        ResourceKind::Deployment => {
            let job = Job::UpdateDeploymentOwner {
                id,
                new_owner_id,
                migration_id,
            };
            submit_started(ctx, &platform.deployments, None, &job).await?
        }
        ResourceKind::Vm => {
            let job = Job::UpdateVmOwner {
                id,
                new_owner_id,
                migration_id,
            };
            submit_started(ctx, &platform.vms, None, &job).await?
        }
        ResourceKind::StorageManager => {
            return Err(Error::Internal(format!(
                "migration {} targets a storage manager",
                m.id
            )));
        }
    };
    Ok(Accepted {
        id: m.id.clone(),
        job_id: accepted.job_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_use_unambiguous_alphabet() {
        let code = generate_code();
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert!(!code.contains('0') && !code.contains('O'));
    }

    #[test]
    fn test_read_hides_code() {
        let m = ResourceMigration {
            id: "m-1".to_string(),
            resource_id: "d-1".to_string(),
            resource_type: ResourceKind::Deployment,
            migration_type: MigrationType::UpdateOwner,
            user_id: "u-1".to_string(),
            status: MigrationStatus::Pending,
            code: Some("SECRET12".to_string()),
            update_owner: UpdateOwnerParams {
                new_owner_id: "u-2".to_string(),
                old_owner_id: "u-1".to_string(),
            },
            created_at: Utc::now(),
            deleted_at: None,
        };
        let json = serde_json::to_string(&MigrationRead::from(m)).unwrap();
        assert!(!json.contains("SECRET12"));
        assert!(json.contains("\"type\":\"updateOwner\""));
    }
}
