// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Platform-wide reads: server status, zones, users and jobs.

use serde::Serialize;

use deploy_core::model::{JobFilter, JobRecord, JobStatus};

use crate::config::{Quotas, UserConfig};
use crate::error::{Error, Result};
use crate::jobs::executor;
use crate::services::quotas::Usage;
use crate::services::{Context, Principal};
use crate::zones::ZoneInfo;

/// Alias for the caller in `GET /v1/users/{id}`.
pub const ME: &str = "me";

/// `GET /v1/status` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRead {
    /// Crate version.
    pub version: String,
    /// Milliseconds since start-up.
    pub uptime_ms: i64,
    /// Jobs waiting to run.
    pub pending_jobs: usize,
    /// Jobs being run.
    pub running_jobs: usize,
}

/// A configured user with effective quotas and current usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRead {
    /// User ID.
    pub id: String,
    /// Administrator flag.
    pub admin: bool,
    /// Role names.
    pub roles: Vec<String>,
    /// Contact address.
    pub email: String,
    /// Effective quotas.
    pub quotas: Quotas,
    /// Current usage.
    pub usage: Usage,
}

/// Server status.
pub async fn status(ctx: &Context) -> Result<StatusRead> {
    let platform = &ctx.platform;
    let count = |status| {
        let filter = JobFilter {
            status: Some(status),
            ..Default::default()
        };
        async move { platform.jobs.list(&filter, None).await.map(|jobs| jobs.len()) }
    };
    Ok(StatusRead {
        version: platform.version.clone(),
        uptime_ms: platform.uptime_ms(),
        pending_jobs: count(JobStatus::Pending).await?,
        running_jobs: count(JobStatus::Running).await?,
    })
}

/// Configured zones.
pub fn zones(ctx: &Context) -> Vec<ZoneInfo> {
    ctx.platform.zones.iter().map(|z| z.info()).collect()
}

async fn user_read(ctx: &Context, user: &UserConfig) -> Result<UserRead> {
    let principal = Principal::from_user(user, &ctx.platform.config.roles);
    Ok(UserRead {
        id: user.id.clone(),
        admin: user.admin,
        roles: principal.roles.iter().map(|r| r.name.clone()).collect(),
        email: user.email.clone(),
        quotas: principal.quotas(),
        usage: Usage::of(&ctx.platform, &user.id, None).await?,
    })
}

/// User `id`; [`ME`] is the caller. Other users are visible to admins only.
pub async fn user(ctx: &Context, id: &str) -> Result<UserRead> {
    let id = if id == ME {
        ctx.principal.user_id.as_str()
    } else {
        id
    };
    let user = ctx
        .platform
        .user(id)
        .filter(|_| ctx.principal.can_access(id))
        .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
    user_read(ctx, user).await
}

/// Every configured user for admins, the caller otherwise.
pub async fn users(ctx: &Context) -> Result<Vec<UserRead>> {
    let mut out = Vec::new();
    for user in &ctx.platform.config.users {
        if ctx.principal.admin || user.id == ctx.principal.user_id {
            out.push(user_read(ctx, user).await?);
        }
    }
    Ok(out)
}

/// Job `id`, visible to its submitter and to admins.
pub async fn job(ctx: &Context, id: &str) -> Result<JobRecord> {
    let job = ctx.platform.jobs.get(id).await?;
    if !ctx.principal.can_access(&job.user_id) {
        return Err(Error::NotFound(format!("job {id}")));
    }
    Ok(job)
}

/// Cancel pending job `id`. Administrators only.
pub async fn terminate_job(ctx: &Context, id: &str) -> Result<JobRecord> {
    if !ctx.principal.admin {
        return Err(Error::Forbidden("only administrators terminate jobs".to_string()));
    }
    let reason = format!("terminated by {}", ctx.principal.user_id);
    let record = ctx.platform.jobs.terminate(id, &reason).await?;
    executor::release_terminated(&ctx.platform, &record).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    use deploy_core::Activity;

    use crate::jobs::Job;
    use crate::testing;

    #[tokio::test]
    async fn test_users_visible_to_self_and_admins() {
        let (platform, _) = testing::platform().await;
        let ctx = testing::context(&platform, "u-1");
        assert_eq!(user(&ctx, ME).await.unwrap().id, "u-1");
        assert_eq!(user(&ctx, ME).await.unwrap().quotas.deployments, 5);
        assert_eq!(user(&ctx, "u-2").await.unwrap_err().status_code(), 404);
        assert_eq!(users(&ctx).await.unwrap().len(), 1);

        let admin = testing::context(&platform, "admin");
        assert_eq!(user(&admin, "u-2").await.unwrap().id, "u-2");
        assert_eq!(users(&admin).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_jobs_visible_to_submitter() {
        let (platform, _) = testing::platform().await;
        let job = Job::RepairDeployment { id: "d-1".into() };
        platform.jobs.submit(Some("j-1"), "u-1", &job).await.unwrap();

        let owner = testing::context(&platform, "u-1");
        assert_eq!(self::job(&owner, "j-1").await.unwrap().id, "j-1");
        let other = testing::context(&platform, "u-2");
        assert_eq!(self::job(&other, "j-1").await.unwrap_err().status_code(), 404);
        assert_eq!(status(&owner).await.unwrap().pending_jobs, 1);
    }

    #[tokio::test]
    async fn test_terminate_requires_admin() {
        let (platform, _) = testing::platform().await;
        let job = Job::RepairDeployment { id: "d-1".into() };
        platform.jobs.submit(Some("j-1"), "u-1", &job).await.unwrap();

        let owner = testing::context(&platform, "u-1");
        assert_eq!(terminate_job(&owner, "j-1").await.unwrap_err().status_code(), 403);

        let admin = testing::context(&platform, "admin");
        let record = terminate_job(&admin, "j-1").await.unwrap();
        assert_eq!(record.status, JobStatus::Terminated);
        assert_eq!(terminate_job(&admin, "j-1").await.unwrap_err().status_code(), 409);
    }

    #[tokio::test]
    async fn test_terminate_releases_activity() {
        let (platform, _) = testing::platform().await;
        let d = testing::deployment("d-1", "a1", "u-1");
        platform.deployments.create(&d).await.unwrap();
        platform
            .deployments
            .add_activity("d-1", Activity::Restarting)
            .await
            .unwrap();
        let job = Job::RestartDeployment { id: "d-1".into() };
        platform.jobs.submit(Some("j-1"), "u-1", &job).await.unwrap();

        let admin = testing::context(&platform, "admin");
        terminate_job(&admin, "j-1").await.unwrap();
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(d.activities.is_empty());
    }
}
