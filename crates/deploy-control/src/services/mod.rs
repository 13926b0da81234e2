// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command API.
//!
//! Each public function validates a request against the caller's roles and
//! quotas, starts the matching activity on the resource and submits a job.
//! Nothing here talks to a provider; that is the job handlers' business.
//!
//! | Module | Commands |
//! |--------|----------|
//! | [`deployments`] | create, update, delete, restart, repair, logs, CI config |
//! | [`vms`] | create, update, delete, power actions, snapshots |
//! | [`gpus`] | list, attach, detach, inventory sync |
//! | [`storage_managers`] | create, delete |
//! | [`migrations`] | owner transfers |
//! | [`notifications`] | list, delete |

use serde::Serialize;
use tracing::warn;

use deploy_core::model::ResourceSpec;
use deploy_core::persistence::ResourceStore;
use deploy_core::{Activity, ActivityOutcome};

use crate::error::{Error, Result};
use crate::jobs::Job;

pub mod context;
pub mod deployments;
pub mod gpus;
pub mod migrations;
pub mod notifications;
pub mod quotas;
pub mod storage_managers;
pub mod vms;

pub use context::{Context, Principal};

/// Response of every write command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    /// Resource ID.
    pub id: String,
    /// Job to poll; absent when nothing had to be done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Start `activity` on `id` or fail with [`Error::ActivityBlocked`].
pub(crate) async fn begin<S: ResourceSpec>(
    store: &ResourceStore<S>,
    id: &str,
    activity: Activity,
) -> Result<()> {
    match store.add_activity(id, activity).await? {
        ActivityOutcome::Started => Ok(()),
        ActivityOutcome::Blocked(by) => Err(Error::ActivityBlocked(by)),
    }
}

/// Submit `job` for a resource whose activity was just started. The activity
/// is rolled back when the submission fails.
pub(crate) async fn submit_started<S: ResourceSpec>(
    ctx: &Context,
    store: &ResourceStore<S>,
    job_id: Option<&str>,
    job: &Job,
) -> Result<Accepted> {
    let (_, id) = job
        .resource()
        .ok_or_else(|| Error::Internal(format!("{} has no resource", job.job_type())))?;
    let id = id.to_string();
    let submitted = match ctx
        .platform
        .jobs
        .submit(job_id, &ctx.principal.user_id, job)
        .await
    {
        Ok(submitted) => submitted,
        Err(e) => {
            if let Some(activity) = job.clears() {
                if let Err(rollback) = store.remove_activity(&id, activity).await {
                    warn!(
                        resource_id = %id,
                        %activity,
                        error = %rollback,
                        "Failed to roll back activity"
                    );
                }
            }
            return Err(e);
        }
    };
    ctx.forget(&id);
    Ok(Accepted {
        id,
        job_id: Some(submitted.job_id),
    })
}

/// The earlier submission with `job_id`, when the caller resubmits it.
pub(crate) async fn existing_submission(
    ctx: &Context,
    job_id: Option<&str>,
) -> Result<Option<Accepted>> {
    let Some(job_id) = job_id else {
        return Ok(None);
    };
    let Some(job) = ctx.platform.jobs.find(job_id).await? else {
        return Ok(None);
    };
    if job.user_id != ctx.principal.user_id {
        return Err(Error::Conflict(format!("job {job_id} already exists")));
    }
    Ok(Some(Accepted {
        id: job.resource_id.unwrap_or_default(),
        job_id: Some(job.id),
    }))
}

/// Validate a user-chosen resource name: an RFC 1035 label of 2 to 30
/// characters.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = (2..=30).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "name {name:?} must be 2-30 lowercase letters, digits or '-', starting with a letter"
        )))
    }
}

/// Validate a custom domain name.
pub fn validate_domain(domain: &str) -> Result<()> {
    let labels: Vec<&str> = domain.split('.').collect();
    let valid = domain.len() <= 253
        && labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty()
                && l.len() <= 63
                && !l.starts_with('-')
                && !l.ends_with('-')
                && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("{domain:?} is not a valid domain name")))
    }
}
