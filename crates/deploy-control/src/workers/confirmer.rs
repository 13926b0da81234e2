// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Confirms that creations and deletions reach their end state.
//!
//! - A resource stuck in `beingCreated` with no queued job gets its create
//!   job again once it is older than the grace period.
//! - A resource in `beingDeleted` with no queued job gets its delete job
//!   again, until delete has failed [`MAX_DELETE_ATTEMPTS`] times; then the
//!   record is removed and the objects left behind are logged for cleanup.
//! - A deleted resource with nothing left in any subsystem is removed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use deploy_core::Activity;
use deploy_core::model::{Document, ResourceSpec, ResourceStatus};
use deploy_core::persistence::{ResourceFilter, ResourceStore};

use super::{Worker, begin_and_submit};
use crate::error::Result;
use crate::jobs::Job;
use crate::platform::Platform;
use crate::reconcile::Remaining;
use crate::services::Principal;

/// Failed delete jobs after which a resource is removed regardless.
pub const MAX_DELETE_ATTEMPTS: usize = 3;

/// Age before a stalled creation is resubmitted.
const CREATE_GRACE: Duration = Duration::from_secs(60);

/// Jobs of one resource kind.
struct KindJobs {
    create: fn(String) -> Job,
    delete: fn(String) -> Job,
}

/// Drives stalled creations and deletions to completion.
pub struct Confirmer {
    platform: Arc<Platform>,
    interval: Duration,
    create_grace: Duration,
}

impl Confirmer {
    /// Create a confirmer with the configured interval.
    pub fn new(platform: Arc<Platform>) -> Self {
        let interval = platform.config.workers.confirm();
        Self {
            platform,
            interval,
            create_grace: CREATE_GRACE,
        }
    }

    /// Override the age before a stalled creation is resubmitted.
    pub fn with_create_grace(mut self, grace: Duration) -> Self {
        self.create_grace = grace;
        self
    }

    async fn confirm_kind<S>(&self, store: &ResourceStore<S>, jobs: KindJobs) -> Result<usize>
    where
        S: ResourceSpec,
        S::Subsystems: Remaining,
    {
        let mut done = 0;
        let filter = ResourceFilter {
            include_deleted: true,
            ..Default::default()
        };
        for doc in store.list(&filter, None).await? {
            if self.platform.jobs.has_live_job(&doc.id).await? {
                continue;
            }
            let acted = if doc.has_activity(Activity::BeingDeleted) {
                self.confirm_deletion(store, &doc, &jobs).await?
            } else if doc.deleted_at.is_some() {
                self.confirm_deleted(store, &doc, &jobs).await?
            } else if doc.has_activity(Activity::BeingCreated) {
                self.confirm_creation(&doc, &jobs).await?
            } else {
                false
            };
            if acted {
                done += 1;
            }
        }
        Ok(done)
    }

    async fn confirm_creation<S: ResourceSpec>(
        &self,
        doc: &Document<S>,
        jobs: &KindJobs,
    ) -> Result<bool> {
        let grace = chrono::Duration::from_std(self.create_grace).unwrap_or_default();
        if doc.created_at + grace > Utc::now() {
            return Ok(false);
        }
        let job = (jobs.create)(doc.id.clone());
        let user_id = Principal::system().user_id;
        self.platform.jobs.submit(None, &user_id, &job).await?;
        info!(resource_id = %doc.id, job_type = job.job_type(), "Stalled creation resubmitted");
        Ok(true)
    }

    async fn confirm_deletion<S>(
        &self,
        store: &ResourceStore<S>,
        doc: &Document<S>,
        jobs: &KindJobs,
    ) -> Result<bool>
    where
        S: ResourceSpec,
        S::Subsystems: Remaining,
    {
        let job = (jobs.delete)(doc.id.clone());
        let failed = self
            .platform
            .jobs
            .failed_attempts(&doc.id, job.job_type())
            .await?;
        if failed >= MAX_DELETE_ATTEMPTS {
            let remaining = doc.subsystems.remaining();
            warn!(
                resource_id = %doc.id,
                name = %doc.name,
                owner_id = %doc.owner_id,
                failed,
                remaining = ?remaining,
                "Deletion keeps failing, removing record; clean up remaining objects by hand"
            );
            store.purge(&doc.id).await?;
            return Ok(true);
        }
        if doc.deleted_at.is_some() && doc.subsystems.is_clean() {
            store.purge(&doc.id).await?;
            info!(resource_id = %doc.id, "Deleted resource removed");
            return Ok(true);
        }
        let user_id = Principal::system().user_id;
        self.platform.jobs.submit(None, &user_id, &job).await?;
        info!(resource_id = %doc.id, job_type = job.job_type(), "Stalled deletion resubmitted");
        Ok(true)
    }

    async fn confirm_deleted<S>(
        &self,
        store: &ResourceStore<S>,
        doc: &Document<S>,
        jobs: &KindJobs,
    ) -> Result<bool>
    where
        S: ResourceSpec,
        S::Subsystems: Remaining,
    {
        if doc.subsystems.is_clean() {
            store.purge(&doc.id).await?;
            info!(resource_id = %doc.id, "Deleted resource removed");
            return Ok(true);
        }
        debug!(
            resource_id = %doc.id,
            remaining = ?doc.subsystems.remaining(),
            "Deleted resource still has objects"
        );
        let job = (jobs.delete)(doc.id.clone());
        store
            .set_status(&doc.id, ResourceStatus::ResourceBeingDeleted, "Resource being deleted")
            .await?;
        begin_and_submit(&self.platform, store, &doc.id, Activity::BeingDeleted, &job).await
    }
}

#[async_trait]
impl Worker for Confirmer {
    fn name(&self) -> &'static str {
        "Confirmer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        let platform = &self.platform;
        let deployments = KindJobs {
            create: |id| Job::CreateDeployment { id },
            delete: |id| Job::DeleteDeployment { id },
        };
        let vms = KindJobs {
            create: |id| Job::CreateVm { id },
            delete: |id| Job::DeleteVm { id },
        };
        let storage_managers = KindJobs {
            create: |id| Job::CreateSm { id },
            delete: |id| Job::DeleteSm { id },
        };
        let done = self.confirm_kind(&platform.deployments, deployments).await?
            + self.confirm_kind(&platform.vms, vms).await?
            + self
                .confirm_kind(&platform.storage_managers, storage_managers)
                .await?;
        Ok(done > 0)
    }
}
