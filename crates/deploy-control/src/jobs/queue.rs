// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submission and inspection of queued jobs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use deploy_core::model::{JobFilter, JobRecord, JobStatus, NewJob, Pagination};
use deploy_core::persistence::Persistence;

use super::{JOB_VERSION, Job};
use crate::error::{Error, Result};

/// Result of [`JobQueue::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    /// ID of the job.
    pub job_id: String,
    /// False when a job with the supplied ID already existed.
    pub created: bool,
}

/// Handle on the durable queue.
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
}

impl JobQueue {
    /// Queue backed by `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Enqueue `job` for `user_id`. Resubmitting an existing `job_id` leaves
    /// the queue unchanged.
    pub async fn submit(
        &self,
        job_id: Option<&str>,
        user_id: &str,
        job: &Job,
    ) -> Result<Submitted> {
        let id = match job_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let (job_type, args) = job
            .to_parts()
            .map_err(|e| Error::Internal(format!("failed to encode job: {e}")))?;
        let now = Utc::now();
        let record = NewJob {
            id: id.clone(),
            user_id: user_id.to_string(),
            job_type: job_type.to_string(),
            args,
            resource_id: job.resource().map(|(_, id)| id.to_string()),
            version: JOB_VERSION.to_string(),
            created_at: now,
            run_after: now,
        };

        let created = self.persistence.insert_job(&record).await?;
        if created {
            info!(job_id = %id, job_type, user_id, "Job submitted");
        } else {
            debug!(job_id = %id, job_type, "Job already submitted");
        }
        Ok(Submitted {
            job_id: id,
            created,
        })
    }

    /// Job `id`.
    pub async fn get(&self, id: &str) -> Result<JobRecord> {
        self.find(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    /// Job `id`, if it exists.
    pub async fn find(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.persistence.get_job(id).await?)
    }

    /// Jobs matching `filter`, newest first.
    pub async fn list(
        &self,
        filter: &JobFilter,
        page: Option<Pagination>,
    ) -> Result<Vec<JobRecord>> {
        Ok(self.persistence.list_jobs(filter, page).await?)
    }

    /// Cancel pending job `id`.
    pub async fn terminate(&self, id: &str, reason: &str) -> Result<JobRecord> {
        let job = self.get(id).await?;
        if job.status != JobStatus::Pending
            || !self.persistence.terminate_job(id, Utc::now(), reason).await?
        {
            return Err(Error::Conflict(format!(
                "job {id} is {} and can no longer be terminated",
                job.status
            )));
        }
        info!(job_id = %id, reason, "Job terminated");
        self.get(id).await
    }

    /// Whether a pending or running job exists for `resource_id`.
    pub async fn has_live_job(&self, resource_id: &str) -> Result<bool> {
        for status in [JobStatus::Pending, JobStatus::Running] {
            let filter = JobFilter {
                resource_id: Some(resource_id.to_string()),
                status: Some(status),
                ..Default::default()
            };
            let page = Pagination {
                page: 0,
                page_size: 1,
            };
            if !self.list(&filter, Some(page)).await?.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Number of failed `job_type` jobs for `resource_id`.
    pub async fn failed_attempts(&self, resource_id: &str, job_type: &str) -> Result<usize> {
        let filter = JobFilter {
            resource_id: Some(resource_id.to_string()),
            status: Some(JobStatus::Failed),
            job_type: Some(job_type.to_string()),
            ..Default::default()
        };
        Ok(self.list(&filter, None).await?.len())
    }
}
