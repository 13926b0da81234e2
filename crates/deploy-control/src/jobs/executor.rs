// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job executor.
//!
//! Claims runnable jobs and runs them on a bounded pool of tasks. The store
//! never hands out two jobs for the same resource at once, so handlers do
//! not lock anything themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use deploy_core::model::{JobRecord, ResourceKind, ResourceStatus};
use deploy_core::{Activity, StoreError};

use super::{Job, JobError, handlers};
use crate::config::WorkerIntervals;
use crate::error::Result;
use crate::platform::Platform;

/// Configuration for the job executor.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// How often to look for runnable jobs when idle.
    pub poll_interval: Duration,
    /// Jobs run concurrently.
    pub pool_size: usize,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            pool_size: 4,
        }
    }
}

impl From<&WorkerIntervals> for JobExecutorConfig {
    fn from(intervals: &WorkerIntervals) -> Self {
        Self {
            poll_interval: intervals.job_poll(),
            pool_size: intervals.job_executor_pool_size.max(1),
        }
    }
}

/// Background worker that runs queued jobs.
pub struct JobExecutor {
    platform: Arc<Platform>,
    config: JobExecutorConfig,
    permits: Arc<Semaphore>,
    shutdown: Arc<Notify>,
}

impl JobExecutor {
    /// Create an executor.
    pub fn new(platform: Arc<Platform>, config: JobExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            platform,
            config,
            permits,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the executor loop until shutdown, then wait for running jobs.
    ///
    /// Jobs left `running` by a previous process are put back to `pending`
    /// first.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            pool_size = self.config.pool_size,
            "Job executor started"
        );

        match self.platform.persistence.reset_running_jobs().await {
            Ok(0) => {}
            Ok(reset) => warn!(jobs = reset, "Reset jobs left running by a previous executor"),
            Err(e) => error!(error = %e, "Failed to reset running jobs"),
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job executor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.dispatch().await {
                        error!(error = %e, "Failed to claim jobs");
                    }
                }
            }
        }

        let pool = u32::try_from(self.config.pool_size.max(1)).unwrap_or(u32::MAX);
        if self.permits.acquire_many(pool).await.is_err() {
            warn!("Job pool closed before running jobs drained");
        }
        info!("Job executor stopped");
    }

    /// Claim jobs while pool slots are free and spawn them.
    async fn dispatch(&self) -> Result<usize> {
        let mut started = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return Ok(started);
            };
            let Some(record) = self.platform.persistence.claim_job(Utc::now()).await? else {
                return Ok(started);
            };
            let platform = self.platform.clone();
            tokio::spawn(async move {
                let job_id = record.id.clone();
                if let Err(e) = execute(&platform, record).await {
                    error!(job_id = %job_id, error = %e, "Failed to record job outcome");
                }
                drop(permit);
            });
            started += 1;
        }
    }

    /// Claim and run one job on the calling task. Returns whether a job ran.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(record) = self.platform.persistence.claim_job(Utc::now()).await? else {
            return Ok(false);
        };
        execute(&self.platform, record).await?;
        Ok(true)
    }

    /// Run jobs on the calling task until none is runnable. Returns how many
    /// ran.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut ran = 0;
        while self.run_once().await? {
            ran += 1;
        }
        Ok(ran)
    }
}

/// Why a resource-scoped job should not run any more.
async fn skip_reason(platform: &Platform, job: &Job) -> Result<Option<&'static str>> {
    let Some((kind, id)) = job.resource() else {
        return Ok(None);
    };
    let Some(record) = platform.persistence.get_resource(kind, id, true).await? else {
        return Ok(Some("resource no longer exists"));
    };
    if job.is_delete() {
        return Ok(None);
    }
    if record.deleted_at.is_some() {
        return Ok(Some("resource was deleted"));
    }
    if record.activities.contains(&Activity::BeingDeleted) {
        return Ok(Some("resource is being deleted"));
    }
    Ok(None)
}

/// Run one claimed job and record its outcome.
pub(crate) async fn execute(platform: &Platform, record: JobRecord) -> Result<()> {
    let persistence = &platform.persistence;
    let job = match Job::from_parts(&record.job_type, &record.args) {
        Ok(job) => job,
        Err(e) => {
            let message = format!("cannot decode {} job: {e}", record.job_type);
            error!(job_id = %record.id, job_type = %record.job_type, error = %e, "Unknown job");
            persistence
                .fail_job(&record.id, Utc::now(), record.attempts + 1, &message)
                .await?;
            return Ok(());
        }
    };
    let job_type = job.job_type();

    if let Some(reason) = skip_reason(platform, &job).await? {
        info!(job_id = %record.id, job_type, reason, "Job skipped");
        let note = format!("skipped: {reason}");
        persistence
            .finish_job(&record.id, Utc::now(), Some(&note))
            .await?;
        return Ok(());
    }

    let policy = job.policy();
    debug!(job_id = %record.id, job_type, attempt = record.attempts + 1, "Running job");
    let run = handlers::run(platform, &record.user_id, &job);
    let outcome = match tokio::time::timeout(policy.timeout, run).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(JobError::from(e)),
        Err(_) => Err(JobError::Transient(format!(
            "timed out after {}s",
            policy.timeout.as_secs()
        ))),
    };

    let now = Utc::now();
    match outcome {
        Ok(()) => {
            if let Some(activity) = job.clears() {
                for (kind, id) in job.targets() {
                    clear_activity(platform, kind, id, activity).await?;
                }
            }
            persistence.finish_job(&record.id, now, None).await?;
            info!(job_id = %record.id, job_type, "Job finished");
        }
        Err(e) => {
            let attempts = record.attempts + 1;
            let message = e.to_string();
            if e.is_transient() && attempts < policy.max_attempts {
                let delay = policy.backoff(attempts);
                let run_after = now + chrono::Duration::from_std(delay).unwrap_or_default();
                persistence
                    .retry_job(&record.id, run_after, attempts, &message)
                    .await?;
                warn!(
                    job_id = %record.id,
                    job_type,
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "Job failed, will retry"
                );
            } else {
                persistence
                    .fail_job(&record.id, now, attempts, &message)
                    .await?;
                error!(job_id = %record.id, job_type, attempts, error = %message, "Job failed");
                cleanup_failed(platform, &job, &message).await?;
            }
        }
    }
    Ok(())
}

/// Remove the activity a terminated job would have cleared.
pub(crate) async fn release_terminated(platform: &Platform, record: &JobRecord) -> Result<()> {
    let job = match Job::from_parts(&record.job_type, &record.args) {
        Ok(job) => job,
        Err(e) => {
            warn!(job_id = %record.id, job_type = %record.job_type, error = %e, "Unknown job");
            return Ok(());
        }
    };
    if let Some(activity) = job.clears() {
        for (kind, id) in job.targets() {
            clear_activity(platform, kind, id, activity).await?;
            debug!(job_id = %record.id, resource_id = id, %activity, "Activity released");
        }
    }
    Ok(())
}

/// Undo what a failed job leaves behind on its resources. A failed delete
/// keeps `beingDeleted` so the confirmer retries or purges it.
async fn cleanup_failed(platform: &Platform, job: &Job, message: &str) -> Result<()> {
    if let Some(activity) = job.clears().filter(|a| *a != Activity::BeingDeleted) {
        for (kind, id) in job.targets() {
            clear_activity(platform, kind, id, activity).await?;
        }
    }
    if job.is_create() || job.is_delete() {
        if let Some((kind, id)) = job.resource() {
            set_status(platform, kind, id, ResourceStatus::ResourceError, message).await?;
        }
    }
    Ok(())
}

fn tolerate_missing(result: deploy_core::error::Result<()>) -> Result<()> {
    match result {
        Ok(()) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove `activity` from resource `id`; a purged resource is fine.
pub(crate) async fn clear_activity(
    platform: &Platform,
    kind: ResourceKind,
    id: &str,
    activity: Activity,
) -> Result<()> {
    tolerate_missing(match kind {
        ResourceKind::Deployment => platform.deployments.remove_activity(id, activity).await,
        ResourceKind::Vm => platform.vms.remove_activity(id, activity).await,
        ResourceKind::StorageManager => {
            platform
                .storage_managers
                .remove_activity(id, activity)
                .await
        }
    })
}

async fn set_status(
    platform: &Platform,
    kind: ResourceKind,
    id: &str,
    status: ResourceStatus,
    message: &str,
) -> Result<()> {
    tolerate_missing(match kind {
        ResourceKind::Deployment => platform.deployments.set_status(id, status, message).await,
        ResourceKind::Vm => platform.vms.set_status(id, status, message).await,
        ResourceKind::StorageManager => {
            platform
                .storage_managers
                .set_status(id, status, message)
                .await
        }
    })
}
