// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background workers.
//!
//! Every worker is a periodic pass over the store: [`Worker::run_once`] does
//! one pass and reports whether it did anything, and [`WorkerLoop`] drives it
//! on its interval until shut down. The job executor has its own loop in
//! [`crate::jobs::JobExecutor`] because it also drains a task pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use deploy_core::model::ResourceSpec;
use deploy_core::persistence::ResourceStore;
use deploy_core::{Activity, ActivityOutcome};

use crate::error::Result;
use crate::jobs::Job;
use crate::platform::Platform;
use crate::services::Principal;

pub mod confirmer;
pub mod gpu_lease_enforcer;
pub mod pinger;
pub mod repairer;
pub mod snapshotter;
pub mod status_updater;

pub use confirmer::Confirmer;
pub use gpu_lease_enforcer::GpuLeaseEnforcer;
pub use pinger::{HttpProbe, Pinger, Probe};
pub use repairer::Repairer;
pub use snapshotter::Snapshotter;
pub use status_updater::StatusUpdater;

/// Resources looked at per kind and pass.
pub(crate) const BATCH_SIZE: i64 = 100;

/// One periodic background task.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Name used in log lines, e.g. `"Repairer"`.
    fn name(&self) -> &'static str;

    /// Pause between passes.
    fn interval(&self) -> Duration;

    /// Do one pass. Returns whether anything was done.
    async fn run_once(&self) -> Result<bool>;
}

/// Runs a [`Worker`] on its interval until shutdown is signalled.
pub struct WorkerLoop<W: Worker> {
    worker: W,
    shutdown: Arc<Notify>,
}

impl<W: Worker> WorkerLoop<W> {
    /// Wrap `worker`.
    pub fn new(worker: W) -> Self {
        Self {
            worker,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// The wrapped worker.
    pub fn worker(&self) -> &W {
        &self.worker
    }

    /// Run passes until the shutdown signal fires. A pass in progress is
    /// finished first; a failed pass is logged and the loop carries on.
    pub async fn run(&self) {
        let name = self.worker.name();
        let interval = self.worker.interval();
        info!(interval_secs = interval.as_secs(), "{name} started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("{name} received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    match self.worker.run_once().await {
                        Ok(true) => debug!(worker = name, "Pass did work"),
                        Ok(false) => {}
                        Err(e) => error!(worker = name, error = %e, "Worker pass failed"),
                    }
                }
            }
        }

        info!("{name} stopped");
    }
}

/// Start `activity` on `id` and queue `job` as the system user. Returns
/// false when another activity blocks it; the activity is rolled back when
/// the job cannot be queued.
pub(crate) async fn begin_and_submit<S: ResourceSpec>(
    platform: &Platform,
    store: &ResourceStore<S>,
    id: &str,
    activity: Activity,
    job: &Job,
) -> Result<bool> {
    match store.add_activity(id, activity).await? {
        ActivityOutcome::Started => {}
        ActivityOutcome::Blocked(by) => {
            debug!(resource_id = %id, %activity, blocked_by = %by, "Activity blocked");
            return Ok(false);
        }
    }
    let user_id = Principal::system().user_id;
    if let Err(e) = platform.jobs.submit(None, &user_id, job).await {
        let _ = store.remove_activity(id, activity).await;
        return Err(e);
    }
    Ok(true)
}
