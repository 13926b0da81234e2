// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic drift repair.
//!
//! Resources with no activity whose last repair is older than the
//! quiescence window get a repair job. `repairedAt` is stamped on
//! submission, so a resource is queued at most once per window even when its
//! repair keeps failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use deploy_core::Activity;
use deploy_core::model::ResourceSpec;
use deploy_core::persistence::ResourceStore;

use super::{BATCH_SIZE, Worker, begin_and_submit};
use crate::error::Result;
use crate::jobs::Job;
use crate::platform::Platform;

/// Queues repair jobs for quiescent resources.
pub struct Repairer {
    platform: Arc<Platform>,
    interval: Duration,
    quiescence: Duration,
}

impl Repairer {
    /// Create a repairer with the configured intervals.
    pub fn new(platform: Arc<Platform>) -> Self {
        let workers = &platform.config.workers;
        let (interval, quiescence) = (workers.repair(), workers.repair_quiescence());
        Self {
            platform,
            interval,
            quiescence,
        }
    }

    /// Override the quiescence window.
    pub fn with_quiescence(mut self, quiescence: Duration) -> Self {
        self.quiescence = quiescence;
        self
    }

    async fn repair_kind<S: ResourceSpec>(
        &self,
        store: &ResourceStore<S>,
        job: fn(String) -> Job,
    ) -> Result<usize> {
        let quiescence = chrono::Duration::from_std(self.quiescence).unwrap_or_default();
        let older_than = Utc::now() - quiescence;
        let mut queued = 0;
        for doc in store.get_with_no_activities(older_than, BATCH_SIZE).await? {
            let job = job(doc.id.clone());
            if begin_and_submit(&self.platform, store, &doc.id, Activity::Repairing, &job).await? {
                store.mark_repaired(&doc.id, None).await?;
                debug!(resource_id = %doc.id, job_type = job.job_type(), "Repair queued");
                queued += 1;
            }
        }
        Ok(queued)
    }
}

#[async_trait]
impl Worker for Repairer {
    fn name(&self) -> &'static str {
        "Repairer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        let platform = &self.platform;
        let queued = self
            .repair_kind(&platform.deployments, |id| Job::RepairDeployment { id })
            .await?
            + self
                .repair_kind(&platform.vms, |id| Job::RepairVm { id })
                .await?
            + self
                .repair_kind(&platform.storage_managers, |id| Job::RepairSm { id })
                .await?;
        if queued > 0 {
            info!(queued, "Repairs queued");
        }
        Ok(queued > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use deploy_core::model::JobStatus;
    use deploy_core::model::subsystems::k8s::K8sDeployment;

    use crate::jobs::JobExecutor;
    use crate::providers::memory::MemoryObject;
    use crate::testing;

    #[tokio::test]
    async fn test_repair_recreates_deleted_workload() {
        let (platform, providers) = testing::platform().await;
        let mut d = testing::deployment("d-1", "a1", "u-1");
        d.activities.insert(Activity::BeingCreated);
        platform.deployments.create(&d).await.unwrap();
        platform
            .jobs
            .submit(None, "u-1", &Job::CreateDeployment { id: "d-1".into() })
            .await
            .unwrap();
        let executor = JobExecutor::new(platform.clone(), Default::default());
        executor.run_until_idle().await.unwrap();

        let kube = providers.kube_for("z1");
        let before = platform.deployments.get("d-1").await.unwrap();
        let observed = before.subsystems.k8s.deployment_map["a1"].clone();
        assert!(kube.backend.remove::<K8sDeployment>(&observed.key()).await);

        let repairer = Repairer::new(platform.clone()).with_quiescence(Duration::ZERO);
        assert!(repairer.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(d.has_activity(Activity::Repairing));
        assert!(d.repaired_at.is_some());

        executor.run_until_idle().await.unwrap();
        let after = platform.deployments.get("d-1").await.unwrap();
        let recreated = &after.subsystems.k8s.deployment_map["a1"];
        assert_ne!(recreated.id, observed.id);
        assert!(after.activities.is_empty());
        assert_eq!(after.spec, before.spec);
        assert_eq!(kube.backend.count::<K8sDeployment>().await, 1);
    }

    #[tokio::test]
    async fn test_busy_and_recent_resources_are_left_alone() {
        let (platform, _) = testing::platform().await;
        let mut busy = testing::deployment("d-1", "a1", "u-1");
        busy.activities.insert(Activity::Restarting);
        platform.deployments.create(&busy).await.unwrap();
        platform
            .deployments
            .create(&testing::deployment("d-2", "a2", "u-1"))
            .await
            .unwrap();

        let repairer = Repairer::new(platform.clone());
        assert!(!repairer.run_once().await.unwrap());

        let repairer = repairer.with_quiescence(Duration::ZERO);
        assert!(repairer.run_once().await.unwrap());
        let jobs = platform.jobs.list(&Default::default(), None).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].resource_id.as_deref(), Some("d-2"));
        assert_eq!(jobs[0].status, JobStatus::Pending);

        assert!(!repairer.run_once().await.unwrap());
    }
}
