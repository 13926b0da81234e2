// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pulls live workload and VM state into `statusCode`/`statusMessage`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use deploy_core::model::{Deployment, Document, ResourceSpec, ResourceStatus, StorageManager, Vm};
use deploy_core::persistence::ResourceStore;

use super::Worker;
use crate::config::Capability;
use crate::error::Result;
use crate::generators::naming;
use crate::platform::Platform;
use crate::providers::{KubeApi, PowerState, WorkloadStatus};

/// Writes observed status onto resources that are not being created or
/// deleted.
pub struct StatusUpdater {
    platform: Arc<Platform>,
    interval: Duration,
}

fn is_settled<S: ResourceSpec>(doc: &Document<S>) -> bool {
    !doc.is_being_deleted() && !doc.has_activity(deploy_core::Activity::BeingCreated)
}

/// Status of a set of workloads; `None` entries are missing.
fn workload_status(workloads: &[(String, Option<WorkloadStatus>)]) -> (ResourceStatus, String) {
    if let Some((name, _)) = workloads.iter().find(|(_, s)| s.is_none()) {
        return (ResourceStatus::ResourceError, format!("Workload {name} is missing"));
    }
    let statuses: Vec<(&String, WorkloadStatus)> = workloads
        .iter()
        .filter_map(|(name, s)| s.map(|s| (name, s)))
        .collect();
    if let Some((name, _)) = statuses.iter().find(|(_, s)| s.failing) {
        return (ResourceStatus::ResourceError, format!("Workload {name} is failing"));
    }
    let desired: u32 = statuses.iter().map(|(_, s)| s.desired_replicas).sum();
    let ready: u32 = statuses.iter().map(|(_, s)| s.ready_replicas).sum();
    if desired == 0 {
        (ResourceStatus::ResourceStopped, "Scaled to zero".to_string())
    } else if ready >= desired {
        (ResourceStatus::ResourceRunning, format!("{ready}/{desired} replicas ready"))
    } else {
        (ResourceStatus::ResourceCreated, format!("{ready}/{desired} replicas ready"))
    }
}

fn power_status(state: Option<PowerState>) -> (ResourceStatus, String) {
    match state {
        Some(PowerState::Running) => (ResourceStatus::ResourceRunning, "VM running".to_string()),
        Some(PowerState::Stopped) => (ResourceStatus::ResourceStopped, "VM stopped".to_string()),
        Some(PowerState::Starting) => (ResourceStatus::ResourceUnknown, "VM starting".to_string()),
        Some(PowerState::Stopping) => (ResourceStatus::ResourceUnknown, "VM stopping".to_string()),
        Some(PowerState::Error) => (
            ResourceStatus::ResourceError,
            "Hypervisor reports an error".to_string(),
        ),
        None => (ResourceStatus::ResourceError, "VM is missing".to_string()),
    }
}

impl StatusUpdater {
    /// Create a status updater with the configured interval.
    pub fn new(platform: Arc<Platform>) -> Self {
        let interval = platform.config.workers.status();
        Self { platform, interval }
    }

    async fn write<S: ResourceSpec>(
        store: &ResourceStore<S>,
        doc: &Document<S>,
        (status, message): (ResourceStatus, String),
    ) -> Result<bool> {
        if doc.status_code == status && doc.status_message == message {
            return Ok(false);
        }
        debug!(resource_id = %doc.id, status = status.as_str(), %message, "Status changed");
        store.set_status(&doc.id, status, message).await?;
        Ok(true)
    }

    async fn kube_statuses(
        kube: &dyn KubeApi,
        namespace: &str,
        names: Vec<String>,
    ) -> Result<Vec<(String, Option<WorkloadStatus>)>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let status = kube.workload_status(namespace, &name).await?;
            out.push((name, status));
        }
        Ok(out)
    }

    async fn update_deployment(&self, d: &Deployment) -> Result<bool> {
        let platform = &self.platform;
        let zone = platform.zone(&d.zone, Capability::Deployment)?;
        let kube = platform.clients.kube(zone).await?;
        let names = d
            .spec
            .apps
            .keys()
            .map(|app| naming::app_workload_name(&d.name, app))
            .collect();
        let namespace = naming::user_namespace(&d.owner_id);
        let statuses = Self::kube_statuses(kube.as_ref(), &namespace, names).await?;
        Self::write(&platform.deployments, d, workload_status(&statuses)).await
    }

    async fn update_vm(&self, vm: &Vm) -> Result<bool> {
        let Some(cs_vm) = &vm.subsystems.cs.vm else {
            return Ok(false);
        };
        let platform = &self.platform;
        let zone = platform.zone(&vm.zone, Capability::Vm)?;
        let cs = platform.clients.cloudstack(zone).await?;
        let state = cs.power_state(&cs_vm.id).await?;
        Self::write(&platform.vms, vm, power_status(state)).await
    }

    async fn update_storage_manager(&self, sm: &StorageManager) -> Result<bool> {
        let platform = &self.platform;
        let zone = platform.zone(&sm.zone, Capability::Deployment)?;
        let kube = platform.clients.kube(zone).await?;
        let namespace = naming::storage_manager_namespace(&sm.owner_id);
        let names = vec![naming::storage_manager_name(&sm.owner_id)];
        let statuses = Self::kube_statuses(kube.as_ref(), &namespace, names).await?;
        Self::write(&platform.storage_managers, sm, workload_status(&statuses)).await
    }
}

/// Count a per-resource outcome; failures are logged and skipped so one
/// unreachable zone does not hide the others.
fn tally(changed: &mut usize, id: &str, outcome: Result<bool>) {
    match outcome {
        Ok(true) => *changed += 1,
        Ok(false) => {}
        Err(e) => warn!(resource_id = %id, error = %e, "Failed to update status"),
    }
}

#[async_trait]
impl Worker for StatusUpdater {
    fn name(&self) -> &'static str {
        "Status updater"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        let platform = &self.platform;
        let filter = Default::default();
        let mut changed = 0;
        for d in platform.deployments.list(&filter, None).await? {
            if is_settled(&d) {
                tally(&mut changed, &d.id, self.update_deployment(&d).await);
            }
        }
        for vm in platform.vms.list(&filter, None).await? {
            if is_settled(&vm) {
                tally(&mut changed, &vm.id, self.update_vm(&vm).await);
            }
        }
        for sm in platform.storage_managers.list(&filter, None).await? {
            if is_settled(&sm) {
                tally(&mut changed, &sm.id, self.update_storage_manager(&sm).await);
            }
        }
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use deploy_core::Activity;

    use crate::jobs::{Job, JobExecutor};
    use crate::testing;

    fn ready(desired: u32, ready: u32) -> Option<WorkloadStatus> {
        Some(WorkloadStatus {
            desired_replicas: desired,
            ready_replicas: ready,
            failing: false,
        })
    }

    #[test]
    fn test_workload_status_summary() {
        let one = |s| vec![("a1-main".to_string(), s)];
        assert_eq!(workload_status(&one(ready(2, 2))).0, ResourceStatus::ResourceRunning);
        assert_eq!(workload_status(&one(ready(2, 1))).0, ResourceStatus::ResourceCreated);
        assert_eq!(workload_status(&one(ready(0, 0))).0, ResourceStatus::ResourceStopped);
        assert_eq!(workload_status(&one(None)).0, ResourceStatus::ResourceError);
        let failing = Some(WorkloadStatus {
            failing: true,
            ..WorkloadStatus::default()
        });
        let (status, message) = workload_status(&one(failing));
        assert_eq!(status, ResourceStatus::ResourceError);
        assert!(message.contains("failing"));
    }

    #[tokio::test]
    async fn test_status_follows_workload() {
        let (platform, providers) = testing::platform().await;
        let mut d = testing::deployment("d-1", "a1", "u-1");
        d.activities.insert(Activity::BeingCreated);
        platform.deployments.create(&d).await.unwrap();
        platform
            .jobs
            .submit(None, "u-1", &Job::CreateDeployment { id: "d-1".into() })
            .await
            .unwrap();
        JobExecutor::new(platform.clone(), Default::default())
            .run_until_idle()
            .await
            .unwrap();

        let updater = StatusUpdater::new(platform.clone());
        assert!(updater.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.status_code, ResourceStatus::ResourceRunning);
        assert!(!updater.run_once().await.unwrap());

        let namespace = naming::user_namespace("u-1");
        let workload = naming::app_workload_name("a1", "main");
        providers
            .kube_for("z1")
            .set_workload_status(&namespace, &workload, ready(1, 0).unwrap())
            .await;
        assert!(updater.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.status_code, ResourceStatus::ResourceCreated);
        assert_eq!(d.status_message, "0/1 replicas ready");
    }

    #[tokio::test]
    async fn test_resources_in_creation_are_skipped() {
        let (platform, _) = testing::platform().await;
        let mut d = testing::deployment("d-1", "a1", "u-1");
        d.activities.insert(Activity::BeingCreated);
        platform.deployments.create(&d).await.unwrap();

        let updater = StatusUpdater::new(platform.clone());
        assert!(!updater.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.status_code, ResourceStatus::ResourceBeingCreated);
    }
}
