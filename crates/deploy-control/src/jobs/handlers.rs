// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.
//!
//! One function per [`Job`] variant. Handlers are idempotent: every provider
//! call is recorded in the resource document as soon as it succeeds, so a
//! retried job starts from whatever already happened. Clearing the job's
//! activity on success is left to the executor.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, warn};

use deploy_core::Activity;
use deploy_core::model::subsystems::cs::{CsSnapshot, CsVm};
use deploy_core::model::subsystems::gitlab::Build;
use deploy_core::model::{Deployment, GpuLease, ResourceStatus, Vm, VmGpuRef};
use deploy_core::persistence::UpdateParams;

use super::{BuildRequest, Job};
use crate::config::Capability;
use crate::error::{Error, Result};
use crate::generators::{harbor, naming};
use crate::platform::Platform;
use crate::providers::{CloudStack, Provider, ProviderError, VmAction};
use crate::reconcile::{self, Mode, Slot};
use crate::services::deployments::DeploymentUpdate;
use crate::services::vms::VmUpdate;

const CREATED: &str = "Resource created";
const DELETED: &str = "Resource deleted";

/// Run `job` on behalf of `user_id`.
pub async fn run(platform: &Platform, user_id: &str, job: &Job) -> Result<()> {
    match job {
        Job::CreateDeployment { id } => {
            reconcile::deployment::reconcile(platform, id, Mode::Create).await?;
            let store = &platform.deployments;
            store.set_status(id, ResourceStatus::ResourceCreated, CREATED).await?;
            store.mark_repaired(id, None).await?;
        }
        Job::UpdateDeployment { id, update } => update_deployment(platform, id, update).await?,
        Job::DeleteDeployment { id } => {
            reconcile::deployment::teardown(platform, id).await?;
            let store = &platform.deployments;
            store.mark_deleted(id).await?;
            store.set_status(id, ResourceStatus::ResourceDeleted, DELETED).await?;
        }
        Job::RepairDeployment { id } => {
            reconcile::deployment::reconcile(platform, id, Mode::Repair).await?;
            platform.deployments.mark_repaired(id, None).await?;
        }
        Job::RestartDeployment { id } => {
            let d = platform.deployments.get(id).await?;
            restart_apps(platform, &d).await?;
            platform.deployments.mark_restarted(id, None).await?;
        }
        Job::BuildDeployments { ids, build } => build_deployments(platform, ids, build).await?,
        Job::UpdateDeploymentOwner {
            id,
            new_owner_id,
            migration_id,
        } => {
            update_deployment_owner(platform, id, new_owner_id).await?;
            close_migration(platform, migration_id.as_deref()).await?;
        }
        Job::CreateVm { id } => {
            reconcile::vm::reconcile(platform, id, Mode::Create).await?;
            let store = &platform.vms;
            store.set_status(id, ResourceStatus::ResourceCreated, CREATED).await?;
            store.mark_repaired(id, None).await?;
        }
        Job::UpdateVm { id, update } => update_vm(platform, id, update).await?,
        Job::DeleteVm { id } => {
            reconcile::vm::teardown(platform, id).await?;
            let store = &platform.vms;
            store.mark_deleted(id).await?;
            store.set_status(id, ResourceStatus::ResourceDeleted, DELETED).await?;
        }
        Job::RepairVm { id } => {
            reconcile::vm::reconcile(platform, id, Mode::Repair).await?;
            platform.vms.mark_repaired(id, None).await?;
        }
        Job::DoVmAction { id, action } => vm_action(platform, id, *action).await?,
        Job::CreateSystemSnapshot { id, name } => {
            create_snapshot(platform, id, name, false).await?;
            prune_system_snapshots(platform, id).await?;
        }
        Job::CreateUserSnapshot { id, name } => create_snapshot(platform, id, name, true).await?,
        Job::DeleteSnapshot { id, name } => delete_snapshot(platform, id, name).await?,
        Job::UpdateVmOwner {
            id,
            new_owner_id,
            migration_id,
        } => {
            update_vm_owner(platform, id, new_owner_id).await?;
            close_migration(platform, migration_id.as_deref()).await?;
        }
        Job::AttachGpu {
            id,
            gpu_ids,
            lease_hours,
            never_expire,
        } => attach_gpu(platform, user_id, id, gpu_ids, *lease_hours, *never_expire).await?,
        Job::DetachGpu { id } => detach_gpu(platform, id).await?,
        Job::CreateSm { id } => {
            reconcile::storage_manager::reconcile(platform, id, Mode::Create).await?;
            let store = &platform.storage_managers;
            store.set_status(id, ResourceStatus::ResourceCreated, CREATED).await?;
            store.mark_repaired(id, None).await?;
        }
        Job::DeleteSm { id } => {
            reconcile::storage_manager::teardown(platform, id).await?;
            let store = &platform.storage_managers;
            store.mark_deleted(id).await?;
            store.set_status(id, ResourceStatus::ResourceDeleted, DELETED).await?;
        }
        Job::RepairSm { id } => {
            reconcile::storage_manager::reconcile(platform, id, Mode::Repair).await?;
            platform.storage_managers.mark_repaired(id, None).await?;
        }
    }
    Ok(())
}

async fn update_deployment(platform: &Platform, id: &str, update: &DeploymentUpdate) -> Result<()> {
    let d = platform.deployments.get(id).await?;
    let params = update.params(&d, &platform.config.registry)?;
    if !params.is_empty() {
        platform.deployments.update_with_params(id, &params).await?;
    }
    let changes = reconcile::deployment::reconcile(platform, id, Mode::Update).await?;
    if !params.is_empty() || changes > 0 {
        platform.deployments.mark_updated(id, None).await?;
    } else {
        debug!(deployment_id = %id, "Update changed nothing");
    }
    Ok(())
}

async fn update_vm(platform: &Platform, id: &str, update: &VmUpdate) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let params = update.params(&vm)?;
    if !params.is_empty() {
        platform.vms.update_with_params(id, &params).await?;
    }
    let changes = reconcile::vm::reconcile(platform, id, Mode::Update).await?;
    if !params.is_empty() || changes > 0 {
        platform.vms.mark_updated(id, None).await?;
    } else {
        debug!(vm_id = %id, "Update changed nothing");
    }
    Ok(())
}

async fn restart_apps(platform: &Platform, d: &Deployment) -> Result<()> {
    let zone = platform.zone(&d.zone, Capability::Deployment)?;
    let kube = platform.clients.kube(zone).await?;
    let namespace = naming::user_namespace(&d.owner_id);
    for app in d.spec.apps.keys() {
        let workload = naming::app_workload_name(&d.name, app);
        match kube.restart_deployment(&namespace, &workload).await {
            Ok(()) => {}
            Err(ProviderError::NotFound { .. }) => {
                warn!(
                    deployment_id = %d.id,
                    workload = %workload,
                    "Workload missing, not restarted"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(deployment_id = %d.id, apps = d.spec.apps.len(), "Deployment restarted");
    Ok(())
}

async fn build_deployments(
    platform: &Platform,
    ids: &[String],
    build: &BuildRequest,
) -> Result<()> {
    let now = Utc::now();
    for id in ids {
        let Some(d) = platform.deployments.find(id).await? else {
            debug!(deployment_id = %id, "Deployment gone, build skipped");
            continue;
        };
        if d.is_being_deleted() {
            debug!(deployment_id = %id, "Deployment being deleted, build skipped");
            continue;
        }
        let last_build = Build {
            id: build.commit.clone(),
            repository: build.repository.clone(),
            branch: build.branch.clone(),
            tag: harbor::custom_image(&platform.config.registry, &d.owner_id, &d.name),
            status: "success".to_string(),
            trace: Vec::new(),
            created_at: now,
        };
        platform
            .deployments
            .set_subsystem(id, "gitlab.lastBuild", Some(&last_build))
            .await?;
        restart_apps(platform, &d).await?;
        platform
            .deployments
            .mark_restarted(id, Some(Activity::Building))
            .await?;
    }
    Ok(())
}

async fn update_deployment_owner(platform: &Platform, id: &str, new_owner_id: &str) -> Result<()> {
    let d = platform.deployments.get(id).await?;
    if d.owner_id != new_owner_id {
        reconcile::deployment::release_owner(platform, id).await?;
        let mut params = UpdateParams {
            owner_id: Some(new_owner_id.to_string()),
            ..Default::default()
        };
        if d.spec.kind == deploy_core::model::DeploymentType::Custom {
            let image = harbor::custom_image(&platform.config.registry, new_owner_id, &d.name);
            params = params.with_spec("apps.main.image", &image)?;
        }
        platform.deployments.update_with_params(id, &params).await?;
        info!(deployment_id = %id, old_owner_id = %d.owner_id, new_owner_id, "Owner changed");
    }
    reconcile::deployment::reconcile(platform, id, Mode::Repair).await?;
    platform.deployments.mark_updated(id, None).await?;
    Ok(())
}

async fn update_vm_owner(platform: &Platform, id: &str, new_owner_id: &str) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    if vm.owner_id != new_owner_id {
        reconcile::vm::release_owner(platform, id).await?;
        let params = UpdateParams {
            owner_id: Some(new_owner_id.to_string()),
            ..Default::default()
        };
        platform.vms.update_with_params(id, &params).await?;
        info!(vm_id = %id, old_owner_id = %vm.owner_id, new_owner_id, "Owner changed");
    }
    reconcile::vm::reconcile(platform, id, Mode::Repair).await?;
    platform.vms.mark_updated(id, None).await?;
    Ok(())
}

async fn close_migration(platform: &Platform, migration_id: Option<&str>) -> Result<()> {
    if let Some(migration_id) = migration_id {
        platform
            .persistence
            .delete_migration(migration_id, Utc::now())
            .await?;
        debug!(migration_id, "Resource migration closed");
    }
    Ok(())
}

async fn cloudstack_of(platform: &Platform, vm: &Vm) -> Result<(CloudStack, CsVm)> {
    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let cs = platform.clients.cloudstack(zone).await?;
    let cs_vm = vm
        .subsystems
        .cs
        .vm
        .clone()
        .filter(|v| !v.id.is_empty())
        .ok_or_else(|| Error::Conflict(format!("VM {} has no CloudStack VM yet", vm.id)))?;
    Ok((cs, cs_vm))
}

/// Re-read the CloudStack VM after an out-of-band change and record it.
async fn refresh_cs_vm(platform: &Platform, id: &str, cs: &CloudStack, cs_vm: &CsVm) -> Result<()> {
    let live = Provider::<CsVm>::read(cs.as_ref(), cs_vm).await?;
    Slot::new(&platform.vms, id, "cs.vm")
        .write(live.as_ref())
        .await
}

async fn vm_action(platform: &Platform, id: &str, action: VmAction) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let (cs, cs_vm) = cloudstack_of(platform, &vm).await?;
    cs.vm_action(&cs_vm.id, action).await?;
    let (status, message) = match action {
        VmAction::Start | VmAction::Reboot => (ResourceStatus::ResourceRunning, "VM is running"),
        VmAction::Stop => (ResourceStatus::ResourceStopped, "VM is stopped"),
    };
    platform.vms.set_status(id, status, message).await?;
    info!(vm_id = %id, ?action, "VM action done");
    Ok(())
}

async fn create_snapshot(
    platform: &Platform,
    id: &str,
    name: &str,
    user_created: bool,
) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let (cs, cs_vm) = cloudstack_of(platform, &vm).await?;
    let description = if user_created {
        String::new()
    } else {
        format!("auto-{}", platform.config.snapshots.name)
    };
    let desired = CsSnapshot {
        name: name.to_string(),
        vm_id: cs_vm.id.clone(),
        description,
        user_created,
        ..Default::default()
    };
    let slot = Slot::new(&platform.vms, id, format!("cs.snapshotMap.{name}"));
    let observed = vm.subsystems.cs.snapshot_map.get(name);
    if reconcile::create(cs.as_ref(), &slot, &desired, observed).await? {
        info!(vm_id = %id, snapshot = %name, user_created, "Snapshot created");
    }
    Ok(())
}

/// Delete the oldest system snapshots beyond the configured count.
async fn prune_system_snapshots(platform: &Platform, id: &str) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let mut system: Vec<&CsSnapshot> = vm
        .subsystems
        .cs
        .snapshot_map
        .values()
        .filter(|s| !s.user_created)
        .collect();
    let keep = platform.config.snapshots.keep;
    if system.len() <= keep {
        return Ok(());
    }
    system.sort_by_key(|s| (s.created_at, s.name.clone()));
    let (cs, _) = cloudstack_of(platform, &vm).await?;
    let excess = system.len() - keep;
    for snapshot in system.into_iter().take(excess) {
        let slot = Slot::new(&platform.vms, id, format!("cs.snapshotMap.{}", snapshot.name));
        reconcile::delete(cs.as_ref(), &slot, Some(snapshot)).await?;
        debug!(vm_id = %id, snapshot = %snapshot.name, "Old system snapshot deleted");
    }
    Ok(())
}

async fn delete_snapshot(platform: &Platform, id: &str, name: &str) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let Some(snapshot) = vm.subsystems.cs.snapshot_map.get(name) else {
        debug!(vm_id = %id, snapshot = %name, "Snapshot already gone");
        return Ok(());
    };
    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let cs = platform.clients.cloudstack(zone).await?;
    let slot = Slot::new(&platform.vms, id, format!("cs.snapshotMap.{name}"));
    reconcile::delete(cs.as_ref(), &slot, Some(snapshot)).await?;
    info!(vm_id = %id, snapshot = %name, "Snapshot deleted");
    Ok(())
}

async fn attach_gpu(
    platform: &Platform,
    user_id: &str,
    id: &str,
    gpu_ids: &[String],
    lease_hours: f64,
    never_expire: bool,
) -> Result<()> {
    let vm = platform.vms.get(id).await?;
    let (cs, cs_vm) = cloudstack_of(platform, &vm).await?;
    let persistence = &platform.persistence;

    let gpu = match persistence.get_gpu_by_vm(id).await? {
        Some(gpu) => gpu,
        None => {
            let now = Utc::now();
            let lease = GpuLease {
                vm_id: id.to_string(),
                user_id: user_id.to_string(),
                created_at: now,
                ends_at: lease_end(now, lease_hours)?,
                never_expire,
            };
            let mut leased = None;
            for gpu_id in gpu_ids {
                if persistence.lease_gpu(gpu_id, &lease, now).await? {
                    leased = persistence.get_gpu(gpu_id).await?;
                    break;
                }
                debug!(vm_id = %id, gpu_id = %gpu_id, "GPU taken meanwhile");
            }
            leased.ok_or_else(|| Error::Conflict("none of the requested GPUs is free".to_string()))?
        }
    };
    let Some(lease) = gpu.lease.clone() else {
        return Err(Error::Internal(format!("GPU {} has no lease after leasing", gpu.id)));
    };

    let gpu_ref = VmGpuRef {
        id: gpu.id.clone(),
        lease_end: lease.ends_at,
        never_expire: lease.never_expire,
    };
    let params = UpdateParams::default()
        .with_spec("gpu", &Some(gpu_ref))?
        .with_spec("host", &Some(gpu.host.clone()))?;
    platform.vms.update_with_params(id, &params).await?;

    if cs_vm.gpu_id.as_deref() != Some(gpu.id.as_str()) {
        if let Err(e) = cs.attach_gpu(&cs_vm.id, &gpu.id, &gpu.host).await {
            if !e.is_transient() {
                warn!(vm_id = %id, gpu_id = %gpu.id, error = %e, "GPU attach rejected, releasing");
                release_gpu(platform, id).await?;
            }
            return Err(e.into());
        }
    }
    refresh_cs_vm(platform, id, &cs, &cs_vm).await?;
    info!(
        vm_id = %id,
        gpu_id = %gpu.id,
        host = %gpu.host,
        ends_at = %lease.ends_at,
        never_expire = lease.never_expire,
        "GPU attached"
    );
    Ok(())
}

/// End of a lease of `lease_hours` starting at `now`.
fn lease_end(now: DateTime<Utc>, lease_hours: f64) -> Result<DateTime<Utc>> {
    let seconds = (lease_hours * 3600.0).round();
    if !seconds.is_finite() || seconds <= 0.0 || seconds > i64::MAX as f64 {
        return Err(Error::Validation(format!("invalid lease of {lease_hours} hours")));
    }
    TimeDelta::try_seconds(seconds as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| Error::Validation(format!("lease of {lease_hours} hours is too long")))
}

async fn detach_gpu(platform: &Platform, id: &str) -> Result<()> {
    let Some(vm) = platform.vms.find_including_deleted(id).await? else {
        platform.persistence.release_gpus_for_vm(id).await?;
        return Ok(());
    };
    if let Some(cs_vm) = vm.subsystems.cs.vm.as_ref().filter(|v| v.gpu_id.is_some()) {
        let zone = platform.zone(&vm.zone, Capability::Vm)?;
        let cs = platform.clients.cloudstack(zone).await?;
        match cs.detach_gpu(&cs_vm.id).await {
            Ok(()) | Err(ProviderError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        refresh_cs_vm(platform, id, &cs, cs_vm).await?;
    }
    release_gpu(platform, id).await?;
    info!(vm_id = %id, "GPU detached");
    Ok(())
}

/// Clear both sides of the lease.
async fn release_gpu(platform: &Platform, id: &str) -> Result<()> {
    platform.persistence.release_gpus_for_vm(id).await?;
    let params = UpdateParams::default().with_spec("gpu", &None::<VmGpuRef>)?;
    platform.vms.update_with_params(id, &params).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use deploy_core::model::Gpu;
    use deploy_core::model::subsystems::k8s::K8sDeployment;

    use crate::providers::GpuDevice;
    use crate::providers::memory::MemoryProviders;
    use crate::testing;

    async fn created_deployment() -> (Arc<Platform>, Arc<MemoryProviders>) {
        let (platform, providers) = testing::platform().await;
        platform
            .deployments
            .create(&testing::deployment("d-1", "a1", "u-1"))
            .await
            .unwrap();
        run(&platform, "u-1", &Job::CreateDeployment { id: "d-1".into() })
            .await
            .unwrap();
        (platform, providers)
    }

    async fn created_vm() -> (Arc<Platform>, Arc<MemoryProviders>) {
        let (platform, providers) = testing::platform().await;
        platform
            .vms
            .create(&testing::vm("v-1", "vm1", "u-1"))
            .await
            .unwrap();
        run(&platform, "u-1", &Job::CreateVm { id: "v-1".into() })
            .await
            .unwrap();
        (platform, providers)
    }

    #[tokio::test]
    async fn test_create_deployment_records_subsystems() {
        let (platform, _) = created_deployment().await;
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.status_code, ResourceStatus::ResourceCreated);
        assert!(d.subsystems.k8s.deployment_map.contains_key("a1"));
        assert!(d.repaired_at.is_some());
    }

    #[tokio::test]
    async fn test_rerun_of_create_makes_no_provider_calls() {
        let (platform, providers) = created_deployment().await;
        let before = providers.total_mutations();
        run(&platform, "u-1", &Job::CreateDeployment { id: "d-1".into() })
            .await
            .unwrap();
        assert_eq!(providers.total_mutations(), before);
    }

    #[tokio::test]
    async fn test_empty_update_keeps_updated_at() {
        let (platform, providers) = created_deployment().await;
        let before = providers.total_mutations();
        let job = Job::UpdateDeployment {
            id: "d-1".into(),
            update: DeploymentUpdate::default(),
        };
        run(&platform, "u-1", &job).await.unwrap();
        assert_eq!(providers.total_mutations(), before);
        assert!(platform.deployments.get("d-1").await.unwrap().updated_at.is_none());
    }

    #[tokio::test]
    async fn test_delete_leaves_nothing_behind() {
        let (platform, providers) = created_deployment().await;
        run(&platform, "u-1", &Job::DeleteDeployment { id: "d-1".into() })
            .await
            .unwrap();

        let d = platform
            .deployments
            .find_including_deleted("d-1")
            .await
            .unwrap()
            .unwrap();
        assert!(d.deleted_at.is_some());
        assert_eq!(d.status_code, ResourceStatus::ResourceDeleted);
        assert!(reconcile::Remaining::is_clean(&d.subsystems));
        let kube = providers.kube_for("z1");
        assert_eq!(kube.backend.count::<K8sDeployment>().await, 0);
    }

    #[tokio::test]
    async fn test_build_skips_deployment_being_deleted() {
        let (platform, providers) = created_deployment().await;
        platform
            .deployments
            .add_activity("d-1", Activity::BeingDeleted)
            .await
            .unwrap();
        let job = Job::BuildDeployments {
            ids: vec!["d-1".into()],
            build: BuildRequest {
                repository: "acme/app".into(),
                branch: "main".into(),
                commit: "abc123".into(),
            },
        };
        run(&platform, "system", &job).await.unwrap();

        assert!(providers.kube_for("z1").restarts().await.is_empty());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(d.subsystems.gitlab.last_build.is_none());
        assert!(d.has_activity(Activity::BeingDeleted));
    }

    #[test]
    fn test_lease_end_rejects_overflow() {
        let now = Utc::now();
        assert_eq!(lease_end(now, 2.0).unwrap(), now + TimeDelta::hours(2));
        assert_eq!(lease_end(now, 1e12).unwrap_err().status_code(), 400);
        assert_eq!(lease_end(now, f64::INFINITY).unwrap_err().status_code(), 400);
        assert_eq!(lease_end(now, 0.0).unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn test_restart_stamps_restarted_at() {
        let (platform, providers) = created_deployment().await;
        run(&platform, "u-1", &Job::RestartDeployment { id: "d-1".into() })
            .await
            .unwrap();
        assert_eq!(providers.kube_for("z1").restarts().await.len(), 1);
        assert!(platform.deployments.get("d-1").await.unwrap().restarted_at.is_some());
    }

    #[tokio::test]
    async fn test_owner_change_moves_namespace() {
        let (platform, providers) = created_deployment().await;
        let job = Job::UpdateDeploymentOwner {
            id: "d-1".into(),
            new_owner_id: "u-2".into(),
            migration_id: None,
        };
        run(&platform, "admin", &job).await.unwrap();

        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.owner_id, "u-2");
        let workloads = providers.kube_for("z1").backend.all::<K8sDeployment>().await;
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].namespace, naming::user_namespace("u-2"));
    }

    #[tokio::test]
    async fn test_vm_action_sets_status() {
        let (platform, _) = created_vm().await;
        let job = Job::DoVmAction {
            id: "v-1".into(),
            action: VmAction::Stop,
        };
        run(&platform, "u-1", &job).await.unwrap();
        let vm = platform.vms.get("v-1").await.unwrap();
        assert_eq!(vm.status_code, ResourceStatus::ResourceStopped);
    }

    #[tokio::test]
    async fn test_system_snapshots_are_pruned() {
        let (platform, _) = created_vm().await;
        let keep = platform.config.snapshots.keep;
        for n in 0..keep + 2 {
            let job = Job::CreateSystemSnapshot {
                id: "v-1".into(),
                name: format!("auto-{n}"),
            };
            run(&platform, "system", &job).await.unwrap();
        }
        let user = Job::CreateUserSnapshot {
            id: "v-1".into(),
            name: "mine".into(),
        };
        run(&platform, "u-1", &user).await.unwrap();

        let vm = platform.vms.get("v-1").await.unwrap();
        let snapshots = &vm.subsystems.cs.snapshot_map;
        assert_eq!(snapshots.values().filter(|s| !s.user_created).count(), keep);
        assert!(snapshots.contains_key("mine"));
        assert!(!snapshots.contains_key("auto-0"));
    }

    #[tokio::test]
    async fn test_gpu_attach_and_detach_keep_both_sides_in_sync() {
        let (platform, providers) = created_vm().await;
        providers
            .cloudstack_for("vz")
            .put_gpu(GpuDevice {
                id: "g-1".into(),
                name: "A100".into(),
                host: "host-1".into(),
            })
            .await;
        platform
            .persistence
            .upsert_gpu(&Gpu {
                id: "g-1".into(),
                name: "A100".into(),
                zone: "vz".into(),
                host: "host-1".into(),
                lease: None,
            })
            .await
            .unwrap();

        let attach = Job::AttachGpu {
            id: "v-1".into(),
            gpu_ids: vec!["g-1".into()],
            lease_hours: 2.0,
            never_expire: false,
        };
        run(&platform, "u-1", &attach).await.unwrap();
        let vm = platform.vms.get("v-1").await.unwrap();
        let gpu = platform.persistence.get_gpu("g-1").await.unwrap().unwrap();
        let lease = gpu.lease.unwrap();
        assert_eq!(vm.spec.gpu.as_ref().unwrap().id, "g-1");
        assert_eq!(lease.vm_id, "v-1");
        assert!(lease.ends_at > lease.created_at);
        assert_eq!(vm.subsystems.cs.vm.unwrap().gpu_id.as_deref(), Some("g-1"));

        run(&platform, "u-1", &Job::DetachGpu { id: "v-1".into() })
            .await
            .unwrap();
        let vm = platform.vms.get("v-1").await.unwrap();
        let gpu = platform.persistence.get_gpu("g-1").await.unwrap().unwrap();
        assert!(vm.spec.gpu.is_none());
        assert!(gpu.lease.is_none());
        assert!(vm.subsystems.cs.vm.unwrap().gpu_id.is_none());
    }

    #[tokio::test]
    async fn test_gpu_attach_rolls_back_on_rejection() {
        let (platform, _) = created_vm().await;
        // Known to the database but not installed on the hypervisor.
        platform
            .persistence
            .upsert_gpu(&Gpu {
                id: "ghost".into(),
                name: "A100".into(),
                zone: "vz".into(),
                host: "host-1".into(),
                lease: None,
            })
            .await
            .unwrap();
        let attach = Job::AttachGpu {
            id: "v-1".into(),
            gpu_ids: vec!["ghost".into()],
            lease_hours: 1.0,
            never_expire: false,
        };
        assert!(run(&platform, "u-1", &attach).await.is_err());
        let vm = platform.vms.get("v-1").await.unwrap();
        assert!(vm.spec.gpu.is_none());
        let gpu = platform.persistence.get_gpu("ghost").await.unwrap().unwrap();
        assert!(gpu.lease.is_none());
    }
}
