// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPU inventory and lease requests.
//!
//! Leases are recorded by the `attachGpu` job handler; this module only
//! picks candidate GPUs, checks permissions and host capacity, and submits
//! the job.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use deploy_core::Activity;
use deploy_core::model::{Gpu, GpuLease, Vm};
use deploy_core::persistence::GpuFilter;

use super::vms::require_ready;
use super::{Accepted, Context, begin, submit_started};
use crate::config::{Capability, Permission};
use crate::error::{Error, Result};
use crate::jobs::Job;
use crate::platform::Platform;
use crate::providers::{CloudStackApi, HostCapacity};

/// Requested GPU meaning "whichever is free".
pub const ANY: &str = "any";

/// Longest lease anyone can request, in hours.
pub const MAX_LEASE_HOURS: f64 = 24.0 * 366.0;

pub(crate) fn any() -> String {
    ANY.to_string()
}

/// A GPU as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuRead {
    /// ID.
    pub id: String,
    /// Model name.
    pub name: String,
    /// Zone.
    pub zone: String,
    /// Host.
    pub host: String,
    /// Live lease; `null` when free.
    pub lease: Option<GpuLease>,
    /// Whether leasing needs the privileged permission.
    pub privileged: bool,
}

/// Parameters of an attach request.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachRequest {
    /// GPU ID or [`ANY`].
    pub gpu_id: String,
    /// Lease length in hours; the role quota when `None`.
    pub lease_hours: Option<f64>,
    /// Lease never expires.
    pub never_expire: bool,
}

fn is_privileged(platform: &Platform, gpu: &Gpu) -> bool {
    let privileged = &platform.config.gpu.privileged_gpus;
    privileged.contains(&gpu.id) || privileged.contains(&gpu.name)
}

/// GPUs the caller may lease, with their current leases.
pub async fn list(ctx: &Context) -> Result<Vec<GpuRead>> {
    let platform = &ctx.platform;
    let config = &platform.config.gpu;
    let filter = GpuFilter {
        exclude_hosts: config.excluded_hosts.clone(),
        exclude_ids: config.excluded_gpus.clone(),
        ..Default::default()
    };
    let now = Utc::now();
    let may_use_privileged = ctx.principal.has_permission(Permission::UsePrivilegedGpus);
    Ok(platform
        .persistence
        .list_gpus(&filter)
        .await?
        .into_iter()
        .filter(|gpu| may_use_privileged || !is_privileged(platform, gpu))
        .map(|gpu| GpuRead {
            privileged: is_privileged(platform, &gpu),
            lease: gpu.lease.filter(|l| !l.is_expired(now)),
            id: gpu.id,
            name: gpu.name,
            zone: gpu.zone,
            host: gpu.host,
        })
        .collect())
}

/// Fail with [`Error::VmTooLarge`] unless `host` has `cpu_cores` and `ram`
/// to spare.
pub async fn check_suitable_host(
    cs: &dyn CloudStackApi,
    host: &str,
    cpu_cores: u32,
    ram: u32,
) -> Result<()> {
    let capacity = cs.host_capacity(host).await?;
    ensure_fits(&capacity, cpu_cores, ram)
}

fn ensure_fits(capacity: &HostCapacity, cpu_cores: u32, ram: u32) -> Result<()> {
    if capacity.fits(cpu_cores, ram) {
        Ok(())
    } else {
        Err(Error::VmTooLarge {
            host: capacity.name.clone(),
            available_cpu_cores: capacity.free_cpu_cores(),
            available_ram: capacity.free_ram(),
        })
    }
}

/// Order candidates: GPUs on `preferred` first, then one GPU per host in
/// turn.
fn round_robin(gpus: Vec<Gpu>, preferred: Option<&str>) -> Vec<Gpu> {
    let mut by_host: BTreeMap<String, Vec<Gpu>> = BTreeMap::new();
    for gpu in gpus {
        by_host.entry(gpu.host.clone()).or_default().push(gpu);
    }

    let mut ordered = preferred
        .and_then(|host| by_host.remove(host))
        .unwrap_or_default();
    let mut queues: Vec<std::vec::IntoIter<Gpu>> =
        by_host.into_values().map(Vec::into_iter).collect();
    loop {
        let mut progressed = false;
        for queue in &mut queues {
            if let Some(gpu) = queue.next() {
                ordered.push(gpu);
                progressed = true;
            }
        }
        if !progressed {
            return ordered;
        }
    }
}

/// Request a GPU lease for `vm`.
pub async fn attach(
    ctx: &Context,
    vm: &Vm,
    job_id: Option<&str>,
    request: AttachRequest,
) -> Result<Accepted> {
    let platform = &ctx.platform;
    let principal = &ctx.principal;
    principal.require(Permission::UseGpus)?;
    if request.never_expire && !principal.admin {
        return Err(Error::Forbidden(
            "only administrators grant leases that never expire".to_string(),
        ));
    }
    require_ready(vm)?;
    if let Some(gpu) = &vm.spec.gpu {
        return Err(Error::Conflict(format!("VM {} already holds GPU {}", vm.id, gpu.id)));
    }

    let max_hours = principal.quotas().gpu_lease_duration;
    let lease_hours = request.lease_hours.unwrap_or(max_hours);
    if lease_hours.is_nan() || lease_hours <= 0.0 {
        return Err(Error::Validation("leaseHours must be positive".to_string()));
    }
    if lease_hours > MAX_LEASE_HOURS {
        return Err(Error::Validation(format!(
            "leaseHours must not exceed {MAX_LEASE_HOURS}"
        )));
    }
    if lease_hours > max_hours && !principal.admin {
        return Err(Error::QuotaExceeded {
            quota: "gpuLeaseDuration",
            current: 0,
            requested: lease_hours.ceil() as u64,
            limit: max_hours.floor() as u64,
        });
    }

    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let cs = platform.clients.cloudstack(zone).await?;
    let current_host = vm
        .subsystems
        .cs
        .vm
        .as_ref()
        .and_then(|v| v.host_name.as_deref());
    let specs = vm.spec.specs;
    let now = Utc::now();

    let gpu_ids = if request.gpu_id == ANY {
        let config = &platform.config.gpu;
        let privileged = if principal.has_permission(Permission::UsePrivilegedGpus) {
            Vec::new()
        } else {
            config.privileged_gpus.clone()
        };
        let mut exclude_ids = config.excluded_gpus.clone();
        exclude_ids.extend(privileged.iter().cloned());
        let filter = GpuFilter {
            zone: Some(vm.zone.clone()),
            available_at: Some(now),
            exclude_hosts: config.excluded_hosts.clone(),
            exclude_ids,
            exclude_names: privileged,
        };
        let free = platform.persistence.list_gpus(&filter).await?;
        if free.is_empty() {
            return Err(Error::Conflict(format!("no GPU is free in zone {}", vm.zone)));
        }

        let hosts = cs.list_hosts().await?;
        let fits = |host: &str| {
            current_host == Some(host)
                || hosts
                    .iter()
                    .any(|h| h.name == host && h.fits(specs.cpu_cores, specs.ram))
        };
        let (suitable, unsuitable): (Vec<Gpu>, Vec<Gpu>) =
            free.into_iter().partition(|gpu| fits(&gpu.host));
        if suitable.is_empty() {
            let host = &unsuitable[0].host;
            let capacity = hosts
                .iter()
                .find(|h| h.name == *host)
                .cloned()
                .unwrap_or(HostCapacity {
                    name: host.clone(),
                    cpu_cores_total: 0,
                    cpu_cores_used: 0,
                    ram_total: 0,
                    ram_allocated: 0,
                    enabled: false,
                });
            ensure_fits(&capacity, specs.cpu_cores, specs.ram)?;
        }
        let preferred = vm.spec.host.as_deref().or(current_host);
        round_robin(suitable, preferred)
            .into_iter()
            .map(|gpu| gpu.id)
            .collect()
    } else {
        let gpu = platform
            .persistence
            .get_gpu(&request.gpu_id)
            .await?
            .filter(|gpu| gpu.zone == vm.zone)
            .ok_or_else(|| Error::NotFound(format!("gpu {}", request.gpu_id)))?;
        if is_privileged(platform, &gpu) {
            principal.require(Permission::UsePrivilegedGpus)?;
        }
        if !gpu.is_available_for(&vm.id, now) {
            return Err(Error::Conflict(format!("GPU {} is leased", gpu.id)));
        }
        if current_host != Some(gpu.host.as_str()) {
            check_suitable_host(cs.as_ref(), &gpu.host, specs.cpu_cores, specs.ram).await?;
        }
        vec![gpu.id]
    };
    debug!(vm_id = %vm.id, candidates = gpu_ids.len(), "GPU candidates selected");

    begin(&platform.vms, &vm.id, Activity::AttachingGpu).await?;
    let job = Job::AttachGpu {
        id: vm.id.clone(),
        gpu_ids,
        lease_hours,
        never_expire: request.never_expire,
    };
    submit_started(ctx, &platform.vms, job_id, &job).await
}

/// Request release of the GPU leased to `vm`.
pub async fn detach(ctx: &Context, vm: &Vm, job_id: Option<&str>) -> Result<Accepted> {
    let platform = &ctx.platform;
    if vm.spec.gpu.is_none() {
        return Err(Error::NotFound(format!("GPU of VM {}", vm.id)));
    }
    begin(&platform.vms, &vm.id, Activity::DetachingGpu).await?;
    submit_started(
        ctx,
        &platform.vms,
        job_id,
        &Job::DetachGpu { id: vm.id.clone() },
    )
    .await
}

/// Refresh the GPU inventory of every VM zone from the hypervisors.
/// Returns the number of GPUs seen.
pub async fn sync_inventory(platform: &Platform) -> Result<usize> {
    let mut seen = 0;
    for zone in platform.zones.iter().filter(|z| z.has(Capability::Vm)) {
        let cs = platform.clients.cloudstack(zone).await?;
        for device in cs.list_gpus().await? {
            let gpu = Gpu {
                id: device.id,
                name: device.name,
                zone: zone.name.clone(),
                host: device.host,
                lease: None,
            };
            platform.persistence.upsert_gpu(&gpu).await?;
            seen += 1;
        }
    }
    info!(gpus = seen, "GPU inventory synchronised");
    Ok(seen)
}
