// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM commands.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use deploy_core::Activity;
use deploy_core::model::subsystems::cs::CsSnapshot;
use deploy_core::model::vm::{HttpProxy, VmSpecs};
use deploy_core::model::{Pagination, ResourceStatus, Vm, VmGpuRef, VmPort, VmSpec};
use deploy_core::persistence::{ResourceFilter, UpdateParams};

use super::deployments::ensure_domain_free;
use super::quotas::{self, Usage};
use super::{
    Accepted, Context, begin, existing_submission, gpus, submit_started, validate_domain,
    validate_name,
};
use crate::config::{Capability, Permission};
use crate::error::{Error, Result};
use crate::jobs::Job;
use crate::platform::Platform;
use crate::providers::VmAction;

/// A port as requested by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PortRequest {
    /// Name, unique within the VM.
    pub name: String,
    /// Port on the VM.
    pub port: u16,
    /// `tcp` or `udp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// HTTP proxy in front of the port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxy>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// `POST /v1/vms` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VmCreate {
    /// Name.
    pub name: String,
    /// Zone; the first VM zone when omitted.
    #[serde(default)]
    pub zone: Option<String>,
    /// Public key injected into the VM.
    pub ssh_public_key: String,
    /// CPU cores.
    pub cpu_cores: u32,
    /// RAM in GB.
    pub ram: u32,
    /// Root disk in GB.
    pub disk_size: u32,
    /// Forwarded ports.
    #[serde(default)]
    pub ports: Vec<PortRequest>,
}

/// `POST /v1/vms/{id}` body. Absent fields stay unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VmUpdate {
    /// New name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Replacement port list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortRequest>>,
    /// New CPU core count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    /// New RAM in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<u32>,
    /// New disk size in GB; disks only grow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u32>,
}

impl VmUpdate {
    /// Compute specs after the update.
    pub fn specs(&self, current: VmSpecs) -> VmSpecs {
        VmSpecs {
            cpu_cores: self.cpu_cores.unwrap_or(current.cpu_cores),
            ram: self.ram.unwrap_or(current.ram),
            disk_size: self.disk_size.unwrap_or(current.disk_size),
        }
    }

    /// Writes that bring `vm` to the requested state. Public ports already
    /// allocated to unchanged ports are kept.
    pub fn params(&self, vm: &Vm) -> Result<UpdateParams> {
        let mut params = UpdateParams::default();
        if let Some(name) = self.name.as_ref().filter(|n| **n != vm.name) {
            params.name = Some(name.clone());
        }
        let specs = self.specs(vm.spec.specs);
        if specs != vm.spec.specs {
            params = params.with_spec("specs", &specs)?;
        }
        if let Some(requested) = &self.ports {
            let ports = merge_ports(requested, &vm.spec.ports);
            if ports != vm.spec.ports {
                params = params.with_spec("ports", &ports)?;
            }
        }
        Ok(params)
    }
}

/// Turn requested ports into VM ports, keeping the public port of every
/// port whose name, number and protocol did not change.
pub fn merge_ports(requested: &[PortRequest], existing: &[VmPort]) -> Vec<VmPort> {
    requested
        .iter()
        .map(|req| {
            let public_port = existing
                .iter()
                .find(|p| p.name == req.name && p.port == req.port && p.protocol == req.protocol)
                .map_or(0, |p| p.public_port);
            VmPort {
                name: req.name.clone(),
                port: req.port,
                protocol: req.protocol.clone(),
                public_port,
                http_proxy: req.http_proxy.clone(),
            }
        })
        .collect()
}

fn validate_ports(ports: &[PortRequest]) -> Result<()> {
    let mut names = BTreeSet::new();
    let mut proxies = BTreeSet::new();
    for port in ports {
        validate_name(&port.name)?;
        if !names.insert(port.name.as_str()) {
            return Err(Error::Validation(format!("duplicate port name {}", port.name)));
        }
        if port.port == 0 {
            return Err(Error::Validation(format!("port {} needs a port number", port.name)));
        }
        if port.protocol != "tcp" && port.protocol != "udp" {
            return Err(Error::Validation(format!(
                "port {} has unknown protocol {}",
                port.name, port.protocol
            )));
        }
        if let Some(proxy) = &port.http_proxy {
            if port.protocol != "tcp" {
                return Err(Error::Validation(format!(
                    "HTTP proxy on port {} needs tcp",
                    port.name
                )));
            }
            validate_name(&proxy.name)?;
            if !proxies.insert(proxy.name.as_str()) {
                return Err(Error::Validation(format!("duplicate proxy name {}", proxy.name)));
            }
            if let Some(domain) = &proxy.custom_domain {
                validate_domain(domain)?;
            }
        }
    }
    Ok(())
}

fn validate_specs(specs: VmSpecs) -> Result<()> {
    if specs.cpu_cores == 0 || specs.ram == 0 || specs.disk_size == 0 {
        return Err(Error::Validation(
            "cpuCores, ram and diskSize must be positive".to_string(),
        ));
    }
    Ok(())
}

fn validate_ssh_key(key: &str) -> Result<()> {
    const KEY_TYPES: [&str; 4] = ["ssh-rsa ", "ssh-ed25519 ", "ecdsa-sha2-", "sk-"];
    if KEY_TYPES.iter().any(|t| key.trim_start().starts_with(t)) {
        Ok(())
    } else {
        Err(Error::Validation("sshPublicKey is not an OpenSSH public key".to_string()))
    }
}

/// Proxy names become hostnames, so they are unique across VMs. Custom
/// domains are unique across VMs and deployments.
async fn ensure_proxies_free(ctx: &Context, ports: &[PortRequest], except_id: &str) -> Result<()> {
    let platform = &ctx.platform;
    let wanted: Vec<&HttpProxy> = ports.iter().filter_map(|p| p.http_proxy.as_ref()).collect();
    if wanted.is_empty() {
        return Ok(());
    }

    let taken: BTreeSet<String> = platform
        .vms
        .list(&ResourceFilter::default(), None)
        .await?
        .iter()
        .filter(|vm| vm.id != except_id)
        .flat_map(|vm| vm.spec.proxied_ports().map(|(_, proxy)| proxy.name.clone()))
        .collect();
    for proxy in wanted {
        if taken.contains(&proxy.name) {
            return Err(Error::Conflict(format!(
                "proxy name {} is already taken",
                proxy.name
            )));
        }
        if let Some(domain) = &proxy.custom_domain {
            ctx.principal.require(Permission::UseCustomDomains)?;
            ensure_domain_free(platform, domain, except_id).await?;
        }
    }
    Ok(())
}

/// `POST /v1/vms/{id}/command` body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VmCommand {
    /// Power on.
    Start,
    /// Power off.
    Stop,
    /// Reboot.
    Reboot,
    /// Re-converge every provider object now.
    Repair,
    /// Take a snapshot.
    CreateSnapshot {
        /// Snapshot name.
        name: String,
    },
    /// Delete a user snapshot.
    DeleteSnapshot {
        /// Snapshot name.
        name: String,
    },
    /// Lease and attach a GPU.
    AttachGpu {
        /// GPU ID or `any`.
        #[serde(default = "gpus::any")]
        gpu_id: String,
        /// Lease length in hours; the role quota when omitted.
        #[serde(default)]
        lease_hours: Option<f64>,
        /// Lease never expires (administrators only).
        #[serde(default)]
        never_expire: bool,
    },
    /// Detach and release the leased GPU.
    DetachGpu,
}

/// A port as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRead {
    /// Name.
    pub name: String,
    /// Port on the VM.
    pub port: u16,
    /// Protocol.
    pub protocol: String,
    /// Public port; absent until allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    /// HTTP proxy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<HttpProxy>,
    /// Proxy URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// VM as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRead {
    /// ID.
    pub id: String,
    /// Name.
    pub name: String,
    /// Owner.
    pub owner_id: String,
    /// Zone.
    pub zone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Last repair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired_at: Option<DateTime<Utc>>,
    /// Public key.
    pub ssh_public_key: String,
    /// Compute specs.
    pub specs: VmSpecs,
    /// Ports.
    pub ports: Vec<PortRead>,
    /// Host the VM is pinned to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Leased GPU; `null` when none.
    pub gpu: Option<VmGpuRef>,
    /// Snapshots, oldest first.
    pub snapshots: Vec<CsSnapshot>,
    /// In-progress operations.
    pub activities: Vec<Activity>,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Status detail.
    pub status_message: String,
}

impl VmRead {
    /// API view of `vm`.
    pub fn new(platform: &Platform, vm: &Vm) -> Self {
        let zone = platform.zones.get(&vm.zone);
        let ports = vm
            .spec
            .ports
            .iter()
            .map(|p| PortRead {
                name: p.name.clone(),
                port: p.port,
                protocol: p.protocol.clone(),
                public_port: (p.public_port != 0).then_some(p.public_port),
                http_proxy: p.http_proxy.clone(),
                url: p
                    .http_proxy
                    .as_ref()
                    .zip(zone)
                    .map(|(proxy, zone)| format!("https://{}", zone.vm_proxy_host(&proxy.name))),
            })
            .collect();
        let mut snapshots: Vec<CsSnapshot> =
            vm.subsystems.cs.snapshot_map.values().cloned().collect();
        snapshots.sort_by_key(|s| s.created_at);

        Self {
            id: vm.id.clone(),
            name: vm.name.clone(),
            owner_id: vm.owner_id.clone(),
            zone: vm.zone.clone(),
            created_at: vm.created_at,
            updated_at: vm.updated_at,
            repaired_at: vm.repaired_at,
            ssh_public_key: vm.spec.ssh_public_key.clone(),
            specs: vm.spec.specs,
            ports,
            host: vm.spec.host.clone(),
            gpu: vm.spec.gpu.clone(),
            snapshots,
            activities: vm.activities.iter().copied().collect(),
            status: vm.status_code,
            status_message: vm.status_message.clone(),
        }
    }
}

/// VMs visible to the caller. Admins may pass `all` to see everyone's.
pub async fn list(ctx: &Context, all: bool, page: Option<Pagination>) -> Result<Vec<VmRead>> {
    let filter = ResourceFilter {
        owner_ids: (!(all && ctx.principal.admin)).then(|| vec![ctx.principal.user_id.clone()]),
        ..Default::default()
    };
    Ok(ctx
        .platform
        .vms
        .list(&filter, page)
        .await?
        .iter()
        .map(|vm| VmRead::new(&ctx.platform, vm))
        .collect())
}

/// VM `id`.
pub async fn get(ctx: &Context, id: &str) -> Result<VmRead> {
    let vm = ctx.vm(id).await?;
    Ok(VmRead::new(&ctx.platform, &vm))
}

/// Create a VM. Resubmitting with the same `job_id` returns the first
/// submission.
pub async fn create(ctx: &Context, job_id: Option<&str>, req: VmCreate) -> Result<Accepted> {
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }

    let platform = &ctx.platform;
    let principal = &ctx.principal;
    validate_name(&req.name)?;
    validate_ssh_key(&req.ssh_public_key)?;
    let specs = VmSpecs {
        cpu_cores: req.cpu_cores,
        ram: req.ram,
        disk_size: req.disk_size,
    };
    validate_specs(specs)?;
    validate_ports(&req.ports)?;
    let zone = match &req.zone {
        Some(name) => platform.zone(name, Capability::Vm)?,
        None => platform
            .zones
            .default_for(Capability::Vm)
            .ok_or_else(|| Error::Validation("no zone hosts VMs".to_string()))?,
    };

    let usage = Usage::of(platform, &principal.user_id, None).await?;
    let limits = principal.quotas();
    quotas::check("cpuCores", usage.cpu_cores, specs.cpu_cores.into(), limits.cpu_cores)?;
    quotas::check("ram", usage.ram, specs.ram.into(), limits.ram)?;
    quotas::check("diskSize", usage.disk_size, specs.disk_size.into(), limits.disk_size)?;

    if platform.vms.get_by_name(&req.name).await?.is_some() {
        return Err(Error::Conflict(format!("name {} is already taken", req.name)));
    }
    ensure_proxies_free(ctx, &req.ports, "").await?;

    let id = Uuid::new_v4().to_string();
    let spec = VmSpec {
        ssh_public_key: req.ssh_public_key.trim().to_string(),
        specs,
        ports: merge_ports(&req.ports, &[]),
        host: None,
        gpu: None,
    };
    let vm = Vm::new(
        id.clone(),
        req.name,
        principal.user_id.clone(),
        zone.name.clone(),
        spec,
    );
    platform.vms.create(&vm).await?;
    info!(vm_id = %id, name = %vm.name, zone = %vm.zone, "VM created");
    submit_started(ctx, &platform.vms, job_id, &Job::CreateVm { id }).await
}

/// Update VM `id`. A request that changes nothing submits no job.
pub async fn update(
    ctx: &Context,
    id: &str,
    job_id: Option<&str>,
    req: VmUpdate,
) -> Result<Accepted> {
    let platform = &ctx.platform;
    if let Some(name) = &req.name {
        validate_name(name)?;
    }
    if let Some(ports) = &req.ports {
        validate_ports(ports)?;
    }
    let vm = ctx.vm(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    if let Some(blocking) = Activity::Updating.blocked_by(&vm.activities) {
        return Err(Error::ActivityBlocked(blocking));
    }
    let specs = req.specs(vm.spec.specs);
    validate_specs(specs)?;
    if specs.disk_size < vm.spec.specs.disk_size {
        return Err(Error::Validation("diskSize cannot shrink".to_string()));
    }

    let params = req.params(&vm)?;
    if params.is_empty() {
        return Ok(Accepted {
            id: id.to_string(),
            job_id: None,
        });
    }
    if let Some(name) = &params.name
        && platform.vms.get_by_name(name).await?.is_some()
    {
        return Err(Error::Conflict(format!("name {name} is already taken")));
    }
    if let Some(ports) = &req.ports {
        ensure_proxies_free(ctx, ports, id).await?;
    }

    if specs != vm.spec.specs {
        let usage = Usage::of(platform, &vm.owner_id, Some(id)).await?;
        let limits = ctx.principal.quotas();
        quotas::check("cpuCores", usage.cpu_cores, specs.cpu_cores.into(), limits.cpu_cores)?;
        quotas::check("ram", usage.ram, specs.ram.into(), limits.ram)?;
        quotas::check("diskSize", usage.disk_size, specs.disk_size.into(), limits.disk_size)?;

        if let Some(host) = &vm.spec.host {
            let zone = platform.zone(&vm.zone, Capability::Vm)?;
            let cs = platform.clients.cloudstack(zone).await?;
            gpus::check_suitable_host(
                cs.as_ref(),
                host,
                specs.cpu_cores.saturating_sub(vm.spec.specs.cpu_cores),
                specs.ram.saturating_sub(vm.spec.specs.ram),
            )
            .await?;
        }
    }

    begin(&platform.vms, id, Activity::Updating).await?;
    submit_started(
        ctx,
        &platform.vms,
        job_id,
        &Job::UpdateVm {
            id: id.to_string(),
            update: req,
        },
    )
    .await
}

/// Delete VM `id`.
pub async fn delete(ctx: &Context, id: &str, job_id: Option<&str>) -> Result<Accepted> {
    let platform = &ctx.platform;
    ctx.vm(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    begin(&platform.vms, id, Activity::BeingDeleted).await?;
    platform
        .vms
        .set_status(id, ResourceStatus::ResourceBeingDeleted, "Resource is being deleted")
        .await?;
    submit_started(ctx, &platform.vms, job_id, &Job::DeleteVm { id: id.to_string() }).await
}

/// Run `command` on VM `id`.
pub async fn command(
    ctx: &Context,
    id: &str,
    job_id: Option<&str>,
    command: VmCommand,
) -> Result<Accepted> {
    let platform = &ctx.platform;
    let vm = ctx.vm(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    let id = id.to_string();
    let power = |action| (Activity::Updating, Job::DoVmAction { id: id.clone(), action });
    let (activity, job) = match command {
        VmCommand::Start => power(VmAction::Start),
        VmCommand::Stop => power(VmAction::Stop),
        VmCommand::Reboot => power(VmAction::Reboot),
        VmCommand::Repair => (Activity::Repairing, Job::RepairVm { id: id.clone() }),
        VmCommand::CreateSnapshot { name } => {
            return create_snapshot(ctx, &vm, job_id, name).await;
        }
        VmCommand::DeleteSnapshot { name } => {
            return delete_snapshot(ctx, &vm, job_id, name).await;
        }
        VmCommand::AttachGpu {
            gpu_id,
            lease_hours,
            never_expire,
        } => {
            let request = gpus::AttachRequest {
                gpu_id,
                lease_hours,
                never_expire,
            };
            return gpus::attach(ctx, &vm, job_id, request).await;
        }
        VmCommand::DetachGpu => return gpus::detach(ctx, &vm, job_id).await,
    };
    begin(&platform.vms, &id, activity).await?;
    submit_started(ctx, &platform.vms, job_id, &job).await
}

pub(crate) fn require_ready(vm: &Vm) -> Result<()> {
    if vm.is_being_deleted() {
        Err(Error::ActivityBlocked(Activity::BeingDeleted))
    } else if vm.has_activity(Activity::BeingCreated) {
        Err(Error::ActivityBlocked(Activity::BeingCreated))
    } else {
        Ok(())
    }
}

async fn create_snapshot(
    ctx: &Context,
    vm: &Vm,
    job_id: Option<&str>,
    name: String,
) -> Result<Accepted> {
    validate_name(&name)?;
    require_ready(vm)?;
    if vm.subsystems.cs.snapshot_map.contains_key(&name) {
        return Err(Error::Conflict(format!("snapshot {name} already exists")));
    }
    let user_snapshots = vm
        .subsystems
        .cs
        .snapshot_map
        .values()
        .filter(|s| s.user_created)
        .count() as u64;
    quotas::check("snapshots", user_snapshots, 1, ctx.principal.quotas().snapshots)?;

    let job = Job::CreateUserSnapshot {
        id: vm.id.clone(),
        name,
    };
    submit_started(ctx, &ctx.platform.vms, job_id, &job).await
}

async fn delete_snapshot(
    ctx: &Context,
    vm: &Vm,
    job_id: Option<&str>,
    name: String,
) -> Result<Accepted> {
    require_ready(vm)?;
    let snapshot = vm
        .subsystems
        .cs
        .snapshot_map
        .get(&name)
        .ok_or_else(|| Error::NotFound(format!("snapshot {name}")))?;
    if !snapshot.user_created && !ctx.principal.admin {
        return Err(Error::Forbidden(format!(
            "snapshot {name} is managed by the snapshot schedule"
        )));
    }
    let job = Job::DeleteSnapshot {
        id: vm.id.clone(),
        name,
    };
    submit_started(ctx, &ctx.platform.vms, job_id, &job).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm() -> Vm {
        let spec = VmSpec {
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
            specs: VmSpecs {
                cpu_cores: 2,
                ram: 4,
                disk_size: 20,
            },
            ports: vec![VmPort {
                name: "ssh".to_string(),
                port: 22,
                protocol: "tcp".to_string(),
                public_port: 30022,
                http_proxy: None,
            }],
            host: None,
            gpu: None,
        };
        Vm::new("vm-1", "v1", "u-1", "vz", spec)
    }

    fn port(name: &str, port: u16) -> PortRequest {
        PortRequest {
            name: name.to_string(),
            port,
            protocol: "tcp".to_string(),
            http_proxy: None,
        }
    }

    #[test]
    fn test_merge_keeps_allocated_ports() {
        let existing = vm().spec.ports;
        let merged = merge_ports(&[port("ssh", 22), port("web", 80)], &existing);
        assert_eq!(merged[0].public_port, 30022);
        assert_eq!(merged[1].public_port, 0);

        let moved = merge_ports(&[port("ssh", 2222)], &existing);
        assert_eq!(moved[0].public_port, 0);
    }

    #[test]
    fn test_unchanged_update_is_empty() {
        let vm = vm();
        let update = VmUpdate {
            name: Some("v1".to_string()),
            ports: Some(vec![port("ssh", 22)]),
            cpu_cores: Some(2),
            ..Default::default()
        };
        assert!(update.params(&vm).unwrap().is_empty());
    }

    #[test]
    fn test_resize_writes_specs() {
        let update = VmUpdate {
            ram: Some(8),
            ..Default::default()
        };
        let params = update.params(&vm()).unwrap();
        assert_eq!(params.spec.len(), 1);
        assert_eq!(params.spec[0].1["ram"], 8);
        assert_eq!(params.spec[0].1["cpuCores"], 2);
    }

    #[test]
    fn test_port_validation() {
        assert!(validate_ports(&[port("ssh", 22), port("ssh", 23)]).is_err());
        assert!(validate_ports(&[port("ssh", 0)]).is_err());
        let mut udp = port("dns", 53);
        udp.protocol = "udp".to_string();
        assert!(validate_ports(&[udp.clone()]).is_ok());
        udp.http_proxy = Some(HttpProxy {
            name: "dns".to_string(),
            custom_domain: None,
        });
        assert!(validate_ports(&[udp]).is_err());
    }

    #[test]
    fn test_ssh_key_validation() {
        assert!(validate_ssh_key("ssh-ed25519 AAAAC3Nz user@host").is_ok());
        assert!(validate_ssh_key("not a key").is_err());
    }

    #[test]
    fn test_command_parsing() {
        let cmd: VmCommand =
            serde_json::from_str(r#"{"command":"createSnapshot","name":"before-upgrade"}"#)
                .unwrap();
        assert_eq!(
            cmd,
            VmCommand::CreateSnapshot {
                name: "before-upgrade".to_string()
            }
        );
        let cmd: VmCommand = serde_json::from_str(r#"{"command":"reboot"}"#).unwrap();
        assert_eq!(cmd, VmCommand::Reboot);
        let cmd: VmCommand =
            serde_json::from_str(r#"{"command":"attachGpu","leaseHours":2.5}"#).unwrap();
        assert_eq!(
            cmd,
            VmCommand::AttachGpu {
                gpu_id: "any".to_string(),
                lease_hours: Some(2.5),
                never_expire: false,
            }
        );
    }
}
