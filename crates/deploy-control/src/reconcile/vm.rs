// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM driver: public ports, CloudStack VM, port forwarding, HTTP proxies.

use std::collections::BTreeSet;

use deploy_core::model::{Vm, VmGpuRef, VmSpec};
use deploy_core::persistence::{ResourceFilter, UpdateParams};
use tracing::{debug, info};

use super::{KubeSync, Mode, Slot, delete, delete_all, sync_map};
use crate::config::{Capability, CloudStackIds};
use crate::error::{Error, Result};
use crate::generators;
use crate::platform::Platform;
use crate::zones::Zone;

fn slot<'a>(platform: &'a Platform, id: &'a str, path: &str) -> Slot<'a, VmSpec> {
    Slot::new(&platform.vms, id, path.to_string())
}

/// CloudStack identifiers of a VM zone.
pub fn cloudstack_ids(zone: &Zone) -> Result<&CloudStackIds> {
    zone.cloudstack
        .as_ref()
        .ok_or_else(|| Error::Internal(format!("zone {} has no CloudStack settings", zone.name)))
}

/// Give every port of VM `id` without a public port one from the zone range.
/// Returns whether the spec changed.
pub async fn allocate_ports(platform: &Platform, id: &str, zone: &Zone) -> Result<bool> {
    let Some(range) = zone.port_range else {
        return Ok(false);
    };

    let _guard = platform.lock_port_allocation().await;
    let vm = platform.vms.get(id).await?;
    if vm.spec.ports.iter().all(|p| p.public_port != 0) {
        return Ok(false);
    }

    let filter = ResourceFilter {
        zone: Some(zone.name.clone()),
        ..Default::default()
    };
    let used: BTreeSet<u16> = platform
        .vms
        .list(&filter, None)
        .await?
        .iter()
        .filter(|other| other.id != vm.id)
        .flat_map(|other| other.spec.ports.iter().map(|p| p.public_port))
        .filter(|port| *port != 0)
        .collect();

    let allocated = generators::cs::allocate_ports(&vm, &range, &used).ok_or_else(|| {
        Error::Conflict(format!("no free public port left in zone {}", zone.name))
    })?;
    let mut ports = vm.spec.ports.clone();
    for (index, public_port) in allocated {
        ports[index].public_port = public_port;
    }
    platform
        .vms
        .update_with_params(id, &UpdateParams::default().with_spec("ports", &ports)?)
        .await?;
    info!(vm_id = %id, "Allocated public ports");
    Ok(true)
}

/// Converge VM `id` using `mode`. Returns the number of provider objects
/// that changed.
pub async fn reconcile(platform: &Platform, id: &str, mode: Mode) -> Result<usize> {
    let vm = platform.vms.get(id).await?;
    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let ids = cloudstack_ids(zone)?;

    allocate_ports(platform, id, zone).await?;
    let vm = platform.vms.get(id).await?;

    let cs = platform.clients.cloudstack(zone).await?;
    let mut changes = 0;
    let desired = generators::cs::vm(&vm, ids);
    if mode
        .apply(
            cs.as_ref(),
            &slot(platform, id, "cs.vm"),
            Some(&desired),
            vm.subsystems.cs.vm.as_ref(),
        )
        .await?
    {
        changes += 1;
    }

    let vm = platform.vms.get(id).await?;
    let rules = generators::cs::port_forwarding_rules(&vm, ids);
    changes += sync_map(
        mode,
        cs.as_ref(),
        &slot(platform, id, "cs.portForwardingRuleMap"),
        &rules,
        &vm.subsystems.cs.port_forwarding_rule_map,
    )
    .await?;

    if mode == Mode::Repair {
        changes += forget_vanished_snapshots(platform, &vm, cs.as_ref()).await?;
    }

    let vm = platform.vms.get(id).await?;
    changes += sync_proxies(platform, &vm, zone, mode).await?;

    debug!(vm_id = %id, ?mode, changes, "VM reconciled");
    Ok(changes)
}

async fn forget_vanished_snapshots(
    platform: &Platform,
    vm: &Vm,
    cs: &dyn crate::providers::CloudStackApi,
) -> Result<usize> {
    let Some(cs_vm) = vm.subsystems.cs.vm.as_ref().filter(|v| !v.id.is_empty()) else {
        return Ok(0);
    };
    if vm.subsystems.cs.snapshot_map.is_empty() {
        return Ok(0);
    }

    let live: BTreeSet<String> = cs
        .list_snapshots(&cs_vm.id)
        .await?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let mut changes = 0;
    for (name, snapshot) in &vm.subsystems.cs.snapshot_map {
        if !live.contains(&snapshot.id) {
            slot(platform, &vm.id, &format!("cs.snapshotMap.{name}"))
                .write::<()>(None)
                .await?;
            changes += 1;
        }
    }
    Ok(changes)
}

async fn sync_proxies(platform: &Platform, vm: &Vm, zone: &Zone, mode: Mode) -> Result<usize> {
    let observed = &vm.subsystems.k8s;
    let wants_proxies = vm.spec.proxied_ports().next().is_some();
    if !wants_proxies && observed.is_empty() && observed.namespace.is_none() {
        return Ok(0);
    }

    let kube = platform.clients.kube(zone).await?;
    let sync = KubeSync::new(&kube, &platform.vms, &vm.id);
    if !wants_proxies {
        return sync.teardown(observed, false).await;
    }

    let cert = platform.wildcard_cert(kube.as_ref()).await;
    let params = platform.k8s_params(zone, cert.as_ref());
    let desired = generators::k8s::vm_proxies(vm, &params);
    sync.reconcile(mode, &desired, observed).await
}

/// Delete the HTTP proxies, which live in the owner's namespace, ahead of an
/// owner change. The CloudStack VM is kept.
pub async fn release_owner(platform: &Platform, id: &str) -> Result<usize> {
    let vm = platform.vms.get(id).await?;
    let k8s = &vm.subsystems.k8s;
    if k8s.is_empty() && k8s.namespace.is_none() {
        return Ok(0);
    }
    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let kube = platform.clients.kube(zone).await?;
    KubeSync::new(&kube, &platform.vms, id)
        .teardown(k8s, false)
        .await
}

/// Delete every provider object of VM `id`: proxies, forwarding rules,
/// snapshots, GPU leases and finally the VM itself.
pub async fn teardown(platform: &Platform, id: &str) -> Result<usize> {
    let Some(vm) = platform.vms.find_including_deleted(id).await? else {
        return Ok(0);
    };
    let zone = platform.zone(&vm.zone, Capability::Vm)?;
    let mut changes = 0;

    let k8s = &vm.subsystems.k8s;
    if !k8s.is_empty() || k8s.namespace.is_some() {
        let kube = platform.clients.kube(zone).await?;
        changes += KubeSync::new(&kube, &platform.vms, id)
            .teardown(k8s, false)
            .await?;
    }

    let cs = platform.clients.cloudstack(zone).await?;
    let cs = cs.as_ref();
    changes += delete_all(
        cs,
        &slot(platform, id, "cs.portForwardingRuleMap"),
        &vm.subsystems.cs.port_forwarding_rule_map,
    )
    .await?;
    changes += delete_all(
        cs,
        &slot(platform, id, "cs.snapshotMap"),
        &vm.subsystems.cs.snapshot_map,
    )
    .await?;

    let released = platform.persistence.release_gpus_for_vm(id).await?;
    if vm.spec.gpu.is_some() {
        let params = UpdateParams::default().with_spec("gpu", &None::<VmGpuRef>)?;
        platform.vms.update_with_params(id, &params).await?;
    }
    if released > 0 {
        info!(vm_id = %id, released, "Released GPU leases");
    }

    if delete(cs, &slot(platform, id, "cs.vm"), vm.subsystems.cs.vm.as_ref()).await? {
        changes += 1;
    }
    debug!(vm_id = %id, changes, "VM torn down");
    Ok(changes)
}
