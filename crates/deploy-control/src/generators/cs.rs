// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudStack objects of a VM.

use std::collections::BTreeSet;

use deploy_core::model::Vm;
use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::cs::{CsVm, PortForwardingRule};

use crate::config::{CloudStackIds, PortRange};

/// The CloudStack VM backing `vm`.
///
/// Host and GPU placement are owned by the GPU jobs once the VM exists, so
/// they are carried over from the observed VM; `spec.host` only steers the
/// initial placement.
pub fn vm(vm: &Vm, ids: &CloudStackIds) -> CsVm {
    let observed = vm.subsystems.cs.vm.as_ref().filter(|o| o.is_created());
    let mut desired = CsVm {
        name: vm.name.clone(),
        cpu_cores: vm.spec.specs.cpu_cores,
        ram: vm.spec.specs.ram,
        disk_size: vm.spec.specs.disk_size,
        template_id: ids.template_id.clone(),
        network_id: ids.network_id.clone(),
        zone_id: ids.zone_id.clone(),
        host_name: vm.spec.host.clone(),
        gpu_id: None,
        ssh_public_key: vm.spec.ssh_public_key.clone(),
        ..Default::default()
    };
    if let Some(observed) = observed {
        desired.preserve_from(observed);
        desired.host_name = observed.host_name.clone();
        desired.gpu_id = observed.gpu_id.clone();
    }
    desired
}

/// Port-forwarding rules of `vm`, keyed by port name. Empty until the VM
/// exists; ports without an allocated public port are left out.
pub fn port_forwarding_rules(vm: &Vm, ids: &CloudStackIds) -> Vec<PortForwardingRule> {
    let Some(cs_vm) = vm.subsystems.cs.vm.as_ref().filter(|o| o.is_created()) else {
        return Vec::new();
    };
    let observed = &vm.subsystems.cs.port_forwarding_rule_map;

    vm.spec
        .ports
        .iter()
        .filter(|p| p.public_port != 0)
        .map(|port| {
            let mut rule = PortForwardingRule {
                name: port.name.clone(),
                vm_id: cs_vm.id.clone(),
                network_id: ids.network_id.clone(),
                ip_address_id: ids.ip_address_id.clone(),
                public_port: port.public_port,
                private_port: port.port,
                protocol: port.protocol.to_lowercase(),
                ..Default::default()
            };
            if let Some(obs) = observed.get(&port.name).filter(|o| o.is_created()) {
                rule.preserve_from(obs);
            }
            rule
        })
        .collect()
}

/// Pick public ports for every port of `vm` that has none, avoiding `used`.
/// Returns `(port index, public port)` pairs, or `None` when the range is
/// exhausted.
pub fn allocate_ports(
    vm: &Vm,
    range: &PortRange,
    used: &BTreeSet<u16>,
) -> Option<Vec<(usize, u16)>> {
    let mut taken: BTreeSet<u16> = used.clone();
    taken.extend(vm.spec.ports.iter().map(|p| p.public_port).filter(|p| *p != 0));

    let mut candidates = (range.start..range.end).filter(|p| !taken.contains(p));
    let mut allocated = Vec::new();
    for (index, port) in vm.spec.ports.iter().enumerate() {
        if port.public_port != 0 {
            continue;
        }
        allocated.push((index, candidates.next()?));
    }
    Some(allocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::model::VmSpec;
    use deploy_core::model::vm::{VmPort, VmSpecs};

    fn ids() -> CloudStackIds {
        CloudStackIds {
            zone_id: "cs-zone".to_string(),
            template_id: "tpl".to_string(),
            network_id: "net".to_string(),
            ip_address_id: "ip".to_string(),
            ..Default::default()
        }
    }

    fn port(name: &str, port: u16, public_port: u16) -> VmPort {
        VmPort {
            name: name.to_string(),
            port,
            protocol: "TCP".to_string(),
            public_port,
            http_proxy: None,
        }
    }

    fn sample() -> Vm {
        Vm::new(
            "v-1",
            "v1",
            "u-1",
            "z1",
            VmSpec {
                ssh_public_key: "ssh-ed25519 AAAA".to_string(),
                specs: VmSpecs {
                    cpu_cores: 2,
                    ram: 4,
                    disk_size: 20,
                },
                ports: vec![port("ssh", 22, 30000), port("http", 80, 0)],
                host: Some("host-2".to_string()),
                gpu: None,
            },
        )
    }

    #[test]
    fn test_vm_uses_spec_host_before_creation() {
        let v = sample();
        let desired = vm(&v, &ids());
        assert_eq!(desired.host_name.as_deref(), Some("host-2"));
        assert_eq!(desired.template_id, "tpl");
    }

    #[test]
    fn test_vm_keeps_observed_placement() {
        let mut v = sample();
        v.subsystems.cs.vm = Some(CsVm {
            id: "vm-9".to_string(),
            host_name: Some("host-3".to_string()),
            gpu_id: Some("10de-host-3".to_string()),
            ..vm(&v, &ids())
        });
        let desired = vm(&v, &ids());
        assert_eq!(desired.id, "vm-9");
        assert_eq!(desired.host_name.as_deref(), Some("host-3"));
        assert_eq!(desired.gpu_id.as_deref(), Some("10de-host-3"));
    }

    #[test]
    fn test_rules_need_vm_and_public_port() {
        let mut v = sample();
        assert!(port_forwarding_rules(&v, &ids()).is_empty());

        v.subsystems.cs.vm = Some(CsVm {
            id: "vm-9".to_string(),
            ..vm(&v, &ids())
        });
        let rules = port_forwarding_rules(&v, &ids());
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "ssh");
        assert_eq!(rules[0].vm_id, "vm-9");
        assert_eq!(rules[0].protocol, "tcp");
    }

    #[test]
    fn test_allocate_ports_skips_used() {
        let v = sample();
        let range = PortRange {
            start: 30000,
            end: 30003,
        };
        let used = BTreeSet::from([30001]);
        assert_eq!(allocate_ports(&v, &range, &used), Some(vec![(1, 30002)]));

        let used = BTreeSet::from([30001, 30002]);
        assert_eq!(allocate_ports(&v, &range, &used), None);
    }
}
