// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudStack objects as recorded in VM documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subsystem_object;

/// A CloudStack virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsVm {
    /// CloudStack VM UUID.
    #[serde(default)]
    pub id: String,
    /// VM name.
    pub name: String,
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// RAM in GB.
    pub ram: u32,
    /// Root disk size in GB.
    pub disk_size: u32,
    /// Template the VM was created from.
    pub template_id: String,
    /// Network the VM is attached to.
    pub network_id: String,
    /// CloudStack zone ID.
    pub zone_id: String,
    /// Host the VM is pinned to.
    #[serde(default)]
    pub host_name: Option<String>,
    /// Attached GPU device.
    #[serde(default)]
    pub gpu_id: Option<String>,
    /// Public key injected into the VM.
    #[serde(default)]
    pub ssh_public_key: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Port-forwarding rule on the zone's public IP.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardingRule {
    /// CloudStack rule UUID.
    #[serde(default)]
    pub id: String,
    /// Rule name (port name).
    pub name: String,
    /// Target VM.
    pub vm_id: String,
    /// Network holding the public IP.
    pub network_id: String,
    /// Public IP address ID.
    pub ip_address_id: String,
    /// Public port.
    pub public_port: u16,
    /// Port on the VM.
    pub private_port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsSnapshot {
    /// CloudStack snapshot UUID.
    #[serde(default)]
    pub id: String,
    /// Snapshot name.
    pub name: String,
    /// Snapshotted VM.
    pub vm_id: String,
    /// Free-form description (`auto-<schedule>` for system snapshots).
    #[serde(default)]
    pub description: String,
    /// Provider state.
    #[serde(default)]
    pub state: String,
    /// Whether the snapshot was created by a user.
    #[serde(default)]
    pub user_created: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

subsystem_object!(CsVm);
subsystem_object!(PortForwardingRule);
subsystem_object!(CsSnapshot);

/// Observed CloudStack state of one VM.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsSubsystem {
    /// The VM itself.
    #[serde(default)]
    pub vm: Option<CsVm>,
    /// Port-forwarding rules keyed by port name.
    #[serde(default)]
    pub port_forwarding_rule_map: BTreeMap<String, PortForwardingRule>,
    /// Snapshots keyed by name.
    #[serde(default)]
    pub snapshot_map: BTreeMap<String, CsSnapshot>,
}
