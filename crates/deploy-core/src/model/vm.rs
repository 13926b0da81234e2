// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual machine documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subsystems::cs::CsSubsystem;
use super::subsystems::k8s::K8sSubsystem;
use super::{Document, ResourceKind, ResourceSpec};

/// Compute specs of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpecs {
    /// Number of CPU cores.
    pub cpu_cores: u32,
    /// RAM in GB.
    pub ram: u32,
    /// Root disk size in GB.
    pub disk_size: u32,
}

/// HTTP proxy exposing a VM port on `<name>.<vmParentDomain>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpProxy {
    /// Proxy name (also the subdomain).
    pub name: String,
    /// Optional user-owned hostname.
    #[serde(default)]
    pub custom_domain: Option<String>,
}

/// A forwarded VM port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmPort {
    /// Port name, unique within the VM.
    pub name: String,
    /// Port on the VM.
    pub port: u16,
    /// `tcp` or `udp`.
    pub protocol: String,
    /// Public port allocated from the zone's port range (0 until allocated).
    #[serde(default)]
    pub public_port: u16,
    /// Optional HTTP proxy.
    #[serde(default)]
    pub http_proxy: Option<HttpProxy>,
}

/// Reference from a VM to its leased GPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmGpuRef {
    /// Leased GPU ID.
    pub id: String,
    /// Lease end.
    pub lease_end: DateTime<Utc>,
    /// Whether the lease never expires.
    #[serde(default)]
    pub never_expire: bool,
}

/// Declared state of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    /// Public key injected into the VM.
    pub ssh_public_key: String,
    /// Compute specs.
    pub specs: VmSpecs,
    /// Forwarded ports.
    #[serde(default)]
    pub ports: Vec<VmPort>,
    /// Host affinity (set while a GPU is leased).
    #[serde(default)]
    pub host: Option<String>,
    /// Current GPU lease.
    #[serde(default)]
    pub gpu: Option<VmGpuRef>,
}

impl VmSpec {
    /// Ports exposing an HTTP proxy.
    pub fn proxied_ports(&self) -> impl Iterator<Item = (&VmPort, &HttpProxy)> {
        self.ports
            .iter()
            .filter_map(|p| p.http_proxy.as_ref().map(|proxy| (p, proxy)))
    }
}

/// Observed provider state of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSubsystems {
    /// CloudStack objects.
    #[serde(default)]
    pub cs: CsSubsystem,
    /// Kubernetes HTTP-proxy objects.
    #[serde(default)]
    pub k8s: K8sSubsystem,
}

impl ResourceSpec for VmSpec {
    const KIND: ResourceKind = ResourceKind::Vm;
    type Subsystems = VmSubsystems;
}

/// A VM document.
pub type Vm = Document<VmSpec>;
