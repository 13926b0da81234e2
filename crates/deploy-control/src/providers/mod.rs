// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provider clients.
//!
//! Every backing system (Kubernetes, CloudStack, Harbor, GitHub) is reached
//! through [`Provider<T>`], one CRUD quartet per object type, plus a small
//! zone-level trait carrying the operations that are not plain CRUD
//! (restarts, GPU attachment, host capacity).
//!
//! Two implementations ship with the crate:
//!
//! - [`memory`]: in-process providers that count mutating calls. Used in
//!   tests and in `--test-mode`.
//! - [`http`]: REST clients built on `reqwest`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use deploy_core::model::subsystems::cs::{CsSnapshot, CsVm, PortForwardingRule};
use deploy_core::model::subsystems::github::GithubWebhook;
use deploy_core::model::subsystems::harbor::{
    HarborProject, HarborRepository, HarborRobot, HarborWebhook,
};
use deploy_core::model::subsystems::k8s::{
    Ingress, K8sDeployment, K8sJob, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
    Service,
};

pub mod factory;
pub mod http;
pub mod memory;

pub use factory::{ProviderFactory, ZoneClients};

/// Errors reported by provider clients.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// 5xx, timeout or connection failure; the call may be retried.
    #[error("provider unavailable: {0}")]
    Transient(String),

    /// The provider rejected the request or returned something unusable.
    #[error("provider rejected request: {0}")]
    Permanent(String),

    /// The object does not exist on the provider.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object kind.
        kind: &'static str,
        /// Object name or ID.
        name: String,
    },

    /// Another ingress already routes this host.
    #[error("ingress host '{0}' is already in use")]
    IngressHostInUse(String),

    /// The host cannot fit the VM.
    #[error(
        "vm does not fit on host {host}: {available_cpu_cores} cpu cores and {available_ram} GB ram available"
    )]
    VmTooLarge {
        /// Host that was checked.
        host: String,
        /// Free CPU cores on the host.
        available_cpu_cores: u32,
        /// Free RAM (GB) on the host.
        available_ram: u32,
    },
}

impl ProviderError {
    /// Build a [`ProviderError::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether the call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => Self::Transient(err.to_string()),
            Some(status) if status == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Self::Transient(err.to_string())
            }
            _ => Self::Permanent(err.to_string()),
        }
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// CRUD access to one object type on one provider.
///
/// `read` and `delete` receive the observed object so each provider can pick
/// its own lookup key (namespace and name for Kubernetes, UUID for CloudStack).
/// `delete` tolerates objects that are already gone.
#[async_trait]
pub trait Provider<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Fetch the live object; `None` when it no longer exists.
    async fn read(&self, observed: &T) -> ProviderResult<Option<T>>;

    /// Create the object and return it with provider-assigned fields set.
    async fn create(&self, desired: &T) -> ProviderResult<T>;

    /// Update the object in place and return the live result.
    async fn update(&self, desired: &T) -> ProviderResult<T>;

    /// Delete the object.
    async fn delete(&self, observed: &T) -> ProviderResult<()>;
}

/// Live state of a Kubernetes workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Replicas requested by the spec.
    pub desired_replicas: u32,
    /// Replicas reporting ready.
    pub ready_replicas: u32,
    /// Whether any pod is crash-looping or failed to pull.
    pub failing: bool,
}

/// Kubernetes operations for one zone.
#[async_trait]
pub trait KubeApi:
    Provider<Namespace>
    + Provider<Secret>
    + Provider<PersistentVolume>
    + Provider<PersistentVolumeClaim>
    + Provider<K8sDeployment>
    + Provider<Service>
    + Provider<Ingress>
    + Provider<K8sJob>
{
    /// Data of a secret outside the user namespaces (the wildcard certificate).
    async fn read_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>>;

    /// Trigger a rolling restart of a workload.
    async fn restart_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()>;

    /// Replica status of a workload; `None` when it does not exist.
    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<WorkloadStatus>>;

    /// Last `tail` log lines across the pods of a workload, oldest first.
    async fn workload_logs(
        &self,
        namespace: &str,
        name: &str,
        tail: usize,
    ) -> ProviderResult<Vec<String>>;
}

/// Capacity figures of one hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostCapacity {
    /// Host name.
    pub name: String,
    /// Total CPU cores.
    pub cpu_cores_total: u32,
    /// CPU cores allocated to VMs.
    pub cpu_cores_used: u32,
    /// Total RAM in GB.
    pub ram_total: u32,
    /// RAM allocated to VMs in GB.
    pub ram_allocated: u32,
    /// Whether the host accepts new VMs.
    pub enabled: bool,
}

impl HostCapacity {
    /// Free CPU cores.
    pub fn free_cpu_cores(&self) -> u32 {
        self.cpu_cores_total.saturating_sub(self.cpu_cores_used)
    }

    /// Free RAM in GB.
    pub fn free_ram(&self) -> u32 {
        self.ram_total.saturating_sub(self.ram_allocated)
    }

    /// Whether `cpu_cores` and `ram` fit on the host.
    pub fn fits(&self, cpu_cores: u32, ram: u32) -> bool {
        self.enabled && self.free_cpu_cores() >= cpu_cores && self.free_ram() >= ram
    }
}

/// A GPU device reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDevice {
    /// `<pci-bus>-<host>` identifier.
    pub id: String,
    /// Marketing name.
    pub name: String,
    /// Host the device is installed in.
    pub host: String,
}

/// Power state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    /// Running.
    Running,
    /// Stopped.
    Stopped,
    /// Transitioning.
    Starting,
    /// Transitioning.
    Stopping,
    /// Error reported by the hypervisor.
    Error,
}

/// User-requested VM power action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VmAction {
    /// Power on.
    Start,
    /// Power off.
    Stop,
    /// Restart.
    Reboot,
}

/// CloudStack operations for one zone.
#[async_trait]
pub trait CloudStackApi:
    Provider<CsVm> + Provider<PortForwardingRule> + Provider<CsSnapshot>
{
    /// Capacity of every host in the zone.
    async fn list_hosts(&self) -> ProviderResult<Vec<HostCapacity>>;

    /// Capacity of a single host.
    async fn host_capacity(&self, host: &str) -> ProviderResult<HostCapacity> {
        self.list_hosts()
            .await?
            .into_iter()
            .find(|h| h.name == host)
            .ok_or_else(|| ProviderError::not_found("host", host))
    }

    /// GPU devices installed in the zone.
    async fn list_gpus(&self) -> ProviderResult<Vec<GpuDevice>>;

    /// Attach a GPU, migrating the VM to `host` if it runs elsewhere.
    async fn attach_gpu(&self, vm_id: &str, gpu_id: &str, host: &str) -> ProviderResult<()>;

    /// Detach whatever GPU the VM holds.
    async fn detach_gpu(&self, vm_id: &str) -> ProviderResult<()>;

    /// Current power state; `None` when the VM does not exist.
    async fn power_state(&self, vm_id: &str) -> ProviderResult<Option<PowerState>>;

    /// Run a power action.
    async fn vm_action(&self, vm_id: &str, action: VmAction) -> ProviderResult<()>;

    /// Snapshots of a VM.
    async fn list_snapshots(&self, vm_id: &str) -> ProviderResult<Vec<CsSnapshot>>;
}

/// Harbor registry operations.
pub trait HarborApi:
    Provider<HarborProject>
    + Provider<HarborRobot>
    + Provider<HarborRepository>
    + Provider<HarborWebhook>
{
}

/// GitHub operations scoped to one user token.
pub trait GithubApi: Provider<GithubWebhook> {}

/// Shared handle to a Kubernetes client.
pub type Kube = Arc<dyn KubeApi>;

/// Shared handle to a CloudStack client.
pub type CloudStack = Arc<dyn CloudStackApi>;

/// Shared handle to the Harbor client.
pub type Harbor = Arc<dyn HarborApi>;

/// Shared handle to a GitHub client.
pub type Github = Arc<dyn GithubApi>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_fits() {
        let host = HostCapacity {
            name: "h1".to_string(),
            cpu_cores_total: 16,
            cpu_cores_used: 12,
            ram_total: 64,
            ram_allocated: 60,
            enabled: true,
        };
        assert!(host.fits(4, 4));
        assert!(!host.fits(5, 4));
        assert!(!host.fits(4, 5));
        assert!(
            !HostCapacity {
                enabled: false,
                ..host
            }
            .fits(1, 1)
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(!ProviderError::Permanent("400".into()).is_transient());
        assert!(ProviderError::not_found("namespace", "u-1").is_not_found());
    }
}
