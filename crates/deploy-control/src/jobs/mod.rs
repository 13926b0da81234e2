// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable jobs.
//!
//! Every state-changing operation is a [`Job`]: a tagged enum stored in the
//! queue as `(type, args)`. The executor claims jobs one per resource at a
//! time, checks that the resource still wants the work, runs the handler
//! under a timeout and then finishes, retries or fails the job.
//!
//! ```text
//!  submit ──► pending ──claim──► running ──ok──► finished
//!                ▲                  │
//!                └──── transient ◄──┤
//!                                   └──permanent / exhausted──► failed
//!  terminate (admin, pending only) ──► terminated
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use deploy_core::model::ResourceKind;
use deploy_core::{Activity, StoreError};

use crate::error::Error;
use crate::providers::VmAction;
use crate::services::deployments::DeploymentUpdate;
use crate::services::vms::VmUpdate;

pub mod executor;
pub mod handlers;
pub mod queue;

pub use executor::{JobExecutor, JobExecutorConfig};
pub use queue::{JobQueue, Submitted};

/// Version recorded with every submitted job.
pub const JOB_VERSION: &str = "1";

/// Push that triggered a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Repository full name.
    pub repository: String,
    /// Branch that was pushed.
    pub branch: String,
    /// Head commit SHA.
    pub commit: String,
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "args",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Job {
    /// Provision a new deployment.
    CreateDeployment {
        /// Deployment ID.
        id: String,
    },
    /// Apply a spec patch to a deployment.
    UpdateDeployment {
        /// Deployment ID.
        id: String,
        /// Validated patch.
        update: DeploymentUpdate,
    },
    /// Tear a deployment down.
    DeleteDeployment {
        /// Deployment ID.
        id: String,
    },
    /// Fix drift on a deployment.
    RepairDeployment {
        /// Deployment ID.
        id: String,
    },
    /// Rolling-restart every workload of a deployment.
    RestartDeployment {
        /// Deployment ID.
        id: String,
    },
    /// Record a build and restart the deployments it feeds.
    BuildDeployments {
        /// Deployment IDs.
        ids: Vec<String>,
        /// Push details.
        build: BuildRequest,
    },
    /// Move a deployment to another owner.
    UpdateDeploymentOwner {
        /// Deployment ID.
        id: String,
        /// New owner.
        new_owner_id: String,
        /// Migration to close once done.
        #[serde(default)]
        migration_id: Option<String>,
    },
    /// Provision a new VM.
    CreateVm {
        /// VM ID.
        id: String,
    },
    /// Apply a spec patch to a VM.
    UpdateVm {
        /// VM ID.
        id: String,
        /// Validated patch.
        update: VmUpdate,
    },
    /// Tear a VM down.
    DeleteVm {
        /// VM ID.
        id: String,
    },
    /// Fix drift on a VM.
    RepairVm {
        /// VM ID.
        id: String,
    },
    /// Run a power action.
    DoVmAction {
        /// VM ID.
        id: String,
        /// Action.
        action: VmAction,
    },
    /// Take a scheduled snapshot and prune old ones.
    CreateSystemSnapshot {
        /// VM ID.
        id: String,
        /// Snapshot name.
        name: String,
    },
    /// Take a user-requested snapshot.
    CreateUserSnapshot {
        /// VM ID.
        id: String,
        /// Snapshot name.
        name: String,
    },
    /// Delete a snapshot.
    DeleteSnapshot {
        /// VM ID.
        id: String,
        /// Snapshot name.
        name: String,
    },
    /// Move a VM to another owner.
    UpdateVmOwner {
        /// VM ID.
        id: String,
        /// New owner.
        new_owner_id: String,
        /// Migration to close once done.
        #[serde(default)]
        migration_id: Option<String>,
    },
    /// Lease the first available GPU of `gpu_ids` and attach it.
    AttachGpu {
        /// VM ID.
        id: String,
        /// Candidate GPUs in preference order.
        gpu_ids: Vec<String>,
        /// Lease length in hours.
        lease_hours: f64,
        /// Lease never expires.
        #[serde(default)]
        never_expire: bool,
    },
    /// Detach and release the VM's GPU.
    DetachGpu {
        /// VM ID.
        id: String,
    },
    /// Provision a storage manager.
    CreateSm {
        /// Storage manager ID.
        id: String,
    },
    /// Tear a storage manager down.
    DeleteSm {
        /// Storage manager ID.
        id: String,
    },
    /// Fix drift on a storage manager.
    RepairSm {
        /// Storage manager ID.
        id: String,
    },
}

impl Job {
    /// Stored type name.
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::CreateDeployment { .. } => "createDeployment",
            Self::UpdateDeployment { .. } => "updateDeployment",
            Self::DeleteDeployment { .. } => "deleteDeployment",
            Self::RepairDeployment { .. } => "repairDeployment",
            Self::RestartDeployment { .. } => "restartDeployment",
            Self::BuildDeployments { .. } => "buildDeployments",
            Self::UpdateDeploymentOwner { .. } => "updateDeploymentOwner",
            Self::CreateVm { .. } => "createVm",
            Self::UpdateVm { .. } => "updateVm",
            Self::DeleteVm { .. } => "deleteVm",
            Self::RepairVm { .. } => "repairVm",
            Self::DoVmAction { .. } => "doVmAction",
            Self::CreateSystemSnapshot { .. } => "createSystemSnapshot",
            Self::CreateUserSnapshot { .. } => "createUserSnapshot",
            Self::DeleteSnapshot { .. } => "deleteSnapshot",
            Self::UpdateVmOwner { .. } => "updateVmOwner",
            Self::AttachGpu { .. } => "attachGpu",
            Self::DetachGpu { .. } => "detachGpu",
            Self::CreateSm { .. } => "createSm",
            Self::DeleteSm { .. } => "deleteSm",
            Self::RepairSm { .. } => "repairSm",
        }
    }

    /// Split into the stored `(type, args)` pair.
    pub fn to_parts(&self) -> serde_json::Result<(&'static str, Value)> {
        let mut value = serde_json::to_value(self)?;
        let args = value
            .get_mut("args")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((self.job_type(), args))
    }

    /// Rebuild a job from its stored `(type, args)` pair.
    pub fn from_parts(job_type: &str, args: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(json!({ "type": job_type, "args": args }))
    }

    /// The single resource the job operates on; jobs on the same resource
    /// never run concurrently.
    pub fn resource(&self) -> Option<(ResourceKind, &str)> {
        use ResourceKind::{Deployment, StorageManager, Vm};
        match self {
            Self::CreateDeployment { id }
            | Self::UpdateDeployment { id, .. }
            | Self::DeleteDeployment { id }
            | Self::RepairDeployment { id }
            | Self::RestartDeployment { id }
            | Self::UpdateDeploymentOwner { id, .. } => Some((Deployment, id)),
            Self::BuildDeployments { .. } => None,
            Self::CreateVm { id }
            | Self::UpdateVm { id, .. }
            | Self::DeleteVm { id }
            | Self::RepairVm { id }
            | Self::DoVmAction { id, .. }
            | Self::CreateSystemSnapshot { id, .. }
            | Self::CreateUserSnapshot { id, .. }
            | Self::DeleteSnapshot { id, .. }
            | Self::UpdateVmOwner { id, .. }
            | Self::AttachGpu { id, .. }
            | Self::DetachGpu { id } => Some((Vm, id)),
            Self::CreateSm { id } | Self::DeleteSm { id } | Self::RepairSm { id } => {
                Some((StorageManager, id))
            }
        }
    }

    /// Every resource whose activity the job clears.
    pub fn targets(&self) -> Vec<(ResourceKind, &str)> {
        match self {
            Self::BuildDeployments { ids, .. } => ids
                .iter()
                .map(|id| (ResourceKind::Deployment, id.as_str()))
                .collect(),
            other => other.resource().into_iter().collect(),
        }
    }

    /// Activity removed from the targets once the job is done.
    pub fn clears(&self) -> Option<Activity> {
        match self {
            Self::CreateDeployment { .. } | Self::CreateVm { .. } | Self::CreateSm { .. } => {
                Some(Activity::BeingCreated)
            }
            Self::DeleteDeployment { .. } | Self::DeleteVm { .. } | Self::DeleteSm { .. } => {
                Some(Activity::BeingDeleted)
            }
            Self::UpdateDeployment { .. }
            | Self::UpdateDeploymentOwner { .. }
            | Self::UpdateVm { .. }
            | Self::UpdateVmOwner { .. }
            | Self::DoVmAction { .. } => Some(Activity::Updating),
            Self::RepairDeployment { .. } | Self::RepairVm { .. } | Self::RepairSm { .. } => {
                Some(Activity::Repairing)
            }
            Self::RestartDeployment { .. } => Some(Activity::Restarting),
            Self::BuildDeployments { .. } => Some(Activity::Building),
            Self::AttachGpu { .. } => Some(Activity::AttachingGpu),
            Self::DetachGpu { .. } => Some(Activity::DetachingGpu),
            Self::CreateSystemSnapshot { .. }
            | Self::CreateUserSnapshot { .. }
            | Self::DeleteSnapshot { .. } => None,
        }
    }

    /// Whether the job tears its resource down.
    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            Self::DeleteDeployment { .. } | Self::DeleteVm { .. } | Self::DeleteSm { .. }
        )
    }

    /// Whether the job provisions its resource.
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            Self::CreateDeployment { .. } | Self::CreateVm { .. } | Self::CreateSm { .. }
        )
    }

    /// Retry policy of the job.
    pub fn policy(&self) -> RetryPolicy {
        match self {
            Self::CreateVm { .. }
            | Self::AttachGpu { .. }
            | Self::CreateSystemSnapshot { .. }
            | Self::CreateUserSnapshot { .. } => RetryPolicy::SLOW,
            _ => RetryPolicy::DEFAULT,
        }
    }
}

/// Attempts, timeout and backoff of a job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before the job fails.
    pub max_attempts: i32,
    /// Wall-clock limit of one attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Policy of most jobs.
    pub const DEFAULT: Self = Self {
        max_attempts: 5,
        timeout: Duration::from_secs(5 * 60),
    };

    /// Policy of jobs waiting on slow hypervisor operations.
    pub const SLOW: Self = Self {
        max_attempts: 5,
        timeout: Duration::from_secs(15 * 60),
    };

    const BASE_BACKOFF: Duration = Duration::from_secs(30);
    const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

    /// Delay before the next attempt after `attempts` failures.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
        Self::BASE_BACKOFF
            .saturating_mul(1 << exponent)
            .min(Self::MAX_BACKOFF)
    }
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Worth retrying.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help.
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Whether the job should be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<Error> for JobError {
    fn from(err: Error) -> Self {
        match &err {
            Error::ProviderTransient(_) | Error::Store(StoreError::Unavailable(_)) => {
                Self::Transient(err.to_string())
            }
            _ => Self::Permanent(err.to_string()),
        }
    }
}
