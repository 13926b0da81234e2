// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted document and record types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::activity::Activity;
use crate::error::StoreError;

pub mod deployment;
pub mod gpu;
pub mod job;
pub mod migration;
pub mod notification;
pub mod storage_manager;
pub mod subsystems;
pub mod vm;

pub use deployment::{App, Deployment, DeploymentSpec, DeploymentSubsystems, DeploymentType};
pub use gpu::{Gpu, GpuLease};
pub use job::{JobFilter, JobRecord, JobStatus, NewJob};
pub use migration::{MigrationStatus, MigrationType, ResourceMigration, UpdateOwnerParams};
pub use notification::Notification;
pub use storage_manager::{StorageManager, StorageManagerSpec, StorageManagerSubsystems};
pub use vm::{Vm, VmGpuRef, VmPort, VmSpec, VmSubsystems};

/// The three kinds of user-owned resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    /// Container deployment.
    Deployment,
    /// Virtual machine.
    Vm,
    /// Per-user storage manager.
    StorageManager,
}

impl ResourceKind {
    /// Table holding documents of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Deployment => "deployments",
            Self::Vm => "vms",
            Self::StorageManager => "storage_managers",
        }
    }

    /// Stored name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment",
            Self::Vm => "vm",
            Self::StorageManager => "storageManager",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deployment" => Ok(Self::Deployment),
            "vm" => Ok(Self::Vm),
            "storageManager" => Ok(Self::StorageManager),
            other => Err(StoreError::InvalidValue {
                field: "resource_type",
                value: other.to_string(),
            }),
        }
    }
}

/// User-visible lifecycle status of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceStatus {
    /// Provisioning is in progress.
    ResourceBeingCreated,
    /// All subsystems are provisioned.
    ResourceCreated,
    /// Teardown is in progress.
    ResourceBeingDeleted,
    /// All subsystems are gone.
    ResourceDeleted,
    /// The workload reports itself healthy.
    ResourceRunning,
    /// The workload is stopped.
    ResourceStopped,
    /// A provider reported an error.
    ResourceError,
    /// Status has not been observed yet.
    #[default]
    ResourceUnknown,
}

impl ResourceStatus {
    /// Stored name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceBeingCreated => "resourceBeingCreated",
            Self::ResourceCreated => "resourceCreated",
            Self::ResourceBeingDeleted => "resourceBeingDeleted",
            Self::ResourceDeleted => "resourceDeleted",
            Self::ResourceRunning => "resourceRunning",
            Self::ResourceStopped => "resourceStopped",
            Self::ResourceError => "resourceError",
            Self::ResourceUnknown => "resourceUnknown",
        }
    }
}

impl FromStr for ResourceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            Self::ResourceBeingCreated,
            Self::ResourceCreated,
            Self::ResourceBeingDeleted,
            Self::ResourceDeleted,
            Self::ResourceRunning,
            Self::ResourceStopped,
            Self::ResourceError,
            Self::ResourceUnknown,
        ];
        all.into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidValue {
                field: "status_code",
                value: s.to_string(),
            })
    }
}

/// Ties a spec type to its resource kind and subsystem document.
pub trait ResourceSpec:
    Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
{
    /// Which table the documents live in.
    const KIND: ResourceKind;

    /// Observed provider state recorded for this kind.
    type Subsystems: Serialize
        + DeserializeOwned
        + Default
        + Clone
        + Send
        + Sync
        + fmt::Debug
        + 'static;
}

/// A resource document: identity, declared spec, observed subsystems and activities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound = "")]
pub struct Document<S: ResourceSpec> {
    /// Stable opaque identifier.
    pub id: String,
    /// Name, unique among non-deleted documents of the same kind.
    pub name: String,
    /// Owning user.
    pub owner_id: String,
    /// Zone the resource lives in.
    pub zone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last successful spec update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last repair (successful or scheduled).
    pub repaired_at: Option<DateTime<Utc>>,
    /// Last workload restart.
    pub restarted_at: Option<DateTime<Utc>>,
    /// Soft-deletion time.
    pub deleted_at: Option<DateTime<Utc>>,
    /// In-progress operations.
    pub activities: BTreeSet<Activity>,
    /// Declared desired state.
    pub spec: S,
    /// Observed provider state.
    pub subsystems: S::Subsystems,
    /// Lifecycle status.
    pub status_code: ResourceStatus,
    /// Human-readable status detail.
    pub status_message: String,
}

impl<S: ResourceSpec> Document<S> {
    /// Create a fresh document in `beingCreated`.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
        zone: impl Into<String>,
        spec: S,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner_id: owner_id.into(),
            zone: zone.into(),
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            restarted_at: None,
            deleted_at: None,
            activities: BTreeSet::from([Activity::BeingCreated]),
            spec,
            subsystems: S::Subsystems::default(),
            status_code: ResourceStatus::ResourceBeingCreated,
            status_message: "Resource is being created".to_string(),
        }
    }

    /// Whether `activity` is currently present.
    pub fn has_activity(&self, activity: Activity) -> bool {
        self.activities.contains(&activity)
    }

    /// Whether the document is soft-deleted or being deleted.
    pub fn is_being_deleted(&self) -> bool {
        self.deleted_at.is_some() || self.has_activity(Activity::BeingDeleted)
    }

    /// Ready means neither being created nor being deleted.
    pub fn is_ready(&self) -> bool {
        crate::activity::is_ready(&self.activities)
    }
}

/// Page request for list operations (zero-based page).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Zero-based page index.
    pub page: u32,
    /// Items per page.
    pub page_size: u32,
}

impl Pagination {
    /// SQL `LIMIT` value.
    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }

    /// SQL `OFFSET` value.
    pub fn offset(&self) -> i64 {
        i64::from(self.page) * i64::from(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_round_trip() {
        for kind in [
            ResourceKind::Deployment,
            ResourceKind::Vm,
            ResourceKind::StorageManager,
        ] {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        assert!("bucket".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        let status: ResourceStatus = "resourceRunning".parse().unwrap();
        assert_eq!(status, ResourceStatus::ResourceRunning);
        assert_eq!(
            serde_json::to_string(&ResourceStatus::ResourceCreated).unwrap(),
            "\"resourceCreated\""
        );
    }

    #[test]
    fn test_pagination() {
        let page = Pagination {
            page: 2,
            page_size: 25,
        };
        assert_eq!(page.limit(), 25);
        assert_eq!(page.offset(), 50);
    }
}
