// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for deploy-core.
//!
//! Resource documents are stored one row per resource. Identity and
//! lifecycle fields are plain columns; `spec`, `subsystems` and `activities`
//! are JSON columns written through keyed path updates so that two writers
//! touching different subsystem objects never overwrite each other.

pub mod postgres;
pub mod resources;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::resources::{ResourceStore, UpdateParams};
pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::activity::{Activity, ActivityOutcome};
use crate::error::{Result, StoreError};
use crate::model::{
    Gpu, GpuLease, JobFilter, JobRecord, JobStatus, MigrationStatus, NewJob, Notification,
    Pagination, ResourceKind, ResourceMigration, ResourceStatus, UpdateOwnerParams,
};

/// JSON column of a resource row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentColumn {
    /// Declared spec.
    Spec,
    /// Observed provider state.
    Subsystems,
}

impl DocumentColumn {
    /// Column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spec => "spec",
            Self::Subsystems => "subsystems",
        }
    }
}

/// Dotted path into a JSON document, e.g. `k8s.deploymentMap.main`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPath(Vec<String>);

impl DocumentPath {
    /// Parse a dotted path. Segments must be non-empty and free of quotes.
    pub fn parse(dotted: &str) -> Result<Self> {
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments
            .iter()
            .any(|s| s.is_empty() || s.contains('"') || s.contains('\\'))
        {
            return Err(StoreError::InvalidValue {
                field: "path",
                value: dotted.to_string(),
            });
        }
        Ok(Self(segments))
    }

    /// Build a path from already-split segments.
    pub fn from_segments<I, T>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let joined: Vec<String> = segments.into_iter().map(Into::into).collect();
        Self::parse(&joined.join("."))
    }

    /// Path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// SQLite JSON path (`$."k8s"."deploymentMap"."main"`).
    pub fn sqlite_path(&self) -> String {
        let mut out = String::from("$");
        for segment in &self.0 {
            out.push_str(".\"");
            out.push_str(segment);
            out.push('"');
        }
        out
    }

    /// Postgres `text[]` path (`{k8s,deploymentMap,main}`).
    pub fn postgres_path(&self) -> Vec<String> {
        self.0.clone()
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Lifecycle timestamp column of a resource row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    /// `updated_at`.
    Updated,
    /// `repaired_at`.
    Repaired,
    /// `restarted_at`.
    Restarted,
    /// `deleted_at`.
    Deleted,
}

impl Timestamp {
    /// Column name.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Updated => "updated_at",
            Self::Repaired => "repaired_at",
            Self::Restarted => "restarted_at",
            Self::Deleted => "deleted_at",
        }
    }
}

/// Untyped resource row.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRecord {
    /// Resource ID.
    pub id: String,
    /// Resource name.
    pub name: String,
    /// Owner.
    pub owner_id: String,
    /// Zone.
    pub zone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    pub updated_at: Option<DateTime<Utc>>,
    /// Last repair.
    pub repaired_at: Option<DateTime<Utc>>,
    /// Last restart.
    pub restarted_at: Option<DateTime<Utc>>,
    /// Soft-deletion time.
    pub deleted_at: Option<DateTime<Utc>>,
    /// Present activities.
    pub activities: BTreeSet<Activity>,
    /// Spec document.
    pub spec: Value,
    /// Subsystems document.
    pub subsystems: Value,
    /// Status code.
    pub status_code: ResourceStatus,
    /// Status message.
    pub status_message: String,
}

/// Raw row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResourceRow {
    id: String,
    name: String,
    owner_id: String,
    zone: String,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
    repaired_at: Option<DateTime<Utc>>,
    restarted_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    activities: String,
    spec: String,
    subsystems: String,
    status_code: String,
    status_message: String,
}

pub(crate) const RESOURCE_COLUMNS: &str = "id, name, owner_id, zone, created_at, updated_at, \
     repaired_at, restarted_at, deleted_at, activities, spec, subsystems, status_code, status_message";

impl TryFrom<ResourceRow> for ResourceRecord {
    type Error = StoreError;

    fn try_from(row: ResourceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            owner_id: row.owner_id,
            zone: row.zone,
            created_at: row.created_at,
            updated_at: row.updated_at,
            repaired_at: row.repaired_at,
            restarted_at: row.restarted_at,
            deleted_at: row.deleted_at,
            activities: serde_json::from_str(&row.activities)?,
            spec: serde_json::from_str(&row.spec)?,
            subsystems: serde_json::from_str(&row.subsystems)?,
            status_code: row.status_code.parse()?,
            status_message: row.status_message,
        })
    }
}

/// Identity fields that may be rewritten after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdate {
    /// New name.
    pub name: Option<String>,
    /// New owner.
    pub owner_id: Option<String>,
}

impl FieldUpdate {
    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.owner_id.is_none()
    }
}

/// Filter for listing resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceFilter {
    /// Only resources owned by one of these users.
    pub owner_ids: Option<Vec<String>>,
    /// Only resources in this zone.
    pub zone: Option<String>,
    /// Include soft-deleted resources.
    pub include_deleted: bool,
    /// Only resources carrying this activity.
    pub activity: Option<Activity>,
    /// Only deployments whose GitHub webhook has this ID.
    pub github_webhook_id: Option<String>,
}

/// Filter for listing GPUs.
#[derive(Debug, Clone, Default)]
pub struct GpuFilter {
    /// Only GPUs in this zone.
    pub zone: Option<String>,
    /// Only GPUs without a live lease at this time.
    pub available_at: Option<DateTime<Utc>>,
    /// Hosts to leave out.
    pub exclude_hosts: Vec<String>,
    /// GPU IDs to leave out.
    pub exclude_ids: Vec<String>,
    /// GPU names to leave out (privileged cards).
    pub exclude_names: Vec<String>,
}

/// Raw GPU row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct GpuRow {
    id: String,
    name: String,
    zone: String,
    host: String,
    lease_vm_id: Option<String>,
    lease_user_id: Option<String>,
    lease_created_at: Option<DateTime<Utc>>,
    lease_ends_at: Option<DateTime<Utc>>,
    lease_never_expire: bool,
}

pub(crate) const GPU_COLUMNS: &str = "id, name, zone, host, lease_vm_id, lease_user_id, \
     lease_created_at, lease_ends_at, lease_never_expire";

impl From<GpuRow> for Gpu {
    fn from(row: GpuRow) -> Self {
        let lease = match (
            row.lease_vm_id,
            row.lease_user_id,
            row.lease_created_at,
            row.lease_ends_at,
        ) {
            (Some(vm_id), Some(user_id), Some(created_at), Some(ends_at)) => Some(GpuLease {
                vm_id,
                user_id,
                created_at,
                ends_at,
                never_expire: row.lease_never_expire,
            }),
            _ => None,
        };
        Self {
            id: row.id,
            name: row.name,
            zone: row.zone,
            host: row.host,
            lease,
        }
    }
}

/// Raw job row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    id: String,
    user_id: String,
    job_type: String,
    args: String,
    resource_id: Option<String>,
    status: String,
    error_logs: String,
    attempts: i32,
    version: String,
    created_at: DateTime<Utc>,
    run_after: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) const JOB_COLUMNS: &str = "id, user_id, job_type, args, resource_id, status, \
     error_logs, attempts, version, created_at, run_after, last_run_at, finished_at";

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            job_type: row.job_type,
            args: serde_json::from_str(&row.args)?,
            resource_id: row.resource_id,
            status: row.status.parse::<JobStatus>()?,
            error_logs: serde_json::from_str(&row.error_logs)?,
            attempts: row.attempts,
            version: row.version,
            created_at: row.created_at,
            run_after: row.run_after,
            last_run_at: row.last_run_at,
            finished_at: row.finished_at,
        })
    }
}

/// Raw migration row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MigrationRow {
    id: String,
    resource_id: String,
    resource_type: String,
    migration_type: String,
    user_id: String,
    status: String,
    code: Option<String>,
    new_owner_id: String,
    old_owner_id: String,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

pub(crate) const MIGRATION_COLUMNS: &str = "id, resource_id, resource_type, migration_type, \
     user_id, status, code, new_owner_id, old_owner_id, created_at, deleted_at";

impl TryFrom<MigrationRow> for ResourceMigration {
    type Error = StoreError;

    fn try_from(row: MigrationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            resource_id: row.resource_id,
            resource_type: row.resource_type.parse()?,
            migration_type: row.migration_type.parse()?,
            user_id: row.user_id,
            status: row.status.parse::<MigrationStatus>()?,
            code: row.code,
            update_owner: UpdateOwnerParams {
                new_owner_id: row.new_owner_id,
                old_owner_id: row.old_owner_id,
            },
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// Raw notification row shared by both backends.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct NotificationRow {
    id: String,
    user_id: String,
    notification_type: String,
    content: String,
    created_at: DateTime<Utc>,
    read_at: Option<DateTime<Utc>>,
}

pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, user_id, notification_type, content, created_at, read_at";

impl TryFrom<NotificationRow> for Notification {
    type Error = StoreError;

    fn try_from(row: NotificationRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            notification_type: row.notification_type,
            content: serde_json::from_str(&row.content)?,
            created_at: row.created_at,
            read_at: row.read_at,
        })
    }
}

/// Resolve the outcome of an `add_activity` update that matched no row.
///
/// Called after the conditional update was refused; `record` is the row as
/// read afterwards.
pub(crate) fn refused_outcome(
    record: &ResourceRecord,
    activity: Activity,
) -> Option<ActivityOutcome> {
    if let Some(blocker) = activity.blocked_by(&record.activities) {
        return Some(ActivityOutcome::Blocked(blocker));
    }
    if record.activities.contains(&activity) {
        return Some(ActivityOutcome::Started);
    }
    if record.deleted_at.is_some() && activity != Activity::BeingDeleted {
        return Some(ActivityOutcome::Blocked(Activity::BeingDeleted));
    }
    None
}

/// Guard set bound into the conditional activity update: the guards plus the
/// activity itself (so an already present activity is never duplicated).
pub(crate) fn activity_guard_names(activity: Activity) -> Vec<String> {
    let mut names: Vec<String> = activity
        .guards()
        .iter()
        .map(|a| a.as_str().to_string())
        .collect();
    if !names.iter().any(|n| n == activity.as_str()) {
        names.push(activity.as_str().to_string());
    }
    names
}

/// Durable storage for resources, jobs, GPUs, migrations and notifications.
///
/// Every method is a single-row atomic operation; there are no multi-row
/// transactions.
#[async_trait::async_trait]
#[allow(missing_docs)]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Insert a new resource. Fails with [`StoreError::NameTaken`] when a
    /// non-deleted resource of the same kind already uses the name.
    async fn insert_resource(&self, kind: ResourceKind, record: &ResourceRecord) -> Result<()>;

    async fn get_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<ResourceRecord>>;

    async fn get_resource_by_name(
        &self,
        kind: ResourceKind,
        name: &str,
        include_deleted: bool,
    ) -> Result<Option<ResourceRecord>>;

    /// List resources ordered by `(created_at, id)`.
    async fn list_resources(
        &self,
        kind: ResourceKind,
        filter: &ResourceFilter,
        pagination: Option<Pagination>,
    ) -> Result<Vec<ResourceRecord>>;

    async fn update_resource_fields(
        &self,
        kind: ResourceKind,
        id: &str,
        update: &FieldUpdate,
    ) -> Result<()>;

    /// Write `value` at `path` inside a JSON column.
    async fn set_document_path(
        &self,
        kind: ResourceKind,
        id: &str,
        column: DocumentColumn,
        path: &DocumentPath,
        value: &Value,
    ) -> Result<()>;

    /// Remove the key at `path` inside a JSON column.
    async fn unset_document_path(
        &self,
        kind: ResourceKind,
        id: &str,
        column: DocumentColumn,
        path: &DocumentPath,
    ) -> Result<()>;

    /// Add `activity` iff none of its guards is present; a single conditional update.
    async fn add_activity(
        &self,
        kind: ResourceKind,
        id: &str,
        activity: Activity,
    ) -> Result<ActivityOutcome>;

    /// Remove `activity`. Idempotent.
    async fn remove_activity(&self, kind: ResourceKind, id: &str, activity: Activity)
    -> Result<()>;

    /// Set a lifecycle timestamp and optionally remove an activity in the same update.
    async fn stamp_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        stamp: Timestamp,
        at: DateTime<Utc>,
        clear: Option<Activity>,
    ) -> Result<()>;

    /// Non-deleted resources with no activity whose last repair (or creation)
    /// is older than `older_than`.
    async fn list_quiescent_resources(
        &self,
        kind: ResourceKind,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceRecord>>;

    async fn set_resource_status(
        &self,
        kind: ResourceKind,
        id: &str,
        status: ResourceStatus,
        message: &str,
    ) -> Result<()>;

    /// Remove the row entirely.
    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Insert a job. Returns `false` when a job with the same ID exists.
    async fn insert_job(&self, job: &NewJob) -> Result<bool>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Option<Pagination>,
    ) -> Result<Vec<JobRecord>>;

    /// Atomically claim the oldest runnable job.
    ///
    /// A job is runnable when it is `pending`, its `run_after` has passed, no
    /// job for the same resource is `running` and no older job for the same
    /// resource is still `pending`.
    async fn claim_job(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>>;

    /// Mark a running job finished, optionally appending a note to its log.
    async fn finish_job(&self, id: &str, at: DateTime<Utc>, note: Option<&str>) -> Result<()>;

    /// Put a running job back to pending with a new `run_after`.
    async fn retry_job(
        &self,
        id: &str,
        run_after: DateTime<Utc>,
        attempts: i32,
        error: &str,
    ) -> Result<()>;

    /// Mark a running job failed.
    async fn fail_job(&self, id: &str, at: DateTime<Utc>, attempts: i32, error: &str)
    -> Result<()>;

    /// Cancel a pending job. Returns `false` when the job was not pending.
    async fn terminate_job(&self, id: &str, at: DateTime<Utc>, reason: &str) -> Result<bool>;

    /// Reset every running job to pending (startup recovery).
    async fn reset_running_jobs(&self) -> Result<u64>;

    // ------------------------------------------------------------------
    // GPUs
    // ------------------------------------------------------------------

    /// Insert or refresh a GPU's hardware fields; never touches the lease.
    async fn upsert_gpu(&self, gpu: &Gpu) -> Result<()>;

    async fn get_gpu(&self, id: &str) -> Result<Option<Gpu>>;

    async fn get_gpu_by_vm(&self, vm_id: &str) -> Result<Option<Gpu>>;

    /// GPUs ordered by `(host, id)`.
    async fn list_gpus(&self, filter: &GpuFilter) -> Result<Vec<Gpu>>;

    /// Record `lease` iff the GPU is free, already leased to the same VM or
    /// its lease expired before `now`. Returns whether the lease was recorded.
    async fn lease_gpu(&self, id: &str, lease: &GpuLease, now: DateTime<Utc>) -> Result<bool>;

    /// Clear the lease held by `vm_id`. Returns the number of GPUs released.
    async fn release_gpus_for_vm(&self, vm_id: &str) -> Result<u64>;

    /// Leases that are over at `now`.
    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Gpu>>;

    // ------------------------------------------------------------------
    // Resource migrations
    // ------------------------------------------------------------------

    /// Insert a migration. Fails with [`StoreError::Conflict`] when a pending
    /// migration for the same resource exists.
    async fn insert_migration(&self, migration: &ResourceMigration) -> Result<()>;

    async fn get_migration(&self, id: &str) -> Result<Option<ResourceMigration>>;

    async fn get_migration_by_resource(&self, resource_id: &str)
    -> Result<Option<ResourceMigration>>;

    /// Live migrations created by or addressed to `user_id` (all when `None`).
    async fn list_migrations(&self, user_id: Option<&str>) -> Result<Vec<ResourceMigration>>;

    async fn set_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()>;

    async fn delete_migration(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    async fn insert_notification(&self, notification: &Notification) -> Result<()>;

    async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>>;

    async fn delete_notification(&self, id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_path_formats() {
        let path = DocumentPath::parse("k8s.deploymentMap.main").unwrap();
        assert_eq!(path.sqlite_path(), r#"$."k8s"."deploymentMap"."main""#);
        assert_eq!(
            path.postgres_path(),
            vec!["k8s".to_string(), "deploymentMap".into(), "main".into()]
        );
        assert_eq!(path.to_string(), "k8s.deploymentMap.main");
    }

    #[test]
    fn test_document_path_rejects_bad_segments() {
        assert!(DocumentPath::parse("k8s..main").is_err());
        assert!(DocumentPath::parse("").is_err());
        assert!(DocumentPath::parse("k8s.\"x").is_err());
    }

    #[test]
    fn test_guard_names_include_activity() {
        let names = activity_guard_names(Activity::Updating);
        assert!(names.contains(&"beingCreated".to_string()));
        assert!(names.contains(&"updating".to_string()));

        let names = activity_guard_names(Activity::Repairing);
        assert_eq!(names.iter().filter(|n| *n == "repairing").count(), 1);
    }
}
