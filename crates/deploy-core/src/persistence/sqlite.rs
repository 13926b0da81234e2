// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::activity::{Activity, ActivityOutcome};
use crate::error::{Result, StoreError};
use crate::model::{
    Gpu, GpuLease, JobFilter, JobRecord, MigrationStatus, NewJob, Notification, Pagination,
    ResourceKind, ResourceMigration, ResourceStatus,
};

use super::{
    DocumentColumn, DocumentPath, FieldUpdate, GPU_COLUMNS, GpuFilter, GpuRow, JOB_COLUMNS,
    JobRow, MIGRATION_COLUMNS, MigrationRow, NOTIFICATION_COLUMNS, NotificationRow, Persistence,
    RESOURCE_COLUMNS, ResourceFilter, ResourceRecord, ResourceRow, Timestamp,
    activity_guard_names, refused_outcome,
};

/// How often `add_activity` re-evaluates when the blocking activity vanished
/// between the update and the follow-up read.
const ADD_ACTIVITY_ATTEMPTS: usize = 3;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and apply migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        crate::migrations::SQLITE.run(&pool).await?;
        debug!(path = %path.display(), "SQLite database ready");

        Ok(Self { pool })
    }

    /// Private in-memory database with migrations applied.
    ///
    /// A single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        crate::migrations::SQLITE.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_resources(
        &self,
        mut qb: QueryBuilder<'_, Sqlite>,
    ) -> Result<Vec<ResourceRecord>> {
        let rows = qb
            .build_query_as::<ResourceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceRecord::try_from).collect()
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_resource(&self, kind: ResourceKind, record: &ResourceRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({RESOURCE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.owner_id)
            .bind(&record.zone)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(record.repaired_at)
            .bind(record.restarted_at)
            .bind(record.deleted_at)
            .bind(serde_json::to_string(&record.activities)?)
            .bind(serde_json::to_string(&record.spec)?)
            .bind(serde_json::to_string(&record.subsystems)?)
            .bind(record.status_code.as_str())
            .bind(&record.status_message)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_unique_violation(&e) => {
                Err(StoreError::NameTaken(record.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        include_deleted: bool,
    ) -> Result<Option<ResourceRecord>> {
        let sql = format!(
            "SELECT {RESOURCE_COLUMNS} FROM {} WHERE id = ? AND (? OR deleted_at IS NULL)",
            kind.table()
        );
        let row = sqlx::query_as::<_, ResourceRow>(&sql)
            .bind(id)
            .bind(include_deleted)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ResourceRecord::try_from).transpose()
    }

    async fn get_resource_by_name(
        &self,
        kind: ResourceKind,
        name: &str,
        include_deleted: bool,
    ) -> Result<Option<ResourceRecord>> {
        let sql = format!(
            r#"
            SELECT {RESOURCE_COLUMNS} FROM {}
            WHERE name = ? AND (? OR deleted_at IS NULL)
            ORDER BY deleted_at IS NOT NULL, created_at DESC
            LIMIT 1
            "#,
            kind.table()
        );
        let row = sqlx::query_as::<_, ResourceRow>(&sql)
            .bind(name)
            .bind(include_deleted)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ResourceRecord::try_from).transpose()
    }

    async fn list_resources(
        &self,
        kind: ResourceKind,
        filter: &ResourceFilter,
        pagination: Option<Pagination>,
    ) -> Result<Vec<ResourceRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {RESOURCE_COLUMNS} FROM {} WHERE 1 = 1",
            kind.table()
        ));
        if !filter.include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }
        if let Some(owners) = &filter.owner_ids {
            if owners.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND owner_id IN (");
            let mut separated = qb.separated(", ");
            for owner in owners {
                separated.push_bind(owner.clone());
            }
            separated.push_unseparated(")");
        }
        if let Some(zone) = &filter.zone {
            qb.push(" AND zone = ").push_bind(zone.clone());
        }
        if let Some(activity) = filter.activity {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(activities) WHERE value = ")
                .push_bind(activity.as_str())
                .push(")");
        }
        if let Some(webhook_id) = &filter.github_webhook_id {
            qb.push(" AND json_extract(subsystems, '$.github.webhook.id') = ")
                .push_bind(webhook_id.clone());
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(page) = pagination {
            qb.push(" LIMIT ")
                .push_bind(page.limit())
                .push(" OFFSET ")
                .push_bind(page.offset());
        }

        self.fetch_resources(qb).await
    }

    async fn update_resource_fields(
        &self,
        kind: ResourceKind,
        id: &str,
        update: &FieldUpdate,
    ) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!("UPDATE {} SET ", kind.table()));
        {
            let mut separated = qb.separated(", ");
            if let Some(name) = &update.name {
                separated.push("name = ").push_bind_unseparated(name.clone());
            }
            if let Some(owner_id) = &update.owner_id {
                separated
                    .push("owner_id = ")
                    .push_bind_unseparated(owner_id.clone());
            }
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await;
        match result {
            Ok(done) if done.rows_affected() == 0 => Err(StoreError::not_found(kind.as_str(), id)),
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_unique_violation(&e) => Err(StoreError::NameTaken(
                update.name.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_document_path(
        &self,
        kind: ResourceKind,
        id: &str,
        column: DocumentColumn,
        path: &DocumentPath,
        value: &Value,
    ) -> Result<()> {
        let col = column.as_str();
        let sql = format!(
            "UPDATE {} SET {col} = json_set({col}, ?, json(?)) WHERE id = ?",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(path.sqlite_path())
            .bind(serde_json::to_string(value)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(kind.as_str(), id));
        }
        Ok(())
    }

    async fn unset_document_path(
        &self,
        kind: ResourceKind,
        id: &str,
        column: DocumentColumn,
        path: &DocumentPath,
    ) -> Result<()> {
        let col = column.as_str();
        let sql = format!(
            "UPDATE {} SET {col} = json_remove({col}, ?) WHERE id = ?",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(path.sqlite_path())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(kind.as_str(), id));
        }
        Ok(())
    }

    async fn add_activity(
        &self,
        kind: ResourceKind,
        id: &str,
        activity: Activity,
    ) -> Result<ActivityOutcome> {
        let table = kind.table();
        let sql = format!(
            r#"
            UPDATE {table}
            SET activities = json_insert(activities, '$[#]', ?)
            WHERE id = ?
              AND (deleted_at IS NULL OR ? = 'beingDeleted')
              AND NOT EXISTS (
                  SELECT 1 FROM json_each({table}.activities) AS present
                  WHERE present.value IN (SELECT guard.value FROM json_each(?) AS guard)
              )
            "#
        );
        let guards = serde_json::to_string(&activity_guard_names(activity))?;

        for _ in 0..ADD_ACTIVITY_ATTEMPTS {
            let result = sqlx::query(&sql)
                .bind(activity.as_str())
                .bind(id)
                .bind(activity.as_str())
                .bind(&guards)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 1 {
                return Ok(ActivityOutcome::Started);
            }

            let record = self
                .get_resource(kind, id, true)
                .await?
                .ok_or_else(|| StoreError::not_found(kind.as_str(), id))?;
            if let Some(outcome) = refused_outcome(&record, activity) {
                return Ok(outcome);
            }
        }

        Err(StoreError::Conflict(format!(
            "could not add activity {activity} to {kind} {id}"
        )))
    }

    async fn remove_activity(
        &self,
        kind: ResourceKind,
        id: &str,
        activity: Activity,
    ) -> Result<()> {
        let table = kind.table();
        let sql = format!(
            r#"
            UPDATE {table}
            SET activities = (
                SELECT json_group_array(value) FROM json_each({table}.activities) WHERE value <> ?
            )
            WHERE id = ?
            "#
        );
        sqlx::query(&sql)
            .bind(activity.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stamp_resource(
        &self,
        kind: ResourceKind,
        id: &str,
        stamp: Timestamp,
        at: DateTime<Utc>,
        clear: Option<Activity>,
    ) -> Result<()> {
        let table = kind.table();
        let column = stamp.column();
        let result = match clear {
            None => {
                let sql = format!("UPDATE {table} SET {column} = ? WHERE id = ?");
                sqlx::query(&sql)
                    .bind(at)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            Some(activity) => {
                let sql = format!(
                    r#"
                    UPDATE {table}
                    SET {column} = ?,
                        activities = (
                            SELECT json_group_array(value)
                            FROM json_each({table}.activities) WHERE value <> ?
                        )
                    WHERE id = ?
                    "#
                );
                sqlx::query(&sql)
                    .bind(at)
                    .bind(activity.as_str())
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(kind.as_str(), id));
        }
        Ok(())
    }

    async fn list_quiescent_resources(
        &self,
        kind: ResourceKind,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<ResourceRecord>> {
        let sql = format!(
            r#"
            SELECT {RESOURCE_COLUMNS} FROM {}
            WHERE deleted_at IS NULL
              AND json_array_length(activities) = 0
              AND COALESCE(repaired_at, created_at) < ?
            ORDER BY COALESCE(repaired_at, created_at), id
            LIMIT ?
            "#,
            kind.table()
        );
        let rows = sqlx::query_as::<_, ResourceRow>(&sql)
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceRecord::try_from).collect()
    }

    async fn set_resource_status(
        &self,
        kind: ResourceKind,
        id: &str,
        status: ResourceStatus,
        message: &str,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status_code = ?, status_message = ? WHERE id = ?",
            kind.table()
        );
        sqlx::query(&sql)
            .bind(status.as_str())
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_resource(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE id = ?", kind.table());
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, user_id, job_type, args, resource_id, status, error_logs,
                              attempts, version, created_at, run_after)
            VALUES (?, ?, ?, ?, ?, 'pending', '[]', 0, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&job.id)
        .bind(&job.user_id)
        .bind(&job.job_type)
        .bind(serde_json::to_string(&job.args)?)
        .bind(&job.resource_id)
        .bind(&job.version)
        .bind(job.created_at)
        .bind(job.run_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Option<Pagination>,
    ) -> Result<Vec<JobRecord>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(resource_id) = &filter.resource_id {
            qb.push(" AND resource_id = ").push_bind(resource_id.clone());
        }
        if let Some(job_type) = &filter.job_type {
            qb.push(" AND job_type = ").push_bind(job_type.clone());
        }
        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(page) = pagination {
            qb.push(" LIMIT ")
                .push_bind(page.limit())
                .push(" OFFSET ")
                .push_bind(page.offset());
        }

        let rows = qb
            .build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn claim_job(&self, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', last_run_at = ?
            WHERE status = 'pending' AND id = (
                SELECT j.id FROM jobs j
                WHERE j.status = 'pending'
                  AND j.run_after <= ?
                  AND (
                      j.resource_id IS NULL OR (
                          NOT EXISTS (
                              SELECT 1 FROM jobs r
                              WHERE r.resource_id = j.resource_id AND r.status = 'running'
                          )
                          AND NOT EXISTS (
                              SELECT 1 FROM jobs p
                              WHERE p.resource_id = j.resource_id
                                AND p.status = 'pending'
                                AND (p.created_at < j.created_at
                                     OR (p.created_at = j.created_at AND p.id < j.id))
                          )
                      )
                  )
                ORDER BY j.created_at, j.id
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn finish_job(&self, id: &str, at: DateTime<Utc>, note: Option<&str>) -> Result<()> {
        let result = match note {
            None => {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = 'finished', finished_at = ?
                    WHERE id = ? AND status = 'running'
                    "#,
                )
                .bind(at)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
            Some(note) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'finished', finished_at = ?,
                        error_logs = json_insert(error_logs, '$[#]', ?)
                    WHERE id = ? AND status = 'running'
                    "#,
                )
                .bind(at)
                .bind(note)
                .bind(id)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {id} is not running")));
        }
        Ok(())
    }

    async fn retry_job(
        &self,
        id: &str,
        run_after: DateTime<Utc>,
        attempts: i32,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', run_after = ?, attempts = ?,
                error_logs = json_insert(error_logs, '$[#]', ?)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(run_after)
        .bind(attempts)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {id} is not running")));
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        id: &str,
        at: DateTime<Utc>,
        attempts: i32,
        error: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', finished_at = ?, attempts = ?,
                error_logs = json_insert(error_logs, '$[#]', ?)
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(at)
        .bind(attempts)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("job {id} is not running")));
        }
        Ok(())
    }

    async fn terminate_job(&self, id: &str, at: DateTime<Utc>, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'terminated', finished_at = ?,
                error_logs = json_insert(error_logs, '$[#]', ?)
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(at)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_running_jobs(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE jobs SET status = 'pending' WHERE status = 'running'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_gpu(&self, gpu: &Gpu) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gpus (id, name, zone, host) VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE
            SET name = excluded.name, zone = excluded.zone, host = excluded.host
            "#,
        )
        .bind(&gpu.id)
        .bind(&gpu.name)
        .bind(&gpu.zone)
        .bind(&gpu.host)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_gpu(&self, id: &str) -> Result<Option<Gpu>> {
        let sql = format!("SELECT {GPU_COLUMNS} FROM gpus WHERE id = ?");
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Gpu::from))
    }

    async fn get_gpu_by_vm(&self, vm_id: &str) -> Result<Option<Gpu>> {
        let sql = format!("SELECT {GPU_COLUMNS} FROM gpus WHERE lease_vm_id = ? LIMIT 1");
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Gpu::from))
    }

    async fn list_gpus(&self, filter: &GpuFilter) -> Result<Vec<Gpu>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {GPU_COLUMNS} FROM gpus WHERE 1 = 1"));
        if let Some(zone) = &filter.zone {
            qb.push(" AND zone = ").push_bind(zone.clone());
        }
        if let Some(now) = filter.available_at {
            qb.push(" AND (lease_vm_id IS NULL OR (NOT lease_never_expire AND lease_ends_at < ")
                .push_bind(now)
                .push("))");
        }
        for (column, values) in [
            ("host", &filter.exclude_hosts),
            ("id", &filter.exclude_ids),
            ("name", &filter.exclude_names),
        ] {
            if values.is_empty() {
                continue;
            }
            qb.push(format!(" AND {column} NOT IN ("));
            let mut separated = qb.separated(", ");
            for value in values {
                separated.push_bind(value.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY host, id");

        let rows = qb
            .build_query_as::<GpuRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Gpu::from).collect())
    }

    async fn lease_gpu(&self, id: &str, lease: &GpuLease, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE gpus
            SET lease_vm_id = ?, lease_user_id = ?, lease_created_at = ?,
                lease_ends_at = ?, lease_never_expire = ?
            WHERE id = ?
              AND (lease_vm_id IS NULL
                   OR lease_vm_id = ?
                   OR (NOT lease_never_expire AND lease_ends_at < ?))
            "#,
        )
        .bind(&lease.vm_id)
        .bind(&lease.user_id)
        .bind(lease.created_at)
        .bind(lease.ends_at)
        .bind(lease.never_expire)
        .bind(id)
        .bind(&lease.vm_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_gpus_for_vm(&self, vm_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE gpus
            SET lease_vm_id = NULL, lease_user_id = NULL, lease_created_at = NULL,
                lease_ends_at = NULL, lease_never_expire = 0
            WHERE lease_vm_id = ?
            "#,
        )
        .bind(vm_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Gpu>> {
        let sql = format!(
            r#"
            SELECT {GPU_COLUMNS} FROM gpus
            WHERE lease_vm_id IS NOT NULL AND NOT lease_never_expire AND lease_ends_at < ?
            ORDER BY lease_ends_at, id
            "#
        );
        let rows = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Gpu::from).collect())
    }

    async fn insert_migration(&self, migration: &ResourceMigration) -> Result<()> {
        let sql = format!(
            "INSERT INTO resource_migrations ({MIGRATION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let result = sqlx::query(&sql)
            .bind(&migration.id)
            .bind(&migration.resource_id)
            .bind(migration.resource_type.as_str())
            .bind(migration.migration_type.as_str())
            .bind(&migration.user_id)
            .bind(migration.status.as_str())
            .bind(&migration.code)
            .bind(&migration.update_owner.new_owner_id)
            .bind(&migration.update_owner.old_owner_id)
            .bind(migration.created_at)
            .bind(migration.deleted_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if StoreError::is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "resource {} already has a pending migration",
                migration.resource_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_migration(&self, id: &str) -> Result<Option<ResourceMigration>> {
        let sql = format!(
            "SELECT {MIGRATION_COLUMNS} FROM resource_migrations WHERE id = ? AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ResourceMigration::try_from).transpose()
    }

    async fn get_migration_by_resource(
        &self,
        resource_id: &str,
    ) -> Result<Option<ResourceMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS} FROM resource_migrations
            WHERE resource_id = ? AND deleted_at IS NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ResourceMigration::try_from).transpose()
    }

    async fn list_migrations(&self, user_id: Option<&str>) -> Result<Vec<ResourceMigration>> {
        let sql = format!(
            r#"
            SELECT {MIGRATION_COLUMNS} FROM resource_migrations
            WHERE deleted_at IS NULL
              AND (? IS NULL OR user_id = ? OR new_owner_id = ?)
            ORDER BY created_at, id
            "#
        );
        let rows = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(user_id)
            .bind(user_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceMigration::try_from).collect()
    }

    async fn set_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resource_migrations SET status = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("migration", id));
        }
        Ok(())
    }

    async fn delete_migration(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE resource_migrations SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        let sql = format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&notification.id)
            .bind(&notification.user_id)
            .bind(&notification.notification_type)
            .bind(serde_json::to_string(&notification.content)?)
            .bind(notification.created_at)
            .bind(notification.read_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let sql = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = ? \
             ORDER BY created_at DESC, id"
        );
        let rows = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn delete_notification(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM notifications WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStatus, MigrationType, UpdateOwnerParams};
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    async fn test_store() -> SqlitePersistence {
        SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite store")
    }

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            owner_id: "user-1".to_string(),
            zone: "se-sto".to_string(),
            created_at: Utc::now(),
            updated_at: None,
            repaired_at: None,
            restarted_at: None,
            deleted_at: None,
            activities: BTreeSet::new(),
            spec: json!({"type": "prebuilt", "apps": {}}),
            subsystems: json!({"k8s": {"deploymentMap": {}, "serviceMap": {}}}),
            status_code: ResourceStatus::ResourceCreated,
            status_message: String::new(),
        }
    }

    fn new_job(resource_id: Option<&str>, created_at: DateTime<Utc>) -> NewJob {
        NewJob {
            id: Uuid::new_v4().to_string(),
            user_id: "user-1".to_string(),
            job_type: "repairDeployment".to_string(),
            args: json!({"id": resource_id}),
            resource_id: resource_id.map(str::to_string),
            version: "1.0.0".to_string(),
            created_at,
            run_after: created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_resource() {
        let store = test_store().await;
        let rec = record("web");
        store
            .insert_resource(ResourceKind::Deployment, &rec)
            .await
            .unwrap();

        let fetched = store
            .get_resource(ResourceKind::Deployment, &rec.id, false)
            .await
            .unwrap()
            .expect("resource should exist");
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.spec, rec.spec);

        let by_name = store
            .get_resource_by_name(ResourceKind::Deployment, "web", false)
            .await
            .unwrap();
        assert_eq!(by_name.map(|r| r.id), Some(rec.id));
    }

    #[tokio::test]
    async fn test_name_unique_among_live_resources() {
        let store = test_store().await;
        let first = record("web");
        store
            .insert_resource(ResourceKind::Deployment, &first)
            .await
            .unwrap();

        let err = store
            .insert_resource(ResourceKind::Deployment, &record("web"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NameTaken(name) if name == "web"));

        store
            .stamp_resource(
                ResourceKind::Deployment,
                &first.id,
                Timestamp::Deleted,
                Utc::now(),
                None,
            )
            .await
            .unwrap();
        store
            .insert_resource(ResourceKind::Deployment, &record("web"))
            .await
            .expect("name is free once the holder is deleted");
    }

    #[tokio::test]
    async fn test_add_activity_respects_guards() {
        let store = test_store().await;
        let rec = record("web");
        store
            .insert_resource(ResourceKind::Deployment, &rec)
            .await
            .unwrap();

        let outcome = store
            .add_activity(ResourceKind::Deployment, &rec.id, Activity::Updating)
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Started);

        let outcome = store
            .add_activity(ResourceKind::Deployment, &rec.id, Activity::Repairing)
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Blocked(Activity::Updating));

        // BeingDeleted is not guarded by Updating.
        let outcome = store
            .add_activity(ResourceKind::Deployment, &rec.id, Activity::BeingDeleted)
            .await
            .unwrap();
        assert_eq!(outcome, ActivityOutcome::Started);

        store
            .remove_activity(ResourceKind::Deployment, &rec.id, Activity::Updating)
            .await
            .unwrap();
        let fetched = store
            .get_resource(ResourceKind::Deployment, &rec.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fetched.activities,
            BTreeSet::from([Activity::BeingDeleted])
        );
    }

    #[tokio::test]
    async fn test_add_activity_not_duplicated() {
        let store = test_store().await;
        let rec = record("web");
        store
            .insert_resource(ResourceKind::Deployment, &rec)
            .await
            .unwrap();

        for _ in 0..2 {
            let outcome = store
                .add_activity(ResourceKind::Deployment, &rec.id, Activity::BeingDeleted)
                .await
                .unwrap();
            assert!(outcome.is_started());
        }

        let fetched = store
            .get_resource(ResourceKind::Deployment, &rec.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.activities.len(), 1);
    }

    #[tokio::test]
    async fn test_add_activity_missing_resource() {
        let store = test_store().await;
        let err = store
            .add_activity(ResourceKind::Vm, "missing", Activity::Updating)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_document_path_writes_do_not_clobber_siblings() {
        let store = test_store().await;
        let rec = record("web");
        store
            .insert_resource(ResourceKind::Deployment, &rec)
            .await
            .unwrap();

        let deployment = DocumentPath::parse("k8s.deploymentMap.main").unwrap();
        let service = DocumentPath::parse("k8s.serviceMap.main").unwrap();
        store
            .set_document_path(
                ResourceKind::Deployment,
                &rec.id,
                DocumentColumn::Subsystems,
                &deployment,
                &json!({"name": "main"}),
            )
            .await
            .unwrap();
        store
            .set_document_path(
                ResourceKind::Deployment,
                &rec.id,
                DocumentColumn::Subsystems,
                &service,
                &json!({"name": "main", "port": 80}),
            )
            .await
            .unwrap();

        let fetched = store
            .get_resource(ResourceKind::Deployment, &rec.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fetched.subsystems["k8s"]["deploymentMap"]["main"]["name"],
            "main"
        );
        assert_eq!(fetched.subsystems["k8s"]["serviceMap"]["main"]["port"], 80);

        store
            .unset_document_path(
                ResourceKind::Deployment,
                &rec.id,
                DocumentColumn::Subsystems,
                &deployment,
            )
            .await
            .unwrap();
        let fetched = store
            .get_resource(ResourceKind::Deployment, &rec.id, false)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.subsystems["k8s"]["deploymentMap"]
            .get("main")
            .is_none());
        assert!(fetched.subsystems["k8s"]["serviceMap"].get("main").is_some());
    }

    #[tokio::test]
    async fn test_list_resources_filters() {
        let store = test_store().await;
        let mut a = record("a");
        a.owner_id = "alice".to_string();
        let mut b = record("b");
        b.owner_id = "bob".to_string();
        b.created_at = a.created_at + Duration::seconds(1);
        for rec in [&a, &b] {
            store
                .insert_resource(ResourceKind::Vm, rec)
                .await
                .unwrap();
        }

        let all = store
            .list_resources(ResourceKind::Vm, &ResourceFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(
            all.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        let filter = ResourceFilter {
            owner_ids: Some(vec!["bob".to_string()]),
            ..Default::default()
        };
        let bobs = store
            .list_resources(ResourceKind::Vm, &filter, None)
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].name, "b");

        let page = store
            .list_resources(
                ResourceKind::Vm,
                &ResourceFilter::default(),
                Some(Pagination {
                    page: 1,
                    page_size: 1,
                }),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].name, "b");
    }

    #[tokio::test]
    async fn test_quiescent_resources() {
        let store = test_store().await;
        let mut idle = record("idle");
        idle.created_at = Utc::now() - Duration::minutes(10);
        let mut busy = record("busy");
        busy.created_at = Utc::now() - Duration::minutes(10);
        busy.activities.insert(Activity::Updating);
        let fresh = record("fresh");
        for rec in [&idle, &busy, &fresh] {
            store
                .insert_resource(ResourceKind::Deployment, rec)
                .await
                .unwrap();
        }

        let found = store
            .list_quiescent_resources(
                ResourceKind::Deployment,
                Utc::now() - Duration::minutes(5),
                100,
            )
            .await
            .unwrap();
        assert_eq!(
            found.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["idle"]
        );
    }

    #[tokio::test]
    async fn test_claim_job_serialises_per_resource() {
        let store = test_store().await;
        let now = Utc::now();
        let first = new_job(Some("dep-1"), now - Duration::seconds(3));
        let second = new_job(Some("dep-1"), now - Duration::seconds(2));
        let other = new_job(Some("dep-2"), now - Duration::seconds(1));
        for job in [&first, &second, &other] {
            assert!(store.insert_job(job).await.unwrap());
        }

        let claimed = store.claim_job(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);

        // dep-1 has a running job, so the next claim skips to dep-2.
        let claimed = store.claim_job(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, other.id);

        assert!(store.claim_job(now).await.unwrap().is_none());

        store.finish_job(&first.id, now, None).await.unwrap();
        let claimed = store.claim_job(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn test_insert_job_is_idempotent() {
        let store = test_store().await;
        let job = new_job(None, Utc::now());
        assert!(store.insert_job(&job).await.unwrap());
        assert!(!store.insert_job(&job).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_job_waits_for_run_after() {
        let store = test_store().await;
        let now = Utc::now();
        let job = new_job(Some("vm-1"), now);
        store.insert_job(&job).await.unwrap();
        store.claim_job(now).await.unwrap().unwrap();

        store
            .retry_job(&job.id, now + Duration::seconds(30), 1, "boom")
            .await
            .unwrap();
        assert!(store.claim_job(now).await.unwrap().is_none());

        let claimed = store
            .claim_job(now + Duration::seconds(31))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.error_logs, vec!["boom".to_string()]);

        store.fail_job(&job.id, now, 2, "still boom").await.unwrap();
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_logs.len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_only_pending() {
        let store = test_store().await;
        let now = Utc::now();
        let job = new_job(None, now);
        store.insert_job(&job).await.unwrap();
        assert!(store.terminate_job(&job.id, now, "cancelled").await.unwrap());
        assert!(!store.terminate_job(&job.id, now, "cancelled").await.unwrap());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Terminated);
    }

    #[tokio::test]
    async fn test_reset_running_jobs() {
        let store = test_store().await;
        let now = Utc::now();
        let job = new_job(None, now);
        store.insert_job(&job).await.unwrap();
        store.claim_job(now).await.unwrap().unwrap();
        assert_eq!(store.reset_running_jobs().await.unwrap(), 1);
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    fn gpu(id: &str, host: &str) -> Gpu {
        Gpu {
            id: id.to_string(),
            name: format!("card-{id}"),
            zone: "se-sto".to_string(),
            host: host.to_string(),
            lease: None,
        }
    }

    fn lease(vm_id: &str, ends_at: DateTime<Utc>) -> GpuLease {
        GpuLease {
            vm_id: vm_id.to_string(),
            user_id: "user-1".to_string(),
            created_at: Utc::now(),
            ends_at,
            never_expire: false,
        }
    }

    #[tokio::test]
    async fn test_lease_gpu_compare_and_set() {
        let store = test_store().await;
        let now = Utc::now();
        store.upsert_gpu(&gpu("g1", "host-a")).await.unwrap();

        assert!(store
            .lease_gpu("g1", &lease("vm-1", now + Duration::days(1)), now)
            .await
            .unwrap());
        assert!(!store
            .lease_gpu("g1", &lease("vm-2", now + Duration::days(1)), now)
            .await
            .unwrap());

        // Expired leases can be taken over.
        let later = now + Duration::days(2);
        assert!(store
            .lease_gpu("g1", &lease("vm-2", later + Duration::days(1)), later)
            .await
            .unwrap());
        let held = store.get_gpu_by_vm("vm-2").await.unwrap().unwrap();
        assert_eq!(held.id, "g1");

        assert_eq!(store.release_gpus_for_vm("vm-2").await.unwrap(), 1);
        assert!(store.get_gpu("g1").await.unwrap().unwrap().lease.is_none());
    }

    #[tokio::test]
    async fn test_list_gpus_filters() {
        let store = test_store().await;
        let now = Utc::now();
        for (id, host) in [("g1", "host-a"), ("g2", "host-b"), ("g3", "host-c")] {
            store.upsert_gpu(&gpu(id, host)).await.unwrap();
        }
        store
            .lease_gpu("g1", &lease("vm-1", now + Duration::hours(1)), now)
            .await
            .unwrap();

        let filter = GpuFilter {
            zone: Some("se-sto".to_string()),
            available_at: Some(now),
            exclude_hosts: vec!["host-c".to_string()],
            ..Default::default()
        };
        let available = store.list_gpus(&filter).await.unwrap();
        assert_eq!(
            available.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
            vec!["g2"]
        );

        let expired = store
            .list_expired_leases(now + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "g1");
    }

    fn migration(resource_id: &str) -> ResourceMigration {
        ResourceMigration {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            resource_type: ResourceKind::Vm,
            migration_type: MigrationType::UpdateOwner,
            user_id: "alice".to_string(),
            status: MigrationStatus::Pending,
            code: Some("secret".to_string()),
            update_owner: UpdateOwnerParams {
                new_owner_id: "bob".to_string(),
                old_owner_id: "alice".to_string(),
            },
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_one_pending_migration_per_resource() {
        let store = test_store().await;
        let first = migration("vm-1");
        store.insert_migration(&first).await.unwrap();

        let err = store.insert_migration(&migration("vm-1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let listed = store.list_migrations(Some("bob")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_migrations(Some("carol")).await.unwrap().is_empty());

        store.delete_migration(&first.id, Utc::now()).await.unwrap();
        assert!(store.get_migration(&first.id).await.unwrap().is_none());
        store.insert_migration(&migration("vm-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications() {
        let store = test_store().await;
        let notification = Notification {
            id: Uuid::new_v4().to_string(),
            user_id: "bob".to_string(),
            notification_type: "resourceTransfer".to_string(),
            content: json!({"resourceId": "vm-1"}),
            created_at: Utc::now(),
            read_at: None,
        };
        store.insert_notification(&notification).await.unwrap();
        let listed = store.list_notifications("bob").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, notification.id);
        assert_eq!(listed[0].content, notification.content);
        store.delete_notification(&notification.id).await.unwrap();
        assert!(store.list_notifications("bob").await.unwrap().is_empty());
    }
}
