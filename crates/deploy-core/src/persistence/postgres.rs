// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.
//!
//! JSON columns are `TEXT` so both backends decode the same row shape; keyed
//! writes cast through `jsonb` for the path operators.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::info;

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

const ADD_ACTIVITY_ATTEMPTS: usize = 3;

/// PostgreSQL-backed persistence provider.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and apply migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::migrations::POSTGRES.run(&pool).await?;
        info!(max_connections, "Connected to PostgreSQL, migrations applied");
        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_resource(&self, kind: ResourceKind, record: &ResourceRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} ({RESOURCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
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
            "SELECT {RESOURCE_COLUMNS} FROM {} WHERE id = $1 AND ($2 OR deleted_at IS NULL)",
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
            WHERE name = $1 AND ($2 OR deleted_at IS NULL)
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
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {RESOURCE_COLUMNS} FROM {} WHERE TRUE",
            kind.table()
        ));
        if !filter.include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }
        if let Some(owners) = &filter.owner_ids {
            if owners.is_empty() {
                return Ok(Vec::new());
            }
            qb.push(" AND owner_id = ANY(").push_bind(owners.clone()).push(")");
        }
        if let Some(zone) = &filter.zone {
            qb.push(" AND zone = ").push_bind(zone.clone());
        }
        if let Some(activity) = filter.activity {
            qb.push(" AND activities::jsonb ? ")
                .push_bind(activity.as_str());
        }
        if let Some(webhook_id) = &filter.github_webhook_id {
            qb.push(" AND subsystems::jsonb #>> '{github,webhook,id}' = ")
                .push_bind(webhook_id.clone());
        }
        qb.push(" ORDER BY created_at, id");
        if let Some(page) = pagination {
            qb.push(" LIMIT ")
                .push_bind(page.limit())
                .push(" OFFSET ")
                .push_bind(page.offset());
        }

        let rows = qb
            .build_query_as::<ResourceRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceRecord::try_from).collect()
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
        let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {} SET ", kind.table()));
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
            "UPDATE {} SET {col} = jsonb_set({col}::jsonb, $1::text[], $2::jsonb, true)::text \
             WHERE id = $3",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(path.postgres_path())
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
            "UPDATE {} SET {col} = ({col}::jsonb #- $1::text[])::text WHERE id = $2",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(path.postgres_path())
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
        let sql = format!(
            r#"
            UPDATE {}
            SET activities = (activities::jsonb || to_jsonb($1::text))::text
            WHERE id = $2
              AND (deleted_at IS NULL OR $1 = 'beingDeleted')
              AND NOT (activities::jsonb ?| $3::text[])
            "#,
            kind.table()
        );
        let guards = activity_guard_names(activity);

        for _ in 0..ADD_ACTIVITY_ATTEMPTS {
            let result = sqlx::query(&sql)
                .bind(activity.as_str())
                .bind(id)
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
        let sql = format!(
            "UPDATE {} SET activities = (activities::jsonb - $1::text)::text WHERE id = $2",
            kind.table()
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
                let sql = format!("UPDATE {table} SET {column} = $1 WHERE id = $2");
                sqlx::query(&sql)
                    .bind(at)
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
            Some(activity) => {
                let sql = format!(
                    "UPDATE {table} SET {column} = $1, \
                     activities = (activities::jsonb - $2::text)::text WHERE id = $3"
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
              AND jsonb_array_length(activities::jsonb) = 0
              AND COALESCE(repaired_at, created_at) < $1
            ORDER BY COALESCE(repaired_at, created_at), id
            LIMIT $2
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
            "UPDATE {} SET status_code = $1, status_message = $2 WHERE id = $3",
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
        let sql = format!("DELETE FROM {} WHERE id = $1", kind.table());
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, user_id, job_type, args, resource_id, status, error_logs,
                              attempts, version, created_at, run_after)
            VALUES ($1, $2, $3, $4, $5, 'pending', '[]', 0, $6, $7, $8)
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
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
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
            QueryBuilder::<Postgres>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE TRUE"));
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
        // SKIP LOCKED lets concurrent executors pass over a row another one is claiming.
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', last_run_at = $1
            WHERE status = 'pending' AND id = (
                SELECT j.id FROM jobs j
                WHERE j.status = 'pending'
                  AND j.run_after <= $1
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
                                AND (p.created_at, p.id) < (j.created_at, j.id)
                          )
                      )
                  )
                ORDER BY j.created_at, j.id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn finish_job(&self, id: &str, at: DateTime<Utc>, note: Option<&str>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'finished', finished_at = $1,
                error_logs = CASE WHEN $2::text IS NULL THEN error_logs
                                  ELSE (error_logs::jsonb || to_jsonb($2::text))::text END
            WHERE id = $3 AND status = 'running'
            "#,
        )
        .bind(at)
        .bind(note)
        .bind(id)
        .execute(&self.pool)
        .await?;
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
            SET status = 'pending', run_after = $1, attempts = $2,
                error_logs = (error_logs::jsonb || to_jsonb($3::text))::text
            WHERE id = $4 AND status = 'running'
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
            SET status = 'failed', finished_at = $1, attempts = $2,
                error_logs = (error_logs::jsonb || to_jsonb($3::text))::text
            WHERE id = $4 AND status = 'running'
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
            SET status = 'terminated', finished_at = $1,
                error_logs = (error_logs::jsonb || to_jsonb($2::text))::text
            WHERE id = $3 AND status = 'pending'
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
            INSERT INTO gpus (id, name, zone, host) VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, zone = EXCLUDED.zone, host = EXCLUDED.host
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
        let sql = format!("SELECT {GPU_COLUMNS} FROM gpus WHERE id = $1");
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Gpu::from))
    }

    async fn get_gpu_by_vm(&self, vm_id: &str) -> Result<Option<Gpu>> {
        let sql = format!("SELECT {GPU_COLUMNS} FROM gpus WHERE lease_vm_id = $1 LIMIT 1");
        let row = sqlx::query_as::<_, GpuRow>(&sql)
            .bind(vm_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Gpu::from))
    }

    async fn list_gpus(&self, filter: &GpuFilter) -> Result<Vec<Gpu>> {
        let mut qb =
            QueryBuilder::<Postgres>::new(format!("SELECT {GPU_COLUMNS} FROM gpus WHERE TRUE"));
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
            qb.push(format!(" AND NOT ({column} = ANY("))
                .push_bind(values.clone())
                .push("))");
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
            SET lease_vm_id = $1, lease_user_id = $2, lease_created_at = $3,
                lease_ends_at = $4, lease_never_expire = $5
            WHERE id = $6
              AND (lease_vm_id IS NULL
                   OR lease_vm_id = $1
                   OR (NOT lease_never_expire AND lease_ends_at < $7))
            "#,
        )
        .bind(&lease.vm_id)
        .bind(&lease.user_id)
        .bind(lease.created_at)
        .bind(lease.ends_at)
        .bind(lease.never_expire)
        .bind(id)
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
                lease_ends_at = NULL, lease_never_expire = FALSE
            WHERE lease_vm_id = $1
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
            WHERE lease_vm_id IS NOT NULL AND NOT lease_never_expire AND lease_ends_at < $1
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
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
            "SELECT {MIGRATION_COLUMNS} FROM resource_migrations \
             WHERE id = $1 AND deleted_at IS NULL"
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
            WHERE resource_id = $1 AND deleted_at IS NULL
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
              AND ($1::text IS NULL OR user_id = $1 OR new_owner_id = $1)
            ORDER BY created_at, id
            "#
        );
        let rows = sqlx::query_as::<_, MigrationRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ResourceMigration::try_from).collect()
    }

    async fn set_migration_status(&self, id: &str, status: MigrationStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE resource_migrations SET status = $1 WHERE id = $2 AND deleted_at IS NULL",
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
            "UPDATE resource_migrations SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL",
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_notification(&self, notification: &Notification) -> Result<()> {
        let sql = format!(
            "INSERT INTO notifications ({NOTIFICATION_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
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
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = $1 \
             ORDER BY created_at DESC, id"
        );
        let rows = sqlx::query_as::<_, NotificationRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn delete_notification(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM notifications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
