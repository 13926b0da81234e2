// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled VM snapshots.
//!
//! A VM whose newest system snapshot is older than the schedule interval
//! gets a `createSystemSnapshot` job. The job itself prunes old system
//! snapshots down to the configured count.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use deploy_core::model::Vm;

use super::Worker;
use crate::config::SnapshotSchedule;
use crate::error::Result;
use crate::jobs::Job;
use crate::platform::Platform;
use crate::services::Principal;

/// Queues system snapshots on schedule.
pub struct Snapshotter {
    platform: Arc<Platform>,
    interval: Duration,
}

/// Creation time of the newest system snapshot of `vm`.
fn last_system_snapshot(vm: &Vm) -> Option<DateTime<Utc>> {
    vm.subsystems
        .cs
        .snapshot_map
        .values()
        .filter(|s| !s.user_created)
        .filter_map(|s| s.created_at)
        .max()
}

fn is_due(vm: &Vm, schedule: &SnapshotSchedule, now: DateTime<Utc>) -> bool {
    if schedule.interval_hours == 0 || vm.subsystems.cs.vm.is_none() || vm.is_being_deleted() {
        return false;
    }
    match last_system_snapshot(vm) {
        None => true,
        Some(at) => at + chrono::Duration::hours(i64::from(schedule.interval_hours)) <= now,
    }
}

impl Snapshotter {
    /// Create a snapshotter with the configured interval.
    pub fn new(platform: Arc<Platform>) -> Self {
        let interval = platform.config.workers.snapshot();
        Self { platform, interval }
    }

    /// Queue snapshots due at `now`. Returns how many were queued.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let platform = &self.platform;
        let schedule = &platform.config.snapshots;
        let user_id = Principal::system().user_id;
        let stamp = now.format("%Y%m%d%H%M");
        let mut queued = 0;
        for vm in platform.vms.list(&Default::default(), None).await? {
            if !is_due(&vm, schedule, now) || platform.jobs.has_live_job(&vm.id).await? {
                continue;
            }
            let name = format!("auto-{}-{stamp}", schedule.name);
            let job_id = format!("snapshot-{}-{stamp}", vm.id);
            let job = Job::CreateSystemSnapshot {
                id: vm.id.clone(),
                name,
            };
            if platform.jobs.submit(Some(&job_id), &user_id, &job).await?.created {
                debug!(vm_id = %vm.id, job_id = %job_id, "Snapshot queued");
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, schedule = %schedule.name, "System snapshots queued");
        }
        Ok(queued)
    }
}

#[async_trait]
impl Worker for Snapshotter {
    fn name(&self) -> &'static str {
        "Snapshotter"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        Ok(self.tick_at(Utc::now()).await? > 0)
    }
}
