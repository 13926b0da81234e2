// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Releases expired GPU leases.
//!
//! Each pass refreshes the GPU inventory from the hypervisors, then queues a
//! `detachGpu` job for every VM whose lease is over. Leases held by VMs that
//! are gone or being deleted are cleared directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use deploy_core::Activity;

use super::{Worker, begin_and_submit};
use crate::error::Result;
use crate::jobs::Job;
use crate::platform::Platform;
use crate::services::gpus;

/// Queues detach jobs for expired leases.
pub struct GpuLeaseEnforcer {
    platform: Arc<Platform>,
    interval: Duration,
}

impl GpuLeaseEnforcer {
    /// Create an enforcer with the configured interval.
    pub fn new(platform: Arc<Platform>) -> Self {
        let interval = platform.config.workers.gpu_lease();
        Self { platform, interval }
    }

    /// Handle leases expired at `now`. Returns how many were acted on.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let platform = &self.platform;
        if let Err(e) = gpus::sync_inventory(platform).await {
            warn!(error = %e, "Failed to synchronise GPU inventory");
        }

        let mut handled = 0;
        for gpu in platform.persistence.list_expired_leases(now).await? {
            let Some(lease) = gpu.lease else {
                continue;
            };
            let vm = platform.vms.find(&lease.vm_id).await?;
            match vm {
                Some(vm) if !vm.is_being_deleted() && vm.spec.gpu.is_some() => {
                    let job = Job::DetachGpu { id: vm.id.clone() };
                    let queued = begin_and_submit(
                        platform,
                        &platform.vms,
                        &vm.id,
                        Activity::DetachingGpu,
                        &job,
                    )
                    .await?;
                    if queued {
                        info!(
                            gpu_id = %gpu.id,
                            vm_id = %vm.id,
                            ends_at = %lease.ends_at,
                            "GPU lease expired, detach queued"
                        );
                        handled += 1;
                    }
                }
                _ => {
                    let released = platform
                        .persistence
                        .release_gpus_for_vm(&lease.vm_id)
                        .await?;
                    debug!(
                        gpu_id = %gpu.id,
                        vm_id = %lease.vm_id,
                        released,
                        "Orphaned lease released"
                    );
                    handled += 1;
                }
            }
        }
        Ok(handled)
    }
}

#[async_trait]
impl Worker for GpuLeaseEnforcer {
    fn name(&self) -> &'static str {
        "GPU lease enforcer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        Ok(self.tick_at(Utc::now()).await? > 0)
    }
}
