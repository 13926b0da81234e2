// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quota accounting.

use serde::Serialize;

use deploy_core::persistence::ResourceFilter;

use crate::error::{Error, Result};
use crate::platform::Platform;

/// Resources a user currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Live deployments.
    pub deployments: u64,
    /// CPU cores across VMs.
    pub cpu_cores: u64,
    /// RAM across VMs, in GB.
    pub ram: u64,
    /// Disk across VMs, in GB.
    pub disk_size: u64,
    /// User-created snapshots across VMs.
    pub snapshots: u64,
}

impl Usage {
    /// Current usage of `owner_id`, optionally leaving out one VM (the one
    /// being resized).
    pub async fn of(platform: &Platform, owner_id: &str, except_vm: Option<&str>) -> Result<Self> {
        let filter = ResourceFilter {
            owner_ids: Some(vec![owner_id.to_string()]),
            ..Default::default()
        };
        let deployments = platform.deployments.list(&filter, None).await?.len() as u64;

        let mut usage = Self {
            deployments,
            ..Default::default()
        };
        for vm in platform.vms.list(&filter, None).await? {
            usage.snapshots += vm
                .subsystems
                .cs
                .snapshot_map
                .values()
                .filter(|s| s.user_created)
                .count() as u64;
            if Some(vm.id.as_str()) == except_vm {
                continue;
            }
            usage.cpu_cores += u64::from(vm.spec.specs.cpu_cores);
            usage.ram += u64::from(vm.spec.specs.ram);
            usage.disk_size += u64::from(vm.spec.specs.disk_size);
        }
        Ok(usage)
    }
}

/// Fail with [`Error::QuotaExceeded`] when `current + requested > limit`.
pub fn check(quota: &'static str, current: u64, requested: u64, limit: u32) -> Result<()> {
    let limit = u64::from(limit);
    if current.saturating_add(requested) > limit {
        return Err(Error::QuotaExceeded {
            quota,
            current,
            requested,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_boundary() {
        assert!(check("deployments", 4, 1, 5).is_ok());
        let err = check("deployments", 5, 1, 5).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(err.to_string().contains("deployments"));
        assert!(check("ram", 0, 0, 0).is_ok());
    }
}
