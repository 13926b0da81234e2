// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GPU inventory and leases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-bounded association of a GPU to a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuLease {
    /// VM holding the lease.
    pub vm_id: String,
    /// User the lease was granted to.
    pub user_id: String,
    /// When the lease was granted.
    pub created_at: DateTime<Utc>,
    /// When the lease ends.
    pub ends_at: DateTime<Utc>,
    /// Admin-granted leases that never expire.
    #[serde(default)]
    pub never_expire: bool,
}

impl GpuLease {
    /// Whether the lease is over at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.never_expire && now > self.ends_at
    }
}

/// A physical GPU installed in a hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gpu {
    /// `<pciBus>-<host>` identifier.
    pub id: String,
    /// Marketing name (used by the privileged list).
    pub name: String,
    /// Zone of the host.
    pub zone: String,
    /// Hypervisor host.
    pub host: String,
    /// Current lease.
    #[serde(default)]
    pub lease: Option<GpuLease>,
}

impl Gpu {
    /// Whether a non-expired lease is held at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Whether the GPU can be leased to `vm_id` at `now`.
    pub fn is_available_for(&self, vm_id: &str, now: DateTime<Utc>) -> bool {
        match &self.lease {
            None => true,
            Some(lease) => lease.vm_id == vm_id || lease.is_expired(now),
        }
    }
}
