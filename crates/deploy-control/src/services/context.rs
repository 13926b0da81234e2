// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-request context: the caller and a small document cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use deploy_core::model::{Deployment, StorageManager, Vm};

use crate::config::{Permission, Quotas, RoleConfig, UserConfig};
use crate::error::{Error, Result};
use crate::platform::Platform;

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct Principal {
    /// User ID.
    pub user_id: String,
    /// Whether the caller is an administrator.
    pub admin: bool,
    /// Resolved roles.
    pub roles: Vec<RoleConfig>,
    /// Contact address.
    pub email: String,
}

impl Principal {
    /// Principal of a configured user.
    pub fn from_user(user: &UserConfig, roles: &[RoleConfig]) -> Self {
        Self {
            user_id: user.id.clone(),
            admin: user.admin,
            roles: roles
                .iter()
                .filter(|r| user.roles.contains(&r.name))
                .cloned()
                .collect(),
            email: user.email.clone(),
        }
    }

    /// Principal used by workers and webhooks.
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            admin: true,
            roles: Vec::new(),
            email: String::new(),
        }
    }

    /// Effective quotas: the most generous value of every role.
    pub fn quotas(&self) -> Quotas {
        let mut roles = self.roles.iter().map(|r| r.quotas);
        let Some(first) = roles.next() else {
            return Quotas::default();
        };
        roles.fold(first, |acc, q| Quotas {
            deployments: acc.deployments.max(q.deployments),
            cpu_cores: acc.cpu_cores.max(q.cpu_cores),
            ram: acc.ram.max(q.ram),
            disk_size: acc.disk_size.max(q.disk_size),
            snapshots: acc.snapshots.max(q.snapshots),
            gpu_lease_duration: acc.gpu_lease_duration.max(q.gpu_lease_duration),
        })
    }

    /// Whether any role grants `permission`. Administrators hold every permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.admin
            || self
                .roles
                .iter()
                .any(|r| r.permissions.contains(&permission))
    }

    /// Fail with [`Error::Forbidden`] unless `permission` is granted.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.has_permission(permission) {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("missing permission {permission:?}")))
        }
    }

    /// Whether the caller may see and change resources of `owner_id`.
    pub fn can_access(&self, owner_id: &str) -> bool {
        self.admin || self.user_id == owner_id
    }
}

/// Everything a command needs: the platform, the caller, and documents
/// already loaded during this request.
pub struct Context {
    /// Shared platform state.
    pub platform: Arc<Platform>,
    /// Caller.
    pub principal: Principal,
    deployments: Mutex<HashMap<String, Deployment>>,
    vms: Mutex<HashMap<String, Vm>>,
}

impl Context {
    /// Context for one request.
    pub fn new(platform: Arc<Platform>, principal: Principal) -> Self {
        Self {
            platform,
            principal,
            deployments: Mutex::new(HashMap::new()),
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Context acting as [`Principal::system`].
    pub fn system(platform: Arc<Platform>) -> Self {
        Self::new(platform, Principal::system())
    }

    /// Deployment `id`, visible to the caller.
    pub async fn deployment(&self, id: &str) -> Result<Deployment> {
        if let Some(d) = self.cached(&self.deployments, id) {
            return Ok(d);
        }
        let d = self.platform.deployments.get(id).await?;
        self.check_access(&d.owner_id, "deployment", id)?;
        self.deployments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), d.clone());
        Ok(d)
    }

    /// VM `id`, visible to the caller.
    pub async fn vm(&self, id: &str) -> Result<Vm> {
        if let Some(vm) = self.cached(&self.vms, id) {
            return Ok(vm);
        }
        let vm = self.platform.vms.get(id).await?;
        self.check_access(&vm.owner_id, "vm", id)?;
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string(), vm.clone());
        Ok(vm)
    }

    /// Storage manager `id`, visible to the caller.
    pub async fn storage_manager(&self, id: &str) -> Result<StorageManager> {
        let sm = self.platform.storage_managers.get(id).await?;
        self.check_access(&sm.owner_id, "storage manager", id)?;
        Ok(sm)
    }

    /// Drop cached copies of `id` after it was written.
    pub fn forget(&self, id: &str) {
        self.deployments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.vms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn cached<T: Clone>(&self, cache: &Mutex<HashMap<String, T>>, id: &str) -> Option<T> {
        cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    // Resources of other users are reported as missing.
    fn check_access(&self, owner_id: &str, kind: &str, id: &str) -> Result<()> {
        if self.principal.can_access(owner_id) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("{kind} {id}")))
        }
    }
}
