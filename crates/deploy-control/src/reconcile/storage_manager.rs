// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager driver. Everything lives in the owner's `system-` namespace.

use tracing::debug;

use super::{KubeSync, Mode};
use crate::config::Capability;
use crate::error::Result;
use crate::generators;
use crate::platform::Platform;

/// Converge storage manager `id` using `mode`.
pub async fn reconcile(platform: &Platform, id: &str, mode: Mode) -> Result<usize> {
    let sm = platform.storage_managers.get(id).await?;
    let zone = platform.zone(&sm.zone, Capability::Deployment)?;
    let kube = platform.clients.kube(zone).await?;
    let cert = platform.wildcard_cert(kube.as_ref()).await;
    let params = platform.k8s_params(zone, cert.as_ref());
    let desired = generators::k8s::storage_manager(&sm, &params);

    let changes = KubeSync::new(&kube, &platform.storage_managers, id)
        .reconcile(mode, &desired, &sm.subsystems.k8s)
        .await?;
    debug!(storage_manager_id = %id, ?mode, changes, "Storage manager reconciled");
    Ok(changes)
}

/// Delete the storage manager's objects including its namespace.
pub async fn teardown(platform: &Platform, id: &str) -> Result<usize> {
    let Some(sm) = platform.storage_managers.find_including_deleted(id).await? else {
        return Ok(0);
    };
    let zone = platform.zone(&sm.zone, Capability::Deployment)?;
    let kube = platform.clients.kube(zone).await?;
    KubeSync::new(&kube, &platform.storage_managers, id)
        .teardown(&sm.subsystems.k8s, true)
        .await
}
