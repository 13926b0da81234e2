// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager documents.

use serde::{Deserialize, Serialize};

use super::subsystems::k8s::K8sSubsystem;
use super::{Document, ResourceKind, ResourceSpec};

/// Declared state of a storage manager; one per user per zone.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManagerSpec {}

/// Observed provider state of a storage manager.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManagerSubsystems {
    /// Kubernetes objects.
    #[serde(default)]
    pub k8s: K8sSubsystem,
}

impl ResourceSpec for StorageManagerSpec {
    const KIND: ResourceKind = ResourceKind::StorageManager;
    type Subsystems = StorageManagerSubsystems;
}

/// A storage manager document. Its name is `system-<ownerId>`.
pub type StorageManager = Document<StorageManagerSpec>;
