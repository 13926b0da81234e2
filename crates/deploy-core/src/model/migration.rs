// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource migrations (owner transfers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ResourceKind;
use crate::error::StoreError;

/// What a migration does. Only owner transfer exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationType {
    /// Transfer ownership to another user.
    UpdateOwner,
}

impl MigrationType {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpdateOwner => "updateOwner",
        }
    }
}

impl std::str::FromStr for MigrationType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "updateOwner" => Ok(Self::UpdateOwner),
            other => Err(StoreError::InvalidValue {
                field: "type",
                value: other.to_string(),
            }),
        }
    }
}

/// Migration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationStatus {
    /// Waiting for the receiving user.
    Pending,
    /// Accepted; the owner-update job has been submitted.
    Accepted,
}

impl MigrationStatus {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            other => Err(StoreError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Parameters of an owner transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOwnerParams {
    /// Receiving user.
    pub new_owner_id: String,
    /// Current owner.
    pub old_owner_id: String,
}

/// A resource migration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMigration {
    /// Migration ID.
    pub id: String,
    /// Migrated resource.
    pub resource_id: String,
    /// Kind of the migrated resource.
    pub resource_type: ResourceKind,
    /// Migration type.
    #[serde(rename = "type")]
    pub migration_type: MigrationType,
    /// User who created the migration.
    pub user_id: String,
    /// Current status.
    pub status: MigrationStatus,
    /// One-time acceptance token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Owner transfer parameters.
    pub update_owner: UpdateOwnerParams,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft-deletion time.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}
