// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Notification ID.
    pub id: String,
    /// Recipient.
    pub user_id: String,
    /// Notification type, e.g. `resourceTransfer`.
    #[serde(rename = "type")]
    pub notification_type: String,
    /// Type-specific payload.
    pub content: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the recipient read it.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}
