// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image build records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of the latest image build for a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    /// Build pipeline ID.
    pub id: String,
    /// Source repository name.
    pub repository: String,
    /// Built branch.
    pub branch: String,
    /// Tag pushed to the registry.
    pub tag: String,
    /// `running`, `success` or `failed`.
    pub status: String,
    /// Build log lines.
    #[serde(default)]
    pub trace: Vec<String>,
    /// When the build was triggered.
    pub created_at: DateTime<Utc>,
}

/// Build state of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitlabSubsystem {
    /// Most recent build.
    #[serde(default)]
    pub last_build: Option<Build>,
}
