// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub objects as recorded in deployment documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subsystem_object;

/// Repository push webhook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubWebhook {
    /// Hook ID (sent back in `X-GitHub-Hook-Id`).
    #[serde(default)]
    pub id: String,
    /// Hook name.
    pub name: String,
    /// Repository the hook is installed on.
    pub repository_id: i64,
    /// Subscribed events.
    #[serde(default)]
    pub events: Vec<String>,
    /// Whether the hook is active.
    pub active: bool,
    /// Payload content type.
    pub content_type: String,
    /// Delivery URL.
    pub web_hook_url: String,
    /// HMAC secret for `X-Hub-Signature-256`.
    pub secret: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

subsystem_object!(GithubWebhook);

/// Observed GitHub state of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubSubsystem {
    /// OAuth token used to manage the hook.
    #[serde(default)]
    pub token: String,
    /// Linked repository (0 when no repository is linked).
    #[serde(default)]
    pub repository_id: i64,
    /// Installed webhook.
    #[serde(default)]
    pub webhook: Option<GithubWebhook>,
}

impl GithubSubsystem {
    /// Whether the owner linked a repository.
    pub fn has_repository(&self) -> bool {
        self.repository_id != 0 && !self.token.is_empty()
    }
}
