// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Harbor registry objects as recorded in deployment documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subsystem_object;

/// Harbor project holding the user's repositories.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborProject {
    /// Project ID.
    #[serde(default)]
    pub id: String,
    /// Project name.
    pub name: String,
    /// Whether images can be pulled anonymously.
    pub public: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Robot account used as pull/push credentials.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborRobot {
    /// Robot ID.
    #[serde(default)]
    pub id: String,
    /// Robot name (without the `robot$` prefix).
    pub name: String,
    /// Project the robot is scoped to.
    pub project_name: String,
    /// Full account name as seen by docker clients.
    #[serde(default)]
    pub harbor_name: String,
    /// Secret returned by Harbor on creation.
    #[serde(default)]
    pub secret: String,
    /// Whether the robot is disabled.
    #[serde(default)]
    pub disable: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Source image copied into a fresh repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryPlaceholder {
    /// Project of the placeholder image.
    pub project_name: String,
    /// Repository of the placeholder image.
    pub repository_name: String,
}

/// Harbor repository for a custom deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborRepository {
    /// Repository ID.
    #[serde(default)]
    pub id: String,
    /// Repository name.
    pub name: String,
    /// Owning project.
    pub project_name: String,
    /// Image copied in until the first real push.
    #[serde(default)]
    pub placeholder: Option<RepositoryPlaceholder>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Harbor webhook notifying the control plane of pushes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborWebhook {
    /// Webhook policy ID.
    #[serde(default)]
    pub id: String,
    /// Policy name.
    pub name: String,
    /// Project the policy belongs to.
    pub project_name: String,
    /// Target URL.
    pub target: String,
    /// Basic-auth token sent with every event.
    pub token: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

subsystem_object!(HarborProject);
subsystem_object!(HarborRobot);
subsystem_object!(HarborRepository);
subsystem_object!(HarborWebhook);

/// Observed Harbor state of one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborSubsystem {
    /// The owner's project.
    #[serde(default)]
    pub project: Option<HarborProject>,
    /// Robot account.
    #[serde(default)]
    pub robot: Option<HarborRobot>,
    /// Image repository.
    #[serde(default)]
    pub repository: Option<HarborRepository>,
    /// Push webhook.
    #[serde(default)]
    pub webhook: Option<HarborWebhook>,
}
