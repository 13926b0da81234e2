// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub repository webhooks, authenticated with the deployment's token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};

use deploy_core::model::subsystems::github::GithubWebhook;

use super::{checked, gone_ok, json, optional};
use crate::providers::{GithubApi, Provider, ProviderError, ProviderResult};

const API_VERSION: &str = "2022-11-28";

/// Client bound to one user token.
pub struct HttpGithub {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct HookConfig {
    #[serde(default)]
    url: String,
    #[serde(default)]
    content_type: String,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: i64,
    name: String,
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    config: HookConfig,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl Hook {
    /// GitHub masks the secret; it is taken from the recorded object.
    fn into_webhook(self, observed: &GithubWebhook) -> GithubWebhook {
        GithubWebhook {
            id: self.id.to_string(),
            name: self.name,
            repository_id: observed.repository_id,
            events: self.events,
            active: self.active,
            content_type: self.config.content_type,
            web_hook_url: self.config.url,
            secret: observed.secret.clone(),
            created_at: self.created_at,
        }
    }
}

impl HttpGithub {
    /// Client for `api_url` using `token`.
    pub fn new(client: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    fn hooks_path(repository_id: i64) -> String {
        format!("/repositories/{repository_id}/hooks")
    }

    fn hook_path(hook: &GithubWebhook) -> String {
        format!("{}/{}", Self::hooks_path(hook.repository_id), hook.id)
    }
}

fn hook_body(hook: &GithubWebhook) -> Value {
    json!({
        "name": hook.name,
        "active": hook.active,
        "events": hook.events,
        "config": {
            "url": hook.web_hook_url,
            "content_type": hook.content_type,
            "secret": hook.secret,
            "insecure_ssl": "0",
        },
    })
}

#[async_trait]
impl Provider<GithubWebhook> for HttpGithub {
    async fn read(&self, observed: &GithubWebhook) -> ProviderResult<Option<GithubWebhook>> {
        let response = self
            .request(Method::GET, &Self::hook_path(observed))
            .send()
            .await?;
        let Some(response) = optional(response, "github webhook", &observed.id).await? else {
            return Ok(None);
        };
        let hook: Hook = json(response).await?;
        Ok(Some(hook.into_webhook(observed)))
    }

    async fn create(&self, desired: &GithubWebhook) -> ProviderResult<GithubWebhook> {
        let response = self
            .request(Method::POST, &Self::hooks_path(desired.repository_id))
            .json(&hook_body(desired))
            .send()
            .await?;
        let response = checked(response, "github webhook", &desired.name).await?;
        let hook: Hook = json(response).await?;
        Ok(hook.into_webhook(desired))
    }

    async fn update(&self, desired: &GithubWebhook) -> ProviderResult<GithubWebhook> {
        if desired.id.is_empty() {
            return Err(ProviderError::Permanent(
                "github webhook has no id to update".to_string(),
            ));
        }
        let response = self
            .request(Method::PATCH, &Self::hook_path(desired))
            .json(&hook_body(desired))
            .send()
            .await?;
        let response = checked(response, "github webhook", &desired.id).await?;
        let hook: Hook = json(response).await?;
        Ok(hook.into_webhook(desired))
    }

    async fn delete(&self, observed: &GithubWebhook) -> ProviderResult<()> {
        let response = self
            .request(Method::DELETE, &Self::hook_path(observed))
            .send()
            .await?;
        gone_ok(
            checked(response, "github webhook", &observed.id)
                .await
                .map(|_| ()),
        )
    }
}

impl GithubApi for HttpGithub {}
