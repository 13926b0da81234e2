// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Harbor v2 API client.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::header::LOCATION;
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use deploy_core::model::subsystems::harbor::{
    HarborProject, HarborRepository, HarborRobot, HarborWebhook,
};

use super::{checked, gone_ok, json, optional};
use crate::api::webhooks::{PUSH_ARTIFACT, basic_auth_token};
use crate::config::RegistryConfig;
use crate::providers::{HarborApi, Provider, ProviderError, ProviderResult};

const ROBOT_PREFIX: &str = "robot$";

/// Client for the registry.
pub struct HttpHarbor {
    client: reqwest::Client,
    api_url: String,
    username: String,
    password: String,
}

impl HttpHarbor {
    /// Client authenticating as the configured admin.
    pub fn new(client: reqwest::Client, registry: &RegistryConfig) -> Self {
        Self {
            client,
            api_url: format!("{}/api/v2.0", registry.url.trim_end_matches('/')),
            username: registry.username.clone(),
            password: registry.password.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn get(
        &self,
        path: &str,
        kind: &'static str,
        name: &str,
    ) -> ProviderResult<Option<Value>> {
        let response = self
            .request(Method::GET, path)
            .header("X-Is-Resource-Name", "true")
            .send()
            .await?;
        match optional(response, kind, name).await? {
            Some(response) => Ok(Some(json(response).await?)),
            None => Ok(None),
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        kind: &'static str,
        name: &str,
    ) -> ProviderResult<Response> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request.json(&body);
        }
        checked(request.send().await?, kind, name).await
    }

    async fn remove(&self, path: &str, kind: &'static str, name: &str) -> ProviderResult<()> {
        gone_ok(
            self.send(Method::DELETE, path, None, kind, name)
                .await
                .map(|_| ()),
        )
    }
}

/// Last path segment of the `Location` header of a `201 Created`.
fn created_id(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn string_id(value: &Value, key: &str) -> String {
    match value.get(key) {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn created_at(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("creation_time")
        .and_then(|t| DateTime::<Utc>::deserialize(t).ok())
}

fn repository_path(project: &str, repository: &str) -> String {
    // Harbor expects slashes in repository names to be encoded twice.
    let encoded = urlencoding::encode(repository);
    format!(
        "/projects/{project}/repositories/{}",
        urlencoding::encode(&encoded)
    )
}

fn robot_body(robot: &HarborRobot) -> Value {
    json!({
        "name": robot.name,
        "level": "project",
        "duration": -1,
        "disable": robot.disable,
        "permissions": [{
            "kind": "project",
            "namespace": robot.project_name,
            "access": [
                { "resource": "repository", "action": "pull" },
                { "resource": "repository", "action": "push" },
            ],
        }],
    })
}

fn parse_robot(live: &Value, observed: &HarborRobot) -> HarborRobot {
    let harbor_name = live
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let (project_name, name) = harbor_name
        .strip_prefix(ROBOT_PREFIX)
        .and_then(|rest| rest.split_once('+'))
        .map(|(p, n)| (p.to_string(), n.to_string()))
        .unwrap_or_else(|| (observed.project_name.clone(), observed.name.clone()));
    HarborRobot {
        id: string_id(live, "id"),
        name,
        project_name,
        harbor_name,
        secret: live
            .get("secret")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        disable: live
            .get("disable")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        created_at: created_at(live),
    }
}

fn webhook_body(webhook: &HarborWebhook) -> Value {
    let credentials = STANDARD.encode(format!("harbor:{}", webhook.token));
    json!({
        "name": webhook.name,
        "enabled": true,
        "event_types": [PUSH_ARTIFACT],
        "targets": [{
            "type": "http",
            "address": webhook.target,
            "auth_header": format!("Basic {credentials}"),
            "skip_cert_verify": false,
        }],
    })
}

fn parse_webhook(live: &Value, project_name: &str) -> HarborWebhook {
    let target = live.pointer("/targets/0").cloned().unwrap_or(Value::Null);
    let text = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    HarborWebhook {
        id: string_id(live, "id"),
        name: text(live, "name"),
        project_name: project_name.to_string(),
        target: text(&target, "address"),
        token: basic_auth_token(&text(&target, "auth_header")).unwrap_or_default(),
        created_at: created_at(live),
    }
}

#[async_trait]
impl Provider<HarborProject> for HttpHarbor {
    async fn read(&self, observed: &HarborProject) -> ProviderResult<Option<HarborProject>> {
        let path = format!("/projects/{}", observed.name);
        let Some(live) = self.get(&path, "harbor project", &observed.name).await? else {
            return Ok(None);
        };
        Ok(Some(HarborProject {
            id: string_id(&live, "project_id"),
            name: live
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&observed.name)
                .to_string(),
            public: live.pointer("/metadata/public").and_then(Value::as_str) == Some("true"),
            created_at: created_at(&live),
        }))
    }

    async fn create(&self, desired: &HarborProject) -> ProviderResult<HarborProject> {
        let body = json!({
            "project_name": desired.name,
            "metadata": { "public": desired.public.to_string() },
        });
        let response = self
            .request(Method::POST, "/projects")
            .json(&body)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(project = %desired.name, "Harbor project already exists");
        } else {
            checked(response, "harbor project", &desired.name).await?;
        }
        self.read(desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor project", &desired.name))
    }

    async fn update(&self, desired: &HarborProject) -> ProviderResult<HarborProject> {
        let body = json!({ "metadata": { "public": desired.public.to_string() } });
        let path = format!("/projects/{}", desired.name);
        self.send(Method::PUT, &path, Some(body), "harbor project", &desired.name)
            .await?;
        self.read(desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor project", &desired.name))
    }

    async fn delete(&self, observed: &HarborProject) -> ProviderResult<()> {
        let path = format!("/projects/{}", observed.name);
        self.remove(&path, "harbor project", &observed.name).await
    }
}

#[async_trait]
impl Provider<HarborRobot> for HttpHarbor {
    async fn read(&self, observed: &HarborRobot) -> ProviderResult<Option<HarborRobot>> {
        let path = format!("/robots/{}", observed.id);
        Ok(self
            .get(&path, "harbor robot", &observed.name)
            .await?
            .map(|live| parse_robot(&live, observed)))
    }

    async fn create(&self, desired: &HarborRobot) -> ProviderResult<HarborRobot> {
        let response = self
            .send(
                Method::POST,
                "/robots",
                Some(robot_body(desired)),
                "harbor robot",
                &desired.name,
            )
            .await?;
        let live: Value = json(response).await?;
        Ok(parse_robot(&live, desired))
    }

    async fn update(&self, desired: &HarborRobot) -> ProviderResult<HarborRobot> {
        let mut body = robot_body(desired);
        body["id"] = json!(desired.id.parse::<i64>().unwrap_or_default());
        body["name"] = json!(desired.harbor_name);
        let path = format!("/robots/{}", desired.id);
        self.send(Method::PUT, &path, Some(body), "harbor robot", &desired.name)
            .await?;
        let live = self
            .read(desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor robot", &desired.name))?;
        Ok(HarborRobot {
            secret: desired.secret.clone(),
            ..live
        })
    }

    async fn delete(&self, observed: &HarborRobot) -> ProviderResult<()> {
        let path = format!("/robots/{}", observed.id);
        self.remove(&path, "harbor robot", &observed.name).await
    }
}

#[async_trait]
impl Provider<HarborRepository> for HttpHarbor {
    async fn read(&self, observed: &HarborRepository) -> ProviderResult<Option<HarborRepository>> {
        let path = repository_path(&observed.project_name, &observed.name);
        let Some(live) = self.get(&path, "harbor repository", &observed.name).await? else {
            return Ok(None);
        };
        Ok(Some(HarborRepository {
            id: string_id(&live, "id"),
            name: observed.name.clone(),
            project_name: observed.project_name.clone(),
            placeholder: observed.placeholder.clone(),
            created_at: created_at(&live),
        }))
    }

    async fn create(&self, desired: &HarborRepository) -> ProviderResult<HarborRepository> {
        // Harbor has no empty repositories; copying the placeholder creates one.
        let placeholder = desired.placeholder.as_ref().ok_or_else(|| {
            ProviderError::Permanent(format!(
                "repository {} has no placeholder image to copy",
                desired.name
            ))
        })?;
        let path = format!(
            "{}/artifacts",
            repository_path(&desired.project_name, &desired.name)
        );
        let from = format!(
            "{}/{}:latest",
            placeholder.project_name, placeholder.repository_name
        );
        let response = self
            .request(Method::POST, &path)
            .query(&[("from", from)])
            .send()
            .await?;
        checked(response, "harbor repository", &desired.name).await?;
        self.read(desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor repository", &desired.name))
    }

    async fn update(&self, desired: &HarborRepository) -> ProviderResult<HarborRepository> {
        match self.read(desired).await? {
            Some(live) => Ok(live),
            None => self.create(desired).await,
        }
    }

    async fn delete(&self, observed: &HarborRepository) -> ProviderResult<()> {
        let path = repository_path(&observed.project_name, &observed.name);
        self.remove(&path, "harbor repository", &observed.name)
            .await
    }
}

#[async_trait]
impl Provider<HarborWebhook> for HttpHarbor {
    async fn read(&self, observed: &HarborWebhook) -> ProviderResult<Option<HarborWebhook>> {
        let path = format!(
            "/projects/{}/webhook/policies/{}",
            observed.project_name, observed.id
        );
        Ok(self
            .get(&path, "harbor webhook", &observed.name)
            .await?
            .map(|live| parse_webhook(&live, &observed.project_name)))
    }

    async fn create(&self, desired: &HarborWebhook) -> ProviderResult<HarborWebhook> {
        let path = format!("/projects/{}/webhook/policies", desired.project_name);
        let response = self
            .send(
                Method::POST,
                &path,
                Some(webhook_body(desired)),
                "harbor webhook",
                &desired.name,
            )
            .await?;
        let id = created_id(&response).ok_or_else(|| {
            ProviderError::Permanent("harbor returned no webhook policy id".to_string())
        })?;
        let created = HarborWebhook {
            id,
            ..desired.clone()
        };
        self.read(&created)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor webhook", &desired.name))
    }

    async fn update(&self, desired: &HarborWebhook) -> ProviderResult<HarborWebhook> {
        let path = format!(
            "/projects/{}/webhook/policies/{}",
            desired.project_name, desired.id
        );
        let mut body = webhook_body(desired);
        body["id"] = json!(desired.id.parse::<i64>().unwrap_or_default());
        self.send(Method::PUT, &path, Some(body), "harbor webhook", &desired.name)
            .await?;
        self.read(desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("harbor webhook", &desired.name))
    }

    async fn delete(&self, observed: &HarborWebhook) -> ProviderResult<()> {
        let path = format!(
            "/projects/{}/webhook/policies/{}",
            observed.project_name, observed.id
        );
        self.remove(&path, "harbor webhook", &observed.name).await
    }
}

impl HarborApi for HttpHarbor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_robot_name_is_split() {
        let observed = HarborRobot {
            name: "app".to_string(),
            project_name: "user-1".to_string(),
            ..Default::default()
        };
        let live = json!({
            "id": 7,
            "name": "robot$user-1+app",
            "disable": false,
            "creation_time": "2025-01-01T00:00:00.000Z",
        });
        let robot = parse_robot(&live, &observed);
        assert_eq!(robot.id, "7");
        assert_eq!(robot.name, "app");
        assert_eq!(robot.project_name, "user-1");
        assert_eq!(robot.harbor_name, "robot$user-1+app");
        assert!(robot.secret.is_empty());
        assert!(robot.created_at.is_some());
    }

    #[test]
    fn test_webhook_token_round_trips_through_auth_header() {
        let webhook = HarborWebhook {
            id: "3".to_string(),
            name: "app".to_string(),
            project_name: "user-1".to_string(),
            target: "https://deploy.example/v1/hooks/deployments/harbor".to_string(),
            token: "hook-token".to_string(),
            created_at: None,
        };
        let mut live = webhook_body(&webhook);
        live["id"] = json!(3);
        assert_eq!(parse_webhook(&live, "user-1"), webhook);
    }

    #[test]
    fn test_nested_repository_names_are_double_encoded() {
        assert_eq!(
            repository_path("user-1", "team/app"),
            "/projects/user-1/repositories/team%252Fapp"
        );
        assert_eq!(
            repository_path("user-1", "app"),
            "/projects/user-1/repositories/app"
        );
    }
}
