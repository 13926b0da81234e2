// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound registry and repository webhooks.
//!
//! - GitHub `push` deliveries are verified against the per-deployment HMAC
//!   secret; a push to the default branch starts a build of every deployment
//!   behind the hook.
//! - Harbor `PUSH_ARTIFACT` events carry the configured webhook token in a
//!   Basic `Authorization` header and restart the deployment whose repository
//!   received the image.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deploy_core::Activity;
use deploy_core::model::Deployment;

use crate::error::{Error, Result};
use crate::generators::{github, naming};
use crate::jobs::{BuildRequest, Job};
use crate::platform::Platform;
use crate::services::deployments::{self, DeploymentCommand};
use crate::services::{Accepted, Context, Principal, begin};

/// Prefix of the `X-Hub-Signature-256` header value.
const SIGNATURE_PREFIX: &str = "sha256=";

/// Harbor event that triggers a restart.
pub const PUSH_ARTIFACT: &str = "PUSH_ARTIFACT";

/// What a webhook delivery led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Valid delivery that requires no work.
    Ignored,
    /// A job was queued.
    Queued {
        /// Queued job.
        job_id: String,
        /// Deployments the job acts on.
        deployment_ids: Vec<String>,
    },
}

/// Headers and raw body of a GitHub delivery.
#[derive(Debug, Clone, Copy)]
pub struct GithubDelivery<'a> {
    /// `X-GitHub-Event`.
    pub event: Option<&'a str>,
    /// `X-GitHub-Hook-ID`.
    pub hook_id: Option<&'a str>,
    /// `X-Hub-Signature-256`.
    pub signature: Option<&'a str>,
    /// Raw request body, as signed.
    pub body: &'a [u8],
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: String,
    repository: PushRepository,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    full_name: String,
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct HarborEvent {
    #[serde(rename = "type")]
    event_type: String,
    event_data: HarborEventData,
}

#[derive(Debug, Deserialize)]
struct HarborEventData {
    repository: HarborEventRepository,
}

#[derive(Debug, Deserialize)]
struct HarborEventRepository {
    name: String,
    #[serde(default)]
    namespace: String,
}

/// Check a `sha256=<hex>` signature of `body` made with `secret`.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    keyed(secret, body).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
}

/// `sha256=<hex>` signature of `body` made with `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mac = keyed(secret, body)?;
    Some(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

fn keyed(secret: &str, body: &[u8]) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(mac)
}

/// Secret the hook of `d` signs deliveries with.
fn hook_secret(platform: &Platform, d: &Deployment) -> String {
    d.subsystems
        .github
        .webhook
        .as_ref()
        .map(|hook| hook.secret.clone())
        .filter(|secret| !secret.is_empty())
        .unwrap_or_else(|| github::webhook_secret(&platform.config.session_secret, &d.id))
}

// GitHub hook IDs are positive integers.
fn is_hook_id(id: &str) -> bool {
    id.bytes().all(|b| b.is_ascii_digit()) && !id.trim_start_matches('0').is_empty()
}

/// Handle a GitHub delivery.
///
/// `ping` is acknowledged, `push` to the default branch of the repository
/// queues a `buildDeployments` job. Every deployment behind the hook must
/// accept the signature; one mismatch rejects the whole delivery.
pub async fn github_push(platform: &Platform, delivery: GithubDelivery<'_>) -> Result<HookOutcome> {
    let event = delivery
        .event
        .ok_or_else(|| Error::Validation("missing X-GitHub-Event header".to_string()))?;
    match event {
        "ping" => return Ok(HookOutcome::Ignored),
        "push" => {}
        other => return Err(Error::Validation(format!("unsupported event {other}"))),
    }
    let hook_id = delivery
        .hook_id
        .filter(|id| is_hook_id(id))
        .ok_or_else(|| Error::Validation("missing or invalid X-GitHub-Hook-ID header".into()))?;
    let signature = delivery
        .signature
        .ok_or_else(|| Error::Validation("missing X-Hub-Signature-256 header".to_string()))?;

    let hooked = deployments::by_github_hook(platform, hook_id).await?;
    if hooked.is_empty() {
        return Err(Error::NotFound(format!("deployments of hook {hook_id}")));
    }
    for d in &hooked {
        if !verify_signature(&hook_secret(platform, d), delivery.body, signature) {
            warn!(hook_id, deployment_id = %d.id, "GitHub delivery with invalid signature");
            return Err(Error::Forbidden("invalid signature".to_string()));
        }
    }

    let payload: PushPayload = serde_json::from_slice(delivery.body)
        .map_err(|e| Error::Validation(format!("invalid push payload: {e}")))?;
    let branch = payload
        .git_ref
        .strip_prefix("refs/heads/")
        .ok_or_else(|| Error::Validation(format!("invalid ref {}", payload.git_ref)))?;
    if branch != payload.repository.default_branch {
        debug!(hook_id, branch, "Push to non-default branch ignored");
        return Ok(HookOutcome::Ignored);
    }

    let mut started = Vec::with_capacity(hooked.len());
    for d in &hooked {
        match begin(&platform.deployments, &d.id, Activity::Building).await {
            Ok(()) => started.push(d.id.clone()),
            Err(Error::ActivityBlocked(by)) => {
                debug!(deployment_id = %d.id, blocked_by = %by, "Build skipped");
            }
            Err(e) => return Err(e),
        }
    }
    if started.is_empty() {
        return Ok(HookOutcome::Ignored);
    }

    let job = Job::BuildDeployments {
        ids: started.clone(),
        build: BuildRequest {
            repository: payload.repository.full_name,
            branch: branch.to_string(),
            commit: payload.after,
        },
    };
    let job_id = Uuid::new_v4().to_string();
    let user_id = Principal::system().user_id;
    if let Err(e) = platform.jobs.submit(Some(&job_id), &user_id, &job).await {
        for id in &started {
            let removed = platform.deployments.remove_activity(id, Activity::Building).await;
            if let Err(rollback) = removed {
                warn!(
                    resource_id = %id,
                    activity = %Activity::Building,
                    error = %rollback,
                    "Failed to roll back activity"
                );
            }
        }
        return Err(e);
    }
    info!(hook_id, job_id = %job_id, deployments = started.len(), "Build queued from push");
    Ok(HookOutcome::Queued {
        job_id,
        deployment_ids: started,
    })
}

/// Password part of a Basic `Authorization` header.
pub fn basic_auth_token(header: &str) -> Option<String> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_, token) = decoded.split_once(':')?;
    Some(token.to_string())
}

/// Handle a Harbor event. A pushed artifact restarts the deployment whose
/// repository received it.
pub async fn harbor_push(
    platform: &Arc<Platform>,
    authorization: Option<&str>,
    body: &[u8],
) -> Result<HookOutcome> {
    let token = authorization
        .and_then(basic_auth_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Unauthorized("missing token".to_string()))?;
    let expected = &platform.config.registry.webhook_token;
    if expected.is_empty() || token != *expected {
        return Err(Error::Unauthorized("invalid token".to_string()));
    }

    let event: HarborEvent = serde_json::from_slice(body)
        .map_err(|e| Error::Validation(format!("invalid registry event: {e}")))?;
    let repository = &event.event_data.repository;
    let d = deployments::by_name(platform, &repository.name)
        .await?
        .filter(|d| {
            repository.namespace.is_empty()
                || repository.namespace == naming::harbor_project(&d.owner_id)
        })
        .ok_or_else(|| Error::NotFound(format!("deployment {}", repository.name)))?;

    if event.event_type != PUSH_ARTIFACT {
        debug!(event = %event.event_type, deployment_id = %d.id, "Registry event ignored");
        return Ok(HookOutcome::Ignored);
    }

    let ctx = Context::system(platform.clone());
    let Accepted { id, job_id } =
        deployments::command(&ctx, &d.id, None, DeploymentCommand::Restart).await?;
    info!(deployment_id = %id, "Restart queued from registry push");
    Ok(HookOutcome::Queued {
        job_id: job_id.unwrap_or_default(),
        deployment_ids: vec![id],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use deploy_core::model::subsystems::github::GithubWebhook;

    use crate::testing;

    const PUSH: &[u8] = br#"{
        "ref": "refs/heads/main",
        "after": "abc123",
        "repository": {"full_name": "acme/a1", "default_branch": "main"}
    }"#;

    async fn hooked(platform: &Arc<Platform>) -> String {
        let mut d = testing::deployment("d-1", "a1", "u-1");
        let secret = github::webhook_secret(&platform.config.session_secret, "d-1");
        d.subsystems.github.webhook = Some(GithubWebhook {
            id: "77".to_string(),
            secret: secret.clone(),
            ..Default::default()
        });
        platform.deployments.create(&d).await.unwrap();
        secret
    }

    fn delivery<'a>(signature: &'a str, body: &'a [u8]) -> GithubDelivery<'a> {
        GithubDelivery {
            event: Some("push"),
            hook_id: Some("77"),
            signature: Some(signature),
            body,
        }
    }

    #[test]
    fn test_signature_round_trip() {
        let signature = sign("s3cret", b"payload").unwrap();
        assert!(verify_signature("s3cret", b"payload", &signature));
        assert!(!verify_signature("other", b"payload", &signature));
        assert!(!verify_signature("s3cret", b"payload!", &signature));
        assert!(!verify_signature("s3cret", b"payload", "sha1=00"));
        assert!(!verify_signature("s3cret", b"payload", "sha256=zz"));
    }

    #[test]
    fn test_basic_auth_token() {
        let header = format!("Basic {}", STANDARD.encode("harbor:tok"));
        assert_eq!(basic_auth_token(&header).as_deref(), Some("tok"));
        assert_eq!(basic_auth_token("Bearer tok"), None);
        assert_eq!(basic_auth_token("Basic !!!"), None);
    }

    #[tokio::test]
    async fn test_push_to_default_branch_queues_build() {
        let (platform, _) = testing::platform().await;
        let secret = hooked(&platform).await;
        let signature = sign(&secret, PUSH).unwrap();

        let outcome = github_push(&platform, delivery(&signature, PUSH)).await.unwrap();
        let HookOutcome::Queued {
            job_id,
            deployment_ids,
        } = outcome
        else {
            panic!("expected a queued build");
        };
        assert_eq!(deployment_ids, vec!["d-1".to_string()]);
        let job = platform.jobs.get(&job_id).await.unwrap();
        assert_eq!(job.job_type, "buildDeployments");
        assert_eq!(job.user_id, "system");
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(d.has_activity(Activity::Building));
    }

    #[tokio::test]
    async fn test_invalid_signature_is_forbidden() {
        let (platform, _) = testing::platform().await;
        hooked(&platform).await;
        let signature = sign("wrong", PUSH).unwrap();

        let err = github_push(&platform, delivery(&signature, PUSH)).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(platform.jobs.list(&Default::default(), None).await.unwrap().is_empty());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(!d.has_activity(Activity::Building));
    }

    #[tokio::test]
    async fn test_push_to_other_branch_is_ignored() {
        let (platform, _) = testing::platform().await;
        let secret = hooked(&platform).await;
        let body = br#"{
            "ref": "refs/heads/dev",
            "repository": {"full_name": "acme/a1", "default_branch": "main"}
        }"#;
        let signature = sign(&secret, body).unwrap();

        let outcome = github_push(&platform, delivery(&signature, body)).await.unwrap();
        assert_eq!(outcome, HookOutcome::Ignored);
        assert!(platform.jobs.list(&Default::default(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_hook_is_not_found() {
        let (platform, _) = testing::platform().await;
        let signature = sign("x", PUSH).unwrap();
        let err = github_push(&platform, delivery(&signature, PUSH)).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_harbor_push_restarts_deployment() {
        let (platform, _) = testing::platform().await;
        platform
            .deployments
            .create(&testing::deployment("d-1", "a1", "u-1"))
            .await
            .unwrap();
        let body = br#"{
            "type": "PUSH_ARTIFACT",
            "event_data": {"repository": {"name": "a1", "namespace": "u-1"}}
        }"#;

        let header = format!("Basic {}", STANDARD.encode("harbor:hook-token"));
        let outcome = harbor_push(&platform, Some(&header), body).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Queued { .. }));
        let d = platform.deployments.get("d-1").await.unwrap();
        assert!(d.has_activity(Activity::Restarting));

        let wrong = format!("Basic {}", STANDARD.encode("harbor:nope"));
        let err = harbor_push(&platform, Some(&wrong), body).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
        let err = harbor_push(&platform, None, body).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }
}
