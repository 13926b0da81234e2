// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! GitHub push webhook of a deployment.

use sha2::{Digest, Sha256};

use deploy_core::model::Deployment;
use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::github::GithubWebhook;

/// Path of the GitHub push hook below the external URL.
pub const GITHUB_HOOK_PATH: &str = "/v1/hooks/deployments/github";

/// Secret GitHub signs deliveries with. Derived from the session secret so
/// regenerating the hook never rotates it.
pub fn webhook_secret(session_secret: &str, deployment_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_secret.as_bytes());
    hasher.update(b"\0github-webhook\0");
    hasher.update(deployment_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Webhook a deployment should have; `None` when no repository is linked.
pub fn webhook(d: &Deployment, external_url: &str, session_secret: &str) -> Option<GithubWebhook> {
    let github = &d.subsystems.github;
    if !github.has_repository() {
        return None;
    }

    let mut desired = GithubWebhook {
        name: "web".to_string(),
        repository_id: github.repository_id,
        events: vec!["push".to_string()],
        active: true,
        content_type: "json".to_string(),
        web_hook_url: format!("{external_url}{GITHUB_HOOK_PATH}"),
        secret: webhook_secret(session_secret, &d.id),
        ..Default::default()
    };
    if let Some(observed) = github.webhook.as_ref().filter(|w| w.is_created()) {
        desired.preserve_from(observed);
    }
    Some(desired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::model::{App, DeploymentSpec, DeploymentType};

    fn linked() -> Deployment {
        let mut d = Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Custom, App::new("img", 80)),
        );
        d.subsystems.github.token = "gho_x".to_string();
        d.subsystems.github.repository_id = 42;
        d
    }

    #[test]
    fn test_secret_is_stable() {
        let a = webhook_secret("session", "d-1");
        assert_eq!(a, webhook_secret("session", "d-1"));
        assert_ne!(a, webhook_secret("session", "d-2"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_no_repository_no_hook() {
        let mut d = linked();
        d.subsystems.github.repository_id = 0;
        assert!(webhook(&d, "https://deploy.example", "s").is_none());
    }

    #[test]
    fn test_hook_fields() {
        let hook = webhook(&linked(), "https://deploy.example", "s").unwrap();
        assert_eq!(hook.repository_id, 42);
        assert_eq!(hook.events, vec!["push".to_string()]);
        assert_eq!(
            hook.web_hook_url,
            "https://deploy.example/v1/hooks/deployments/github"
        );
    }
}
