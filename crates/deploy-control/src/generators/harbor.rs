// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Harbor objects of custom-image deployments.

use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::harbor::{
    HarborProject, HarborRepository, HarborRobot, HarborWebhook, RepositoryPlaceholder,
};
use deploy_core::model::{Deployment, DeploymentType};

use super::naming;
use crate::config::RegistryConfig;

/// Path of the registry push hook below the external URL.
pub const HARBOR_HOOK_PATH: &str = "/v1/hooks/deployments/harbor";

/// Desired Harbor objects of one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarborDesired {
    /// The owner's project.
    pub project: Option<HarborProject>,
    /// Pull/push robot.
    pub robot: Option<HarborRobot>,
    /// Image repository.
    pub repository: Option<HarborRepository>,
    /// Push webhook.
    pub webhook: Option<HarborWebhook>,
}

/// Registry host as used in image references, without scheme or trailing slash.
pub fn registry_host(registry: &RegistryConfig) -> String {
    let url = registry.url.trim_end_matches('/');
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
        .to_string()
}

/// Image reference of a custom deployment.
pub fn custom_image(registry: &RegistryConfig, owner_id: &str, deployment_name: &str) -> String {
    format!(
        "{}/{}/{deployment_name}",
        registry_host(registry),
        naming::harbor_project(owner_id)
    )
}

fn placeholder(registry: &RegistryConfig) -> Option<RepositoryPlaceholder> {
    let (project, repository) = registry.placeholder_image.split_once('/')?;
    if project.is_empty() || repository.is_empty() {
        return None;
    }
    Some(RepositoryPlaceholder {
        project_name: project.to_string(),
        repository_name: repository.to_string(),
    })
}

/// Harbor objects a deployment should own. Prebuilt deployments own none.
pub fn deployment(
    deployment: &Deployment,
    registry: &RegistryConfig,
    external_url: &str,
) -> HarborDesired {
    if deployment.spec.kind != DeploymentType::Custom {
        return HarborDesired::default();
    }

    let project_name = naming::harbor_project(&deployment.owner_id);
    let observed = &deployment.subsystems.harbor;

    let mut project = HarborProject {
        name: project_name.clone(),
        public: false,
        ..Default::default()
    };
    let mut robot = HarborRobot {
        name: deployment.name.clone(),
        project_name: project_name.clone(),
        disable: false,
        ..Default::default()
    };
    let mut repository = HarborRepository {
        name: deployment.name.clone(),
        project_name: project_name.clone(),
        placeholder: placeholder(registry),
        ..Default::default()
    };
    let mut webhook = HarborWebhook {
        name: deployment.name.clone(),
        project_name,
        target: format!("{external_url}{HARBOR_HOOK_PATH}"),
        token: registry.webhook_token.clone(),
        ..Default::default()
    };

    if let Some(obs) = observed.project.as_ref().filter(|o| o.is_created()) {
        project.preserve_from(obs);
    }
    if let Some(obs) = observed.robot.as_ref().filter(|o| o.is_created()) {
        robot.preserve_from(obs);
        robot.harbor_name = obs.harbor_name.clone();
        robot.secret = obs.secret.clone();
    }
    if let Some(obs) = observed.repository.as_ref().filter(|o| o.is_created()) {
        repository.preserve_from(obs);
    }
    if let Some(obs) = observed.webhook.as_ref().filter(|o| o.is_created()) {
        webhook.preserve_from(obs);
    }

    HarborDesired {
        project: Some(project),
        robot: Some(robot),
        repository: Some(repository),
        webhook: Some(webhook),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::model::{App, DeploymentSpec};

    fn registry() -> RegistryConfig {
        RegistryConfig {
            url: "https://registry.example/".to_string(),
            webhook_token: "hook-token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_registry_host_and_image() {
        assert_eq!(registry_host(&registry()), "registry.example");
        assert_eq!(
            custom_image(&registry(), "u-1", "a1"),
            "registry.example/u-1/a1"
        );
    }

    #[test]
    fn test_prebuilt_owns_nothing() {
        let d = Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx", 80)),
        );
        assert_eq!(deployment(&d, &registry(), "https://deploy.example"), HarborDesired::default());
    }

    #[test]
    fn test_custom_objects() {
        let mut d = Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Custom, App::new("registry.example/u-1/a1", 80)),
        );
        d.subsystems.harbor.robot = Some(HarborRobot {
            id: "robot-7".to_string(),
            name: "a1".to_string(),
            project_name: "u-1".to_string(),
            harbor_name: "robot$u-1+a1".to_string(),
            secret: "s3cret".to_string(),
            ..Default::default()
        });

        let desired = deployment(&d, &registry(), "https://deploy.example");
        let project = desired.project.unwrap();
        assert_eq!(project.name, "u-1");
        assert!(!project.public);

        let robot = desired.robot.unwrap();
        assert_eq!(robot.id, "robot-7");
        assert_eq!(robot.secret, "s3cret");

        let repository = desired.repository.unwrap();
        assert_eq!(
            repository.placeholder,
            Some(RepositoryPlaceholder {
                project_name: "system".to_string(),
                repository_name: "placeholder".to_string(),
            })
        );

        let webhook = desired.webhook.unwrap();
        assert_eq!(
            webhook.target,
            "https://deploy.example/v1/hooks/deployments/harbor"
        );
        assert_eq!(webhook.token, "hook-token");
    }
}
