// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use deploy_core::model::deployment::{Env, Volume};
use deploy_core::model::subsystems::gitlab::Build;
use deploy_core::Activity;
use deploy_core::model::{
    App, Deployment, DeploymentSpec, DeploymentType, Pagination, ResourceStatus,
};
use deploy_core::persistence::{ResourceFilter, UpdateParams};
use tracing::info;

use super::quotas::{self, Usage};
use super::{
    Accepted, Context, begin, existing_submission, submit_started, validate_domain, validate_name,
};
use crate::config::{Capability, Permission, RegistryConfig};
use crate::error::{Error, Result};
use crate::generators::{self, naming};
use crate::jobs::Job;
use crate::platform::Platform;
use crate::providers::Kube;

/// Default container port when a request names none.
pub const DEFAULT_PORT: u16 = 8080;

const MAX_REPLICAS: u32 = 100;

/// `POST /v1/deployments` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentCreate {
    /// Name.
    pub name: String,
    /// Zone; the first deployment zone when omitted.
    #[serde(default)]
    pub zone: Option<String>,
    /// Image to run; a custom image built from the user's repository when omitted.
    #[serde(default)]
    pub image: Option<String>,
    /// Container port.
    #[serde(default)]
    pub internal_port: Option<u16>,
    /// Replica count.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// Environment variables.
    #[serde(default)]
    pub envs: Vec<Env>,
    /// NFS-backed volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Init container commands.
    #[serde(default)]
    pub init_commands: Vec<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Skip the public ingress.
    #[serde(default)]
    pub private: bool,
    /// Extra hostname with its own certificate.
    #[serde(default)]
    pub custom_domain: Option<String>,
    /// Path the pinger requests.
    #[serde(default)]
    pub health_check_path: Option<String>,
    /// Repository whose pushes trigger builds.
    #[serde(default)]
    pub github: Option<GithubLink>,
}

/// Repository link of a custom deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GithubLink {
    /// OAuth token acting for the user.
    pub token: String,
    /// Numeric repository ID.
    pub repository_id: i64,
}

/// `POST /v1/deployments/{id}` body. Absent fields stay unchanged; an empty
/// `customDomain` removes the custom domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeploymentUpdate {
    /// New name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New image (prebuilt deployments only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// New container port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_port: Option<u16>,
    /// New replica count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    /// Replacement environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envs: Option<Vec<Env>>,
    /// Replacement volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Volume>>,
    /// Replacement init commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_commands: Option<Vec<String>>,
    /// Replacement arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// New visibility.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<bool>,
    /// New custom domain; empty to remove.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    /// New ping path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_path: Option<String>,
}

fn main_path(field: &str) -> String {
    format!("apps.{}.{field}", deploy_core::model::deployment::MAIN_APP)
}

fn set_if_changed<T: PartialEq + Serialize>(
    params: UpdateParams,
    field: &str,
    new: Option<&T>,
    current: &T,
) -> Result<UpdateParams> {
    match new {
        Some(new) if new != current => Ok(params.with_spec(&main_path(field), new)?),
        _ => Ok(params),
    }
}

impl DeploymentUpdate {
    /// Requested custom domain: `Some(None)` removes it.
    fn requested_domain(&self) -> Option<Option<String>> {
        self.custom_domain
            .as_deref()
            .map(|d| (!d.is_empty()).then(|| d.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(Some(domain)) = self.requested_domain() {
            validate_domain(&domain)?;
        }
        validate_app_fields(
            self.image.as_deref(),
            self.internal_port,
            self.replicas,
            self.envs.as_deref().unwrap_or_default(),
            self.volumes.as_deref().unwrap_or_default(),
        )
    }

    /// Writes that bring `d` to the requested state. Fields already at their
    /// requested value produce nothing.
    pub fn params(&self, d: &Deployment, registry: &RegistryConfig) -> Result<UpdateParams> {
        let app = d
            .main_app()
            .ok_or_else(|| Error::Internal(format!("deployment {} has no main app", d.id)))?;
        let mut params = UpdateParams::default();

        if let Some(name) = self.name.as_ref().filter(|n| **n != d.name) {
            params.name = Some(name.clone());
            if d.spec.kind == DeploymentType::Custom {
                let image = generators::harbor::custom_image(registry, &d.owner_id, name);
                params = params.with_spec(&main_path("image"), &image)?;
            }
        }
        if d.spec.kind == DeploymentType::Prebuilt {
            params = set_if_changed(params, "image", self.image.as_ref(), &app.image)?;
        }
        params = set_if_changed(
            params,
            "internalPort",
            self.internal_port.as_ref(),
            &app.internal_port,
        )?;
        params = set_if_changed(params, "replicas", self.replicas.as_ref(), &app.replicas)?;
        params = set_if_changed(params, "envs", self.envs.as_ref(), &app.envs)?;
        params = set_if_changed(params, "volumes", self.volumes.as_ref(), &app.volumes)?;
        params = set_if_changed(
            params,
            "initCommands",
            self.init_commands.as_ref(),
            &app.init_commands,
        )?;
        params = set_if_changed(params, "args", self.args.as_ref(), &app.args)?;
        params = set_if_changed(params, "private", self.private.as_ref(), &app.private)?;
        params = set_if_changed(
            params,
            "customDomain",
            self.requested_domain().as_ref(),
            &app.custom_domain,
        )?;
        params = set_if_changed(
            params,
            "pingPath",
            self.health_check_path.as_ref(),
            &app.ping_path,
        )?;
        Ok(params)
    }
}

fn validate_app_fields(
    image: Option<&str>,
    internal_port: Option<u16>,
    replicas: Option<u32>,
    envs: &[Env],
    volumes: &[Volume],
) -> Result<()> {
    if image.is_some_and(|i| i.trim().is_empty()) {
        return Err(Error::Validation("image must not be empty".to_string()));
    }
    if internal_port == Some(0) {
        return Err(Error::Validation("internalPort must be 1-65535".to_string()));
    }
    if replicas.is_some_and(|r| r > MAX_REPLICAS) {
        return Err(Error::Validation(format!(
            "replicas must be at most {MAX_REPLICAS}"
        )));
    }
    if let Some(env) = envs.iter().find(|e| {
        e.name.is_empty() || !e.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }) {
        return Err(Error::Validation(format!(
            "invalid environment variable name {:?}",
            env.name
        )));
    }
    for volume in volumes {
        validate_name(&volume.name)?;
        if !volume.app_path.starts_with('/') {
            return Err(Error::Validation(format!(
                "volume {} needs an absolute appPath",
                volume.name
            )));
        }
    }
    Ok(())
}

/// `POST /v1/deployments/{id}/command` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum DeploymentCommand {
    /// Rolling restart of every workload.
    Restart,
    /// Re-converge every provider object now.
    Repair,
}

/// Deployment as returned by the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRead {
    /// ID.
    pub id: String,
    /// Name.
    pub name: String,
    /// Custom or prebuilt.
    #[serde(rename = "type")]
    pub kind: DeploymentType,
    /// Owner.
    pub owner_id: String,
    /// Zone.
    pub zone: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Last repair.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired_at: Option<DateTime<Utc>>,
    /// Last restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarted_at: Option<DateTime<Utc>>,
    /// Public URL; absent for private deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Image.
    pub image: String,
    /// Container port.
    pub internal_port: u16,
    /// Replica count.
    pub replicas: u32,
    /// Environment.
    pub envs: Vec<Env>,
    /// Volumes.
    pub volumes: Vec<Volume>,
    /// Init commands.
    pub init_commands: Vec<String>,
    /// Arguments.
    pub args: Vec<String>,
    /// Private deployments have no ingress.
    pub private: bool,
    /// Custom domain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    /// Ping path.
    pub health_check_path: String,
    /// Last ping status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_result: Option<u16>,
    /// In-progress operations.
    pub activities: Vec<Activity>,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Status detail.
    pub status_message: String,
    /// Linked integrations.
    pub integrations: Vec<&'static str>,
    /// Most recent build.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_build: Option<Build>,
}

impl DeploymentRead {
    /// API view of `d`.
    pub fn new(platform: &Platform, d: &Deployment) -> Self {
        let fallback = App::new("", DEFAULT_PORT);
        let app = d.main_app().unwrap_or(&fallback);
        let url = platform
            .zones
            .get(&d.zone)
            .filter(|_| !app.private)
            .map(|zone| format!("https://{}", zone.deployment_host(&d.name)));
        let mut integrations = Vec::new();
        if d.subsystems.github.has_repository() {
            integrations.push("github");
        }
        Self {
            id: d.id.clone(),
            name: d.name.clone(),
            kind: d.spec.kind,
            owner_id: d.owner_id.clone(),
            zone: d.zone.clone(),
            created_at: d.created_at,
            updated_at: d.updated_at,
            repaired_at: d.repaired_at,
            restarted_at: d.restarted_at,
            url,
            image: app.image.clone(),
            internal_port: app.internal_port,
            replicas: app.replicas,
            envs: app.envs.clone(),
            volumes: app.volumes.clone(),
            init_commands: app.init_commands.clone(),
            args: app.args.clone(),
            private: app.private,
            custom_domain: app.custom_domain.clone(),
            health_check_path: app.ping_path.clone(),
            ping_result: app.ping_result,
            activities: d.activities.iter().copied().collect(),
            status: d.status_code,
            status_message: d.status_message.clone(),
            integrations,
            last_build: d.subsystems.gitlab.last_build.clone(),
        }
    }
}

/// CI snippet that pushes a custom image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CiConfig {
    /// GitHub Actions workflow.
    pub config: String,
}

/// Deployments visible to the caller. Admins may pass `all` to see everyone's.
pub async fn list(
    ctx: &Context,
    all: bool,
    page: Option<Pagination>,
) -> Result<Vec<DeploymentRead>> {
    let filter = ResourceFilter {
        owner_ids: (!(all && ctx.principal.admin)).then(|| vec![ctx.principal.user_id.clone()]),
        ..Default::default()
    };
    Ok(ctx
        .platform
        .deployments
        .list(&filter, page)
        .await?
        .iter()
        .map(|d| DeploymentRead::new(&ctx.platform, d))
        .collect())
}

/// Deployment `id`.
pub async fn get(ctx: &Context, id: &str) -> Result<DeploymentRead> {
    let d = ctx.deployment(id).await?;
    Ok(DeploymentRead::new(&ctx.platform, &d))
}

/// Fail with [`Error::CustomDomainInUse`] when a deployment or VM proxy other
/// than `except_id` already routes `domain`.
pub async fn ensure_domain_free(platform: &Platform, domain: &str, except_id: &str) -> Result<()> {
    let filter = ResourceFilter::default();
    let in_deployments = platform
        .deployments
        .list(&filter, None)
        .await?
        .into_iter()
        .filter(|d| d.id != except_id)
        .any(|d| {
            d.spec
                .apps
                .values()
                .any(|a| a.custom_domain.as_deref() == Some(domain))
        });
    let in_vms = platform
        .vms
        .list(&filter, None)
        .await?
        .into_iter()
        .filter(|vm| vm.id != except_id)
        .any(|vm| {
            vm.spec
                .proxied_ports()
                .any(|(_, proxy)| proxy.custom_domain.as_deref() == Some(domain))
        });
    if in_deployments || in_vms {
        return Err(Error::CustomDomainInUse(domain.to_string()));
    }
    Ok(())
}

/// Create a deployment. Resubmitting with the same `job_id` returns the
/// first submission.
pub async fn create(
    ctx: &Context,
    job_id: Option<&str>,
    req: DeploymentCreate,
) -> Result<Accepted> {
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }

    let platform = &ctx.platform;
    let principal = &ctx.principal;
    validate_name(&req.name)?;
    validate_app_fields(
        req.image.as_deref(),
        req.internal_port,
        req.replicas,
        &req.envs,
        &req.volumes,
    )?;
    let zone = match &req.zone {
        Some(name) => platform.zone(name, Capability::Deployment)?,
        None => platform
            .zones
            .default_for(Capability::Deployment)
            .ok_or_else(|| Error::Validation("no zone hosts deployments".to_string()))?,
    };

    let usage = Usage::of(platform, &principal.user_id, None).await?;
    quotas::check(
        "deployments",
        usage.deployments,
        1,
        principal.quotas().deployments,
    )?;

    let custom_domain = req.custom_domain.filter(|d| !d.is_empty());
    if let Some(domain) = &custom_domain {
        principal.require(Permission::UseCustomDomains)?;
        validate_domain(domain)?;
        ensure_domain_free(platform, domain, "").await?;
    }
    if platform.deployments.get_by_name(&req.name).await?.is_some() {
        return Err(Error::Conflict(format!("name {} is already taken", req.name)));
    }

    let (kind, image) = match req.image {
        Some(image) => (DeploymentType::Prebuilt, image),
        None => {
            let registry = &platform.config.registry;
            let image = generators::harbor::custom_image(registry, &principal.user_id, &req.name);
            (DeploymentType::Custom, image)
        }
    };
    let mut app = App::new(image, req.internal_port.unwrap_or(DEFAULT_PORT));
    app.envs = req.envs;
    app.volumes = req.volumes;
    app.init_commands = req.init_commands;
    app.args = req.args;
    app.private = req.private;
    app.custom_domain = custom_domain;
    if let Some(replicas) = req.replicas {
        app.replicas = replicas;
    }
    if let Some(path) = req.health_check_path {
        app.ping_path = path;
    }

    let id = Uuid::new_v4().to_string();
    let mut d = Deployment::new(
        id.clone(),
        req.name,
        principal.user_id.clone(),
        zone.name.clone(),
        DeploymentSpec::single(kind, app),
    );
    if let Some(link) = req.github {
        if kind != DeploymentType::Custom {
            return Err(Error::Validation(
                "only custom-image deployments can link a repository".to_string(),
            ));
        }
        d.subsystems.github.token = link.token;
        d.subsystems.github.repository_id = link.repository_id;
    }

    platform.deployments.create(&d).await?;
    info!(deployment_id = %id, name = %d.name, zone = %d.zone, "Deployment created");
    submit_started(
        ctx,
        &platform.deployments,
        job_id,
        &Job::CreateDeployment { id },
    )
    .await
}

/// Update deployment `id`. A request that changes nothing submits no job.
pub async fn update(
    ctx: &Context,
    id: &str,
    job_id: Option<&str>,
    req: DeploymentUpdate,
) -> Result<Accepted> {
    req.validate()?;
    let platform = &ctx.platform;
    let d = ctx.deployment(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    if let Some(blocking) = Activity::Updating.blocked_by(&d.activities) {
        return Err(Error::ActivityBlocked(blocking));
    }
    if req.image.is_some() && d.spec.kind == DeploymentType::Custom {
        return Err(Error::Validation(
            "the image of a custom deployment comes from its repository".to_string(),
        ));
    }

    let params = req.params(&d, &platform.config.registry)?;
    if params.is_empty() {
        return Ok(Accepted {
            id: id.to_string(),
            job_id: None,
        });
    }
    if let Some(name) = &params.name
        && platform.deployments.get_by_name(name).await?.is_some()
    {
        return Err(Error::Conflict(format!("name {name} is already taken")));
    }
    if let Some(Some(domain)) = req.requested_domain() {
        ctx.principal.require(Permission::UseCustomDomains)?;
        ensure_domain_free(platform, &domain, id).await?;
    }

    begin(&platform.deployments, id, Activity::Updating).await?;
    submit_started(
        ctx,
        &platform.deployments,
        job_id,
        &Job::UpdateDeployment {
            id: id.to_string(),
            update: req,
        },
    )
    .await
}

/// Delete deployment `id`.
pub async fn delete(ctx: &Context, id: &str, job_id: Option<&str>) -> Result<Accepted> {
    let platform = &ctx.platform;
    ctx.deployment(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    begin(&platform.deployments, id, Activity::BeingDeleted).await?;
    platform
        .deployments
        .set_status(id, ResourceStatus::ResourceBeingDeleted, "Resource is being deleted")
        .await?;
    submit_started(
        ctx,
        &platform.deployments,
        job_id,
        &Job::DeleteDeployment { id: id.to_string() },
    )
    .await
}

/// Run `command` on deployment `id`.
pub async fn command(
    ctx: &Context,
    id: &str,
    job_id: Option<&str>,
    command: DeploymentCommand,
) -> Result<Accepted> {
    let platform = &ctx.platform;
    ctx.deployment(id).await?;
    if let Some(accepted) = existing_submission(ctx, job_id).await? {
        return Ok(accepted);
    }
    let (activity, job) = match command {
        DeploymentCommand::Restart => (
            Activity::Restarting,
            Job::RestartDeployment { id: id.to_string() },
        ),
        DeploymentCommand::Repair => (
            Activity::Repairing,
            Job::RepairDeployment { id: id.to_string() },
        ),
    };
    begin(&platform.deployments, id, activity).await?;
    submit_started(ctx, &platform.deployments, job_id, &job).await
}

/// GitHub Actions workflow that builds and pushes the image of custom
/// deployment `id`.
pub async fn ci_config(ctx: &Context, id: &str) -> Result<CiConfig> {
    let d = ctx.deployment(id).await?;
    if d.spec.kind != DeploymentType::Custom {
        return Err(Error::Validation(
            "only custom-image deployments have a CI config".to_string(),
        ));
    }
    let robot = d
        .subsystems
        .harbor
        .robot
        .as_ref()
        .filter(|r| !r.harbor_name.is_empty())
        .ok_or_else(|| Error::NotFound(format!("registry robot of deployment {id}")))?;
    let registry = generators::harbor::registry_host(&ctx.platform.config.registry);
    let image = d.main_app().map(|a| a.image.as_str()).unwrap_or_default();

    let config = format!(
        "name: deploy-{name}\n\
         on:\n  push:\n    branches: [main]\n\
         jobs:\n  docker:\n    runs-on: ubuntu-latest\n    steps:\n\
         \x20     - uses: docker/login-action@v3\n\
         \x20       with:\n\
         \x20         registry: {registry}\n\
         \x20         username: ${{{{ secrets.DEPLOY_REGISTRY_USERNAME }}}}\n\
         \x20         password: ${{{{ secrets.DEPLOY_REGISTRY_PASSWORD }}}}\n\
         \x20     - uses: docker/build-push-action@v5\n\
         \x20       with:\n\
         \x20         push: true\n\
         \x20         tags: {image}:latest\n\
         # DEPLOY_REGISTRY_USERNAME={robot}\n",
        name = d.name,
        robot = robot.harbor_name,
    );
    Ok(CiConfig { config })
}

/// Where the logs of deployment `id` live.
pub struct LogSource {
    /// Cluster client.
    pub kube: Kube,
    /// Namespace.
    pub namespace: String,
    /// Workload names, one per app.
    pub workloads: Vec<String>,
}

/// Resolve the log source of deployment `id`.
pub async fn log_source(ctx: &Context, id: &str) -> Result<LogSource> {
    let d = ctx.deployment(id).await?;
    if !d.is_ready() {
        let blocking = if d.is_being_deleted() {
            Activity::BeingDeleted
        } else {
            Activity::BeingCreated
        };
        return Err(Error::ActivityBlocked(blocking));
    }
    let zone = ctx.platform.zone(&d.zone, Capability::Deployment)?;
    let kube = ctx.platform.clients.kube(zone).await?;
    Ok(LogSource {
        kube,
        namespace: naming::user_namespace(&d.owner_id),
        workloads: d
            .spec
            .apps
            .keys()
            .map(|app| naming::app_workload_name(&d.name, app))
            .collect(),
    })
}

/// Deployments whose GitHub webhook has `hook_id`.
pub async fn by_github_hook(platform: &Platform, hook_id: &str) -> Result<Vec<Deployment>> {
    let filter = ResourceFilter {
        github_webhook_id: Some(hook_id.to_string()),
        ..Default::default()
    };
    Ok(platform.deployments.list(&filter, None).await?)
}

/// Deployment named `name`, if any.
pub async fn by_name(platform: &Platform, name: &str) -> Result<Option<Deployment>> {
    Ok(platform.deployments.get_by_name(name).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(kind: DeploymentType) -> Deployment {
        let mut app = App::new("nginx", 80);
        app.custom_domain = Some("foo.example".to_string());
        Deployment::new("d-1", "a1", "u-1", "z1", DeploymentSpec::single(kind, app))
    }

    fn paths(params: &UpdateParams) -> Vec<String> {
        params
            .spec
            .iter()
            .map(|(path, _)| path.segments().join("."))
            .collect()
    }

    #[test]
    fn test_empty_update_has_no_params() {
        let d = deployment(DeploymentType::Prebuilt);
        let params = DeploymentUpdate::default()
            .params(&d, &RegistryConfig::default())
            .unwrap();
        assert!(params.is_empty());

        let same = DeploymentUpdate {
            name: Some("a1".to_string()),
            replicas: Some(1),
            custom_domain: Some("foo.example".to_string()),
            ..Default::default()
        };
        assert!(same.params(&d, &RegistryConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_update_only_touches_changed_fields() {
        let d = deployment(DeploymentType::Prebuilt);
        let update = DeploymentUpdate {
            replicas: Some(3),
            image: Some("nginx".to_string()),
            custom_domain: Some(String::new()),
            ..Default::default()
        };
        let params = update.params(&d, &RegistryConfig::default()).unwrap();
        assert_eq!(
            paths(&params),
            vec!["apps.main.replicas", "apps.main.customDomain"]
        );
        assert_eq!(params.spec[1].1, serde_json::Value::Null);
    }

    #[test]
    fn test_rename_moves_custom_image() {
        let d = deployment(DeploymentType::Custom);
        let update = DeploymentUpdate {
            name: Some("b2".to_string()),
            ..Default::default()
        };
        let params = update.params(&d, &RegistryConfig::default()).unwrap();
        assert_eq!(params.name.as_deref(), Some("b2"));
        assert_eq!(paths(&params), vec!["apps.main.image"]);
        assert!(params.spec[0].1.as_str().unwrap().ends_with("/b2"));
    }

    #[test]
    fn test_update_rejects_unknown_fields() {
        let err = serde_json::from_str::<DeploymentUpdate>(r#"{"replicas": 2, "cpu": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_command_parsing() {
        let cmd: DeploymentCommand = serde_json::from_str(r#"{"command":"restart"}"#).unwrap();
        assert_eq!(cmd, DeploymentCommand::Restart);
        assert!(serde_json::from_str::<DeploymentCommand>(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(validate_app_fields(None, Some(0), None, &[], &[]).is_err());
        assert!(validate_app_fields(None, None, Some(101), &[], &[]).is_err());
        let env = Env {
            name: "BAD NAME".to_string(),
            value: "x".to_string(),
        };
        assert!(validate_app_fields(None, None, None, &[env], &[]).is_err());
        assert!(validate_app_fields(Some("nginx"), Some(80), Some(2), &[], &[]).is_ok());
    }
}
