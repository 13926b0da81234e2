// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment driver: Harbor, then GitHub, then Kubernetes.

use deploy_core::model::subsystems::harbor::HarborSubsystem;
use deploy_core::model::{Deployment, DeploymentSpec};
use tracing::debug;

use super::{KubeSync, Mode, Slot, delete};
use crate::config::Capability;
use crate::error::Result;
use crate::generators;
use crate::platform::Platform;

fn slot<'a>(platform: &'a Platform, id: &'a str, path: &str) -> Slot<'a, DeploymentSpec> {
    Slot::new(&platform.deployments, id, path.to_string())
}

/// Converge deployment `id` using `mode`. Returns the number of provider
/// objects that changed.
pub async fn reconcile(platform: &Platform, id: &str, mode: Mode) -> Result<usize> {
    let d = platform.deployments.get(id).await?;
    let zone = platform.zone(&d.zone, Capability::Deployment)?;

    let mut changes = sync_harbor(platform, &d, mode).await?;
    let d = platform.deployments.get(id).await?;
    changes += sync_github(platform, &d, mode).await?;
    let d = platform.deployments.get(id).await?;

    let kube = platform.clients.kube(zone).await?;
    let cert = platform.wildcard_cert(kube.as_ref()).await;
    let params = platform.k8s_params(zone, cert.as_ref());
    let desired = generators::k8s::deployment(&d, &params);
    changes += KubeSync::new(&kube, &platform.deployments, id)
        .reconcile(mode, &desired, &d.subsystems.k8s)
        .await?;

    debug!(deployment_id = %id, ?mode, changes, "Deployment reconciled");
    Ok(changes)
}

async fn sync_harbor(platform: &Platform, d: &Deployment, mode: Mode) -> Result<usize> {
    let desired = generators::harbor::deployment(
        d,
        &platform.config.registry,
        platform.config.external_url(),
    );
    let observed = &d.subsystems.harbor;
    if desired.project.is_none() {
        if *observed == HarborSubsystem::default() {
            return Ok(0);
        }
        return teardown_harbor(platform, d).await;
    }

    let harbor = platform.clients.harbor()?;
    let harbor = harbor.as_ref();
    let steps = [
        mode.apply(
            harbor,
            &slot(platform, &d.id, "harbor.project"),
            desired.project.as_ref(),
            observed.project.as_ref(),
        )
        .await?,
        mode.apply(
            harbor,
            &slot(platform, &d.id, "harbor.robot"),
            desired.robot.as_ref(),
            observed.robot.as_ref(),
        )
        .await?,
        mode.apply(
            harbor,
            &slot(platform, &d.id, "harbor.repository"),
            desired.repository.as_ref(),
            observed.repository.as_ref(),
        )
        .await?,
        mode.apply(
            harbor,
            &slot(platform, &d.id, "harbor.webhook"),
            desired.webhook.as_ref(),
            observed.webhook.as_ref(),
        )
        .await?,
    ];
    Ok(steps.iter().filter(|changed| **changed).count())
}

async fn sync_github(platform: &Platform, d: &Deployment, mode: Mode) -> Result<usize> {
    let github = &d.subsystems.github;
    let desired = generators::github::webhook(
        d,
        platform.config.external_url(),
        &platform.config.session_secret,
    );
    if desired.is_none() && github.webhook.is_none() {
        return Ok(0);
    }

    let client = platform.clients.github(&github.token)?;
    let slot = slot(platform, &d.id, "github.webhook");
    let changed = match desired {
        Some(desired) => {
            mode.apply(client.as_ref(), &slot, Some(&desired), github.webhook.as_ref())
                .await?
        }
        None => delete(client.as_ref(), &slot, github.webhook.as_ref()).await?,
    };
    Ok(usize::from(changed))
}

async fn teardown_harbor(platform: &Platform, d: &Deployment) -> Result<usize> {
    let observed = &d.subsystems.harbor;
    let harbor = platform.clients.harbor()?;
    let harbor = harbor.as_ref();
    let mut changes = 0;
    if delete(harbor, &slot(platform, &d.id, "harbor.webhook"), observed.webhook.as_ref()).await? {
        changes += 1;
    }
    if delete(
        harbor,
        &slot(platform, &d.id, "harbor.repository"),
        observed.repository.as_ref(),
    )
    .await?
    {
        changes += 1;
    }
    if delete(harbor, &slot(platform, &d.id, "harbor.robot"), observed.robot.as_ref()).await? {
        changes += 1;
    }
    // The project is shared by every deployment of the owner.
    if observed.project.is_some() {
        slot(platform, &d.id, "harbor.project")
            .write::<()>(None)
            .await?;
    }
    Ok(changes)
}

/// Delete the objects that live under the owner's name (Kubernetes
/// namespace and Harbor project) ahead of an owner change.
pub async fn release_owner(platform: &Platform, id: &str) -> Result<usize> {
    let d = platform.deployments.get(id).await?;
    let mut changes = 0;
    if !d.subsystems.k8s.is_empty() || d.subsystems.k8s.namespace.is_some() {
        let zone = platform.zone(&d.zone, Capability::Deployment)?;
        let kube = platform.clients.kube(zone).await?;
        changes += KubeSync::new(&kube, &platform.deployments, id)
            .teardown(&d.subsystems.k8s, false)
            .await?;
    }
    if d.subsystems.harbor != HarborSubsystem::default() {
        changes += teardown_harbor(platform, &d).await?;
    }
    debug!(deployment_id = %id, changes, "Released objects of previous owner");
    Ok(changes)
}

/// Delete every provider object of deployment `id`, Kubernetes first.
pub async fn teardown(platform: &Platform, id: &str) -> Result<usize> {
    let d = platform.deployments.find_including_deleted(id).await?;
    let Some(d) = d else {
        return Ok(0);
    };
    let mut changes = 0;

    if !d.subsystems.k8s.is_empty() || d.subsystems.k8s.namespace.is_some() {
        let zone = platform.zone(&d.zone, Capability::Deployment)?;
        let kube = platform.clients.kube(zone).await?;
        changes += KubeSync::new(&kube, &platform.deployments, id)
            .teardown(&d.subsystems.k8s, false)
            .await?;
    }

    if let Some(webhook) = d.subsystems.github.webhook.as_ref() {
        let client = platform.clients.github(&d.subsystems.github.token)?;
        if delete(client.as_ref(), &slot(platform, id, "github.webhook"), Some(webhook)).await? {
            changes += 1;
        }
    }

    changes += teardown_harbor(platform, &d).await?;
    debug!(deployment_id = %id, changes, "Deployment torn down");
    Ok(changes)
}
