// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subsystem reconcilers.
//!
//! Four primitives drive one provider object towards its desired state:
//!
//! | Primitive | Observed missing | Observed present |
//! |-----------|------------------|------------------|
//! | [`create`] | create | no-op |
//! | [`update`] | create | update when it differs from observed |
//! | [`delete`] | no-op | delete, then forget |
//! | [`repair`] | create | read live, update or recreate on drift |
//!
//! Each primitive writes the observed object back into the resource document
//! through a [`Slot`] right after the provider call succeeds, so a retried
//! job always starts from what actually happened.
//!
//! The per-resource drivers ([`deployment`], [`vm`], [`storage_manager`])
//! chain the primitives across providers in creation order and tear them down
//! in reverse.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use deploy_core::model::ResourceSpec;
use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::cs::{CsSnapshot, CsVm, PortForwardingRule};
use deploy_core::model::subsystems::github::GithubWebhook;
use deploy_core::model::subsystems::harbor::{
    HarborProject, HarborRepository, HarborRobot, HarborWebhook,
};
use deploy_core::model::subsystems::k8s::{
    Ingress, K8sDeployment, K8sJob, Namespace, PersistentVolume, PersistentVolumeClaim, Secret,
    Service,
};
use deploy_core::model::{DeploymentSubsystems, StorageManagerSubsystems, VmSubsystems};
use deploy_core::persistence::ResourceStore;

use crate::error::{Error, Result};
use crate::providers::{Provider, ProviderError};

pub mod deployment;
pub mod k8s;
pub mod storage_manager;
pub mod vm;

pub use k8s::KubeSync;

/// Where an observed object is recorded inside a resource document.
pub struct Slot<'a, S: ResourceSpec> {
    store: &'a ResourceStore<S>,
    id: &'a str,
    path: String,
}

impl<'a, S: ResourceSpec> Slot<'a, S> {
    /// Slot at the dotted subsystem `path` of resource `id`.
    pub fn new(store: &'a ResourceStore<S>, id: &'a str, path: impl Into<String>) -> Self {
        Self {
            store,
            id,
            path: path.into(),
        }
    }

    /// Slot for the entry `key` of the map at this slot's path.
    pub fn entry(&self, key: &str) -> Self {
        Self::new(self.store, self.id, format!("{}.{key}", self.path))
    }

    /// Dotted path of the slot.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Record `value`, or forget the object when `None`.
    pub async fn write<T: Serialize>(&self, value: Option<&T>) -> Result<()> {
        self.store.set_subsystem(self.id, &self.path, value).await?;
        Ok(())
    }
}

/// Which primitive a reconciliation run applies to every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Provision missing objects only.
    Create,
    /// Push spec changes recorded since the last run.
    Update,
    /// Compare with the live provider state and fix drift.
    Repair,
}

impl Mode {
    /// Apply this mode's primitive to one object.
    pub async fn apply<T, P, S>(
        self,
        provider: &P,
        slot: &Slot<'_, S>,
        desired: Option<&T>,
        observed: Option<&T>,
    ) -> Result<bool>
    where
        T: Reconcilable,
        P: Provider<T> + ?Sized,
        S: ResourceSpec,
    {
        match self {
            Self::Create => match desired {
                Some(desired) => create(provider, slot, desired, observed).await,
                None => Ok(false),
            },
            Self::Update => update(provider, slot, desired, observed).await,
            Self::Repair => repair(provider, slot, desired, observed).await,
        }
    }
}

/// An observed provider object the primitives can drive.
pub trait Reconcilable:
    SubsystemObject + Clone + PartialEq + Serialize + Send + Sync + 'static
{
    /// Label used in logs and errors.
    const KIND: &'static str;

    /// Whether the provider can change the object in place; otherwise drift
    /// is fixed by delete and create.
    fn can_update_in_place(&self) -> bool {
        true
    }

    /// Whether `live` already has every field this desired object declares.
    fn matches(&self, live: &Self) -> bool {
        let mut desired = self.clone();
        desired.preserve_from(live);
        desired == *live
    }
}

macro_rules! reconcilable {
    ($ty:ty, $kind:literal) => {
        impl Reconcilable for $ty {
            const KIND: &'static str = $kind;
        }
    };
    ($ty:ty, $kind:literal, recreate) => {
        impl Reconcilable for $ty {
            const KIND: &'static str = $kind;

            fn can_update_in_place(&self) -> bool {
                false
            }
        }
    };
}

reconcilable!(Namespace, "namespace");
reconcilable!(Secret, "secret");
reconcilable!(PersistentVolume, "persistentVolume", recreate);
reconcilable!(PersistentVolumeClaim, "persistentVolumeClaim", recreate);
reconcilable!(K8sDeployment, "deployment");
reconcilable!(Service, "service");
reconcilable!(Ingress, "ingress");
reconcilable!(K8sJob, "job", recreate);
reconcilable!(CsVm, "vm");
reconcilable!(PortForwardingRule, "portForwardingRule", recreate);
reconcilable!(CsSnapshot, "snapshot", recreate);
reconcilable!(HarborProject, "harborProject");
reconcilable!(HarborRepository, "harborRepository");
reconcilable!(HarborWebhook, "harborWebhook");
reconcilable!(GithubWebhook, "githubWebhook");

impl Reconcilable for HarborRobot {
    const KIND: &'static str = "harborRobot";

    // Harbor never returns the robot secret after creation.
    fn matches(&self, live: &Self) -> bool {
        let mut live = live.clone();
        if live.secret.is_empty() {
            live.secret = self.secret.clone();
        }
        if live.harbor_name.is_empty() {
            live.harbor_name = self.harbor_name.clone();
        }
        let mut desired = self.clone();
        desired.preserve_from(&live);
        desired == live
    }
}

fn is_real<T: SubsystemObject>(object: Option<&T>) -> Option<&T> {
    object.filter(|o| o.is_created() && !o.is_placeholder())
}

fn require_id<T: Reconcilable>(object: T) -> Result<T> {
    if object.provider_id().is_empty() {
        return Err(Error::ProviderPermanent(format!(
            "{} {} was accepted without a provider id",
            T::KIND,
            object.object_name()
        )));
    }
    Ok(object)
}

/// Provision `desired` unless an object is already recorded.
pub async fn create<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: &T,
    observed: Option<&T>,
) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    if observed.is_some_and(|o| o.is_created()) {
        return Ok(false);
    }
    if desired.is_placeholder() {
        slot.write(Some(desired)).await?;
        return Ok(true);
    }

    let created = require_id(provider.create(desired).await?)?;
    debug!(kind = T::KIND, name = %created.object_name(), path = %slot.path(), "Created");
    slot.write(Some(&created)).await?;
    Ok(true)
}

/// Replace a recorded object with its desired version.
async fn recreate<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: &T,
    current: &T,
) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    delete_live(provider, current).await?;
    slot.write::<T>(None).await?;
    create(provider, slot, desired, None).await
}

async fn delete_live<T, P>(provider: &P, observed: &T) -> Result<()>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
{
    match provider.delete(observed).await {
        Ok(()) => {}
        Err(ProviderError::NotFound { .. }) => {
            debug!(kind = T::KIND, name = %observed.object_name(), "Already gone");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn converge<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: &T,
    current: &T,
) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    if !desired.can_update_in_place() {
        return recreate(provider, slot, desired, current).await;
    }

    let mut desired = desired.clone();
    desired.preserve_from(current);
    match provider.update(&desired).await {
        Ok(updated) => {
            let updated = require_id(updated)?;
            debug!(kind = T::KIND, name = %updated.object_name(), path = %slot.path(), "Updated");
            slot.write(Some(&updated)).await?;
            Ok(true)
        }
        Err(ProviderError::NotFound { .. }) => {
            slot.write::<T>(None).await?;
            create(provider, slot, &desired, None).await
        }
        Err(e) => Err(e.into()),
    }
}

/// Bring a recorded object in line with `desired` without reading it back.
pub async fn update<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: Option<&T>,
    observed: Option<&T>,
) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    let Some(desired) = desired else {
        return Ok(false);
    };

    match (observed.filter(|o| o.is_created()), desired.is_placeholder()) {
        (None, _) => create(provider, slot, desired, None).await,
        (Some(observed), true) if observed.is_placeholder() => {
            if observed == desired {
                return Ok(false);
            }
            slot.write(Some(desired)).await?;
            Ok(true)
        }
        (Some(observed), true) => {
            delete_live(provider, observed).await?;
            slot.write(Some(desired)).await?;
            Ok(true)
        }
        (Some(observed), false) if observed.is_placeholder() => {
            create(provider, slot, desired, None).await
        }
        (Some(observed), false) => {
            if desired.matches(observed) {
                return Ok(false);
            }
            converge(provider, slot, desired, observed).await
        }
    }
}

/// Delete a recorded object and forget it. Missing provider objects are fine.
pub async fn delete<T, P, S>(provider: &P, slot: &Slot<'_, S>, observed: Option<&T>) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    let Some(observed) = observed else {
        return Ok(false);
    };
    if let Some(real) = is_real(Some(observed)) {
        delete_live(provider, real).await?;
        debug!(kind = T::KIND, name = %real.object_name(), path = %slot.path(), "Deleted");
    }
    slot.write::<T>(None).await?;
    Ok(true)
}

/// Compare the live object with `desired` and fix whatever drifted.
pub async fn repair<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: Option<&T>,
    observed: Option<&T>,
) -> Result<bool>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    let Some(desired) = desired else {
        return Ok(false);
    };
    if desired.is_placeholder() {
        return update(provider, slot, Some(desired), observed).await;
    }
    let Some(observed) = is_real(observed) else {
        return create(provider, slot, desired, None).await;
    };

    let Some(live) = provider.read(observed).await? else {
        debug!(kind = T::KIND, name = %observed.object_name(), "Missing on provider, recreating");
        slot.write::<T>(None).await?;
        return create(provider, slot, desired, None).await;
    };

    if desired.matches(&live) {
        if live != *observed {
            slot.write(Some(&live)).await?;
            return Ok(true);
        }
        return Ok(false);
    }
    converge(provider, slot, desired, &live).await
}

/// Reconcile a keyed map of objects: every desired object through `mode`,
/// then every observed object that is no longer desired is deleted.
pub async fn sync_map<T, P, S>(
    mode: Mode,
    provider: &P,
    slot: &Slot<'_, S>,
    desired: &[T],
    observed: &BTreeMap<String, T>,
) -> Result<usize>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    let mut changes = 0;
    for object in desired {
        let name = object.object_name();
        let entry = slot.entry(name);
        if mode.apply(provider, &entry, Some(object), observed.get(name)).await? {
            changes += 1;
        }
    }
    changes += delete_stale(provider, slot, desired, observed).await?;
    Ok(changes)
}

/// Delete observed entries whose name is not in `desired`.
pub async fn delete_stale<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    desired: &[T],
    observed: &BTreeMap<String, T>,
) -> Result<usize>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    let mut changes = 0;
    for (name, object) in observed {
        if desired.iter().any(|d| d.object_name() == name) {
            continue;
        }
        if delete(provider, &slot.entry(name), Some(object)).await? {
            changes += 1;
        }
    }
    Ok(changes)
}

/// Delete every entry of a recorded map.
pub async fn delete_all<T, P, S>(
    provider: &P,
    slot: &Slot<'_, S>,
    observed: &BTreeMap<String, T>,
) -> Result<usize>
where
    T: Reconcilable,
    P: Provider<T> + ?Sized,
    S: ResourceSpec,
{
    delete_stale(provider, slot, &[], observed).await
}

/// Observed objects still recorded on a resource.
pub trait Remaining {
    /// Dotted paths of every recorded object.
    fn remaining(&self) -> Vec<String>;

    /// Whether nothing is recorded any more.
    fn is_clean(&self) -> bool {
        self.remaining().is_empty()
    }
}

fn k8s_remaining(
    prefix: &str,
    k8s: &deploy_core::model::subsystems::k8s::K8sSubsystem,
) -> Vec<String> {
    let mut out = Vec::new();
    let maps: [(&str, Vec<&String>); 7] = [
        ("secretMap", k8s.secret_map.keys().collect()),
        ("pvMap", k8s.pv_map.keys().collect()),
        ("pvcMap", k8s.pvc_map.keys().collect()),
        ("deploymentMap", k8s.deployment_map.keys().collect()),
        ("serviceMap", k8s.service_map.keys().collect()),
        ("ingressMap", k8s.ingress_map.keys().collect()),
        ("jobMap", k8s.job_map.keys().collect()),
    ];
    for (map, keys) in maps {
        out.extend(keys.into_iter().map(|k| format!("{prefix}.{map}.{k}")));
    }
    out
}

impl Remaining for DeploymentSubsystems {
    fn remaining(&self) -> Vec<String> {
        let mut out = k8s_remaining("k8s", &self.k8s);
        if self.harbor.robot.is_some() {
            out.push("harbor.robot".to_string());
        }
        if self.harbor.repository.is_some() {
            out.push("harbor.repository".to_string());
        }
        if self.harbor.webhook.is_some() {
            out.push("harbor.webhook".to_string());
        }
        if self.github.webhook.is_some() {
            out.push("github.webhook".to_string());
        }
        out
    }
}

impl Remaining for VmSubsystems {
    fn remaining(&self) -> Vec<String> {
        let mut out = k8s_remaining("k8s", &self.k8s);
        if self.cs.vm.is_some() {
            out.push("cs.vm".to_string());
        }
        out.extend(
            self.cs
                .port_forwarding_rule_map
                .keys()
                .map(|k| format!("cs.portForwardingRuleMap.{k}")),
        );
        out.extend(
            self.cs
                .snapshot_map
                .keys()
                .map(|k| format!("cs.snapshotMap.{k}")),
        );
        out
    }
}

impl Remaining for StorageManagerSubsystems {
    fn remaining(&self) -> Vec<String> {
        let mut out = k8s_remaining("k8s", &self.k8s);
        if self.k8s.namespace.is_some() {
            out.push("k8s.namespace".to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use deploy_core::model::{App, Deployment, DeploymentSpec, DeploymentType};
    use deploy_core::persistence::{Persistence, SqlitePersistence};

    use crate::providers::memory::MemoryKube;

    async fn store_with(doc: &Deployment) -> ResourceStore<DeploymentSpec> {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let store = ResourceStore::new(persistence);
        store.create(doc).await.unwrap();
        store
    }

    fn doc() -> Deployment {
        Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx", 80)),
        )
    }

    fn service(port: u16) -> Service {
        Service {
            name: "a1".to_string(),
            namespace: "deploy-u-1".to_string(),
            port,
            target_port: port,
            ..Default::default()
        }
    }

    async fn recorded(store: &ResourceStore<DeploymentSpec>) -> Option<Service> {
        store
            .get("d-1")
            .await
            .unwrap()
            .subsystems
            .k8s
            .service_map
            .get("a1")
            .cloned()
    }

    #[tokio::test]
    async fn test_create_records_and_is_idempotent() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");

        assert!(create(&kube, &slot, &service(80), None).await.unwrap());
        let observed = recorded(&store).await.unwrap();
        assert!(observed.is_created());

        assert!(!create(&kube, &slot, &service(80), Some(&observed)).await.unwrap());
        assert_eq!(kube.backend.mutations(), 1);
    }

    #[tokio::test]
    async fn test_update_skips_matching_object() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        create(&kube, &slot, &service(80), None).await.unwrap();
        let observed = recorded(&store).await.unwrap();

        assert!(!update(&kube, &slot, Some(&service(80)), Some(&observed)).await.unwrap());
        assert_eq!(kube.backend.mutations(), 1);

        assert!(update(&kube, &slot, Some(&service(8080)), Some(&observed)).await.unwrap());
        let updated = recorded(&store).await.unwrap();
        assert_eq!(updated.port, 8080);
        assert_eq!(updated.id, observed.id);
    }

    #[tokio::test]
    async fn test_update_without_desired_is_noop() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        assert!(!update::<Service, _, _>(&kube, &slot, None, None).await.unwrap());
        assert_eq!(kube.backend.mutations(), 0);
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        create(&kube, &slot, &service(80), None).await.unwrap();
        let observed = recorded(&store).await.unwrap();

        kube.backend.remove::<Service>("deploy-u-1/a1").await;
        assert!(delete(&kube, &slot, Some(&observed)).await.unwrap());
        assert!(recorded(&store).await.is_none());
    }

    #[tokio::test]
    async fn test_repair_recreates_missing_object() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        create(&kube, &slot, &service(80), None).await.unwrap();
        let observed = recorded(&store).await.unwrap();

        assert!(!repair(&kube, &slot, Some(&service(80)), Some(&observed)).await.unwrap());

        kube.backend.remove::<Service>("deploy-u-1/a1").await;
        assert!(repair(&kube, &slot, Some(&service(80)), Some(&observed)).await.unwrap());
        let repaired = recorded(&store).await.unwrap();
        assert_ne!(repaired.id, observed.id);
    }

    #[tokio::test]
    async fn test_repair_updates_drifted_object() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        create(&kube, &slot, &service(80), None).await.unwrap();
        let observed = recorded(&store).await.unwrap();

        let mut drifted = observed.clone();
        drifted.target_port = 9999;
        kube.backend.put(&drifted).await.unwrap();

        assert!(repair(&kube, &slot, Some(&service(80)), Some(&observed)).await.unwrap());
        let live = kube.backend.get::<Service>("deploy-u-1/a1").await.unwrap();
        assert_eq!(live.target_port, 80);
        assert_eq!(live.id, observed.id);
    }

    #[tokio::test]
    async fn test_placeholder_is_recorded_without_provider_call() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.ingressMap.a1");
        let placeholder = Ingress {
            name: "a1".to_string(),
            namespace: "deploy-u-1".to_string(),
            placeholder: true,
            ..Default::default()
        };

        assert!(create(&kube, &slot, &placeholder, None).await.unwrap());
        assert_eq!(kube.backend.mutations(), 0);
        let fetched = store.get("d-1").await.unwrap();
        assert!(fetched.subsystems.k8s.ingress_map["a1"].placeholder);
    }

    #[tokio::test]
    async fn test_empty_provider_id_is_not_recorded() {
        struct Blank;

        #[async_trait::async_trait]
        impl Provider<Service> for Blank {
            async fn read(&self, _: &Service) -> crate::providers::ProviderResult<Option<Service>> {
                Ok(None)
            }
            async fn create(&self, desired: &Service) -> crate::providers::ProviderResult<Service> {
                Ok(desired.clone())
            }
            async fn update(&self, desired: &Service) -> crate::providers::ProviderResult<Service> {
                Ok(desired.clone())
            }
            async fn delete(&self, _: &Service) -> crate::providers::ProviderResult<()> {
                Ok(())
            }
        }

        let store = store_with(&doc()).await;
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap.a1");
        let err = create(&Blank, &slot, &service(80), None).await.unwrap_err();
        assert!(matches!(err, Error::ProviderPermanent(_)));
        assert!(recorded(&store).await.is_none());
    }

    #[tokio::test]
    async fn test_sync_map_deletes_stale_entries() {
        let store = store_with(&doc()).await;
        let kube = MemoryKube::new();
        let slot = Slot::new(&store, "d-1", "k8s.serviceMap");
        let mut old = service(80);
        old.name = "old".to_string();

        sync_map(Mode::Create, &kube, &slot, std::slice::from_ref(&old), &BTreeMap::new())
            .await
            .unwrap();
        let observed = store.get("d-1").await.unwrap().subsystems.k8s.service_map;
        assert!(observed.contains_key("old"));

        let changes = sync_map(Mode::Update, &kube, &slot, &[service(80)], &observed)
            .await
            .unwrap();
        assert_eq!(changes, 2);
        let observed = store.get("d-1").await.unwrap().subsystems.k8s.service_map;
        assert!(!observed.contains_key("old"));
        assert!(observed.contains_key("a1"));
        assert_eq!(kube.backend.count::<Service>().await, 1);
    }

    #[test]
    fn test_robot_match_ignores_hidden_secret() {
        let desired = HarborRobot {
            id: "r-1".to_string(),
            name: "a1".to_string(),
            project_name: "u-1".to_string(),
            harbor_name: "robot$u-1+a1".to_string(),
            secret: "s".to_string(),
            ..Default::default()
        };
        let live = HarborRobot {
            secret: String::new(),
            ..desired.clone()
        };
        assert!(desired.matches(&live));
        assert!(!desired.matches(&HarborRobot {
            disable: true,
            ..live
        }));
    }

    #[test]
    fn test_remaining_lists_recorded_objects() {
        let mut subsystems = DeploymentSubsystems::default();
        assert!(subsystems.is_clean());
        subsystems
            .k8s
            .service_map
            .insert("a1".to_string(), service(80));
        assert_eq!(subsystems.remaining(), vec!["k8s.serviceMap.a1".to_string()]);
    }
}
