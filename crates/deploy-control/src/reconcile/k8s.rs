// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes subsystem driver.

use deploy_core::model::ResourceSpec;
use deploy_core::model::subsystems::k8s::K8sSubsystem;
use deploy_core::persistence::ResourceStore;
use tracing::info;

use super::{Mode, Reconcilable, Slot, delete, delete_all, sync_map};
use crate::error::Result;
use crate::generators::K8sDesired;
use crate::providers::{Kube, Provider};

/// Drives the `k8s` subsystem of one resource.
pub struct KubeSync<'a, S: ResourceSpec> {
    kube: &'a Kube,
    store: &'a ResourceStore<S>,
    id: &'a str,
}

impl<'a, S: ResourceSpec> KubeSync<'a, S> {
    /// Driver for resource `id`, recording under `k8s.*`.
    pub fn new(kube: &'a Kube, store: &'a ResourceStore<S>, id: &'a str) -> Self {
        Self { kube, store, id }
    }

    fn slot(&self, path: &str) -> Slot<'a, S> {
        Slot::new(self.store, self.id, format!("k8s.{path}"))
    }

    /// Bring the cluster in line with `desired`. Returns the number of
    /// objects that changed.
    ///
    /// Objects are handled namespace first, then secrets, volumes, claims,
    /// workloads, services, ingresses and jobs. Stale objects of each kind
    /// are deleted in that kind's step.
    pub async fn reconcile(
        &self,
        mode: Mode,
        desired: &K8sDesired,
        observed: &K8sSubsystem,
    ) -> Result<usize> {
        let kube = &**self.kube;
        let mut observed = observed.clone();
        let mut changes = 0;

        if mode != Mode::Create && self.volumes_drifted(mode, desired, &observed).await? {
            changes += self.recreate_volumes(&mut observed).await?;
        }

        if mode
            .apply(
                kube,
                &self.slot("namespace"),
                desired.namespace.as_ref(),
                observed.namespace.as_ref(),
            )
            .await?
        {
            changes += 1;
        }
        let o = &observed;
        changes += sync_map(mode, kube, &self.slot("secretMap"), &desired.secrets, &o.secret_map)
            .await?;
        changes += sync_map(mode, kube, &self.slot("pvMap"), &desired.pvs, &o.pv_map).await?;
        changes += sync_map(mode, kube, &self.slot("pvcMap"), &desired.pvcs, &o.pvc_map).await?;
        changes += sync_map(
            mode,
            kube,
            &self.slot("deploymentMap"),
            &desired.deployments,
            &o.deployment_map,
        )
        .await?;
        changes += sync_map(mode, kube, &self.slot("serviceMap"), &desired.services, &o.service_map)
            .await?;
        changes += sync_map(
            mode,
            kube,
            &self.slot("ingressMap"),
            &desired.ingresses,
            &o.ingress_map,
        )
        .await?;
        changes += sync_map(mode, kube, &self.slot("jobMap"), &desired.jobs, &o.job_map).await?;

        Ok(changes)
    }

    /// Delete every recorded object in reverse creation order.
    ///
    /// Namespaces shared between resources are only forgotten; pass
    /// `delete_namespace` when the namespace belongs to this resource alone.
    pub async fn teardown(&self, observed: &K8sSubsystem, delete_namespace: bool) -> Result<usize> {
        let kube = &**self.kube;
        let mut changes = 0;
        changes += delete_all(kube, &self.slot("jobMap"), &observed.job_map).await?;
        changes += delete_all(kube, &self.slot("ingressMap"), &observed.ingress_map).await?;
        changes += delete_all(kube, &self.slot("serviceMap"), &observed.service_map).await?;
        changes += delete_all(kube, &self.slot("deploymentMap"), &observed.deployment_map).await?;
        changes += delete_all(kube, &self.slot("pvcMap"), &observed.pvc_map).await?;
        changes += delete_all(kube, &self.slot("pvMap"), &observed.pv_map).await?;
        changes += delete_all(kube, &self.slot("secretMap"), &observed.secret_map).await?;

        if let Some(namespace) = observed.namespace.as_ref() {
            let slot = self.slot("namespace");
            if delete_namespace {
                if delete(kube, &slot, Some(namespace)).await? {
                    changes += 1;
                }
            } else {
                slot.write::<()>(None).await?;
            }
        }
        Ok(changes)
    }

    /// Whether any recorded volume or claim no longer matches what is desired
    /// (update) or what is live (repair).
    async fn volumes_drifted(
        &self,
        mode: Mode,
        desired: &K8sDesired,
        observed: &K8sSubsystem,
    ) -> Result<bool> {
        for pv in &desired.pvs {
            if let Some(obs) = observed.pv_map.get(&pv.name) {
                if self.drifted(mode, pv, obs).await? {
                    return Ok(true);
                }
            }
        }
        for pvc in &desired.pvcs {
            if let Some(obs) = observed.pvc_map.get(&pvc.name) {
                if self.drifted(mode, pvc, obs).await? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn drifted<T>(&self, mode: Mode, desired: &T, observed: &T) -> Result<bool>
    where
        T: Reconcilable,
        dyn crate::providers::KubeApi: Provider<T>,
    {
        if !observed.is_created() {
            return Ok(false);
        }
        match mode {
            Mode::Create => Ok(false),
            Mode::Update => Ok(!desired.matches(observed)),
            Mode::Repair => match Provider::<T>::read(&**self.kube, observed).await? {
                Some(live) => Ok(!desired.matches(&live)),
                None => Ok(true),
            },
        }
    }

    /// Volumes cannot be changed in place and claims pin their volume, so on
    /// drift the workloads mounting them go first, then every claim, then
    /// every volume. The normal pass recreates them all.
    async fn recreate_volumes(&self, observed: &mut K8sSubsystem) -> Result<usize> {
        let kube = &**self.kube;
        info!(resource_id = %self.id, "Volume drift detected, recreating volumes");

        let mounting: std::collections::BTreeMap<_, _> = observed
            .deployment_map
            .iter()
            .filter(|(_, d)| !d.volumes.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut changes = delete_all(kube, &self.slot("deploymentMap"), &mounting).await?;
        for name in mounting.keys() {
            observed.deployment_map.remove(name);
        }

        let pvcs = std::mem::take(&mut observed.pvc_map);
        changes += delete_all(kube, &self.slot("pvcMap"), &pvcs).await?;
        let pvs = std::mem::take(&mut observed.pv_map);
        changes += delete_all(kube, &self.slot("pvMap"), &pvs).await?;
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use deploy_core::model::subsystems::k8s::{
        K8sDeployment, Namespace, PersistentVolume, PersistentVolumeClaim, Service, VolumeMount,
    };
    use deploy_core::model::{App, Deployment, DeploymentSpec, DeploymentType};
    use deploy_core::persistence::{Persistence, SqlitePersistence};

    use crate::providers::memory::MemoryKube;

    async fn setup() -> (Arc<MemoryKube>, Kube, ResourceStore<DeploymentSpec>) {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let store = ResourceStore::new(persistence);
        let doc = Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx", 80)),
        );
        store.create(&doc).await.unwrap();
        let memory = Arc::new(MemoryKube::new());
        let kube: Kube = memory.clone();
        (memory, kube, store)
    }

    fn desired(capacity: &str) -> K8sDesired {
        let ns = "deploy-u-1".to_string();
        K8sDesired {
            namespace: Some(Namespace {
                name: ns.clone(),
                ..Default::default()
            }),
            pvs: vec![PersistentVolume {
                name: "a1-data".to_string(),
                capacity: capacity.to_string(),
                nfs_server: "nfs".to_string(),
                nfs_path: "/u-1/a1".to_string(),
                ..Default::default()
            }],
            pvcs: vec![PersistentVolumeClaim {
                name: "a1-data".to_string(),
                namespace: ns.clone(),
                capacity: capacity.to_string(),
                volume_name: "a1-data".to_string(),
                ..Default::default()
            }],
            deployments: vec![K8sDeployment {
                name: "a1".to_string(),
                namespace: ns.clone(),
                image: "nginx".to_string(),
                port: 80,
                replicas: 1,
                volumes: vec![VolumeMount {
                    name: "data".to_string(),
                    pvc_name: "a1-data".to_string(),
                    mount_path: "/data".to_string(),
                }],
                ..Default::default()
            }],
            services: vec![Service {
                name: "a1".to_string(),
                namespace: ns,
                port: 80,
                target_port: 80,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn observed(store: &ResourceStore<DeploymentSpec>) -> K8sSubsystem {
        store.get("d-1").await.unwrap().subsystems.k8s
    }

    #[tokio::test]
    async fn test_converged_resource_makes_no_calls() {
        let (memory, kube, store) = setup().await;
        let sync = KubeSync::new(&kube, &store, "d-1");

        let changes = sync
            .reconcile(Mode::Create, &desired("1Gi"), &observed(&store).await)
            .await
            .unwrap();
        assert_eq!(changes, 5);
        let calls = memory.backend.mutations();

        let desired = desired("1Gi").preserve(&observed(&store).await);
        for mode in [Mode::Create, Mode::Update, Mode::Repair] {
            let changes = sync.reconcile(mode, &desired, &observed(&store).await).await.unwrap();
            assert_eq!(changes, 0, "{mode:?}");
        }
        assert_eq!(memory.backend.mutations(), calls);
    }

    #[tokio::test]
    async fn test_volume_drift_recreates_dependents() {
        let (memory, kube, store) = setup().await;
        let sync = KubeSync::new(&kube, &store, "d-1");
        sync.reconcile(Mode::Create, &desired("1Gi"), &observed(&store).await)
            .await
            .unwrap();
        let before = observed(&store).await;

        let grown = desired("2Gi").preserve(&before);
        sync.reconcile(Mode::Update, &grown, &before).await.unwrap();

        let after = observed(&store).await;
        assert_eq!(after.pv_map["a1-data"].capacity, "2Gi");
        assert_ne!(after.pv_map["a1-data"].id, before.pv_map["a1-data"].id);
        assert_ne!(after.deployment_map["a1"].id, before.deployment_map["a1"].id);
        assert_eq!(after.service_map["a1"].id, before.service_map["a1"].id);
        assert_eq!(memory.backend.count::<PersistentVolume>().await, 1);
    }

    #[tokio::test]
    async fn test_repair_recreates_deleted_claim() {
        let (memory, kube, store) = setup().await;
        let sync = KubeSync::new(&kube, &store, "d-1");
        sync.reconcile(Mode::Create, &desired("1Gi"), &observed(&store).await)
            .await
            .unwrap();
        memory
            .backend
            .remove::<PersistentVolumeClaim>("deploy-u-1/a1-data")
            .await;

        let before = observed(&store).await;
        let changes = sync
            .reconcile(Mode::Repair, &desired("1Gi").preserve(&before), &before)
            .await
            .unwrap();
        assert!(changes >= 3);
        assert_eq!(memory.backend.count::<PersistentVolumeClaim>().await, 1);
        assert_eq!(memory.backend.count::<K8sDeployment>().await, 1);
    }

    #[tokio::test]
    async fn test_teardown_keeps_shared_namespace() {
        let (memory, kube, store) = setup().await;
        let sync = KubeSync::new(&kube, &store, "d-1");
        sync.reconcile(Mode::Create, &desired("1Gi"), &observed(&store).await)
            .await
            .unwrap();

        sync.teardown(&observed(&store).await, false).await.unwrap();
        let after = observed(&store).await;
        assert!(after.is_empty());
        assert!(after.namespace.is_none());
        assert_eq!(memory.backend.count::<Namespace>().await, 1);
        assert_eq!(memory.backend.count::<K8sDeployment>().await, 0);
        assert_eq!(memory.backend.count::<PersistentVolume>().await, 0);
    }
}
