// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory providers for tests and test mode.
//!
//! Objects are kept as JSON values keyed by kind and a per-kind lookup key.
//! Every create/update/delete (and every non-CRUD mutating call) bumps a
//! counter so tests can assert that a converged resource causes no provider
//! writes. Errors can be queued with `fail_next` to exercise retries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

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

use super::factory::ProviderFactory;
use super::{
    CloudStack, CloudStackApi, GithubApi, GpuDevice, Github, Harbor, HarborApi, HostCapacity,
    Kube, KubeApi, PowerState, Provider, ProviderError, ProviderResult, VmAction,
    WorkloadStatus,
};
use crate::zones::Zone;

/// An object the in-memory backend can store.
pub trait MemoryObject:
    SubsystemObject + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind label used in keys and generated IDs.
    const KIND: &'static str;

    /// Lookup key, unique per kind.
    fn key(&self) -> String;

    /// Set the provider-assigned identity.
    fn assign(&mut self, id: String, at: DateTime<Utc>);

    /// Hostnames that must be unique across objects of this kind.
    fn hosts(&self) -> Vec<String> {
        Vec::new()
    }

    /// Fill provider-generated fields on creation.
    fn on_create(&mut self, _seq: u64) {}
}

macro_rules! memory_object {
    ($ty:ty, $kind:literal, |$o:ident| $key:expr) => {
        memory_object!($ty, $kind, |$o| $key, {});
    };
    ($ty:ty, $kind:literal, |$o:ident| $key:expr, { $($extra:item)* }) => {
        impl MemoryObject for $ty {
            const KIND: &'static str = $kind;

            fn key(&self) -> String {
                let $o = self;
                $key
            }

            fn assign(&mut self, id: String, at: DateTime<Utc>) {
                self.id = id;
                self.created_at = Some(at);
            }

            $($extra)*
        }
    };
}

memory_object!(Namespace, "namespace", |o| o.name.clone());
memory_object!(Secret, "secret", |o| format!("{}/{}", o.namespace, o.name));
memory_object!(PersistentVolume, "pv", |o| o.name.clone());
memory_object!(PersistentVolumeClaim, "pvc", |o| format!(
    "{}/{}",
    o.namespace, o.name
));
memory_object!(K8sDeployment, "deployment", |o| format!(
    "{}/{}",
    o.namespace, o.name
));
memory_object!(Service, "service", |o| format!("{}/{}", o.namespace, o.name));
memory_object!(Ingress, "ingress", |o| format!("{}/{}", o.namespace, o.name), {
    fn hosts(&self) -> Vec<String> {
        self.hosts.clone()
    }
});
memory_object!(K8sJob, "job", |o| format!("{}/{}", o.namespace, o.name));
memory_object!(CsVm, "vm", |o| o.name.clone());
memory_object!(PortForwardingRule, "pfr", |o| format!("{}/{}", o.vm_id, o.name));
memory_object!(CsSnapshot, "snapshot", |o| format!("{}/{}", o.vm_id, o.name), {
    fn on_create(&mut self, _seq: u64) {
        self.state = "BackedUp".to_string();
    }
});
memory_object!(HarborProject, "project", |o| o.name.clone());
memory_object!(HarborRobot, "robot", |o| format!("{}/{}", o.project_name, o.name), {
    fn on_create(&mut self, seq: u64) {
        self.harbor_name = format!("robot${}+{}", self.project_name, self.name);
        self.secret = format!("robot-secret-{seq}");
    }
});
memory_object!(HarborRepository, "repository", |o| format!(
    "{}/{}",
    o.project_name, o.name
));
memory_object!(HarborWebhook, "webhook", |o| format!(
    "{}/{}",
    o.project_name, o.name
));
memory_object!(GithubWebhook, "github-webhook", |o| format!("{}/{}", o.repository_id, o.name), {
    fn on_create(&mut self, seq: u64) {
        self.id = seq.to_string();
    }
});

/// Shared object table with call accounting.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<BTreeMap<(&'static str, String), Value>>,
    mutations: AtomicUsize,
    failures: Mutex<VecDeque<ProviderError>>,
    next_id: AtomicU64,
}

fn decode<T: DeserializeOwned>(value: &Value) -> ProviderResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| ProviderError::Permanent(e.to_string()))
}

fn encode<T: Serialize>(object: &T) -> ProviderResult<Value> {
    serde_json::to_value(object).map_err(|e| ProviderError::Permanent(e.to_string()))
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a mutating call and return a queued failure, if any.
    async fn mutate(&self) -> ProviderResult<()> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().await.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_hosts<T: MemoryObject>(
        objects: &BTreeMap<(&'static str, String), Value>,
        object: &T,
    ) -> ProviderResult<()> {
        let hosts = object.hosts();
        if hosts.is_empty() {
            return Ok(());
        }
        let key = object.key();
        for ((kind, other_key), value) in objects {
            if *kind != T::KIND || *other_key == key {
                continue;
            }
            let other: T = decode(value)?;
            if let Some(host) = other.hosts().into_iter().find(|h| hosts.contains(h)) {
                return Err(ProviderError::IngressHostInUse(host));
            }
        }
        Ok(())
    }

    /// Look up the live object with the same key.
    pub async fn read<T: MemoryObject>(&self, observed: &T) -> ProviderResult<Option<T>> {
        let objects = self.objects.lock().await;
        objects
            .get(&(T::KIND, observed.key()))
            .map(decode)
            .transpose()
    }

    /// Create the object, or return the live one when the key already exists.
    pub async fn create<T: MemoryObject>(&self, desired: &T) -> ProviderResult<T> {
        self.mutate().await?;
        let mut objects = self.objects.lock().await;
        let key = (T::KIND, desired.key());
        if let Some(existing) = objects.get(&key) {
            return decode(existing);
        }
        Self::check_hosts(&objects, desired)?;

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut created = desired.clone();
        created.assign(format!("{}-{seq}", T::KIND), Utc::now());
        created.on_create(seq);
        objects.insert(key, encode(&created)?);
        Ok(created)
    }

    /// Replace the object, keeping its provider-assigned identity.
    pub async fn update<T: MemoryObject>(&self, desired: &T) -> ProviderResult<T> {
        self.mutate().await?;
        let mut objects = self.objects.lock().await;
        let key = (T::KIND, desired.key());
        let Some(existing) = objects.get(&key) else {
            return Err(ProviderError::not_found(T::KIND, desired.key()));
        };
        let live: T = decode(existing)?;
        Self::check_hosts(&objects, desired)?;

        let mut updated = desired.clone();
        updated.preserve_from(&live);
        objects.insert(key, encode(&updated)?);
        Ok(updated)
    }

    /// Remove the object; absent objects are ignored.
    pub async fn delete<T: MemoryObject>(&self, observed: &T) -> ProviderResult<()> {
        self.mutate().await?;
        self.objects.lock().await.remove(&(T::KIND, observed.key()));
        Ok(())
    }

    /// Live object by key.
    pub async fn get<T: MemoryObject>(&self, key: &str) -> Option<T> {
        let objects = self.objects.lock().await;
        objects
            .get(&(T::KIND, key.to_string()))
            .and_then(|v| decode(v).ok())
    }

    /// Live object by provider ID.
    pub async fn find_by_id<T: MemoryObject>(&self, id: &str) -> Option<T> {
        self.all::<T>()
            .await
            .into_iter()
            .find(|o| o.provider_id() == id)
    }

    /// Every live object of a kind.
    pub async fn all<T: MemoryObject>(&self) -> Vec<T> {
        let objects = self.objects.lock().await;
        objects
            .iter()
            .filter(|((kind, _), _)| *kind == T::KIND)
            .filter_map(|(_, v)| decode(v).ok())
            .collect()
    }

    /// Store an object without counting a call.
    pub async fn put<T: MemoryObject>(&self, object: &T) -> ProviderResult<()> {
        let value = encode(object)?;
        self.objects
            .lock()
            .await
            .insert((T::KIND, object.key()), value);
        Ok(())
    }

    /// Delete an object behind the control plane's back.
    pub async fn remove<T: MemoryObject>(&self, key: &str) -> bool {
        self.objects
            .lock()
            .await
            .remove(&(T::KIND, key.to_string()))
            .is_some()
    }

    /// Number of live objects of a kind.
    pub async fn count<T: MemoryObject>(&self) -> usize {
        self.all::<T>().await.len()
    }

    /// Mutating calls seen so far.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Fail the next mutating call with `err`.
    pub async fn fail_next(&self, err: ProviderError) {
        self.failures.lock().await.push_back(err);
    }
}

macro_rules! delegate_provider {
    ($client:ty => $($ty:ty),+ $(,)?) => {
        $(
            #[async_trait]
            impl Provider<$ty> for $client {
                async fn read(&self, observed: &$ty) -> ProviderResult<Option<$ty>> {
                    self.backend.read(observed).await
                }

                async fn create(&self, desired: &$ty) -> ProviderResult<$ty> {
                    self.backend.create(desired).await
                }

                async fn update(&self, desired: &$ty) -> ProviderResult<$ty> {
                    self.backend.update(desired).await
                }

                async fn delete(&self, observed: &$ty) -> ProviderResult<()> {
                    self.backend.delete(observed).await
                }
            }
        )+
    };
}

/// In-memory Kubernetes cluster.
#[derive(Default)]
pub struct MemoryKube {
    /// Object table.
    pub backend: MemoryBackend,
    external_secrets: Mutex<HashMap<String, BTreeMap<String, String>>>,
    workloads: Mutex<HashMap<String, WorkloadStatus>>,
    restarts: Mutex<Vec<String>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryKube {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret living outside the managed namespaces.
    pub async fn put_external_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) {
        self.external_secrets
            .lock()
            .await
            .insert(format!("{namespace}/{name}"), data);
    }

    /// Override the status reported for a workload.
    pub async fn set_workload_status(&self, namespace: &str, name: &str, status: WorkloadStatus) {
        self.workloads
            .lock()
            .await
            .insert(format!("{namespace}/{name}"), status);
    }

    /// Workloads restarted so far, as `namespace/name`.
    pub async fn restarts(&self) -> Vec<String> {
        self.restarts.lock().await.clone()
    }

    /// Append log lines to a workload.
    pub async fn push_logs(&self, namespace: &str, name: &str, lines: &[&str]) {
        self.logs
            .lock()
            .await
            .entry(format!("{namespace}/{name}"))
            .or_default()
            .extend(lines.iter().map(|l| l.to_string()));
    }
}

delegate_provider!(MemoryKube =>
    Namespace,
    Secret,
    PersistentVolume,
    PersistentVolumeClaim,
    K8sDeployment,
    Service,
    Ingress,
    K8sJob,
);

#[async_trait]
impl KubeApi for MemoryKube {
    async fn read_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>> {
        let key = format!("{namespace}/{name}");
        if let Some(data) = self.external_secrets.lock().await.get(&key) {
            return Ok(Some(data.clone()));
        }
        Ok(self.backend.get::<Secret>(&key).await.map(|s| s.data))
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        self.backend.mutate().await?;
        let key = format!("{namespace}/{name}");
        if self.backend.get::<K8sDeployment>(&key).await.is_none() {
            return Err(ProviderError::not_found("deployment", key));
        }
        self.restarts.lock().await.push(key);
        Ok(())
    }

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<WorkloadStatus>> {
        let key = format!("{namespace}/{name}");
        let Some(deployment) = self.backend.get::<K8sDeployment>(&key).await else {
            return Ok(None);
        };
        if let Some(status) = self.workloads.lock().await.get(&key) {
            return Ok(Some(*status));
        }
        Ok(Some(WorkloadStatus {
            desired_replicas: deployment.replicas,
            ready_replicas: deployment.replicas,
            failing: false,
        }))
    }

    async fn workload_logs(
        &self,
        namespace: &str,
        name: &str,
        tail: usize,
    ) -> ProviderResult<Vec<String>> {
        let key = format!("{namespace}/{name}");
        if self.backend.get::<K8sDeployment>(&key).await.is_none() {
            return Err(ProviderError::not_found("deployment", key));
        }
        let logs = self.logs.lock().await;
        let lines = logs.get(&key).map(Vec::as_slice).unwrap_or_default();
        Ok(lines[lines.len().saturating_sub(tail)..].to_vec())
    }
}

/// In-memory CloudStack zone.
pub struct MemoryCloudStack {
    /// Object table.
    pub backend: MemoryBackend,
    hosts: Mutex<Vec<HostCapacity>>,
    gpus: Mutex<Vec<GpuDevice>>,
    power: Mutex<HashMap<String, PowerState>>,
}

impl Default for MemoryCloudStack {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloudStack {
    /// Create a zone with one idle host and no GPUs.
    pub fn new() -> Self {
        Self {
            backend: MemoryBackend::new(),
            hosts: Mutex::new(vec![HostCapacity {
                name: "host-1".to_string(),
                cpu_cores_total: 64,
                cpu_cores_used: 0,
                ram_total: 256,
                ram_allocated: 0,
                enabled: true,
            }]),
            gpus: Mutex::new(Vec::new()),
            power: Mutex::new(HashMap::new()),
        }
    }

    /// Add or replace a host.
    pub async fn put_host(&self, host: HostCapacity) {
        let mut hosts = self.hosts.lock().await;
        hosts.retain(|h| h.name != host.name);
        hosts.push(host);
    }

    /// Install a GPU device.
    pub async fn put_gpu(&self, gpu: GpuDevice) {
        self.gpus.lock().await.push(gpu);
    }

    async fn vm_by_id(&self, vm_id: &str) -> ProviderResult<CsVm> {
        self.backend
            .find_by_id::<CsVm>(vm_id)
            .await
            .ok_or_else(|| ProviderError::not_found("vm", vm_id))
    }
}

delegate_provider!(MemoryCloudStack => PortForwardingRule, CsSnapshot);

#[async_trait]
impl Provider<CsVm> for MemoryCloudStack {
    async fn read(&self, observed: &CsVm) -> ProviderResult<Option<CsVm>> {
        self.backend.read(observed).await
    }

    async fn create(&self, desired: &CsVm) -> ProviderResult<CsVm> {
        let mut vm = desired.clone();
        if vm.host_name.is_none() {
            vm.host_name = self.hosts.lock().await.first().map(|h| h.name.clone());
        }
        let created = self.backend.create(&vm).await?;
        self.power
            .lock()
            .await
            .insert(created.id.clone(), PowerState::Running);
        Ok(created)
    }

    async fn update(&self, desired: &CsVm) -> ProviderResult<CsVm> {
        self.backend.update(desired).await
    }

    async fn delete(&self, observed: &CsVm) -> ProviderResult<()> {
        self.backend.delete(observed).await?;
        self.power.lock().await.remove(&observed.id);
        Ok(())
    }
}

#[async_trait]
impl CloudStackApi for MemoryCloudStack {
    async fn list_hosts(&self) -> ProviderResult<Vec<HostCapacity>> {
        Ok(self.hosts.lock().await.clone())
    }

    async fn list_gpus(&self) -> ProviderResult<Vec<GpuDevice>> {
        Ok(self.gpus.lock().await.clone())
    }

    async fn attach_gpu(&self, vm_id: &str, gpu_id: &str, host: &str) -> ProviderResult<()> {
        self.backend.mutate().await?;
        let mut vm = self.vm_by_id(vm_id).await?;
        if !self.gpus.lock().await.iter().any(|g| g.id == gpu_id) {
            return Err(ProviderError::not_found("gpu", gpu_id));
        }
        vm.gpu_id = Some(gpu_id.to_string());
        vm.host_name = Some(host.to_string());
        self.backend.put(&vm).await
    }

    async fn detach_gpu(&self, vm_id: &str) -> ProviderResult<()> {
        self.backend.mutate().await?;
        let mut vm = self.vm_by_id(vm_id).await?;
        vm.gpu_id = None;
        self.backend.put(&vm).await
    }

    async fn power_state(&self, vm_id: &str) -> ProviderResult<Option<PowerState>> {
        Ok(self.power.lock().await.get(vm_id).copied())
    }

    async fn vm_action(&self, vm_id: &str, action: VmAction) -> ProviderResult<()> {
        self.backend.mutate().await?;
        self.vm_by_id(vm_id).await?;
        let state = match action {
            VmAction::Start | VmAction::Reboot => PowerState::Running,
            VmAction::Stop => PowerState::Stopped,
        };
        self.power.lock().await.insert(vm_id.to_string(), state);
        Ok(())
    }

    async fn list_snapshots(&self, vm_id: &str) -> ProviderResult<Vec<CsSnapshot>> {
        Ok(self
            .backend
            .all::<CsSnapshot>()
            .await
            .into_iter()
            .filter(|s| s.vm_id == vm_id)
            .collect())
    }
}

/// In-memory Harbor registry.
#[derive(Default)]
pub struct MemoryHarbor {
    /// Object table.
    pub backend: MemoryBackend,
}

delegate_provider!(MemoryHarbor => HarborProject, HarborRobot, HarborRepository, HarborWebhook);

impl HarborApi for MemoryHarbor {}

/// In-memory GitHub.
#[derive(Default)]
pub struct MemoryGithub {
    /// Object table.
    pub backend: MemoryBackend,
}

delegate_provider!(MemoryGithub => GithubWebhook);

impl GithubApi for MemoryGithub {}

/// Factory handing out one in-memory client per zone.
#[derive(Default)]
pub struct MemoryProviders {
    kube: std::sync::Mutex<HashMap<String, Arc<MemoryKube>>>,
    cloudstack: std::sync::Mutex<HashMap<String, Arc<MemoryCloudStack>>>,
    harbor: Arc<MemoryHarbor>,
    github: Arc<MemoryGithub>,
}

impl MemoryProviders {
    /// Create an empty provider set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster of `zone`, created on first use.
    pub fn kube_for(&self, zone: &str) -> Arc<MemoryKube> {
        let mut map = self.kube.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(zone.to_string()).or_default().clone()
    }

    /// CloudStack of `zone`, created on first use.
    pub fn cloudstack_for(&self, zone: &str) -> Arc<MemoryCloudStack> {
        let mut map = self
            .cloudstack
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(zone.to_string()).or_default().clone()
    }

    /// The registry.
    pub fn harbor_backend(&self) -> Arc<MemoryHarbor> {
        self.harbor.clone()
    }

    /// GitHub.
    pub fn github_backend(&self) -> Arc<MemoryGithub> {
        self.github.clone()
    }

    /// Mutating calls across every provider.
    pub fn total_mutations(&self) -> usize {
        let kube: usize = self
            .kube
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|k| k.backend.mutations())
            .sum();
        let cloudstack: usize = self
            .cloudstack
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.backend.mutations())
            .sum();
        kube + cloudstack + self.harbor.backend.mutations() + self.github.backend.mutations()
    }
}

impl ProviderFactory for MemoryProviders {
    fn kube(&self, zone: &Zone) -> ProviderResult<Kube> {
        Ok(self.kube_for(&zone.name))
    }

    fn cloudstack(&self, zone: &Zone) -> ProviderResult<CloudStack> {
        Ok(self.cloudstack_for(&zone.name))
    }

    fn harbor(&self) -> ProviderResult<Harbor> {
        Ok(self.harbor.clone())
    }

    fn github(&self, _token: &str) -> ProviderResult<Github> {
        Ok(self.github.clone())
    }
}
