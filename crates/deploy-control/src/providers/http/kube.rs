// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes API client.
//!
//! Objects are created with `POST`, updated with server-side apply and read
//! back from the live manifest, so drift on the cluster shows up as a
//! mismatch against the desired object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use deploy_core::model::subsystems::k8s::{
    EnvVar, Ingress, K8sDeployment, K8sJob, Namespace, PersistentVolume, PersistentVolumeClaim,
    ResourceLimits, Secret, SecretType, Service, VolumeMount,
};

use super::{checked, gone_ok, json, optional};
use crate::config::KubernetesCredentials;
use crate::providers::{KubeApi, Provider, ProviderError, ProviderResult, WorkloadStatus};

const FIELD_MANAGER: &str = "deploy-control";
const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const APPLY_PATCH: &str = "application/apply-patch+yaml";
const STRATEGIC_MERGE_PATCH: &str = "application/strategic-merge-patch+json";
const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
const CLUSTER_ISSUER: &str = "cert-manager.io/cluster-issuer";

/// Waiting reasons that mark a pod as failing.
const FAILING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
];

/// Client for one cluster.
pub struct HttpKube {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl HttpKube {
    /// Client for the cluster behind `credentials`.
    pub fn new(client: reqwest::Client, credentials: &KubernetesCredentials) -> Self {
        Self {
            client,
            api_url: credentials.api_url.trim_end_matches('/').to_string(),
            token: credentials.token.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.api_url))
            .bearer_auth(&self.token)
    }

    async fn get_object(
        &self,
        path: &str,
        kind: &'static str,
        name: &str,
    ) -> ProviderResult<Option<Value>> {
        let response = self.request(Method::GET, path).send().await?;
        match optional(response, kind, name).await? {
            Some(response) => Ok(Some(json(response).await?)),
            None => Ok(None),
        }
    }

    async fn read_object<T: Manifest>(&self, observed: &T) -> ProviderResult<Option<T>> {
        let path = item_path(observed);
        match self.get_object(&path, T::KIND, observed.name()).await? {
            Some(value) => T::from_manifest(&value).map(Some),
            None => Ok(None),
        }
    }

    async fn create_object<T: Manifest>(&self, desired: &T) -> ProviderResult<T> {
        let path = collection_path::<T>(desired.namespace());
        let response = self
            .request(Method::POST, &path)
            .json(&desired.manifest())
            .send()
            .await?;
        let response = checked(response, T::KIND, desired.name())
            .await
            .map_err(|e| desired.conflict(e))?;
        debug!(kind = T::KIND, name = desired.name(), "Kubernetes object created");
        T::from_manifest(&json(response).await?)
    }

    async fn apply_object<T: Manifest>(&self, desired: &T) -> ProviderResult<T> {
        let body = serde_json::to_vec(&desired.manifest())
            .map_err(|e| ProviderError::Permanent(format!("failed to encode manifest: {e}")))?;
        let response = self
            .request(Method::PATCH, &item_path(desired))
            .query(&[("fieldManager", FIELD_MANAGER), ("force", "true")])
            .header(CONTENT_TYPE, APPLY_PATCH)
            .body(body)
            .send()
            .await?;
        let response = checked(response, T::KIND, desired.name())
            .await
            .map_err(|e| desired.conflict(e))?;
        T::from_manifest(&json(response).await?)
    }

    async fn delete_object<T: Manifest>(&self, observed: &T) -> ProviderResult<()> {
        let response = self
            .request(Method::DELETE, &item_path(observed))
            .json(&json!({ "propagationPolicy": "Background" }))
            .send()
            .await?;
        gone_ok(checked(response, T::KIND, observed.name()).await.map(|_| ()))
    }

    /// Pods matching `labels`, sorted by name.
    async fn pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> ProviderResult<Vec<Value>> {
        let selector = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .request(Method::GET, &format!("/api/v1/namespaces/{namespace}/pods"))
            .query(&[("labelSelector", selector)])
            .send()
            .await?;
        let list: Value = json(checked(response, "pods", namespace).await?).await?;
        let mut pods = array_at(&list, "/items").to_vec();
        pods.sort_by_key(|pod| str_at(pod, "/metadata/name"));
        Ok(pods)
    }
}

/// A Kubernetes object type and its manifest mapping.
trait Manifest: Sized + Send + Sync {
    const KIND: &'static str;
    const API_VERSION: &'static str;
    const PLURAL: &'static str;

    fn name(&self) -> &str;

    /// `None` for cluster-scoped objects.
    fn namespace(&self) -> Option<&str>;

    fn manifest(&self) -> Value;

    fn from_manifest(value: &Value) -> ProviderResult<Self>;

    /// Refine an error returned on create or apply.
    fn conflict(&self, err: ProviderError) -> ProviderError {
        err
    }
}

fn collection_path<T: Manifest>(namespace: Option<&str>) -> String {
    let prefix = if T::API_VERSION == "v1" {
        "/api/v1".to_string()
    } else {
        format!("/apis/{}", T::API_VERSION)
    };
    match namespace {
        Some(ns) => format!("{prefix}/namespaces/{ns}/{}", T::PLURAL),
        None => format!("{prefix}/{}", T::PLURAL),
    }
}

fn item_path<T: Manifest>(object: &T) -> String {
    format!(
        "{}/{}",
        collection_path::<T>(object.namespace()),
        object.name()
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ObjectMeta {
    uid: String,
    name: String,
    namespace: String,
    creation_timestamp: Option<DateTime<Utc>>,
    annotations: BTreeMap<String, String>,
}

fn meta(value: &Value) -> ProviderResult<ObjectMeta> {
    let raw = value.get("metadata").cloned().unwrap_or_else(|| json!({}));
    serde_json::from_value(raw)
        .map_err(|e| ProviderError::Permanent(format!("malformed object metadata: {e}")))
}

fn metadata(name: &str, namespace: Option<&str>) -> Value {
    let mut meta = json!({
        "name": name,
        "labels": { MANAGED_BY: FIELD_MANAGER },
    });
    if let Some(ns) = namespace {
        meta["namespace"] = json!(ns);
    }
    meta
}

fn str_at(value: &Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u32_at(value: &Value, pointer: &str) -> u32 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn port_at(value: &Value, pointer: &str) -> u16 {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(0)
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn strings_at(value: &Value, pointer: &str) -> Vec<String> {
    array_at(value, pointer)
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect()
}

fn map_at(value: &Value, pointer: &str) -> BTreeMap<String, String> {
    value
        .pointer(pointer)
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Quantity map without empty entries.
fn quantities(cpu: &str, memory: &str) -> Value {
    let mut map = serde_json::Map::new();
    if !cpu.is_empty() {
        map.insert("cpu".to_string(), json!(cpu));
    }
    if !memory.is_empty() {
        map.insert("memory".to_string(), json!(memory));
    }
    Value::Object(map)
}

fn pod_volumes(volumes: &[VolumeMount]) -> (Vec<Value>, Vec<Value>) {
    let sources = volumes
        .iter()
        .map(|v| json!({ "name": v.name, "persistentVolumeClaim": { "claimName": v.pvc_name } }))
        .collect();
    let mounts = volumes
        .iter()
        .map(|v| json!({ "name": v.name, "mountPath": v.mount_path }))
        .collect();
    (sources, mounts)
}

fn parse_volumes(pod_spec: &Value, container: &Value) -> Vec<VolumeMount> {
    let claims: BTreeMap<String, String> = array_at(pod_spec, "/volumes")
        .iter()
        .map(|v| {
            (
                str_at(v, "/name"),
                str_at(v, "/persistentVolumeClaim/claimName"),
            )
        })
        .collect();
    array_at(container, "/volumeMounts")
        .iter()
        .map(|m| {
            let name = str_at(m, "/name");
            VolumeMount {
                pvc_name: claims.get(&name).cloned().unwrap_or_default(),
                mount_path: str_at(m, "/mountPath"),
                name,
            }
        })
        .collect()
}

impl Manifest for Namespace {
    const KIND: &'static str = "Namespace";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "namespaces";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        None
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, None),
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            created_at: meta.creation_timestamp,
        })
    }
}

fn secret_type_name(kind: SecretType) -> &'static str {
    match kind {
        SecretType::Opaque => "Opaque",
        SecretType::DockerConfigJson => "kubernetes.io/dockerconfigjson",
        SecretType::Tls => "kubernetes.io/tls",
    }
}

fn decode_secret_data(value: &Value) -> BTreeMap<String, String> {
    map_at(value, "/data")
        .into_iter()
        .map(|(k, v)| {
            let decoded = STANDARD
                .decode(v.as_bytes())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            (k, decoded)
        })
        .collect()
}

impl Manifest for Secret {
    const KIND: &'static str = "Secret";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "secrets";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        let data: BTreeMap<&str, String> = self
            .data
            .iter()
            .map(|(k, v)| (k.as_str(), STANDARD.encode(v)))
            .collect();
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, Some(&self.namespace)),
            "type": secret_type_name(self.secret_type),
            "data": data,
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        let secret_type = match str_at(value, "/type").as_str() {
            "kubernetes.io/dockerconfigjson" => SecretType::DockerConfigJson,
            "kubernetes.io/tls" => SecretType::Tls,
            _ => SecretType::Opaque,
        };
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            namespace: meta.namespace,
            secret_type,
            data: decode_secret_data(value),
            placeholder: false,
            created_at: meta.creation_timestamp,
        })
    }
}

impl Manifest for PersistentVolume {
    const KIND: &'static str = "PersistentVolume";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "persistentvolumes";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        None
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, None),
            "spec": {
                "capacity": { "storage": self.capacity },
                "accessModes": ["ReadWriteMany"],
                "persistentVolumeReclaimPolicy": "Retain",
                "storageClassName": "",
                "nfs": { "server": self.nfs_server, "path": self.nfs_path },
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            capacity: str_at(value, "/spec/capacity/storage"),
            nfs_server: str_at(value, "/spec/nfs/server"),
            nfs_path: str_at(value, "/spec/nfs/path"),
            created_at: meta.creation_timestamp,
        })
    }
}

impl Manifest for PersistentVolumeClaim {
    const KIND: &'static str = "PersistentVolumeClaim";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "persistentvolumeclaims";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, Some(&self.namespace)),
            "spec": {
                "accessModes": ["ReadWriteMany"],
                "storageClassName": "",
                "volumeName": self.volume_name,
                "resources": { "requests": { "storage": self.capacity } },
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            namespace: meta.namespace,
            capacity: str_at(value, "/spec/resources/requests/storage"),
            volume_name: str_at(value, "/spec/volumeName"),
            created_at: meta.creation_timestamp,
        })
    }
}

impl Manifest for K8sDeployment {
    const KIND: &'static str = "Deployment";
    const API_VERSION: &'static str = "apps/v1";
    const PLURAL: &'static str = "deployments";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        let (volumes, mounts) = pod_volumes(&self.volumes);
        let init_containers: Vec<Value> = self
            .init_commands
            .iter()
            .enumerate()
            .map(|(i, command)| {
                json!({
                    "name": format!("init-{i}"),
                    "image": self.image,
                    "command": ["/bin/sh", "-c", command],
                    "volumeMounts": mounts,
                })
            })
            .collect();
        let pull_secrets: Vec<Value> = self
            .image_pull_secrets
            .iter()
            .map(|name| json!({ "name": name }))
            .collect();
        let limits = &self.resources;
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, Some(&self.namespace)),
            "spec": {
                "replicas": self.replicas,
                "selector": { "matchLabels": self.labels },
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": {
                        "imagePullSecrets": pull_secrets,
                        "volumes": volumes,
                        "initContainers": init_containers,
                        "containers": [{
                            "name": self.name,
                            "image": self.image,
                            "args": self.args,
                            "env": self.env,
                            "ports": [{ "containerPort": self.port }],
                            "resources": {
                                "limits": quantities(&limits.cpu_limit, &limits.memory_limit),
                                "requests": quantities(&limits.cpu_request, &limits.memory_request),
                            },
                            "volumeMounts": mounts,
                        }],
                    },
                },
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        let pod = value
            .pointer("/spec/template/spec")
            .cloned()
            .unwrap_or(Value::Null);
        let container = pod.pointer("/containers/0").cloned().unwrap_or(Value::Null);
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            namespace: meta.namespace,
            labels: map_at(value, "/spec/selector/matchLabels"),
            image: str_at(&container, "/image"),
            env: array_at(&container, "/env")
                .iter()
                .map(|e| EnvVar::new(str_at(e, "/name"), str_at(e, "/value")))
                .collect(),
            port: port_at(&container, "/ports/0/containerPort"),
            replicas: u32_at(value, "/spec/replicas"),
            image_pull_secrets: array_at(&pod, "/imagePullSecrets")
                .iter()
                .map(|s| str_at(s, "/name"))
                .collect(),
            volumes: parse_volumes(&pod, &container),
            init_commands: array_at(&pod, "/initContainers")
                .iter()
                .map(|c| str_at(c, "/command/2"))
                .collect(),
            args: strings_at(&container, "/args"),
            resources: ResourceLimits {
                cpu_limit: str_at(&container, "/resources/limits/cpu"),
                memory_limit: str_at(&container, "/resources/limits/memory"),
                cpu_request: str_at(&container, "/resources/requests/cpu"),
                memory_request: str_at(&container, "/resources/requests/memory"),
            },
            created_at: meta.creation_timestamp,
        })
    }
}

impl Manifest for Service {
    const KIND: &'static str = "Service";
    const API_VERSION: &'static str = "v1";
    const PLURAL: &'static str = "services";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, Some(&self.namespace)),
            "spec": {
                "selector": self.selector,
                "ports": [{
                    "name": "http",
                    "protocol": "TCP",
                    "port": self.port,
                    "targetPort": self.target_port,
                }],
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            namespace: meta.namespace,
            port: port_at(value, "/spec/ports/0/port"),
            target_port: port_at(value, "/spec/ports/0/targetPort"),
            selector: map_at(value, "/spec/selector"),
            created_at: meta.creation_timestamp,
        })
    }
}

/// TLS secret cert-manager issues for an ingress with a cluster issuer.
fn issued_secret(ingress: &str) -> String {
    format!("{ingress}-tls")
}

impl Manifest for Ingress {
    const KIND: &'static str = "Ingress";
    const API_VERSION: &'static str = "networking.k8s.io/v1";
    const PLURAL: &'static str = "ingresses";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        let mut metadata = metadata(&self.name, Some(&self.namespace));
        if let Some(issuer) = &self.cluster_issuer {
            metadata["annotations"] = json!({ CLUSTER_ISSUER: issuer });
        }
        let rules: Vec<Value> = self
            .hosts
            .iter()
            .map(|host| {
                json!({
                    "host": host,
                    "http": { "paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": { "service": {
                            "name": self.service_name,
                            "port": { "number": self.service_port },
                        }},
                    }]},
                })
            })
            .collect();
        let tls_secret = self
            .tls_secret
            .clone()
            .or_else(|| self.cluster_issuer.as_ref().map(|_| issued_secret(&self.name)));
        let tls: Vec<Value> = tls_secret
            .map(|secret| json!({ "hosts": self.hosts, "secretName": secret }))
            .into_iter()
            .collect();
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata,
            "spec": {
                "ingressClassName": self.ingress_class,
                "rules": rules,
                "tls": tls,
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        let cluster_issuer = meta.annotations.get(CLUSTER_ISSUER).cloned();
        let tls_secret = Some(str_at(value, "/spec/tls/0/secretName"))
            .filter(|s| !s.is_empty())
            .filter(|s| cluster_issuer.is_none() || *s != issued_secret(&meta.name));
        let backend = "/spec/rules/0/http/paths/0/backend/service";
        Ok(Self {
            id: meta.uid,
            service_name: str_at(value, &format!("{backend}/name")),
            service_port: port_at(value, &format!("{backend}/port/number")),
            ingress_class: str_at(value, "/spec/ingressClassName"),
            hosts: array_at(value, "/spec/rules")
                .iter()
                .map(|rule| str_at(rule, "/host"))
                .collect(),
            tls_secret,
            cluster_issuer,
            placeholder: false,
            name: meta.name,
            namespace: meta.namespace,
            created_at: meta.creation_timestamp,
        })
    }

    fn conflict(&self, err: ProviderError) -> ProviderError {
        match &err {
            ProviderError::Permanent(msg) if msg.contains("is already defined in ingress") => {
                let host = self
                    .hosts
                    .iter()
                    .find(|h| msg.contains(h.as_str()))
                    .or(self.hosts.first())
                    .cloned()
                    .unwrap_or_default();
                ProviderError::IngressHostInUse(host)
            }
            _ => err,
        }
    }
}

impl Manifest for K8sJob {
    const KIND: &'static str = "Job";
    const API_VERSION: &'static str = "batch/v1";
    const PLURAL: &'static str = "jobs";

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn manifest(&self) -> Value {
        let (volumes, mounts) = pod_volumes(&self.volumes);
        json!({
            "apiVersion": Self::API_VERSION,
            "kind": Self::KIND,
            "metadata": metadata(&self.name, Some(&self.namespace)),
            "spec": {
                "backoffLimit": 3,
                "template": {
                    "spec": {
                        "restartPolicy": "OnFailure",
                        "volumes": volumes,
                        "containers": [{
                            "name": self.name,
                            "image": self.image,
                            "command": self.command,
                            "args": self.args,
                            "volumeMounts": mounts,
                        }],
                    },
                },
            },
        })
    }

    fn from_manifest(value: &Value) -> ProviderResult<Self> {
        let meta = meta(value)?;
        let pod = value
            .pointer("/spec/template/spec")
            .cloned()
            .unwrap_or(Value::Null);
        let container = pod.pointer("/containers/0").cloned().unwrap_or(Value::Null);
        Ok(Self {
            id: meta.uid,
            name: meta.name,
            namespace: meta.namespace,
            image: str_at(&container, "/image"),
            command: strings_at(&container, "/command"),
            args: strings_at(&container, "/args"),
            volumes: parse_volumes(&pod, &container),
            created_at: meta.creation_timestamp,
        })
    }
}

macro_rules! kube_provider {
    ($($ty:ty),+ $(,)?) => {
        $(
            #[async_trait]
            impl Provider<$ty> for HttpKube {
                async fn read(&self, observed: &$ty) -> ProviderResult<Option<$ty>> {
                    self.read_object(observed).await
                }

                async fn create(&self, desired: &$ty) -> ProviderResult<$ty> {
                    self.create_object(desired).await
                }

                async fn update(&self, desired: &$ty) -> ProviderResult<$ty> {
                    self.apply_object(desired).await
                }

                async fn delete(&self, observed: &$ty) -> ProviderResult<()> {
                    self.delete_object(observed).await
                }
            }
        )+
    };
}

kube_provider!(
    Namespace,
    Secret,
    PersistentVolume,
    PersistentVolumeClaim,
    K8sDeployment,
    Service,
    Ingress,
    K8sJob,
);

fn is_failing(pod: &Value) -> bool {
    array_at(pod, "/status/containerStatuses")
        .iter()
        .chain(array_at(pod, "/status/initContainerStatuses"))
        .any(|status| FAILING_REASONS.contains(&str_at(status, "/state/waiting/reason").as_str()))
}

/// The last `tail` lines of `lines`.
fn last_lines(mut lines: Vec<String>, tail: usize) -> Vec<String> {
    let skip = lines.len().saturating_sub(tail);
    lines.split_off(skip)
}

#[async_trait]
impl KubeApi for HttpKube {
    async fn read_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<BTreeMap<String, String>>> {
        let path = format!("/api/v1/namespaces/{namespace}/secrets/{name}");
        Ok(self
            .get_object(&path, "secret", name)
            .await?
            .map(|value| decode_secret_data(&value)))
    }

    async fn restart_deployment(&self, namespace: &str, name: &str) -> ProviderResult<()> {
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": {
                RESTARTED_AT: Utc::now().to_rfc3339(),
            }}}},
        });
        let response = self
            .request(
                Method::PATCH,
                &format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}"),
            )
            .header(CONTENT_TYPE, STRATEGIC_MERGE_PATCH)
            .body(patch.to_string())
            .send()
            .await?;
        checked(response, "deployment", name).await?;
        Ok(())
    }

    async fn workload_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> ProviderResult<Option<WorkloadStatus>> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}");
        let Some(deployment) = self.get_object(&path, "deployment", name).await? else {
            return Ok(None);
        };
        let labels = map_at(&deployment, "/spec/selector/matchLabels");
        let pods = self.pods(namespace, &labels).await?;
        Ok(Some(WorkloadStatus {
            desired_replicas: u32_at(&deployment, "/spec/replicas"),
            ready_replicas: u32_at(&deployment, "/status/readyReplicas"),
            failing: pods.iter().any(is_failing),
        }))
    }

    async fn workload_logs(
        &self,
        namespace: &str,
        name: &str,
        tail: usize,
    ) -> ProviderResult<Vec<String>> {
        let path = format!("/apis/apps/v1/namespaces/{namespace}/deployments/{name}");
        let Some(deployment) = self.get_object(&path, "deployment", name).await? else {
            return Err(ProviderError::not_found("deployment", name));
        };
        let labels = map_at(&deployment, "/spec/selector/matchLabels");
        let tail_lines = tail.to_string();
        let mut lines = Vec::new();
        for pod in self.pods(namespace, &labels).await? {
            let pod_name = str_at(&pod, "/metadata/name");
            let response = self
                .request(
                    Method::GET,
                    &format!("/api/v1/namespaces/{namespace}/pods/{pod_name}/log"),
                )
                .query(&[("container", name), ("tailLines", tail_lines.as_str())])
                .send()
                .await?;
            if !response.status().is_success() {
                // Pods that have not started yet have no log.
                debug!(pod = %pod_name, status = %response.status(), "Skipping pod logs");
                continue;
            }
            let text = response.text().await?;
            lines.extend(text.lines().map(str::to_string));
        }
        Ok(last_lines(lines, tail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> K8sDeployment {
        K8sDeployment {
            id: "uid-1".to_string(),
            name: "a1".to_string(),
            namespace: "u-1".to_string(),
            labels: BTreeMap::from([("app".to_string(), "a1".to_string())]),
            image: "nginx".to_string(),
            env: vec![EnvVar::new("PORT", "80")],
            port: 80,
            replicas: 2,
            image_pull_secrets: vec!["pull".to_string()],
            volumes: vec![VolumeMount {
                name: "data".to_string(),
                pvc_name: "pvc-data".to_string(),
                mount_path: "/data".to_string(),
            }],
            init_commands: vec!["echo ready && touch /data/ok".to_string()],
            args: vec!["--verbose".to_string()],
            resources: ResourceLimits {
                cpu_limit: "500m".to_string(),
                memory_limit: "1Gi".to_string(),
                cpu_request: String::new(),
                memory_request: String::new(),
            },
            created_at: None,
        }
    }

    fn live(mut manifest: Value, uid: &str) -> Value {
        manifest["metadata"]["uid"] = json!(uid);
        manifest["metadata"]["creationTimestamp"] = json!("2025-01-01T00:00:00Z");
        manifest
    }

    #[test]
    fn test_paths() {
        let ns = Namespace {
            name: "u-1".to_string(),
            ..Default::default()
        };
        assert_eq!(item_path(&ns), "/api/v1/namespaces/u-1");
        assert_eq!(
            item_path(&deployment()),
            "/apis/apps/v1/namespaces/u-1/deployments/a1"
        );
        assert_eq!(
            collection_path::<Ingress>(Some("u-1")),
            "/apis/networking.k8s.io/v1/namespaces/u-1/ingresses"
        );
    }

    #[test]
    fn test_deployment_manifest_reads_back() {
        let desired = deployment();
        let parsed = K8sDeployment::from_manifest(&live(desired.manifest(), "uid-1")).unwrap();
        assert_eq!(parsed.created_at.map(|t| t.timestamp()), Some(1_735_689_600));
        assert_eq!(
            K8sDeployment {
                created_at: None,
                ..parsed
            },
            desired
        );
    }

    #[test]
    fn test_secret_data_is_base64() {
        let secret = Secret {
            name: "pull".to_string(),
            namespace: "u-1".to_string(),
            secret_type: SecretType::DockerConfigJson,
            data: BTreeMap::from([(".dockerconfigjson".to_string(), "{}".to_string())]),
            ..Default::default()
        };
        let manifest = secret.manifest();
        assert_eq!(manifest["type"], "kubernetes.io/dockerconfigjson");
        assert_eq!(manifest["data"][".dockerconfigjson"], "e30=");

        let parsed = Secret::from_manifest(&live(manifest, "uid-2")).unwrap();
        assert_eq!(parsed.secret_type, SecretType::DockerConfigJson);
        assert_eq!(parsed.data, secret.data);
    }

    #[test]
    fn test_issued_tls_secret_is_implicit() {
        let ingress = Ingress {
            name: "custom".to_string(),
            namespace: "u-1".to_string(),
            service_name: "a1".to_string(),
            service_port: 8080,
            ingress_class: "nginx".to_string(),
            hosts: vec!["app.example.com".to_string()],
            cluster_issuer: Some("letsencrypt".to_string()),
            ..Default::default()
        };
        let manifest = ingress.manifest();
        assert_eq!(manifest["spec"]["tls"][0]["secretName"], "custom-tls");
        assert_eq!(
            manifest["metadata"]["annotations"][CLUSTER_ISSUER],
            "letsencrypt"
        );

        let parsed = Ingress::from_manifest(&live(manifest, "uid-3")).unwrap();
        assert_eq!(parsed.tls_secret, None);
        assert_eq!(parsed.hosts, ingress.hosts);
        assert_eq!(parsed.service_port, 8080);
    }

    #[test]
    fn test_duplicate_host_is_reported() {
        let ingress = Ingress {
            name: "a1".to_string(),
            hosts: vec!["a1.z1.example".to_string()],
            ..Default::default()
        };
        let err = ingress.conflict(ProviderError::Permanent(
            "admission webhook denied the request: host \"a1.z1.example\" and path \"/\" \
             is already defined in ingress u-2/a1"
                .to_string(),
        ));
        assert!(matches!(err, ProviderError::IngressHostInUse(h) if h == "a1.z1.example"));
    }

    #[test]
    fn test_failing_pods() {
        let pod = json!({ "status": { "containerStatuses": [
            { "state": { "waiting": { "reason": "CrashLoopBackOff" } } },
        ]}});
        assert!(is_failing(&pod));
        let pod = json!({ "status": { "containerStatuses": [
            { "state": { "running": {} } },
        ]}});
        assert!(!is_failing(&pod));
    }

    #[test]
    fn test_last_lines() {
        let lines: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        assert_eq!(last_lines(lines.clone(), 2), vec!["3", "4"]);
        assert_eq!(last_lines(lines, 10).len(), 5);
    }
}
