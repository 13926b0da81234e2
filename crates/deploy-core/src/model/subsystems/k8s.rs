// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes objects as recorded in resource documents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::subsystem_object;

/// Kubernetes namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Namespace name.
    pub name: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// An environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Build an environment variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A volume mounted into a container, backed by a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name inside the pod.
    pub name: String,
    /// Claim the volume is bound to.
    pub pvc_name: String,
    /// Mount path inside the container.
    pub mount_path: String,
}

/// CPU and memory requests/limits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU limit (Kubernetes quantity).
    pub cpu_limit: String,
    /// Memory limit (Kubernetes quantity).
    pub memory_limit: String,
    /// CPU request.
    pub cpu_request: String,
    /// Memory request.
    pub memory_request: String,
}

/// Kubernetes Deployment workload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sDeployment {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Labels applied to the pod template and selector.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Container image.
    pub image: String,
    /// Container environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Container port.
    pub port: u16,
    /// Desired replicas.
    pub replicas: u32,
    /// Pull secrets referenced by the pod.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Commands run by an init container before the main one starts.
    #[serde(default)]
    pub init_commands: Vec<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Resource limits.
    #[serde(default)]
    pub resources: ResourceLimits,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kubernetes Service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Service port.
    pub port: u16,
    /// Target port on the pods.
    pub target_port: u16,
    /// Pod selector.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kubernetes Ingress routing hosts to a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingress {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Backend service name.
    pub service_name: String,
    /// Backend service port.
    pub service_port: u16,
    /// Ingress class.
    pub ingress_class: String,
    /// Hostnames routed by this ingress.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// TLS secret for the hosts.
    #[serde(default)]
    pub tls_secret: Option<String>,
    /// Cert-manager issuer for custom domains.
    #[serde(default)]
    pub cluster_issuer: Option<String>,
    /// Intentionally not created (private app).
    #[serde(default, skip_serializing_if = "super::is_false")]
    pub placeholder: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// NFS-backed PersistentVolume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolume {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Capacity (Kubernetes quantity).
    pub capacity: String,
    /// NFS server.
    pub nfs_server: String,
    /// Exported path on the NFS server.
    pub nfs_path: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// PersistentVolumeClaim bound to a named volume.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaim {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Requested capacity.
    pub capacity: String,
    /// Volume the claim binds to.
    pub volume_name: String,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Kind of secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecretType {
    /// Generic key/value secret.
    #[default]
    Opaque,
    /// Docker registry credentials.
    DockerConfigJson,
    /// TLS certificate and key.
    Tls,
}

/// Kubernetes Secret.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Secret kind.
    #[serde(rename = "type", default)]
    pub secret_type: SecretType,
    /// Secret payload.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Intentionally not created.
    #[serde(default, skip_serializing_if = "super::is_false")]
    pub placeholder: bool,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// One-shot Kubernetes Job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sJob {
    /// Object UID.
    #[serde(default)]
    pub id: String,
    /// Object name.
    pub name: String,
    /// Namespace of the object.
    pub namespace: String,
    /// Container image.
    pub image: String,
    /// Container command.
    #[serde(default)]
    pub command: Vec<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Volume mounts.
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

subsystem_object!(Namespace);
subsystem_object!(K8sDeployment);
subsystem_object!(Service);
subsystem_object!(Ingress, placeholder);
subsystem_object!(PersistentVolume);
subsystem_object!(PersistentVolumeClaim);
subsystem_object!(Secret, placeholder);
subsystem_object!(K8sJob);

/// Observed Kubernetes state of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sSubsystem {
    /// Namespace the objects live in.
    #[serde(default)]
    pub namespace: Option<Namespace>,
    /// Workloads keyed by name.
    #[serde(default)]
    pub deployment_map: BTreeMap<String, K8sDeployment>,
    /// Services keyed by name.
    #[serde(default)]
    pub service_map: BTreeMap<String, Service>,
    /// Ingresses keyed by name.
    #[serde(default)]
    pub ingress_map: BTreeMap<String, Ingress>,
    /// Volumes keyed by name.
    #[serde(default)]
    pub pv_map: BTreeMap<String, PersistentVolume>,
    /// Claims keyed by name.
    #[serde(default)]
    pub pvc_map: BTreeMap<String, PersistentVolumeClaim>,
    /// Secrets keyed by name.
    #[serde(default)]
    pub secret_map: BTreeMap<String, Secret>,
    /// One-shot jobs keyed by name.
    #[serde(default)]
    pub job_map: BTreeMap<String, K8sJob>,
}

impl K8sSubsystem {
    /// Whether no object (namespace excluded) is recorded.
    pub fn is_empty(&self) -> bool {
        self.deployment_map.is_empty()
            && self.service_map.is_empty()
            && self.ingress_map.is_empty()
            && self.pv_map.is_empty()
            && self.pvc_map.is_empty()
            && self.secret_map.is_empty()
            && self.job_map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::subsystems::SubsystemObject;

    #[test]
    fn test_skeleton_serializes_every_map() {
        let json = serde_json::to_value(K8sSubsystem::default()).unwrap();
        for key in [
            "deploymentMap",
            "serviceMap",
            "ingressMap",
            "pvMap",
            "pvcMap",
            "secretMap",
            "jobMap",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_placeholder_ingress_counts_as_created() {
        let ingress = Ingress {
            name: "app".to_string(),
            placeholder: true,
            ..Default::default()
        };
        assert!(ingress.is_created());

        let json = serde_json::to_value(&ingress).unwrap();
        assert_eq!(json["placeholder"], true);

        let plain = serde_json::to_value(Ingress::default()).unwrap();
        assert!(plain.get("placeholder").is_none());
    }
}
