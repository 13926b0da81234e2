// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::subsystems::github::GithubSubsystem;
use super::subsystems::gitlab::GitlabSubsystem;
use super::subsystems::harbor::HarborSubsystem;
use super::subsystems::k8s::K8sSubsystem;
use super::{Document, ResourceKind, ResourceSpec};

/// Name of the app every deployment carries.
pub const MAIN_APP: &str = "main";

/// Where the deployment's image comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentType {
    /// Image is built and pushed to the platform registry.
    Custom,
    /// Image is pulled from an external registry.
    #[default]
    Prebuilt,
}

/// Environment variable declared by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Env {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

/// NFS-backed volume declared by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, unique within the deployment.
    pub name: String,
    /// Mount path inside the container.
    pub app_path: String,
    /// Path below the user's home on the NFS server.
    pub server_path: String,
}

/// One container app inside a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    /// Container image.
    pub image: String,
    /// Port the container listens on.
    pub internal_port: u16,
    /// Private apps get no ingress.
    #[serde(default)]
    pub private: bool,
    /// Environment variables.
    #[serde(default)]
    pub envs: Vec<Env>,
    /// Mounted volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Commands run before the container starts.
    #[serde(default)]
    pub init_commands: Vec<String>,
    /// Container arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Optional user-owned hostname.
    #[serde(default)]
    pub custom_domain: Option<String>,
    /// Desired replicas.
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Last HTTP status observed by the pinger.
    #[serde(default)]
    pub ping_result: Option<u16>,
    /// Path probed by the pinger.
    #[serde(default = "default_ping_path")]
    pub ping_path: String,
}

fn default_replicas() -> u32 {
    1
}

fn default_ping_path() -> String {
    "/".to_string()
}

impl App {
    /// A public app with defaults for everything but image and port.
    pub fn new(image: impl Into<String>, internal_port: u16) -> Self {
        Self {
            image: image.into(),
            internal_port,
            private: false,
            envs: Vec::new(),
            volumes: Vec::new(),
            init_commands: Vec::new(),
            args: Vec::new(),
            custom_domain: None,
            replicas: default_replicas(),
            ping_result: None,
            ping_path: default_ping_path(),
        }
    }
}

/// Declared state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Image source.
    #[serde(rename = "type")]
    pub kind: DeploymentType,
    /// Apps keyed by name; always contains [`MAIN_APP`].
    pub apps: BTreeMap<String, App>,
}

impl DeploymentSpec {
    /// Spec with a single `main` app.
    pub fn single(kind: DeploymentType, app: App) -> Self {
        Self {
            kind,
            apps: BTreeMap::from([(MAIN_APP.to_string(), app)]),
        }
    }

    /// The `main` app, if present.
    pub fn main_app(&self) -> Option<&App> {
        self.apps.get(MAIN_APP)
    }
}

/// Observed provider state of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSubsystems {
    /// Kubernetes objects.
    #[serde(default)]
    pub k8s: K8sSubsystem,
    /// Harbor objects.
    #[serde(default)]
    pub harbor: HarborSubsystem,
    /// GitHub objects.
    #[serde(default)]
    pub github: GithubSubsystem,
    /// Build records.
    #[serde(default)]
    pub gitlab: GitlabSubsystem,
}

impl ResourceSpec for DeploymentSpec {
    const KIND: ResourceKind = ResourceKind::Deployment;
    type Subsystems = DeploymentSubsystems;
}

/// A deployment document.
pub type Deployment = Document<DeploymentSpec>;

impl Deployment {
    /// The `main` app, if present.
    pub fn main_app(&self) -> Option<&App> {
        self.spec.main_app()
    }
}
