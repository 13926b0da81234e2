// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for deploy-control.
//!
//! Process settings come from environment variables ([`Config`]); the
//! platform description (zones, roles, registry, worker intervals) comes from
//! a TOML file ([`PlatformConfig`]).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL; `postgres://` or `sqlite:` selects the backend.
    pub database_url: String,
    /// Path of the platform TOML file.
    pub config_file: PathBuf,
    /// HTTP listen address.
    pub http_addr: SocketAddr,
    /// Use the `-test` database.
    pub test_mode: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DEPLOY_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DEPLOY_DATABASE_URL"))?;

        let config_file = PathBuf::from(
            std::env::var("DEPLOY_CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string()),
        );

        let port: u16 = std::env::var("DEPLOY_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let test_mode = std::env::var("DEPLOY_TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            config_file,
            http_addr,
            test_mode,
        })
    }

    /// Database URL with the test suffix applied when running in test mode.
    ///
    /// Postgres gets `-test` appended to the database name, SQLite to the file stem.
    pub fn effective_database_url(&self) -> String {
        if !self.test_mode {
            return self.database_url.clone();
        }
        test_database_url(&self.database_url)
    }
}

fn test_database_url(url: &str) -> String {
    let (base, query) = match url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (url, None),
    };

    let suffixed = if let Some(path) = base.strip_prefix("sqlite:") {
        match path.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
                format!("sqlite:{stem}-test.{ext}")
            }
            _ => format!("sqlite:{path}-test"),
        }
    } else {
        format!("{base}-test")
    };

    match query {
        Some(query) => format!("{suffixed}?{query}"),
        None => suffixed,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// The platform file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The platform file is not valid TOML for [`PlatformConfig`].
    #[error("Invalid platform config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The platform file parsed but is inconsistent.
    #[error("Invalid platform config: {0}")]
    Invalid(String),
}

/// Worker roles enabled in this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::Args)]
pub struct WorkerFlags {
    /// Serve the HTTP API.
    #[arg(long)]
    pub api: bool,
    /// Advance resources out of `beingCreated` / `beingDeleted`.
    #[arg(long)]
    pub confirmer: bool,
    /// Pull live workload status from providers.
    #[arg(long)]
    pub status_updater: bool,
    /// Claim and run queued jobs.
    #[arg(long)]
    pub job_executor: bool,
    /// Schedule repair jobs for quiescent resources.
    #[arg(long)]
    pub repairer: bool,
    /// HTTP-check deployment URLs.
    #[arg(long)]
    pub pinger: bool,
    /// Take scheduled VM snapshots.
    #[arg(long)]
    pub snapshotter: bool,
    /// Release expired GPU leases.
    #[arg(long)]
    pub gpu_lease_enforcer: bool,
    /// Use the `-test` database.
    #[arg(long, env = "DEPLOY_TEST_MODE")]
    pub test_mode: bool,
}

impl WorkerFlags {
    /// Every role enabled.
    pub fn all() -> Self {
        Self {
            api: true,
            confirmer: true,
            status_updater: true,
            job_executor: true,
            repairer: true,
            pinger: true,
            snapshotter: true,
            gpu_lease_enforcer: true,
            test_mode: false,
        }
    }

    /// With no role flag set, every role runs.
    pub fn resolve(self) -> Self {
        let any = self.api
            || self.confirmer
            || self.status_updater
            || self.job_executor
            || self.repairer
            || self.pinger
            || self.snapshotter
            || self.gpu_lease_enforcer;
        if any {
            self
        } else {
            Self {
                test_mode: self.test_mode,
                ..Self::all()
            }
        }
    }
}

/// Platform description loaded from the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Public base URL of this control plane (webhook targets are derived from it).
    pub external_url: String,
    /// Secret used to sign session state.
    #[serde(default)]
    pub session_secret: String,
    /// Zones with their provider endpoints.
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
    /// Roles with quotas and permissions.
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    /// API-key principals.
    #[serde(default)]
    pub users: Vec<UserConfig>,
    /// Workload defaults for generated Kubernetes objects.
    #[serde(default)]
    pub deployment: DeploymentDefaults,
    /// Container registry.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// GitHub API settings.
    #[serde(default)]
    pub github: GithubConfig,
    /// Storage manager OAuth proxy settings.
    #[serde(default)]
    pub storage_manager: StorageManagerConfig,
    /// GPU blacklists.
    #[serde(default)]
    pub gpu: GpuConfig,
    /// Worker intervals and pool sizes.
    #[serde(default)]
    pub workers: WorkerIntervals,
    /// VM snapshot schedule.
    #[serde(default)]
    pub snapshots: SnapshotSchedule,
}

impl PlatformConfig {
    /// Read and validate the platform file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.external_url.is_empty() {
            return Err(ConfigError::Invalid("external_url is empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for zone in &self.zones {
            if !seen.insert(zone.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "zone {} declared twice",
                    zone.name
                )));
            }
            if let Some(range) = &zone.port_range {
                if range.start >= range.end {
                    return Err(ConfigError::Invalid(format!(
                        "zone {} has an empty port range",
                        zone.name
                    )));
                }
            }
        }

        for user in &self.users {
            for role in &user.roles {
                if !self.roles.iter().any(|r| &r.name == role) {
                    return Err(ConfigError::Invalid(format!(
                        "user {} references unknown role {role}",
                        user.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Base URL with any trailing slash removed.
    pub fn external_url(&self) -> &str {
        self.external_url.trim_end_matches('/')
    }
}

/// What a zone can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Container deployments and storage managers.
    Deployment,
    /// Virtual machines.
    Vm,
}

/// One zone as declared in the platform file.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    /// Zone name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Authoritative capability list.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Legacy single-capability field, read only when `capabilities` is empty.
    #[serde(default, rename = "type")]
    pub legacy_type: Option<String>,
    /// Parent domain for deployment hostnames (`<name>.<parent_domain>`).
    #[serde(default)]
    pub parent_domain: String,
    /// Parent domain for VM HTTP proxies (`<port>.<vm_app_domain>`).
    #[serde(default)]
    pub vm_app_domain: String,
    /// Public hostname of the zone's VM gateway.
    #[serde(default)]
    pub vm_parent_domain: String,
    /// Parent domain for storage managers (`<user>.<storage_domain>`).
    #[serde(default)]
    pub storage_domain: String,
    /// Ingress class for generated ingresses.
    #[serde(default = "default_ingress_class")]
    pub ingress_class: String,
    /// Cert-manager issuer for custom domains.
    #[serde(default = "default_cluster_issuer")]
    pub cluster_issuer: String,
    /// NFS storage.
    #[serde(default)]
    pub storage: Option<StorageConfig>,
    /// Kubernetes API credentials.
    #[serde(default)]
    pub kubernetes: Option<KubernetesCredentials>,
    /// CloudStack identifiers.
    #[serde(default)]
    pub cloudstack: Option<CloudStackIds>,
    /// Public port range for VM port forwarding.
    #[serde(default)]
    pub port_range: Option<PortRange>,
}

fn default_ingress_class() -> String {
    "nginx".to_string()
}

fn default_cluster_issuer() -> String {
    "letsencrypt-prod".to_string()
}

/// NFS storage of a zone.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// NFS server address.
    pub nfs_server: String,
    /// Export root holding per-user directories.
    pub nfs_parent_path: String,
}

/// Kubernetes API endpoint and token.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesCredentials {
    /// API server URL.
    pub api_url: String,
    /// Bearer token.
    #[serde(default)]
    pub token: String,
}

/// CloudStack identifiers used when creating VMs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudStackIds {
    /// API endpoint.
    #[serde(default)]
    pub api_url: String,
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// API secret.
    #[serde(default)]
    pub secret_key: String,
    /// CloudStack zone UUID.
    pub zone_id: String,
    /// Template VMs are created from.
    pub template_id: String,
    /// Network VMs attach to.
    pub network_id: String,
    /// Public IP address ID used for port forwarding.
    pub ip_address_id: String,
    /// Custom service offering; looked up by the name `custom` when empty.
    #[serde(default)]
    pub service_offering_id: String,
}

/// Inclusive start, exclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PortRange {
    /// First usable port.
    pub start: u16,
    /// One past the last usable port.
    pub end: u16,
}

/// Permission flags granted by a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    /// Lease GPUs.
    UseGpus,
    /// Lease GPUs on the privileged list.
    UsePrivilegedGpus,
    /// Attach custom domains.
    UseCustomDomains,
}

/// Per-user limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all(serialize = "camelCase"))]
pub struct Quotas {
    /// Maximum live deployments.
    pub deployments: u32,
    /// Total VM CPU cores.
    pub cpu_cores: u32,
    /// Total VM RAM in GB.
    pub ram: u32,
    /// Total VM disk in GB.
    pub disk_size: u32,
    /// User snapshots per VM.
    pub snapshots: u32,
    /// GPU lease length in hours.
    pub gpu_lease_duration: f64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            deployments: 5,
            cpu_cores: 4,
            ram: 8,
            disk_size: 100,
            snapshots: 3,
            gpu_lease_duration: 168.0,
        }
    }
}

/// A role: IAM group mapping, quotas and permissions.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleConfig {
    /// Role name.
    pub name: String,
    /// IAM group granting the role.
    #[serde(default)]
    pub iam_group: String,
    /// Limits for holders of the role.
    #[serde(default)]
    pub quotas: Quotas,
    /// Granted permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// A principal authenticated by API key.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// User ID.
    pub id: String,
    /// Opaque API key.
    pub api_key: String,
    /// Role names, highest quota wins.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Platform administrator.
    #[serde(default)]
    pub admin: bool,
    /// Contact e-mail (storage manager allow-list).
    #[serde(default)]
    pub email: String,
}

/// Defaults applied to generated workloads.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentDefaults {
    /// CPU limit.
    pub cpu_limit: String,
    /// Memory limit.
    pub memory_limit: String,
    /// CPU request.
    pub cpu_request: String,
    /// Memory request.
    pub memory_request: String,
    /// Capacity of generated volumes.
    pub storage_capacity: String,
    /// Namespace holding the platform wildcard certificate.
    pub wildcard_cert_namespace: String,
    /// Name of the wildcard certificate secret.
    pub wildcard_cert_secret: String,
    /// Image serving VM HTTP proxies.
    pub vm_http_proxy_image: String,
}

impl Default for DeploymentDefaults {
    fn default() -> Self {
        Self {
            cpu_limit: "500m".to_string(),
            memory_limit: "1Gi".to_string(),
            cpu_request: "100m".to_string(),
            memory_request: "256Mi".to_string(),
            storage_capacity: "10Gi".to_string(),
            wildcard_cert_namespace: "cert-manager".to_string(),
            wildcard_cert_secret: "wildcard-cert".to_string(),
            vm_http_proxy_image: "registry.local/system/vm-http-proxy:latest".to_string(),
        }
    }
}

/// Harbor registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry URL.
    pub url: String,
    /// Admin username.
    pub username: String,
    /// Admin password.
    pub password: String,
    /// Token Harbor sends in the webhook `Authorization` header.
    pub webhook_token: String,
    /// Image deployed until a custom image is pushed (`<project>/<repository>`).
    pub placeholder_image: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://registry.local".to_string(),
            username: String::new(),
            password: String::new(),
            webhook_token: String::new(),
            placeholder_image: "system/placeholder".to_string(),
        }
    }
}

/// GitHub API settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    /// REST API base URL.
    pub api_url: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
        }
    }
}

/// OAuth proxy settings for storage managers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageManagerConfig {
    /// OIDC issuer URL.
    pub oidc_issuer_url: String,
    /// OAuth client ID.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Cookie encryption secret.
    pub cookie_secret: String,
}

/// GPU selection blacklists.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Hosts never used for GPU leases.
    pub excluded_hosts: Vec<String>,
    /// GPU IDs never leased.
    pub excluded_gpus: Vec<String>,
    /// GPU IDs requiring the `usePrivilegedGpus` permission.
    pub privileged_gpus: Vec<String>,
}

/// Worker intervals in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerIntervals {
    /// Repairer scan interval.
    pub repair_interval_secs: u64,
    /// Quiescence window before a resource is repaired again.
    pub repair_quiescence_secs: u64,
    /// Pinger interval.
    pub ping_interval_secs: u64,
    /// Confirmer interval.
    pub confirm_interval_secs: u64,
    /// Status updater interval.
    pub status_interval_secs: u64,
    /// Snapshotter interval.
    pub snapshot_interval_secs: u64,
    /// GPU lease enforcer interval.
    pub gpu_lease_interval_secs: u64,
    /// Job executor poll interval in milliseconds.
    pub job_poll_interval_ms: u64,
    /// Concurrent job executor tasks.
    pub job_executor_pool_size: usize,
}

impl Default for WorkerIntervals {
    fn default() -> Self {
        Self {
            repair_interval_secs: 300,
            repair_quiescence_secs: 300,
            ping_interval_secs: 300,
            confirm_interval_secs: 5,
            status_interval_secs: 30,
            snapshot_interval_secs: 3600,
            gpu_lease_interval_secs: 60,
            job_poll_interval_ms: 500,
            job_executor_pool_size: 4,
        }
    }
}

impl WorkerIntervals {
    /// Repairer interval.
    pub fn repair(&self) -> Duration {
        Duration::from_secs(self.repair_interval_secs)
    }

    /// Repair quiescence window.
    pub fn repair_quiescence(&self) -> Duration {
        Duration::from_secs(self.repair_quiescence_secs)
    }

    /// Pinger interval.
    pub fn ping(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Confirmer interval.
    pub fn confirm(&self) -> Duration {
        Duration::from_secs(self.confirm_interval_secs)
    }

    /// Status updater interval.
    pub fn status(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Snapshotter interval.
    pub fn snapshot(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// GPU lease enforcer interval.
    pub fn gpu_lease(&self) -> Duration {
        Duration::from_secs(self.gpu_lease_interval_secs)
    }

    /// Job poll interval.
    pub fn job_poll(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

/// Automatic VM snapshot schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotSchedule {
    /// Schedule name, recorded as `auto-<name>` in the snapshot description.
    pub name: String,
    /// Hours between automatic snapshots of one VM.
    pub interval_hours: u32,
    /// Automatic snapshots kept per VM.
    pub keep: usize,
}

impl Default for SnapshotSchedule {
    fn default() -> Self {
        Self {
            name: "daily".to_string(),
            interval_hours: 24,
            keep: 3,
        }
    }
}
