// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared control plane state.
//!
//! One [`Platform`] is built at start-up and shared (behind an `Arc`) by the
//! HTTP handlers, the job handlers and every worker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::warn;

use deploy_core::model::{DeploymentSpec, StorageManagerSpec, VmSpec};
use deploy_core::persistence::{Persistence, ResourceStore};

use crate::config::{Capability, ConfigError, PlatformConfig, UserConfig};
use crate::error::Result;
use crate::generators::k8s::K8sParams;
use crate::jobs::JobQueue;
use crate::providers::{KubeApi, ProviderFactory, ZoneClients};
use crate::zones::{Zone, ZoneRegistry};

/// State shared by handlers, jobs and workers.
pub struct Platform {
    /// Parsed platform file.
    pub config: Arc<PlatformConfig>,
    /// Configured zones.
    pub zones: ZoneRegistry,
    /// Zone-scoped provider clients.
    pub clients: ZoneClients,
    /// Underlying persistence.
    pub persistence: Arc<dyn Persistence>,
    /// Deployment documents.
    pub deployments: ResourceStore<DeploymentSpec>,
    /// VM documents.
    pub vms: ResourceStore<VmSpec>,
    /// Storage manager documents.
    pub storage_managers: ResourceStore<StorageManagerSpec>,
    /// Job queue.
    pub jobs: JobQueue,
    /// When the platform was built.
    pub start_time: Instant,
    /// Crate version.
    pub version: String,
    /// Serialises public port allocation across VM jobs.
    port_allocation: Mutex<()>,
}

impl Platform {
    /// Build the platform state.
    pub fn new(
        config: PlatformConfig,
        persistence: Arc<dyn Persistence>,
        factory: Arc<dyn ProviderFactory>,
    ) -> std::result::Result<Self, ConfigError> {
        let zones = ZoneRegistry::from_config(config.zones.clone())?;
        Ok(Self {
            config: Arc::new(config),
            zones,
            clients: ZoneClients::new(factory),
            deployments: ResourceStore::new(persistence.clone()),
            vms: ResourceStore::new(persistence.clone()),
            storage_managers: ResourceStore::new(persistence.clone()),
            jobs: JobQueue::new(persistence.clone()),
            persistence,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            port_allocation: Mutex::new(()),
        })
    }

    /// Zone `name`, which must host `capability`.
    pub fn zone(&self, name: &str, capability: Capability) -> Result<&Zone> {
        self.zones.require(name, capability)
    }

    /// Principal configured with `api_key`.
    pub fn user_by_api_key(&self, api_key: &str) -> Option<&UserConfig> {
        self.config
            .users
            .iter()
            .find(|u| !u.api_key.is_empty() && u.api_key == api_key)
    }

    /// Principal configured with `id`.
    pub fn user(&self, id: &str) -> Option<&UserConfig> {
        self.config.users.iter().find(|u| u.id == id)
    }

    /// Generator inputs for `zone`.
    pub fn k8s_params<'a>(
        &'a self,
        zone: &'a Zone,
        wildcard_cert: Option<&'a BTreeMap<String, String>>,
    ) -> K8sParams<'a> {
        K8sParams {
            zone,
            defaults: &self.config.deployment,
            registry: &self.config.registry,
            storage_manager: &self.config.storage_manager,
            wildcard_cert,
        }
    }

    /// Data of the platform wildcard certificate in `kube`'s cluster.
    ///
    /// A failed read is logged and reported as `None`; the generators then
    /// keep whatever copy is already recorded.
    pub async fn wildcard_cert(&self, kube: &dyn KubeApi) -> Option<BTreeMap<String, String>> {
        let defaults = &self.config.deployment;
        match kube
            .read_secret_data(
                &defaults.wildcard_cert_namespace,
                &defaults.wildcard_cert_secret,
            )
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    namespace = %defaults.wildcard_cert_namespace,
                    secret = %defaults.wildcard_cert_secret,
                    error = %e,
                    "Failed to read wildcard certificate"
                );
                None
            }
        }
    }

    /// Hold the port allocation lock.
    pub async fn lock_port_allocation(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.port_allocation.lock().await
    }

    /// Server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}
