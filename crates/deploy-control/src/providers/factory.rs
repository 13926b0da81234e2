// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zone-scoped client construction and caching.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::{CloudStack, Github, Harbor, Kube, ProviderResult};
use crate::zones::Zone;

/// Builds provider clients.
pub trait ProviderFactory: Send + Sync {
    /// Kubernetes client for a zone.
    fn kube(&self, zone: &Zone) -> ProviderResult<Kube>;

    /// CloudStack client for a zone.
    fn cloudstack(&self, zone: &Zone) -> ProviderResult<CloudStack>;

    /// Registry client.
    fn harbor(&self) -> ProviderResult<Harbor>;

    /// GitHub client acting with a user's token.
    fn github(&self, token: &str) -> ProviderResult<Github>;
}

/// Long-lived per-zone clients, built on first use.
pub struct ZoneClients {
    factory: Arc<dyn ProviderFactory>,
    kube: RwLock<HashMap<String, Kube>>,
    cloudstack: RwLock<HashMap<String, CloudStack>>,
}

impl ZoneClients {
    /// Wrap a factory.
    pub fn new(factory: Arc<dyn ProviderFactory>) -> Self {
        Self {
            factory,
            kube: RwLock::new(HashMap::new()),
            cloudstack: RwLock::new(HashMap::new()),
        }
    }

    /// Kubernetes client for `zone`.
    pub async fn kube(&self, zone: &Zone) -> ProviderResult<Kube> {
        if let Some(client) = self.kube.read().await.get(&zone.name) {
            return Ok(client.clone());
        }

        let mut clients = self.kube.write().await;
        if let Some(client) = clients.get(&zone.name) {
            return Ok(client.clone());
        }
        let client = self.factory.kube(zone)?;
        clients.insert(zone.name.clone(), client.clone());
        info!(zone = %zone.name, "Kubernetes client initialised");
        Ok(client)
    }

    /// CloudStack client for `zone`.
    pub async fn cloudstack(&self, zone: &Zone) -> ProviderResult<CloudStack> {
        if let Some(client) = self.cloudstack.read().await.get(&zone.name) {
            return Ok(client.clone());
        }

        let mut clients = self.cloudstack.write().await;
        if let Some(client) = clients.get(&zone.name) {
            return Ok(client.clone());
        }
        let client = self.factory.cloudstack(zone)?;
        clients.insert(zone.name.clone(), client.clone());
        info!(zone = %zone.name, "CloudStack client initialised");
        Ok(client)
    }

    /// Registry client.
    pub fn harbor(&self) -> ProviderResult<Harbor> {
        self.factory.harbor()
    }

    /// GitHub client for a user token.
    pub fn github(&self, token: &str) -> ProviderResult<Github> {
        self.factory.github(token)
    }

    /// Drop every cached client.
    pub async fn teardown(&self) {
        let kube = {
            let mut clients = self.kube.write().await;
            std::mem::take(&mut *clients).len()
        };
        let cloudstack = {
            let mut clients = self.cloudstack.write().await;
            std::mem::take(&mut *clients).len()
        };
        info!(kube, cloudstack, "Zone clients released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;
    use crate::providers::memory::MemoryProviders;
    use crate::zones::ZoneRegistry;

    #[tokio::test]
    async fn test_clients_cached_per_zone() {
        let config = PlatformConfig::from_toml_str(
            r#"
external_url = "https://deploy.example"

[[zones]]
name = "z1"
capabilities = ["deployment"]
"#,
        )
        .unwrap();
        let zones = ZoneRegistry::from_config(config.zones).unwrap();
        let zone = zones.get("z1").unwrap();

        let clients = ZoneClients::new(Arc::new(MemoryProviders::new()));
        let a = clients.kube(zone).await.unwrap();
        let b = clients.kube(zone).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        clients.teardown().await;
        assert!(clients.kube.read().await.is_empty());
    }
}
