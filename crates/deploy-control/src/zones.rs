// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Static zone registry.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{
    Capability, CloudStackIds, ConfigError, KubernetesCredentials, PortRange, StorageConfig,
    ZoneConfig,
};
use crate::error::{Error, Result};

/// A zone with its resolved capabilities.
#[derive(Debug, Clone)]
pub struct Zone {
    /// Zone name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// What the zone hosts.
    pub capabilities: Vec<Capability>,
    /// Parent domain for deployment hostnames.
    pub parent_domain: String,
    /// Parent domain for VM HTTP proxies.
    pub vm_app_domain: String,
    /// Public hostname of the VM gateway.
    pub vm_parent_domain: String,
    /// Parent domain for storage managers.
    pub storage_domain: String,
    /// Ingress class.
    pub ingress_class: String,
    /// Cert-manager issuer for custom domains.
    pub cluster_issuer: String,
    /// NFS storage.
    pub storage: Option<StorageConfig>,
    /// Kubernetes credentials.
    pub kubernetes: Option<KubernetesCredentials>,
    /// CloudStack identifiers.
    pub cloudstack: Option<CloudStackIds>,
    /// VM port forwarding range.
    pub port_range: Option<PortRange>,
}

impl Zone {
    fn from_config(config: ZoneConfig) -> std::result::Result<Self, ConfigError> {
        let capabilities = if !config.capabilities.is_empty() {
            config.capabilities
        } else {
            match config.legacy_type.as_deref() {
                Some("deployment") => vec![Capability::Deployment],
                Some("vm") => vec![Capability::Vm],
                Some(other) => {
                    return Err(ConfigError::Invalid(format!(
                        "zone {} has unknown type {other}",
                        config.name
                    )));
                }
                None => Vec::new(),
            }
        };

        Ok(Self {
            name: config.name,
            description: config.description,
            capabilities,
            parent_domain: config.parent_domain,
            vm_app_domain: config.vm_app_domain,
            vm_parent_domain: config.vm_parent_domain,
            storage_domain: config.storage_domain,
            ingress_class: config.ingress_class,
            cluster_issuer: config.cluster_issuer,
            storage: config.storage,
            kubernetes: config.kubernetes,
            cloudstack: config.cloudstack,
            port_range: config.port_range,
        })
    }

    /// Whether the zone hosts `capability`.
    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Public hostname of a deployment.
    pub fn deployment_host(&self, deployment_name: &str) -> String {
        format!("{deployment_name}.{}", self.parent_domain)
    }

    /// Public hostname of a VM HTTP proxy.
    pub fn vm_proxy_host(&self, proxy_name: &str) -> String {
        format!("{proxy_name}.{}", self.vm_app_domain)
    }

    /// Public hostname of a user's storage manager.
    pub fn storage_host(&self, user_id: &str) -> String {
        format!("{user_id}.{}", self.storage_domain)
    }

    /// Public summary.
    pub fn info(&self) -> ZoneInfo {
        ZoneInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            capabilities: self
                .capabilities
                .iter()
                .map(|c| match c {
                    Capability::Deployment => "deployment",
                    Capability::Vm => "vm",
                })
                .collect(),
            domain: self.parent_domain.clone(),
        }
    }
}

/// Zone summary returned by `GET /v1/zones`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneInfo {
    /// Zone name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Capability names.
    pub capabilities: Vec<&'static str>,
    /// Deployment parent domain.
    pub domain: String,
}

/// Immutable set of configured zones.
#[derive(Debug, Clone, Default)]
pub struct ZoneRegistry {
    zones: BTreeMap<String, Zone>,
}

impl ZoneRegistry {
    /// Build the registry from the platform file entries.
    pub fn from_config(zones: Vec<ZoneConfig>) -> std::result::Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for zone in zones {
            let zone = Zone::from_config(zone)?;
            map.insert(zone.name.clone(), zone);
        }
        Ok(Self { zones: map })
    }

    /// Look up a zone by name.
    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.zones.get(name)
    }

    /// Look up a zone that hosts `capability`.
    pub fn require(&self, name: &str, capability: Capability) -> Result<&Zone> {
        let zone = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("zone {name}")))?;
        if !zone.has(capability) {
            return Err(Error::Validation(format!(
                "zone {name} does not host {}",
                match capability {
                    Capability::Deployment => "deployments",
                    Capability::Vm => "vms",
                }
            )));
        }
        Ok(zone)
    }

    /// All zones, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    /// First zone hosting `capability`, used when a request omits the zone.
    pub fn default_for(&self, capability: Capability) -> Option<&Zone> {
        self.iter().find(|z| z.has(capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;

    fn registry() -> ZoneRegistry {
        let config = PlatformConfig::from_toml_str(
            r#"
external_url = "https://deploy.example"

[[zones]]
name = "a"
capabilities = ["vm"]
type = "deployment"

[[zones]]
name = "b"
type = "deployment"
parent_domain = "b.example"
"#,
        )
        .unwrap();
        ZoneRegistry::from_config(config.zones).unwrap()
    }

    #[test]
    fn test_capabilities_win_over_legacy_type() {
        let zones = registry();
        let a = zones.get("a").unwrap();
        assert!(a.has(Capability::Vm));
        assert!(!a.has(Capability::Deployment));

        let b = zones.get("b").unwrap();
        assert!(b.has(Capability::Deployment));
    }

    #[test]
    fn test_require_checks_capability() {
        let zones = registry();
        assert!(zones.require("b", Capability::Deployment).is_ok());
        assert!(matches!(
            zones.require("a", Capability::Deployment),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            zones.require("nope", Capability::Vm),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_hostnames() {
        let zones = registry();
        let b = zones.get("b").unwrap();
        assert_eq!(b.deployment_host("a1"), "a1.b.example");
        assert_eq!(
            zones.default_for(Capability::Deployment).map(|z| z.name.as_str()),
            Some("b")
        );
    }
}
