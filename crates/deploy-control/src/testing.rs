// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fixtures shared by the unit tests.

use std::sync::Arc;

use deploy_core::model::vm::VmSpecs;
use deploy_core::model::{App, Deployment, DeploymentSpec, DeploymentType, Vm, VmPort, VmSpec};
use deploy_core::persistence::{Persistence, SqlitePersistence};

use crate::config::PlatformConfig;
use crate::platform::Platform;
use crate::providers::memory::MemoryProviders;
use crate::services::{Context, Principal};

pub(crate) const PLATFORM: &str = r#"
external_url = "https://deploy.example"
session_secret = "session"

[[zones]]
name = "z1"
capabilities = ["deployment"]
parent_domain = "z1.example"
storage_domain = "storage.z1.example"

[zones.storage]
nfs_server = "10.0.0.5"
nfs_parent_path = "/srv/nfs"

[[zones]]
name = "vz"
capabilities = ["vm"]
vm_app_domain = "app.vz.example"
vm_parent_domain = "vm.vz.example"

[zones.cloudstack]
zone_id = "cs-zone"
template_id = "tpl"
network_id = "net"
ip_address_id = "ip"

[zones.port_range]
start = 20000
end = 20010

[registry]
webhook_token = "hook-token"

[[roles]]
name = "default"
permissions = ["useGpus", "useCustomDomains"]

[roles.quotas]
deployments = 5
cpu_cores = 16
ram = 64
disk_size = 200
snapshots = 2
gpu_lease_duration = 24.0

[[users]]
id = "u-1"
api_key = "key-1"
roles = ["default"]

[[users]]
id = "u-2"
api_key = "key-2"
roles = ["default"]

[[users]]
id = "admin"
api_key = "key-admin"
admin = true
"#;

/// Platform over an in-memory database and in-memory providers.
pub(crate) async fn platform() -> (Arc<Platform>, Arc<MemoryProviders>) {
    let config = PlatformConfig::from_toml_str(PLATFORM).unwrap();
    let persistence: Arc<dyn Persistence> =
        Arc::new(SqlitePersistence::in_memory().await.unwrap());
    let providers = Arc::new(MemoryProviders::new());
    let platform = Platform::new(config, persistence, providers.clone()).unwrap();
    (Arc::new(platform), providers)
}

/// Request context of configured user `user_id`.
pub(crate) fn context(platform: &Arc<Platform>, user_id: &str) -> Context {
    let user = platform.user(user_id).unwrap();
    let principal = Principal::from_user(user, &platform.config.roles);
    Context::new(platform.clone(), principal)
}

/// A ready deployment document.
pub(crate) fn deployment(id: &str, name: &str, owner: &str) -> Deployment {
    let mut d = Deployment::new(
        id,
        name,
        owner,
        "z1",
        DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx", 80)),
    );
    d.activities.clear();
    d
}

/// A ready VM document with one SSH port.
pub(crate) fn vm(id: &str, name: &str, owner: &str) -> Vm {
    let spec = VmSpec {
        ssh_public_key: "ssh-ed25519 AAAA test".to_string(),
        specs: VmSpecs {
            cpu_cores: 2,
            ram: 4,
            disk_size: 20,
        },
        ports: vec![VmPort {
            name: "ssh".to_string(),
            port: 22,
            protocol: "tcp".to_string(),
            public_port: 0,
            http_proxy: None,
        }],
        host: None,
        gpu: None,
    };
    let mut vm = Vm::new(id, name, owner, "vz", spec);
    vm.activities.clear();
    vm
}
