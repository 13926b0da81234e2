// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for deploy-control integration tests.
//!
//! Provides [`TestContext`]: a platform over an in-memory database and
//! in-memory providers, its router and a job executor.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use deploy_control::config::PlatformConfig;
use deploy_control::jobs::JobExecutor;
use deploy_control::platform::Platform;
use deploy_control::providers::memory::MemoryProviders;
use deploy_core::persistence::{Persistence, SqlitePersistence};

pub const PLATFORM: &str = r#"
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

/// A platform with its router and executor.
pub struct TestContext {
    pub platform: Arc<Platform>,
    pub providers: Arc<MemoryProviders>,
    pub executor: JobExecutor,
    router: Router,
}

impl TestContext {
    pub async fn new() -> Self {
        let config = PlatformConfig::from_toml_str(PLATFORM).expect("Invalid test platform");
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to create in-memory SQLite store"),
        );
        let providers = Arc::new(MemoryProviders::new());
        let platform = Arc::new(
            Platform::new(config, persistence, providers.clone())
                .expect("Failed to build platform"),
        );
        Self {
            executor: JobExecutor::new(platform.clone(), Default::default()),
            router: deploy_control::http::router(platform.clone()),
            platform,
            providers,
        }
    }

    /// Send a request as the user owning `key`.
    pub async fn call(
        &self,
        method: &str,
        uri: &str,
        key: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {key}"));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("Invalid request");
        self.send(request).await
    }

    /// Send a prepared request.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("Body is not JSON")
        };
        (status, body)
    }

    /// Run queued jobs until none is runnable.
    pub async fn run_jobs(&self) -> usize {
        self.executor
            .run_until_idle()
            .await
            .expect("Failed to run jobs")
    }

    /// Mutating provider calls so far.
    pub fn provider_calls(&self) -> usize {
        self.providers.total_mutations()
    }
}
