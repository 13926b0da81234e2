// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for deploy-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use deploy_core::model::{App, Deployment, DeploymentSpec, DeploymentType};
use deploy_core::persistence::{Persistence, ResourceStore, SqlitePersistence};

/// A file-backed store, so several pool connections race for real.
pub struct TestStore {
    pub persistence: Arc<dyn Persistence>,
    pub deployments: ResourceStore<DeploymentSpec>,
    _dir: tempfile::TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = SqlitePersistence::from_path(dir.path().join("deploy.db"))
            .await
            .expect("Failed to open SQLite store");
        let persistence: Arc<dyn Persistence> = Arc::new(store);
        Self {
            deployments: ResourceStore::new(persistence.clone()),
            persistence,
            _dir: dir,
        }
    }

    /// Insert a ready deployment.
    pub async fn deployment(&self, id: &str, name: &str) -> Deployment {
        let mut d = Deployment::new(
            id,
            name,
            "user-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx", 80)),
        );
        d.activities.clear();
        self.deployments
            .create(&d)
            .await
            .expect("Failed to insert deployment");
        d
    }
}
