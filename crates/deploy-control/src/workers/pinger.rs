// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP health pings of public deployments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use deploy_core::model::Deployment;
use deploy_core::model::deployment::MAIN_APP;
use deploy_core::persistence::UpdateParams;

use super::Worker;
use crate::error::Result;
use crate::generators::naming;
use crate::platform::Platform;

/// Per-request timeout of [`HttpProbe`].
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Issues one GET and reports the status code.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Status code of `GET url`; `None` when no response arrived.
    async fn get(&self, url: &str) -> Option<u16>;
}

/// [`Probe`] over a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Build a probe with a 10 second timeout that does not follow
    /// redirects.
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn get(&self, url: &str) -> Option<u16> {
        match self.client.get(url).send().await {
            Ok(response) => Some(response.status().as_u16()),
            Err(e) => {
                debug!(url, error = %e, "Ping failed");
                None
            }
        }
    }
}

/// Records the HTTP status of each public deployment's ping path.
pub struct Pinger {
    platform: Arc<Platform>,
    probe: Arc<dyn Probe>,
    interval: Duration,
}

impl Pinger {
    /// Create a pinger using `probe`.
    pub fn new(platform: Arc<Platform>, probe: Arc<dyn Probe>) -> Self {
        let interval = platform.config.workers.ping();
        Self {
            platform,
            probe,
            interval,
        }
    }

    fn url(&self, d: &Deployment) -> Option<String> {
        let app = d.main_app().filter(|app| !app.private)?;
        let zone = self.platform.zones.get(&d.zone)?;
        let path = naming::join_path(&[&app.ping_path]);
        Some(format!("https://{}{}", zone.deployment_host(&d.name), path))
    }

    async fn ping(&self, d: &Deployment) -> Result<bool> {
        let Some(url) = self.url(d) else {
            return Ok(false);
        };
        let result = self.probe.get(&url).await;
        let previous = d.main_app().and_then(|app| app.ping_result);
        if result == previous {
            return Ok(false);
        }
        let path = format!("apps.{MAIN_APP}.pingResult");
        let params = UpdateParams::default().with_spec(&path, &result)?;
        self.platform
            .deployments
            .update_with_params(&d.id, &params)
            .await?;
        debug!(deployment_id = %d.id, %url, status = ?result, "Ping result changed");
        Ok(true)
    }
}

#[async_trait]
impl Worker for Pinger {
    fn name(&self) -> &'static str {
        "Pinger"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> Result<bool> {
        let mut changed = 0;
        for d in self.platform.deployments.list(&Default::default(), None).await? {
            if d.is_being_deleted() {
                continue;
            }
            if self.ping(&d).await? {
                changed += 1;
            }
        }
        if changed > 0 {
            info!(changed, "Ping results updated");
        }
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::testing;

    #[derive(Default)]
    struct FakeProbe {
        statuses: Mutex<HashMap<String, u16>>,
        requested: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Probe for FakeProbe {
        async fn get(&self, url: &str) -> Option<u16> {
            self.requested.lock().unwrap().push(url.to_string());
            self.statuses.lock().unwrap().get(url).copied()
        }
    }

    #[tokio::test]
    async fn test_ping_result_recorded() {
        let (platform, _) = testing::platform().await;
        let mut d = testing::deployment("d-1", "a1", "u-1");
        d.spec.apps.get_mut(MAIN_APP).unwrap().ping_path = "/health".to_string();
        platform.deployments.create(&d).await.unwrap();
        let mut private = testing::deployment("d-2", "a2", "u-1");
        private.spec.apps.get_mut(MAIN_APP).unwrap().private = true;
        platform.deployments.create(&private).await.unwrap();

        let probe = Arc::new(FakeProbe::default());
        probe
            .statuses
            .lock()
            .unwrap()
            .insert("https://a1.z1.example/health".to_string(), 200);
        let pinger = Pinger::new(platform.clone(), probe.clone());

        assert!(pinger.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.main_app().unwrap().ping_result, Some(200));
        assert!(d.updated_at.is_none());
        assert_eq!(
            *probe.requested.lock().unwrap(),
            vec!["https://a1.z1.example/health".to_string()]
        );

        assert!(!pinger.run_once().await.unwrap());
        probe.statuses.lock().unwrap().clear();
        assert!(pinger.run_once().await.unwrap());
        let d = platform.deployments.get("d-1").await.unwrap();
        assert_eq!(d.main_app().unwrap().ping_result, None);
    }
}
