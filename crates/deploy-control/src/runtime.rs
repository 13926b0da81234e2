// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for deploy-control.
//!
//! [`ControlPlaneRuntime`] wires the platform state, the HTTP server and the
//! background workers enabled by [`WorkerFlags`]. The binary is a thin
//! wrapper around it.
//!
//! ```rust,ignore
//! use deploy_control::config::{Config, WorkerFlags};
//! use deploy_control::runtime::ControlPlaneRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let runtime = ControlPlaneRuntime::builder()
//!         .config(config)
//!         .flags(WorkerFlags::all())
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use deploy_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};

use crate::config::{Config, PlatformConfig, WorkerFlags};
use crate::jobs::{JobExecutor, JobExecutorConfig};
use crate::platform::Platform;
use crate::providers::ProviderFactory;
use crate::providers::http::HttpProviders;
use crate::workers::{
    Confirmer, GpuLeaseEnforcer, HttpProbe, Pinger, Probe, Repairer, Snapshotter, StatusUpdater,
    Worker, WorkerLoop,
};

/// Postgres pool size.
const MAX_CONNECTIONS: u32 = 10;

/// Default time allowed for workers and the HTTP server to drain.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown did not complete in time.
#[derive(Debug, thiserror::Error)]
#[error("shutdown did not complete within {0:?}")]
pub struct ShutdownTimeout(pub Duration);

/// Open the database named by `url` and apply migrations.
///
/// `postgres://` and `postgresql://` select Postgres; `sqlite:` selects a
/// SQLite file, and `sqlite::memory:` a private in-memory database.
pub async fn connect_persistence(url: &str) -> Result<Arc<dyn Persistence>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let persistence = PostgresPersistence::connect(url, MAX_CONNECTIONS)
            .await
            .context("failed to connect to Postgres")?;
        info!("Connected to Postgres");
        return Ok(Arc::new(persistence));
    }

    let Some(rest) = url.strip_prefix("sqlite:") else {
        anyhow::bail!("unsupported database URL scheme (expected postgres:// or sqlite:)");
    };
    if rest == ":memory:" {
        return Ok(Arc::new(SqlitePersistence::in_memory().await?));
    }
    let path = rest.trim_start_matches("//");
    let path = path.split_once('?').map_or(path, |(path, _)| path);
    let persistence = SqlitePersistence::from_path(path)
        .await
        .with_context(|| format!("failed to open SQLite database {path}"))?;
    info!(path, "Opened SQLite database");
    Ok(Arc::new(persistence))
}

/// Builder for a [`ControlPlaneRuntime`].
#[derive(Default)]
pub struct ControlPlaneRuntimeBuilder {
    config: Option<Config>,
    flags: WorkerFlags,
    platform_config: Option<PlatformConfig>,
    persistence: Option<Arc<dyn Persistence>>,
    providers: Option<Arc<dyn ProviderFactory>>,
    probe: Option<Arc<dyn Probe>>,
    shutdown_timeout: Option<Duration>,
}

impl ControlPlaneRuntimeBuilder {
    /// Process configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Roles to run. Resolved with [`WorkerFlags::resolve`].
    pub fn flags(mut self, flags: WorkerFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Use this platform description instead of reading
    /// [`Config::config_file`].
    pub fn platform_config(mut self, platform_config: PlatformConfig) -> Self {
        self.platform_config = Some(platform_config);
        self
    }

    /// Use this persistence instead of connecting to
    /// [`Config::database_url`].
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Provider clients. Default: REST clients built from the platform file.
    pub fn providers(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Probe used by the pinger. Default: [`HttpProbe`].
    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Time allowed for shutdown.
    ///
    /// Default: 30 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    /// Build the platform and start the enabled roles.
    pub async fn start(self) -> Result<ControlPlaneRuntime> {
        let mut config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let flags = self.flags.resolve();
        config.test_mode |= flags.test_mode;

        let platform_config = match self.platform_config {
            Some(platform_config) => platform_config,
            None => PlatformConfig::load(&config.config_file)?,
        };
        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => connect_persistence(&config.effective_database_url()).await?,
        };
        let providers: Arc<dyn ProviderFactory> = match self.providers {
            Some(providers) => providers,
            None => Arc::new(HttpProviders::new(&platform_config)?),
        };
        let platform = Arc::new(Platform::new(platform_config, persistence, providers)?);
        info!(
            zones = platform.zones.iter().count(),
            version = %platform.version,
            test_mode = config.test_mode,
            "Platform loaded"
        );

        let mut tasks = Vec::new();

        if flags.job_executor {
            let executor = JobExecutor::new(
                platform.clone(),
                JobExecutorConfig::from(&platform.config.workers),
            );
            let shutdown = executor.shutdown_handle();
            let handle = tokio::spawn(async move { executor.run().await });
            tasks.push(Task::new("Job executor", shutdown, handle));
        }
        if flags.confirmer {
            tasks.push(spawn_worker(Confirmer::new(platform.clone())));
        }
        if flags.status_updater {
            tasks.push(spawn_worker(StatusUpdater::new(platform.clone())));
        }
        if flags.repairer {
            tasks.push(spawn_worker(Repairer::new(platform.clone())));
        }
        if flags.pinger {
            let probe: Arc<dyn Probe> = match self.probe {
                Some(probe) => probe,
                None => Arc::new(HttpProbe::new()?),
            };
            tasks.push(spawn_worker(Pinger::new(platform.clone(), probe)));
        }
        if flags.snapshotter {
            tasks.push(spawn_worker(Snapshotter::new(platform.clone())));
        }
        if flags.gpu_lease_enforcer {
            tasks.push(spawn_worker(GpuLeaseEnforcer::new(platform.clone())));
        }

        let mut http_addr = None;
        let mut server = None;
        if flags.api {
            let listener = TcpListener::bind(config.http_addr)
                .await
                .with_context(|| format!("failed to bind {}", config.http_addr))?;
            http_addr = Some(listener.local_addr()?);
            let shutdown = Arc::new(Notify::new());
            let signal = shutdown.clone();
            let router = crate::http::router(platform.clone());
            let handle = tokio::spawn(crate::http::serve(listener, router, async move {
                signal.notified().await;
            }));
            server = Some((shutdown, handle));
        }

        info!(
            http_addr = ?http_addr,
            workers = tasks.len(),
            "Control plane runtime started"
        );

        Ok(ControlPlaneRuntime {
            platform,
            tasks,
            server,
            http_addr,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT),
        })
    }
}

/// A spawned background loop and its stop signal.
struct Task {
    name: &'static str,
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl Task {
    fn new(name: &'static str, shutdown: Arc<Notify>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            handle,
        }
    }
}

fn spawn_worker<W: Worker>(worker: W) -> Task {
    let name = worker.name();
    let worker = WorkerLoop::new(worker);
    let shutdown = worker.shutdown_handle();
    let handle = tokio::spawn(async move { worker.run().await });
    Task::new(name, shutdown, handle)
}

/// A running control plane.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ControlPlaneRuntime {
    platform: Arc<Platform>,
    tasks: Vec<Task>,
    server: Option<(Arc<Notify>, JoinHandle<std::io::Result<()>>)>,
    http_addr: Option<SocketAddr>,
    shutdown_timeout: Duration,
}

impl ControlPlaneRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ControlPlaneRuntimeBuilder {
        ControlPlaneRuntimeBuilder::default()
    }

    /// Shared platform state.
    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Address the HTTP server is bound to, when the API role runs.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Check if every started task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|t| !t.handle.is_finished())
            && self.server.as_ref().is_none_or(|(_, h)| !h.is_finished())
    }

    /// Stop the HTTP server and every worker, then release zone clients.
    ///
    /// Returns [`ShutdownTimeout`] when draining takes longer than the
    /// configured timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!("Control plane runtime shutting down");
        let Self {
            platform,
            tasks,
            server,
            shutdown_timeout: timeout,
            ..
        } = self;

        if let Some((shutdown, _)) = &server {
            shutdown.notify_one();
        }
        for task in &tasks {
            task.shutdown.notify_one();
        }

        let drained = tokio::time::timeout(timeout, async {
            let mut result = Ok(());
            if let Some((_, handle)) = server {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "HTTP server error during shutdown");
                        result = Err(anyhow::Error::from(e));
                    }
                    Err(e) => {
                        error!(error = %e, "HTTP server task panicked");
                        result = Err(anyhow::anyhow!("HTTP server task panicked: {e}"));
                    }
                }
            }
            for task in tasks {
                if let Err(e) = task.handle.await {
                    error!(worker = task.name, error = %e, "Worker task panicked");
                }
            }
            result
        })
        .await;

        platform.clients.teardown().await;

        match drained {
            Ok(result) => {
                info!("Control plane runtime shutdown complete");
                result
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Shutdown timed out");
                Err(ShutdownTimeout(timeout).into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use crate::providers::memory::MemoryProviders;
    use crate::testing;

    fn config() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            config_file: PathBuf::from("unused.toml"),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            test_mode: false,
        }
    }

    #[tokio::test]
    async fn test_sqlite_urls_are_accepted() {
        assert!(connect_persistence("sqlite::memory:").await.is_ok());

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("deploy.db").display());
        assert!(connect_persistence(&url).await.is_ok());
        assert!(dir.path().join("deploy.db").exists());

        assert!(connect_persistence("mysql://localhost/deploy").await.is_err());
    }

    #[tokio::test]
    async fn test_runtime_serves_api_and_shuts_down() {
        let runtime = ControlPlaneRuntime::builder()
            .config(config())
            .flags(WorkerFlags {
                api: true,
                job_executor: true,
                confirmer: true,
                ..Default::default()
            })
            .platform_config(PlatformConfig::from_toml_str(testing::PLATFORM).unwrap())
            .providers(Arc::new(MemoryProviders::new()))
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());

        let addr = runtime.http_addr().unwrap();
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/v1/status"))
            .bearer_auth("key-1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_config_is_rejected() {
        let result = ControlPlaneRuntime::builder().start().await;
        assert!(result.is_err());
    }
}
