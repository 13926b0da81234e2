// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! deploy-control - multi-tenant deployment and VM control plane
//!
//! One binary runs any subset of the roles:
//! - HTTP command API (`--api`)
//! - Job executor and the periodic workers (`--job-executor`, `--confirmer`, ...)
//!
//! With no role flag every role runs in this process.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use deploy_control::config::{Config, WorkerFlags};
use deploy_control::runtime::{ControlPlaneRuntime, ShutdownTimeout};

#[derive(Debug, Parser)]
#[command(name = "deploy-control", version, about)]
struct Cli {
    #[command(flatten)]
    flags: WorkerFlags,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_control=info,deploy_core=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration error");
            return ExitCode::from(1);
        }
    };

    info!(
        http_addr = %config.http_addr,
        config_file = %config.config_file.display(),
        "Starting deploy-control"
    );

    let runtime = match ControlPlaneRuntime::builder()
        .config(config)
        .flags(cli.flags)
        .start()
        .await
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = format!("{e:#}"), "Failed to start");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");

    match runtime.shutdown().await {
        Ok(()) => {
            info!("deploy-control shut down");
            ExitCode::SUCCESS
        }
        Err(e) if e.downcast_ref::<ShutdownTimeout>().is_some() => {
            error!(error = %e, "Shutdown timed out");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = format!("{e:#}"), "Shutdown failed");
            ExitCode::from(1)
        }
    }
}
