// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! deploy-control - multi-tenant deployment and VM control plane
//!
//! Users declare deployments, VMs and storage managers; this crate turns the
//! declarations into Kubernetes, CloudStack, Harbor and GitHub objects and
//! keeps them converged.
//!
//! # Architecture
//!
//! ```text
//!   HTTP (axum) ──► services ──► ResourceStore (deploy-core)
//!                      │                 ▲
//!                      ▼                 │ subsystem writes
//!                  JobQueue ──► JobExecutor ──► reconcile ──► providers
//!                                                  ▲
//!   workers (confirmer, repairer, pinger, ...) ────┘
//! ```
//!
//! A command validates the request, sets an activity on the resource and
//! queues a job; the job handler computes the desired provider objects with
//! [`generators`] and drives them with [`reconcile`], persisting each
//! observed object as soon as the provider accepts it.
//!
//! # Roles
//!
//! | Flag | Role |
//! |------|------|
//! | `--api` | HTTP command API |
//! | `--job-executor` | Runs queued jobs |
//! | `--confirmer` | Clears `beingCreated` / `beingDeleted` once observed |
//! | `--status-updater` | Pulls workload status from the providers |
//! | `--repairer` | Queues repairs for quiescent resources |
//! | `--pinger` | HTTP-checks public deployments |
//! | `--snapshotter` | Takes scheduled VM snapshots |
//! | `--gpu-lease-enforcer` | Detaches GPUs whose lease ran out |

#![deny(missing_docs)]

/// Platform reads and inbound webhooks.
pub mod api;

/// Process and platform configuration.
pub mod config;

/// Error type of the command layer.
pub mod error;

/// Desired provider objects computed from resource documents.
pub mod generators;

/// axum router over the command layer.
pub mod http;

/// Job sum type, queue, handlers and executor.
pub mod jobs;

/// Shared platform state.
pub mod platform;

/// Provider traits, REST clients and in-memory clients.
pub mod providers;

/// Create/update/delete primitives and per-resource reconcilers.
pub mod reconcile;

/// Embeddable runtime wiring the server and workers.
pub mod runtime;

/// Commands on deployments, VMs, storage managers, GPUs and migrations.
pub mod services;

/// Periodic background workers.
pub mod workers;

/// Configured zones and their capabilities.
pub mod zones;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use platform::Platform;
