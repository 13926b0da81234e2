// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy Core - resource documents and the durable job queue
//!
//! This crate owns everything the control plane persists:
//!
//! - Resource documents (deployments, VMs, storage managers) with their
//!   declared spec, the observed state of every provider subsystem and the
//!   set of in-progress activities.
//! - The job queue that serialises every state-changing operation.
//! - GPU inventory and leases, resource migrations and notifications.
//!
//! Reconciliation logic lives in `deploy-control`; this crate only guarantees
//! that each write is a single-row atomic update.
//!
//! # Activity state machine
//!
//! ```text
//!   nonexistent ──► beingCreated ──► ready ◄──► updating | restarting | repairing
//!                                      │          building | attachingGpu | detachingGpu
//!                                      ▼
//!                                beingDeleted ──► deleted
//! ```
//!
//! Activities are added with a conditional update (see
//! [`persistence::Persistence::add_activity`]) so two competing operations can
//! never both start.
//!
//! # Backends
//!
//! | Backend | Type | Use |
//! |---------|------|-----|
//! | PostgreSQL | [`persistence::PostgresPersistence`] | production |
//! | SQLite | [`persistence::SqlitePersistence`] | embedded / tests |

#![deny(missing_docs)]

/// Activity variants and their guard table.
pub mod activity;

/// Error types for store operations.
pub mod error;

/// Embedded database migrations.
pub mod migrations;

/// Persisted document and record types.
pub mod model;

/// Persistence trait, backends and the typed resource store.
pub mod persistence;

pub use activity::{Activity, ActivityOutcome};
pub use error::StoreError;
