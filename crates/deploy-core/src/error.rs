// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for deploy-core.

use thiserror::Error;

/// Errors returned by the persistence layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested record does not exist (or is soft-deleted).
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Record kind (deployment, vm, job, ...).
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A non-deleted resource with the same name already exists.
    #[error("name '{0}' is already taken")]
    NameTaken(String),

    /// A uniqueness or compare-and-set condition failed.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The database could not be reached or returned an error.
    #[error("store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// A stored document could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Creating the database directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Applying migrations failed.
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored value does not match any known variant.
    #[error("invalid stored value for {field}: {value}")]
    InvalidValue {
        /// Column or field holding the value.
        field: &'static str,
        /// The offending value.
        value: String,
    },
}

impl StoreError {
    /// Build a [`StoreError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether this error is a unique-constraint violation reported by the database.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
