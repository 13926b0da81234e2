// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for deploy-control.

use deploy_core::{Activity, StoreError};
use thiserror::Error;

use crate::providers::ProviderError;

/// Control plane errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Resource, subsystem object or user not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Name taken or object already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A custom domain is routed by another resource.
    #[error("Custom domain {0} is already in use")]
    CustomDomainInUse(String),

    /// An activity on the resource blocks the operation.
    #[error("Resource is busy: blocked by activity {0}")]
    ActivityBlocked(Activity),

    /// A quota would be exceeded.
    #[error("Quota exceeded: {quota} (current {current}, requested {requested}, limit {limit})")]
    QuotaExceeded {
        /// Quota name.
        quota: &'static str,
        /// Current usage.
        current: u64,
        /// Additional amount requested.
        requested: u64,
        /// Configured limit.
        limit: u64,
    },

    /// The caller lacks a permission.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The request is malformed.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A provider is temporarily unavailable.
    #[error("Provider unavailable: {0}")]
    ProviderTransient(String),

    /// A provider rejected the request.
    #[error("Provider error: {0}")]
    ProviderPermanent(String),

    /// The VM does not fit on the selected host.
    #[error(
        "VM too large for host {host}: {available_cpu_cores} CPU cores and {available_ram} GB RAM available"
    )]
    VmTooLarge {
        /// Checked host.
        host: String,
        /// Free cores.
        available_cpu_cores: u32,
        /// Free RAM in GB.
        available_ram: u32,
    },

    /// Persistence failed.
    #[error("Store error: {0}")]
    Store(StoreError),

    /// Invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for the error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::VmTooLarge { .. } => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) | Self::QuotaExceeded { .. } => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::CustomDomainInUse(_) => 409,
            Self::ActivityBlocked(_) => 423,
            Self::ProviderTransient(_) => 503,
            Self::Store(StoreError::Unavailable(_)) => 503,
            Self::Config(_)
            | Self::ProviderPermanent(_)
            | Self::Store(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::CustomDomainInUse(_) => "custom_domain_in_use",
            Self::ActivityBlocked(_) => "activity_blocked",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::Forbidden(_) => "forbidden",
            Self::Unauthorized(_) => "unauthorized",
            Self::Validation(_) => "validation_error",
            Self::ProviderTransient(_) => "provider_unavailable",
            Self::ProviderPermanent(_) => "provider_error",
            Self::VmTooLarge { .. } => "vm_too_large",
            Self::Store(StoreError::Unavailable(_)) => "store_unavailable",
            Self::Store(_) => "store_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the error text may be shown to callers.
    pub fn is_public(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => Self::NotFound(format!("{kind} {id}")),
            StoreError::NameTaken(name) => Self::Conflict(format!("name {name} is already taken")),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Store(other),
        }
    }
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => Self::ProviderTransient(msg),
            ProviderError::NotFound { kind, name } => Self::NotFound(format!("{kind} {name}")),
            ProviderError::IngressHostInUse(host) => Self::CustomDomainInUse(host),
            ProviderError::VmTooLarge {
                host,
                available_cpu_cores,
                available_ram,
            } => Self::VmTooLarge {
                host,
                available_cpu_cores,
                available_ram,
            },
            other => Self::ProviderPermanent(other.to_string()),
        }
    }
}

/// Result type using the control plane [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::Validation("x".into()).status_code(), 400);
        assert_eq!(Error::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(Error::Forbidden("x".into()).status_code(), 403);
        assert_eq!(
            Error::QuotaExceeded {
                quota: "deployments",
                current: 5,
                requested: 1,
                limit: 5
            }
            .status_code(),
            403
        );
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::Conflict("x".into()).status_code(), 409);
        assert_eq!(
            Error::ActivityBlocked(Activity::BeingDeleted).status_code(),
            423
        );
        assert_eq!(Error::Internal("x".into()).status_code(), 500);
        assert_eq!(Error::ProviderTransient("x".into()).status_code(), 503);
    }

    #[test]
    fn test_activity_blocked_names_activity() {
        let err = Error::ActivityBlocked(Activity::BeingDeleted);
        assert!(err.to_string().contains("beingDeleted"));
    }

    #[test]
    fn test_store_errors_map_to_kinds() {
        let err: Error = StoreError::NameTaken("a1".into()).into();
        assert_eq!(err.status_code(), 409);

        let err: Error = StoreError::not_found("deployment", "d-1").into();
        assert_eq!(err.error_code(), "not_found");
    }

    #[test]
    fn test_provider_errors_map_to_kinds() {
        let err: Error = ProviderError::IngressHostInUse("foo.example".into()).into();
        assert_eq!(err.error_code(), "custom_domain_in_use");

        let err: Error = ProviderError::Transient("timeout".into()).into();
        assert_eq!(err.status_code(), 503);
    }
}
