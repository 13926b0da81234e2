// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observed provider objects recorded under `subsystems.*`.
//!
//! Every object stored in a resource document either carries a non-empty
//! provider-side ID or is a placeholder, meaning "intentionally not created in
//! this provider". Absence of the key means "not created yet".

use chrono::{DateTime, Utc};

pub mod cs;
pub mod github;
pub mod gitlab;
pub mod harbor;
pub mod k8s;

/// Common accessors over observed provider objects.
pub trait SubsystemObject {
    /// Provider-assigned identifier; empty when the provider has not assigned one.
    fn provider_id(&self) -> &str;

    /// Join key between desired and observed state.
    fn object_name(&self) -> &str;

    /// Provider-assigned creation time.
    fn created_at(&self) -> Option<DateTime<Utc>>;

    /// Copy the provider-assigned fields from an observed object.
    fn preserve_from(&mut self, observed: &Self);

    /// Whether this is a placeholder marker.
    fn is_placeholder(&self) -> bool {
        false
    }

    /// Whether the object exists in the provider (or is a placeholder).
    fn is_created(&self) -> bool {
        self.is_placeholder() || !self.provider_id().is_empty()
    }
}

/// Implements [`SubsystemObject`] for a struct with `id`, `name` and `created_at` fields.
macro_rules! subsystem_object {
    ($ty:ty) => {
        impl $crate::model::subsystems::SubsystemObject for $ty {
            fn provider_id(&self) -> &str {
                &self.id
            }

            fn object_name(&self) -> &str {
                &self.name
            }

            fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.created_at
            }

            fn preserve_from(&mut self, observed: &Self) {
                self.id = observed.id.clone();
                self.created_at = observed.created_at;
            }
        }
    };
    ($ty:ty, placeholder) => {
        impl $crate::model::subsystems::SubsystemObject for $ty {
            fn provider_id(&self) -> &str {
                &self.id
            }

            fn object_name(&self) -> &str {
                &self.name
            }

            fn created_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.created_at
            }

            fn preserve_from(&mut self, observed: &Self) {
                self.id = observed.id.clone();
                self.created_at = observed.created_at;
            }

            fn is_placeholder(&self) -> bool {
                self.placeholder
            }
        }
    };
}

pub(crate) use subsystem_object;

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}

#[cfg(test)]
mod tests {
    use super::k8s::Namespace;
    use super::*;

    #[test]
    fn test_created_requires_provider_id() {
        let mut ns = Namespace {
            id: String::new(),
            name: "u-1".to_string(),
            created_at: None,
        };
        assert!(!ns.is_created());

        ns.id = "uid-1".to_string();
        assert!(ns.is_created());
    }

    #[test]
    fn test_preserve_copies_provider_fields() {
        let observed = Namespace {
            id: "uid-9".to_string(),
            name: "u-1".to_string(),
            created_at: Some(Utc::now()),
        };
        let mut desired = Namespace {
            id: String::new(),
            name: "u-1".to_string(),
            created_at: None,
        };
        desired.preserve_from(&observed);
        assert_eq!(desired, observed);
    }
}
