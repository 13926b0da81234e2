// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations behind the HTTP surface that do not belong to one resource
//! kind: platform reads and inbound webhooks. Resource commands live in
//! [`crate::services`].

pub mod system;
pub mod webhooks;

pub use webhooks::{GithubDelivery, HookOutcome};
