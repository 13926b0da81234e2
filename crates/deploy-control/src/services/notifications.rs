// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Notifications addressed to the caller.

use deploy_core::model::Notification;

use super::Context;
use crate::error::{Error, Result};

/// Notifications of the caller.
pub async fn list(ctx: &Context) -> Result<Vec<Notification>> {
    Ok(ctx
        .platform
        .persistence
        .list_notifications(&ctx.principal.user_id)
        .await?)
}

/// Notification `id` of the caller.
pub async fn get(ctx: &Context, id: &str) -> Result<Notification> {
    list(ctx)
        .await?
        .into_iter()
        .find(|n| n.id == id)
        .ok_or_else(|| Error::NotFound(format!("notification {id}")))
}

/// Delete notification `id` of the caller.
pub async fn delete(ctx: &Context, id: &str) -> Result<()> {
    get(ctx, id).await?;
    ctx.platform.persistence.delete_notification(id).await?;
    Ok(())
}
