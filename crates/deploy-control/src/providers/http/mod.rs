// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! REST provider clients.
//!
//! One `reqwest::Client` is shared by every zone; per-zone clients only carry
//! their endpoint and credentials.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::{CloudStack, Github, Harbor, Kube, ProviderError, ProviderFactory, ProviderResult};
use crate::config::{GithubConfig, PlatformConfig, RegistryConfig};
use crate::zones::Zone;

mod cloudstack;
mod github;
mod harbor;
mod kube;

pub use cloudstack::HttpCloudStack;
pub use github::HttpGithub;
pub use harbor::HttpHarbor;
pub use kube::HttpKube;

/// Timeout of a single provider request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("deploy-control/", env!("CARGO_PKG_VERSION"));

/// Factory building REST clients from the platform configuration.
pub struct HttpProviders {
    client: reqwest::Client,
    registry: RegistryConfig,
    github: GithubConfig,
}

impl HttpProviders {
    /// Build the shared HTTP client.
    pub fn new(config: &PlatformConfig) -> ProviderResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            registry: config.registry.clone(),
            github: config.github.clone(),
        })
    }
}

impl ProviderFactory for HttpProviders {
    fn kube(&self, zone: &Zone) -> ProviderResult<Kube> {
        let credentials = zone.kubernetes.as_ref().ok_or_else(|| {
            ProviderError::Permanent(format!("zone {} has no kubernetes credentials", zone.name))
        })?;
        Ok(Arc::new(HttpKube::new(self.client.clone(), credentials)))
    }

    fn cloudstack(&self, zone: &Zone) -> ProviderResult<CloudStack> {
        let ids = zone.cloudstack.as_ref().ok_or_else(|| {
            ProviderError::Permanent(format!("zone {} has no cloudstack settings", zone.name))
        })?;
        Ok(Arc::new(HttpCloudStack::new(self.client.clone(), ids.clone())))
    }

    fn harbor(&self) -> ProviderResult<Harbor> {
        Ok(Arc::new(HttpHarbor::new(self.client.clone(), &self.registry)))
    }

    fn github(&self, token: &str) -> ProviderResult<Github> {
        Ok(Arc::new(HttpGithub::new(
            self.client.clone(),
            &self.github.api_url,
            token,
        )))
    }
}

/// Error for a non-success `status`.
pub(crate) fn status_error(status: StatusCode, what: &str, body: &str) -> ProviderError {
    let detail = format!("{what}: {status}: {}", body.trim());
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Transient(detail)
    } else {
        ProviderError::Permanent(detail)
    }
}

/// Pass a successful response through; map the rest to provider errors.
/// `404` becomes [`ProviderError::NotFound`].
pub(crate) async fn checked(
    response: Response,
    kind: &'static str,
    name: &str,
) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::not_found(kind, name));
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &format!("{kind} '{name}'"), &body))
}

/// Like [`checked`], with `404` mapped to `None`.
pub(crate) async fn optional(
    response: Response,
    kind: &'static str,
    name: &str,
) -> ProviderResult<Option<Response>> {
    match checked(response, kind, name).await {
        Ok(response) => Ok(Some(response)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Decode a JSON body.
pub(crate) async fn json<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::Permanent(format!("unexpected response body: {e}")))
}

/// Treat a missing object as deleted.
pub(crate) fn gone_ok(result: ProviderResult<()>) -> ProviderResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
