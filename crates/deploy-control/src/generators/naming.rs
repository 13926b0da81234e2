// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic object names.
//!
//! Names are the join key between desired and observed state, so every
//! generator derives them from here.

/// Label selecting the pods of one workload.
pub const LABEL_DEPLOY_NAME: &str = "app.kubernetes.io/deploy-name";

/// Label carrying the owning user.
pub const LABEL_OWNER_ID: &str = "owner-id";

/// Key of the docker config inside a pull secret.
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Port the VM HTTP proxy listens on.
pub const VM_PROXY_PORT: u16 = 8080;

/// Port of the storage manager file browser.
pub const FILEBROWSER_PORT: u16 = 80;

/// Port of the storage manager OAuth proxy.
pub const OAUTH_PROXY_PORT: u16 = 4180;

/// Lower-case a name and replace anything outside `[a-z0-9-]` with `-`.
pub fn k8s_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_matches('-');
    trimmed.chars().take(253).collect()
}

/// Namespace holding a user's deployments and VM proxies.
pub fn user_namespace(owner_id: &str) -> String {
    format!("deploy-{}", k8s_name(owner_id))
}

/// Namespace holding a user's storage manager.
pub fn storage_manager_namespace(owner_id: &str) -> String {
    format!("system-{}", k8s_name(owner_id))
}

/// Workload name of an app; the main app is named after the deployment.
pub fn app_workload_name(deployment_name: &str, app_name: &str) -> String {
    if app_name == deploy_core::model::deployment::MAIN_APP {
        deployment_name.to_string()
    } else {
        format!("{deployment_name}-{}", k8s_name(app_name))
    }
}

/// Volume and claim name of a deployment volume.
pub fn deployment_pv_name(deployment_name: &str, volume_name: &str) -> String {
    format!("{deployment_name}-{}", k8s_name(volume_name))
}

/// Pull secret of a custom-image deployment.
pub fn image_pull_secret_name(deployment_name: &str) -> String {
    format!("{deployment_name}-image-pull-secret")
}

/// Copy of the platform wildcard certificate owned by one workload.
pub fn wildcard_cert_secret_name(name: &str) -> String {
    format!("{name}-wildcard-cert")
}

/// Certificate issued for a custom domain.
pub fn custom_domain_tls_name(name: &str) -> String {
    format!("{name}-custom-domain-tls")
}

/// Ingress routing a custom domain.
pub fn custom_domain_ingress_name(name: &str) -> String {
    format!("{name}-custom-domain")
}

/// Workload, service and ingress name of a VM HTTP proxy.
pub fn vm_proxy_name(vm_name: &str, proxy_name: &str) -> String {
    format!("{vm_name}-{proxy_name}")
}

/// File browser workload of a storage manager.
pub fn storage_manager_name(owner_id: &str) -> String {
    format!("storage-manager-{}", k8s_name(owner_id))
}

/// OAuth proxy workload of a storage manager.
pub fn storage_manager_auth_name(owner_id: &str) -> String {
    format!("storage-manager-auth-{}", k8s_name(owner_id))
}

/// Volume and claim name of a storage manager volume.
pub fn storage_manager_pv_name(owner_id: &str, volume_name: &str) -> String {
    format!("sm-{volume_name}-{}", k8s_name(owner_id))
}

/// Harbor project of a user.
pub fn harbor_project(owner_id: &str) -> String {
    k8s_name(owner_id)
}

/// Join path segments with single slashes, skipping empty ones.
pub fn join_path(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .flat_map(|p| p.split('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("/{joined}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k8s_name() {
        assert_eq!(k8s_name("My Volume_1"), "my-volume-1");
        assert_eq!(k8s_name("--data.."), "data");
        assert_eq!(k8s_name(&"a".repeat(300)).len(), 253);
    }

    #[test]
    fn test_names() {
        assert_eq!(deployment_pv_name("a1", "Data"), "a1-data");
        assert_eq!(app_workload_name("a1", "main"), "a1");
        assert_eq!(app_workload_name("a1", "Worker"), "a1-worker");
        assert_eq!(vm_proxy_name("v1", "web"), "v1-web");
        assert_eq!(storage_manager_namespace("U-1"), "system-u-1");
        assert_eq!(storage_manager_pv_name("u-1", "init"), "sm-init-u-1");
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path(&["/srv/nfs/", "u-1", "user", "/data"]), "/srv/nfs/u-1/user/data");
        assert_eq!(join_path(&["/exports", ""]), "/exports");
    }
}
