// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes objects of deployments, VM HTTP proxies and storage managers.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::k8s::{
    EnvVar, Ingress, K8sDeployment, K8sJob, K8sSubsystem, Namespace, PersistentVolume,
    PersistentVolumeClaim, ResourceLimits, Secret, SecretType, Service, VolumeMount,
};
use deploy_core::model::{App, Deployment, DeploymentType, StorageManager, Vm};

use super::K8sDesired;
use super::harbor::registry_host;
use super::naming::{self, DOCKER_CONFIG_KEY, FILEBROWSER_PORT, OAUTH_PROXY_PORT, VM_PROXY_PORT};
use crate::config::{DeploymentDefaults, RegistryConfig, StorageManagerConfig};
use crate::zones::Zone;

const FILEBROWSER_IMAGE: &str = "filebrowser/filebrowser";
const OAUTH_PROXY_IMAGE: &str = "quay.io/oauth2-proxy/oauth2-proxy:latest";
const INIT_IMAGE: &str = "busybox";
const INIT_JOB: &str = "init";

/// Inputs shared by the Kubernetes generators.
#[derive(Debug, Clone, Copy)]
pub struct K8sParams<'a> {
    /// Zone the resource lives in.
    pub zone: &'a Zone,
    /// Workload defaults.
    pub defaults: &'a DeploymentDefaults,
    /// Registry settings.
    pub registry: &'a RegistryConfig,
    /// OAuth proxy settings.
    pub storage_manager: &'a StorageManagerConfig,
    /// Data of the platform wildcard certificate, when it could be read.
    pub wildcard_cert: Option<&'a BTreeMap<String, String>>,
}

impl K8sParams<'_> {
    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_limit: self.defaults.cpu_limit.clone(),
            memory_limit: self.defaults.memory_limit.clone(),
            cpu_request: self.defaults.cpu_request.clone(),
            memory_request: self.defaults.memory_request.clone(),
        }
    }

    /// Wildcard copy named `name` in `namespace`. Falls back to the recorded
    /// copy when the source certificate could not be read.
    fn wildcard_secret(
        &self,
        namespace: &str,
        name: &str,
        observed: &K8sSubsystem,
    ) -> Option<Secret> {
        match self.wildcard_cert {
            Some(data) => Some(Secret {
                name: name.to_string(),
                namespace: namespace.to_string(),
                secret_type: SecretType::Tls,
                data: data.clone(),
                ..Default::default()
            }),
            None => observed
                .secret_map
                .get(name)
                .filter(|s| s.is_created())
                .cloned(),
        }
    }

    fn ingress(
        &self,
        name: &str,
        namespace: &str,
        service: &str,
        port: u16,
        host: String,
    ) -> Ingress {
        Ingress {
            name: name.to_string(),
            namespace: namespace.to_string(),
            service_name: service.to_string(),
            service_port: port,
            ingress_class: self.zone.ingress_class.clone(),
            hosts: vec![host],
            ..Default::default()
        }
    }

    fn custom_domain_ingress(
        &self,
        name: &str,
        namespace: &str,
        service: &str,
        port: u16,
        domain: &str,
    ) -> Ingress {
        Ingress {
            tls_secret: Some(naming::custom_domain_tls_name(name)),
            cluster_issuer: Some(self.zone.cluster_issuer.clone()),
            ..self.ingress(
                &naming::custom_domain_ingress_name(name),
                namespace,
                service,
                port,
                domain.to_string(),
            )
        }
    }
}

fn labels(workload: &str, owner_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (naming::LABEL_DEPLOY_NAME.to_string(), workload.to_string()),
        (naming::LABEL_OWNER_ID.to_string(), owner_id.to_string()),
    ])
}

fn selector(workload: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(naming::LABEL_DEPLOY_NAME.to_string(), workload.to_string())])
}

fn namespace(name: String) -> Namespace {
    Namespace {
        name,
        ..Default::default()
    }
}

/// User environment with `PORT` forced to the app's internal port.
fn app_env(app: &App) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = app
        .envs
        .iter()
        .filter(|e| e.name != "PORT")
        .map(|e| EnvVar::new(&e.name, &e.value))
        .collect();
    env.push(EnvVar::new("PORT", app.internal_port.to_string()));
    env
}

fn docker_config(host: &str, username: &str, password: &str) -> String {
    let auth = BASE64.encode(format!("{username}:{password}"));
    serde_json::json!({
        "auths": {
            host: {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    })
    .to_string()
}

/// Kubernetes objects of a deployment.
pub fn deployment(d: &Deployment, params: &K8sParams<'_>) -> K8sDesired {
    let observed = &d.subsystems.k8s;
    let ns = naming::user_namespace(&d.owner_id);
    let mut desired = K8sDesired {
        namespace: Some(namespace(ns.clone())),
        ..Default::default()
    };

    let pull_secret = naming::image_pull_secret_name(&d.name);
    let robot = d
        .subsystems
        .harbor
        .robot
        .as_ref()
        .filter(|r| r.is_created() && !r.secret.is_empty());
    let custom = d.spec.kind == DeploymentType::Custom;
    if custom && let Some(robot) = robot {
        let config = docker_config(
            &registry_host(params.registry),
            &robot.harbor_name,
            &robot.secret,
        );
        desired.secrets.push(Secret {
            name: pull_secret.clone(),
            namespace: ns.clone(),
            secret_type: SecretType::DockerConfigJson,
            data: BTreeMap::from([(DOCKER_CONFIG_KEY.to_string(), config)]),
            ..Default::default()
        });
    }

    let wildcard_name = naming::wildcard_cert_secret_name(&d.name);
    let wildcard = params.wildcard_secret(&ns, &wildcard_name, observed);
    let tls_secret = wildcard.as_ref().map(|s| s.name.clone());
    desired.secrets.extend(wildcard);

    for (app_name, app) in &d.spec.apps {
        let workload = naming::app_workload_name(&d.name, app_name);

        let mut mounts = Vec::new();
        if let Some(storage) = &params.zone.storage {
            for volume in &app.volumes {
                let pv_name = naming::deployment_pv_name(&workload, &volume.name);
                desired.pvs.push(PersistentVolume {
                    name: pv_name.clone(),
                    capacity: params.defaults.storage_capacity.clone(),
                    nfs_server: storage.nfs_server.clone(),
                    nfs_path: naming::join_path(&[
                        &storage.nfs_parent_path,
                        &d.owner_id,
                        "user",
                        &volume.server_path,
                    ]),
                    ..Default::default()
                });
                desired.pvcs.push(PersistentVolumeClaim {
                    name: pv_name.clone(),
                    namespace: ns.clone(),
                    capacity: params.defaults.storage_capacity.clone(),
                    volume_name: pv_name.clone(),
                    ..Default::default()
                });
                mounts.push(VolumeMount {
                    name: naming::k8s_name(&volume.name),
                    pvc_name: pv_name,
                    mount_path: volume.app_path.clone(),
                });
            }
        }

        desired.deployments.push(K8sDeployment {
            name: workload.clone(),
            namespace: ns.clone(),
            labels: labels(&workload, &d.owner_id),
            image: app.image.clone(),
            env: app_env(app),
            port: app.internal_port,
            replicas: app.replicas,
            image_pull_secrets: if custom && robot.is_some() {
                vec![pull_secret.clone()]
            } else {
                Vec::new()
            },
            volumes: mounts,
            init_commands: app.init_commands.clone(),
            args: app.args.clone(),
            resources: params.limits(),
            ..Default::default()
        });

        desired.services.push(Service {
            name: workload.clone(),
            namespace: ns.clone(),
            port: app.internal_port,
            target_port: app.internal_port,
            selector: selector(&workload),
            ..Default::default()
        });

        if app.private {
            desired.ingresses.push(Ingress {
                name: workload.clone(),
                namespace: ns.clone(),
                placeholder: true,
                ..Default::default()
            });
            continue;
        }

        desired.ingresses.push(Ingress {
            tls_secret: tls_secret.clone(),
            ..params.ingress(
                &workload,
                &ns,
                &workload,
                app.internal_port,
                params.zone.deployment_host(&workload),
            )
        });
        if let Some(domain) = app.custom_domain.as_deref().filter(|d| !d.is_empty()) {
            desired.ingresses.push(params.custom_domain_ingress(
                &workload,
                &ns,
                &workload,
                app.internal_port,
                domain,
            ));
        }
    }

    desired.preserve(observed)
}

/// HTTP proxy objects of a VM. Proxies are only generated once the port's
/// forwarding rule exists, because the proxy targets its public port.
pub fn vm_proxies(vm: &Vm, params: &K8sParams<'_>) -> K8sDesired {
    let observed = &vm.subsystems.k8s;
    if vm.spec.proxied_ports().next().is_none() {
        return K8sDesired::default();
    }

    let ns = naming::user_namespace(&vm.owner_id);
    let mut desired = K8sDesired {
        namespace: Some(namespace(ns.clone())),
        ..Default::default()
    };

    let wildcard_name = naming::wildcard_cert_secret_name(&vm.name);
    let wildcard = params.wildcard_secret(&ns, &wildcard_name, observed);
    let tls_secret = wildcard.as_ref().map(|s| s.name.clone());
    desired.secrets.extend(wildcard);

    for (port, proxy) in vm.spec.proxied_ports() {
        let Some(rule) = vm
            .subsystems
            .cs
            .port_forwarding_rule_map
            .get(&port.name)
            .filter(|r| r.is_created())
        else {
            continue;
        };

        let name = naming::vm_proxy_name(&vm.name, &proxy.name);
        desired.deployments.push(K8sDeployment {
            name: name.clone(),
            namespace: ns.clone(),
            labels: labels(&name, &vm.owner_id),
            image: params.defaults.vm_http_proxy_image.clone(),
            env: vec![
                EnvVar::new("PORT", VM_PROXY_PORT.to_string()),
                EnvVar::new("VM_PORT", rule.public_port.to_string()),
                EnvVar::new(
                    "URL",
                    format!("https://{}", params.zone.vm_proxy_host(&proxy.name)),
                ),
                EnvVar::new("VM_URL", &params.zone.vm_parent_domain),
            ],
            port: VM_PROXY_PORT,
            replicas: 1,
            resources: params.limits(),
            ..Default::default()
        });
        desired.services.push(Service {
            name: name.clone(),
            namespace: ns.clone(),
            port: VM_PROXY_PORT,
            target_port: VM_PROXY_PORT,
            selector: selector(&name),
            ..Default::default()
        });
        desired.ingresses.push(Ingress {
            tls_secret: tls_secret.clone(),
            ..params.ingress(
                &name,
                &ns,
                &name,
                VM_PROXY_PORT,
                params.zone.vm_proxy_host(&proxy.name),
            )
        });
        if let Some(domain) = proxy.custom_domain.as_deref().filter(|d| !d.is_empty()) {
            desired
                .ingresses
                .push(params.custom_domain_ingress(&name, &ns, &name, VM_PROXY_PORT, domain));
        }
    }

    desired.preserve(observed)
}

/// Kubernetes objects of a storage manager.
pub fn storage_manager(sm: &StorageManager, params: &K8sParams<'_>) -> K8sDesired {
    let observed = &sm.subsystems.k8s;
    let owner = &sm.owner_id;
    let ns = naming::storage_manager_namespace(owner);
    let filebrowser = naming::storage_manager_name(owner);
    let auth = naming::storage_manager_auth_name(owner);
    let host = params.zone.storage_host(owner);

    let mut desired = K8sDesired {
        namespace: Some(namespace(ns.clone())),
        ..Default::default()
    };

    let wildcard = params.wildcard_secret(&ns, &naming::wildcard_cert_secret_name(&auth), observed);
    let tls_secret = wildcard.as_ref().map(|s| s.name.clone());
    desired.secrets.extend(wildcard);

    let mut mounts = Vec::new();
    if let Some(storage) = &params.zone.storage {
        let volumes = [
            ("init", storage.nfs_parent_path.clone(), "/exports"),
            (
                "data",
                naming::join_path(&[&storage.nfs_parent_path, owner, "data"]),
                "/data",
            ),
            (
                "user",
                naming::join_path(&[&storage.nfs_parent_path, owner, "user"]),
                "/deploy",
            ),
        ];
        for (volume, nfs_path, mount_path) in volumes {
            let pv_name = naming::storage_manager_pv_name(owner, volume);
            desired.pvs.push(PersistentVolume {
                name: pv_name.clone(),
                capacity: params.defaults.storage_capacity.clone(),
                nfs_server: storage.nfs_server.clone(),
                nfs_path,
                ..Default::default()
            });
            desired.pvcs.push(PersistentVolumeClaim {
                name: pv_name.clone(),
                namespace: ns.clone(),
                capacity: params.defaults.storage_capacity.clone(),
                volume_name: pv_name.clone(),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: volume.to_string(),
                pvc_name: pv_name,
                mount_path: mount_path.to_string(),
            });
        }

        let (init, workload): (Vec<_>, Vec<_>) = mounts.into_iter().partition(|m| m.name == "init");
        mounts = workload;
        desired.jobs.push(K8sJob {
            name: INIT_JOB.to_string(),
            namespace: ns.clone(),
            image: INIT_IMAGE.to_string(),
            command: vec![
                "/bin/mkdir".to_string(),
                "-p".to_string(),
                format!("/exports/{owner}/data"),
                format!("/exports/{owner}/user"),
            ],
            volumes: init,
            ..Default::default()
        });
    }

    desired.deployments.push(K8sDeployment {
        name: filebrowser.clone(),
        namespace: ns.clone(),
        labels: labels(&filebrowser, owner),
        image: FILEBROWSER_IMAGE.to_string(),
        port: FILEBROWSER_PORT,
        replicas: 1,
        volumes: mounts,
        args: vec![
            "--noauth".to_string(),
            "--root=/deploy".to_string(),
            "--database=/data/database.db".to_string(),
            format!("--port={FILEBROWSER_PORT}"),
        ],
        resources: params.limits(),
        ..Default::default()
    });

    let oauth = params.storage_manager;
    desired.deployments.push(K8sDeployment {
        name: auth.clone(),
        namespace: ns.clone(),
        labels: labels(&auth, owner),
        image: OAUTH_PROXY_IMAGE.to_string(),
        port: OAUTH_PROXY_PORT,
        replicas: 1,
        args: vec![
            format!("--http-address=0.0.0.0:{OAUTH_PROXY_PORT}"),
            "--reverse-proxy=true".to_string(),
            "--provider=oidc".to_string(),
            format!("--redirect-url=https://{host}/oauth2/callback"),
            format!("--oidc-issuer-url={}", oauth.oidc_issuer_url),
            format!("--upstream=http://{filebrowser}:{FILEBROWSER_PORT}"),
            format!("--client-id={}", oauth.client_id),
            format!("--client-secret={}", oauth.client_secret),
            format!("--cookie-secret={}", oauth.cookie_secret),
            "--cookie-secure=true".to_string(),
            "--email-domain=*".to_string(),
            "--skip-provider-button=true".to_string(),
            "--code-challenge-method=S256".to_string(),
        ],
        resources: params.limits(),
        ..Default::default()
    });

    for (name, port) in [(&filebrowser, FILEBROWSER_PORT), (&auth, OAUTH_PROXY_PORT)] {
        desired.services.push(Service {
            name: name.clone(),
            namespace: ns.clone(),
            port,
            target_port: port,
            selector: selector(name),
            ..Default::default()
        });
    }

    desired.ingresses.push(Ingress {
        tls_secret,
        ..params.ingress(&auth, &ns, &auth, OAUTH_PROXY_PORT, host)
    });

    desired.preserve(observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deploy_core::model::deployment::{Env, Volume};
    use deploy_core::model::subsystems::cs::PortForwardingRule;
    use deploy_core::model::subsystems::harbor::HarborRobot;
    use deploy_core::model::vm::{HttpProxy, VmPort, VmSpecs};
    use deploy_core::model::{DeploymentSpec, StorageManagerSpec, VmSpec};

    use crate::config::PlatformConfig;
    use crate::zones::ZoneRegistry;

    fn zone() -> Zone {
        let config = PlatformConfig::from_toml_str(
            r#"
external_url = "https://deploy.example"

[[zones]]
name = "z1"
capabilities = ["deployment", "vm"]
parent_domain = "z1.example"
vm_app_domain = "app.vm.example"
vm_parent_domain = "vm.example"
storage_domain = "storage.example"

[zones.storage]
nfs_server = "nfs.z1"
nfs_parent_path = "/srv/nfs"
"#,
        )
        .unwrap();
        ZoneRegistry::from_config(config.zones)
            .unwrap()
            .get("z1")
            .unwrap()
            .clone()
    }

    struct Fixture {
        zone: Zone,
        defaults: DeploymentDefaults,
        registry: RegistryConfig,
        storage_manager: StorageManagerConfig,
        cert: BTreeMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                zone: zone(),
                defaults: DeploymentDefaults::default(),
                registry: RegistryConfig::default(),
                storage_manager: StorageManagerConfig::default(),
                cert: BTreeMap::from([
                    ("tls.crt".to_string(), "crt".to_string()),
                    ("tls.key".to_string(), "key".to_string()),
                ]),
            }
        }

        fn params(&self) -> K8sParams<'_> {
            K8sParams {
                zone: &self.zone,
                defaults: &self.defaults,
                registry: &self.registry,
                storage_manager: &self.storage_manager,
                wildcard_cert: Some(&self.cert),
            }
        }
    }

    fn nginx() -> Deployment {
        let mut app = App::new("nginx", 80);
        app.envs = vec![
            Env {
                name: "PORT".to_string(),
                value: "1".to_string(),
            },
            Env {
                name: "MODE".to_string(),
                value: "prod".to_string(),
            },
        ];
        Deployment::new(
            "d-1",
            "a1",
            "u-1",
            "z1",
            DeploymentSpec::single(DeploymentType::Prebuilt, app),
        )
    }

    #[test]
    fn test_deployment_objects() {
        let fixture = Fixture::new();
        let desired = deployment(&nginx(), &fixture.params());

        assert_eq!(desired.namespace.as_ref().unwrap().name, "deploy-u-1");
        assert_eq!(desired.secrets.len(), 1);
        assert_eq!(desired.secrets[0].name, "a1-wildcard-cert");

        let workload = &desired.deployments[0];
        assert_eq!(workload.name, "a1");
        assert_eq!(
            workload.env,
            vec![EnvVar::new("MODE", "prod"), EnvVar::new("PORT", "80")]
        );
        assert!(workload.image_pull_secrets.is_empty());

        assert_eq!(desired.services[0].selector[naming::LABEL_DEPLOY_NAME], "a1");
        assert_eq!(desired.ingresses.len(), 1);
        assert_eq!(desired.ingresses[0].hosts, vec!["a1.z1.example".to_string()]);
        assert_eq!(
            desired.ingresses[0].tls_secret.as_deref(),
            Some("a1-wildcard-cert")
        );
    }

    #[test]
    fn test_private_app_gets_placeholder_ingress() {
        let fixture = Fixture::new();
        let mut d = nginx();
        d.spec.apps.get_mut("main").unwrap().private = true;

        let desired = deployment(&d, &fixture.params());
        assert_eq!(desired.ingresses.len(), 1);
        assert!(desired.ingresses[0].placeholder);
        assert!(desired.ingresses[0].hosts.is_empty());
    }

    #[test]
    fn test_custom_domain_and_volumes() {
        let fixture = Fixture::new();
        let mut d = nginx();
        let app = d.spec.apps.get_mut("main").unwrap();
        app.custom_domain = Some("foo.example".to_string());
        app.volumes = vec![Volume {
            name: "Data".to_string(),
            app_path: "/var/data".to_string(),
            server_path: "/projects/a1".to_string(),
        }];

        let desired = deployment(&d, &fixture.params());
        let custom = &desired.ingresses[1];
        assert_eq!(custom.name, "a1-custom-domain");
        assert_eq!(custom.hosts, vec!["foo.example".to_string()]);
        assert_eq!(custom.cluster_issuer.as_deref(), Some("letsencrypt-prod"));

        assert_eq!(desired.pvs[0].name, "a1-data");
        assert_eq!(desired.pvs[0].nfs_path, "/srv/nfs/u-1/user/projects/a1");
        assert_eq!(desired.pvcs[0].volume_name, "a1-data");
        assert_eq!(desired.deployments[0].volumes[0].pvc_name, "a1-data");
    }

    #[test]
    fn test_custom_deployment_pull_secret() {
        let fixture = Fixture::new();
        let mut d = nginx();
        d.spec.kind = DeploymentType::Custom;
        d.subsystems.harbor.robot = Some(HarborRobot {
            id: "robot-1".to_string(),
            name: "a1".to_string(),
            project_name: "u-1".to_string(),
            harbor_name: "robot$u-1+a1".to_string(),
            secret: "pw".to_string(),
            ..Default::default()
        });

        let desired = deployment(&d, &fixture.params());
        let secret = &desired.secrets[0];
        assert_eq!(secret.name, "a1-image-pull-secret");
        assert_eq!(secret.secret_type, SecretType::DockerConfigJson);
        let config: serde_json::Value =
            serde_json::from_str(&secret.data[DOCKER_CONFIG_KEY]).unwrap();
        assert_eq!(config["auths"]["registry.local"]["username"], "robot$u-1+a1");
        assert_eq!(
            desired.deployments[0].image_pull_secrets,
            vec!["a1-image-pull-secret".to_string()]
        );
    }

    #[test]
    fn test_regenerating_converged_state_matches_observed() {
        let fixture = Fixture::new();
        let mut d = nginx();
        let first = deployment(&d, &fixture.params());

        let mut observed = K8sSubsystem::default();
        let mut ns = first.namespace.clone().unwrap();
        ns.id = "ns-1".to_string();
        observed.namespace = Some(ns);
        for (i, mut w) in first.deployments.clone().into_iter().enumerate() {
            w.id = format!("dep-{i}");
            w.created_at = Some(Utc::now());
            observed.deployment_map.insert(w.name.clone(), w);
        }
        d.subsystems.k8s = observed.clone();

        let second = deployment(&d, &fixture.params());
        assert_eq!(second.deployments[0], observed.deployment_map["a1"]);
    }

    #[test]
    fn test_missing_wildcard_keeps_recorded_copy() {
        let fixture = Fixture::new();
        let mut d = nginx();
        let params = K8sParams {
            wildcard_cert: None,
            ..fixture.params()
        };
        assert!(deployment(&d, &params).secrets.is_empty());

        d.subsystems.k8s.secret_map.insert(
            "a1-wildcard-cert".to_string(),
            Secret {
                id: "s-1".to_string(),
                name: "a1-wildcard-cert".to_string(),
                namespace: "deploy-u-1".to_string(),
                secret_type: SecretType::Tls,
                ..Default::default()
            },
        );
        let desired = deployment(&d, &params);
        assert_eq!(desired.secrets[0].id, "s-1");
    }

    fn vm_with_proxy() -> Vm {
        Vm::new(
            "v-1",
            "v1",
            "u-1",
            "z1",
            VmSpec {
                ssh_public_key: "ssh-ed25519 AAAA".to_string(),
                specs: VmSpecs {
                    cpu_cores: 2,
                    ram: 4,
                    disk_size: 20,
                },
                ports: vec![VmPort {
                    name: "http".to_string(),
                    port: 80,
                    protocol: "tcp".to_string(),
                    public_port: 0,
                    http_proxy: Some(HttpProxy {
                        name: "web".to_string(),
                        custom_domain: None,
                    }),
                }],
                host: None,
                gpu: None,
            },
        )
    }

    #[test]
    fn test_vm_proxy_waits_for_port_forwarding() {
        let fixture = Fixture::new();
        let mut vm = vm_with_proxy();

        let desired = vm_proxies(&vm, &fixture.params());
        assert!(desired.deployments.is_empty());
        assert!(desired.namespace.is_some());

        vm.subsystems.cs.port_forwarding_rule_map.insert(
            "http".to_string(),
            PortForwardingRule {
                id: "pfr-1".to_string(),
                name: "http".to_string(),
                public_port: 30001,
                private_port: 80,
                protocol: "tcp".to_string(),
                ..Default::default()
            },
        );
        let desired = vm_proxies(&vm, &fixture.params());
        let proxy = &desired.deployments[0];
        assert_eq!(proxy.name, "v1-web");
        assert!(proxy.env.contains(&EnvVar::new("VM_PORT", "30001")));
        assert!(proxy.env.contains(&EnvVar::new("URL", "https://web.app.vm.example")));
        assert_eq!(desired.ingresses[0].hosts, vec!["web.app.vm.example".to_string()]);
    }

    #[test]
    fn test_vm_without_proxies_has_no_objects() {
        let fixture = Fixture::new();
        let mut vm = vm_with_proxy();
        vm.spec.ports[0].http_proxy = None;
        assert!(vm_proxies(&vm, &fixture.params()).is_empty());
    }

    #[test]
    fn test_storage_manager_objects() {
        let fixture = Fixture::new();
        let sm = StorageManager::new("sm-1", "system-u-1", "u-1", "z1", StorageManagerSpec {});
        let desired = storage_manager(&sm, &fixture.params());

        assert_eq!(desired.namespace.unwrap().name, "system-u-1");
        assert_eq!(desired.deployments.len(), 2);
        assert_eq!(desired.services.len(), 2);
        assert_eq!(desired.ingresses[0].hosts, vec!["u-1.storage.example".to_string()]);
        assert_eq!(desired.ingresses[0].service_port, OAUTH_PROXY_PORT);

        let pv_paths: Vec<_> = desired.pvs.iter().map(|p| p.nfs_path.as_str()).collect();
        assert_eq!(
            pv_paths,
            vec!["/srv/nfs", "/srv/nfs/u-1/data", "/srv/nfs/u-1/user"]
        );

        let filebrowser = &desired.deployments[0];
        let mounts: Vec<_> = filebrowser.volumes.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(mounts, vec!["/data", "/deploy"]);

        let job = &desired.jobs[0];
        assert_eq!(job.volumes[0].mount_path, "/exports");
        assert!(job.command.contains(&"/exports/u-1/user".to_string()));
    }
}
