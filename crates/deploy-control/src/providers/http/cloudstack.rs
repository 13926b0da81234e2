// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudStack API client.
//!
//! Requests are signed with HMAC-SHA1 over the sorted, lower-cased query
//! string. Asynchronous commands are polled through `queryAsyncJobResult`
//! until they finish.
//!
//! GPUs are advertised through host tags of the form `gpu:<bus>:<name>` and
//! passed through to a VM with a libvirt `hostdev` extra configuration.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info};

use deploy_core::model::subsystems::cs::{CsSnapshot, CsVm, PortForwardingRule};

use super::{gone_ok, status_error};
use crate::config::CloudStackIds;
use crate::providers::{
    CloudStackApi, GpuDevice, HostCapacity, PowerState, Provider, ProviderError, ProviderResult,
    VmAction,
};

/// Interval between async job polls.
const JOB_POLL: Duration = Duration::from_secs(2);

/// Longest wait for an async job.
const JOB_TIMEOUT: Duration = Duration::from_secs(600);

const CUSTOM_OFFERING: &str = "custom";
const GPU_TAG: &str = "gpu:";
const GIB: u64 = 1024 * 1024 * 1024;

type Params = Vec<(&'static str, String)>;

/// Client for one CloudStack zone.
pub struct HttpCloudStack {
    client: reqwest::Client,
    ids: CloudStackIds,
    offering: OnceCell<String>,
}

impl HttpCloudStack {
    /// Client for the zone identified by `ids`.
    pub fn new(client: reqwest::Client, ids: CloudStackIds) -> Self {
        Self {
            client,
            ids,
            offering: OnceCell::new(),
        }
    }

    async fn call(&self, command: &str, params: Params) -> ProviderResult<Value> {
        let query = signed_query(&self.ids.api_key, &self.ids.secret_key, command, params)?;
        let url = format!("{}?{query}", self.ids.api_url.trim_end_matches('/'));
        let response = self.client.get(url).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        let key = format!("{}response", command.to_lowercase());
        let payload = body.get(&key).cloned().unwrap_or(Value::Null);
        if status.is_success() {
            return Ok(payload);
        }
        let text = str_at(&payload, "/errortext");
        if is_missing(&text) {
            return Err(ProviderError::not_found("cloudstack object", text));
        }
        Err(status_error(status, command, &text))
    }

    /// Run an asynchronous command and wait for its result.
    async fn call_async(&self, command: &str, params: Params) -> ProviderResult<Value> {
        let started = self.call(command, params).await?;
        let job_id = started
            .get("jobid")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::Permanent(format!("{command} returned no job id")))?
            .to_string();
        let deadline = Instant::now() + JOB_TIMEOUT;
        loop {
            let job = self
                .call("queryAsyncJobResult", vec![("jobid", job_id.clone())])
                .await?;
            match job.get("jobstatus").and_then(Value::as_i64) {
                Some(1) => return Ok(job.get("jobresult").cloned().unwrap_or(Value::Null)),
                Some(2) => {
                    let text = str_at(&job, "/jobresult/errortext");
                    if is_missing(&text) {
                        return Err(ProviderError::not_found("cloudstack object", text));
                    }
                    return Err(ProviderError::Permanent(format!("{command} failed: {text}")));
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::Transient(format!(
                    "{command} job {job_id} did not finish in time"
                )));
            }
            tokio::time::sleep(JOB_POLL).await;
        }
    }

    async fn service_offering(&self) -> ProviderResult<String> {
        if !self.ids.service_offering_id.is_empty() {
            return Ok(self.ids.service_offering_id.clone());
        }
        self.offering
            .get_or_try_init(|| async {
                let list = self
                    .call(
                        "listServiceOfferings",
                        vec![
                            ("name", CUSTOM_OFFERING.to_string()),
                            ("listall", "true".to_string()),
                        ],
                    )
                    .await?;
                Some(str_at(&list, "/serviceoffering/0/id"))
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| ProviderError::not_found("service offering", CUSTOM_OFFERING))
            })
            .await
            .cloned()
    }

    async fn host_id(&self, name: &str) -> ProviderResult<String> {
        let list = self
            .call(
                "listHosts",
                vec![("name", name.to_string()), ("type", "Routing".to_string())],
            )
            .await?;
        Some(str_at(&list, "/host/0/id"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::not_found("host", name))
    }

    async fn hosts(&self) -> ProviderResult<Vec<Value>> {
        let list = self
            .call(
                "listHosts",
                vec![
                    ("zoneid", self.ids.zone_id.clone()),
                    ("type", "Routing".to_string()),
                ],
            )
            .await?;
        Ok(array_at(&list, "/host").to_vec())
    }

    async fn find_vm(&self, key: &'static str, value: &str) -> ProviderResult<Option<Value>> {
        let list = self
            .call("listVirtualMachines", vec![(key, value.to_string())])
            .await?;
        Ok(array_at(&list, "/virtualmachine")
            .first()
            .filter(|vm| !matches!(str_at(vm, "/state").as_str(), "Destroyed" | "Expunging"))
            .cloned())
    }

    async fn root_disk_size(&self, vm_id: &str) -> ProviderResult<u32> {
        let list = self
            .call(
                "listVolumes",
                vec![
                    ("virtualmachineid", vm_id.to_string()),
                    ("type", "ROOT".to_string()),
                ],
            )
            .await?;
        let bytes = list
            .pointer("/volume/0/size")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        Ok(u32::try_from(bytes / GIB).unwrap_or(u32::MAX))
    }

    async fn parse_live_vm(&self, live: &Value, observed: &CsVm) -> ProviderResult<CsVm> {
        let id = str_at(live, "/id");
        let disk_size = self.root_disk_size(&id).await?;
        Ok(CsVm {
            id,
            name: str_at(live, "/name"),
            cpu_cores: u32_at(live, "/cpunumber"),
            ram: u32_at(live, "/memory") / 1024,
            disk_size,
            template_id: str_at(live, "/templateid"),
            network_id: str_at(live, "/nic/0/networkid"),
            zone_id: str_at(live, "/zoneid"),
            host_name: observed.host_name.clone(),
            gpu_id: observed.gpu_id.clone(),
            ssh_public_key: observed.ssh_public_key.clone(),
            created_at: parse_time(&str_at(live, "/created")),
        })
    }

    async fn set_extra_config(&self, vm_id: &str, extra_config: String) -> ProviderResult<()> {
        self.call(
            "updateVirtualMachine",
            vec![("id", vm_id.to_string()), ("extraconfig", extra_config)],
        )
        .await?;
        Ok(())
    }

    async fn start_on(&self, vm_id: &str, host: Option<&str>) -> ProviderResult<()> {
        let mut params = vec![("id", vm_id.to_string())];
        if let Some(host) = host {
            params.push(("hostid", self.host_id(host).await?));
        }
        self.call_async("startVirtualMachine", params).await?;
        Ok(())
    }

    async fn stop(&self, vm_id: &str) -> ProviderResult<()> {
        if self.power_state(vm_id).await? == Some(PowerState::Stopped) {
            return Ok(());
        }
        self.call_async("stopVirtualMachine", vec![("id", vm_id.to_string())])
            .await?;
        Ok(())
    }

    fn sizing(&self, offering: String, vm: &CsVm) -> Params {
        vec![
            ("serviceofferingid", offering),
            ("details[0].cpuNumber", vm.cpu_cores.to_string()),
            ("details[0].cpuSpeed", "1".to_string()),
            ("details[0].memory", (u64::from(vm.ram) * 1024).to_string()),
        ]
    }
}

/// Signed query string for `command`.
fn signed_query(
    api_key: &str,
    secret_key: &str,
    command: &str,
    params: Params,
) -> ProviderResult<String> {
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    pairs.push(("command".to_string(), command.to_string()));
    pairs.push(("response".to_string(), "json".to_string()));
    pairs.push(("apiKey".to_string(), api_key.to_string()));
    pairs.sort_by_key(|(k, _)| k.to_lowercase());

    let query = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let mut mac = Hmac::<Sha1>::new_from_slice(secret_key.as_bytes())
        .map_err(|e| ProviderError::Permanent(format!("invalid cloudstack secret: {e}")))?;
    mac.update(query.to_lowercase().as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    Ok(format!(
        "{query}&signature={}",
        urlencoding::encode(&signature)
    ))
}

fn is_missing(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("does not exist") || text.contains("unable to find")
}

fn str_at(value: &Value, pointer: &str) -> String {
    match value.pointer(pointer) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn u32_at(value: &Value, pointer: &str) -> u32 {
    str_at(value, pointer).parse().unwrap_or(0)
}

fn port_at(value: &Value, pointer: &str) -> u16 {
    str_at(value, pointer).parse().unwrap_or(0)
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// CloudStack timestamps carry the offset without a colon.
fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Percentage string such as `"12.5%"`.
fn percent(raw: &str) -> f64 {
    raw.trim_end_matches('%').parse().unwrap_or(0.0)
}

fn host_capacity(host: &Value) -> HostCapacity {
    let cpu_cores_total = u32_at(host, "/cpunumber");
    let used = f64::from(cpu_cores_total) * percent(&str_at(host, "/cpuallocated")) / 100.0;
    let bytes = |pointer: &str| {
        let value = host.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
        u32::try_from(value / GIB).unwrap_or(u32::MAX)
    };
    HostCapacity {
        name: str_at(host, "/name"),
        cpu_cores_total,
        cpu_cores_used: used.ceil() as u32,
        ram_total: bytes("/memorytotal"),
        ram_allocated: bytes("/memoryallocatedbytes"),
        enabled: str_at(host, "/resourcestate") == "Enabled",
    }
}

/// GPUs advertised by `host` through `gpu:<bus>:<name>` tags.
fn host_gpus(host: &Value) -> Vec<GpuDevice> {
    let name = str_at(host, "/name");
    str_at(host, "/hosttags")
        .split(',')
        .filter_map(|tag| tag.trim().strip_prefix(GPU_TAG))
        .filter_map(|tag| tag.split_once(':'))
        .map(|(bus, model)| GpuDevice {
            id: format!("{bus}-{name}"),
            name: model.to_string(),
            host: name.clone(),
        })
        .collect()
}

/// libvirt passthrough of the device on PCI `bus`.
fn gpu_extra_config(bus: &str) -> String {
    format!(
        "<devices><hostdev mode='subsystem' type='pci' managed='yes'><driver name='vfio'/>\
         <source><address domain='0x0000' bus='0x{bus}' slot='0x00' function='0x0'/></source>\
         <alias name='nvidia0'/>\
         <address type='pci' domain='0x0000' bus='0x00' slot='0x00' function='0x0'/>\
         </hostdev></devices>"
    )
}

fn cloud_init(name: &str, ssh_public_key: &str) -> String {
    format!(
        "#cloud-config\nfqdn: {name}\nssh_pwauth: false\nusers:\n  - name: root\n    \
         sudo: ['ALL=(ALL) NOPASSWD:ALL']\n    lock_passwd: true\n    shell: /bin/bash\n    \
         ssh_authorized_keys:\n      - {ssh_public_key}\n"
    )
}

fn power_state(raw: &str) -> Option<PowerState> {
    Some(match raw {
        "Running" => PowerState::Running,
        "Stopped" => PowerState::Stopped,
        "Starting" | "Migrating" => PowerState::Starting,
        "Stopping" => PowerState::Stopping,
        "Destroyed" | "Expunging" | "Expunged" => return None,
        _ => PowerState::Error,
    })
}

fn parse_rule(live: &Value, observed: &PortForwardingRule) -> PortForwardingRule {
    let protocol = str_at(live, "/protocol");
    PortForwardingRule {
        id: str_at(live, "/id"),
        name: observed.name.clone(),
        vm_id: str_at(live, "/virtualmachineid"),
        network_id: str_at(live, "/networkid"),
        ip_address_id: str_at(live, "/ipaddressid"),
        public_port: port_at(live, "/publicport"),
        private_port: port_at(live, "/privateport"),
        protocol: if protocol.eq_ignore_ascii_case(&observed.protocol) {
            observed.protocol.clone()
        } else {
            protocol
        },
        created_at: observed.created_at,
    }
}

fn parse_snapshot(live: &Value, observed: &CsSnapshot) -> CsSnapshot {
    CsSnapshot {
        id: str_at(live, "/id"),
        name: str_at(live, "/displayname"),
        vm_id: str_at(live, "/virtualmachineid"),
        description: str_at(live, "/description"),
        state: observed.state.clone(),
        user_created: observed.user_created,
        created_at: parse_time(&str_at(live, "/created")),
    }
}

#[async_trait]
impl Provider<CsVm> for HttpCloudStack {
    async fn read(&self, observed: &CsVm) -> ProviderResult<Option<CsVm>> {
        match self.find_vm("id", &observed.id).await? {
            Some(live) => self.parse_live_vm(&live, observed).await.map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, desired: &CsVm) -> ProviderResult<CsVm> {
        if let Some(existing) = self.find_vm("name", &desired.name).await? {
            debug!(name = %desired.name, "VM already exists, adopting");
            return self.parse_live_vm(&existing, desired).await;
        }
        let offering = self.service_offering().await?;
        let mut params = self.sizing(offering, desired);
        params.extend([
            ("templateid", desired.template_id.clone()),
            ("zoneid", desired.zone_id.clone()),
            ("networkids", desired.network_id.clone()),
            ("name", desired.name.clone()),
            ("displayname", desired.name.clone()),
            ("rootdisksize", desired.disk_size.to_string()),
            (
                "userdata",
                STANDARD.encode(cloud_init(&desired.name, &desired.ssh_public_key)),
            ),
        ]);
        if let Some(host) = &desired.host_name {
            params.push(("hostid", self.host_id(host).await?));
        }
        let result = self.call_async("deployVirtualMachine", params).await?;
        let live = result
            .get("virtualmachine")
            .ok_or_else(|| ProviderError::Permanent("deployVirtualMachine returned no vm".into()))?;
        info!(name = %desired.name, "CloudStack VM deployed");
        self.parse_live_vm(live, desired).await
    }

    async fn update(&self, desired: &CsVm) -> ProviderResult<CsVm> {
        let live = Provider::<CsVm>::read(self, desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("vm", &desired.name))?;
        if live.name != desired.name {
            self.call(
                "updateVirtualMachine",
                vec![
                    ("id", desired.id.clone()),
                    ("name", desired.name.clone()),
                    ("displayname", desired.name.clone()),
                ],
            )
            .await?;
        }
        if live.cpu_cores != desired.cpu_cores || live.ram != desired.ram {
            let was_running = self.power_state(&desired.id).await? == Some(PowerState::Running);
            self.stop(&desired.id).await?;
            let offering = self.service_offering().await?;
            let mut params = self.sizing(offering, desired);
            params.push(("id", desired.id.clone()));
            self.call("changeServiceForVirtualMachine", params).await?;
            if was_running {
                self.start_on(&desired.id, desired.host_name.as_deref())
                    .await?;
            }
        }
        if desired.disk_size > live.disk_size {
            let volumes = self
                .call(
                    "listVolumes",
                    vec![
                        ("virtualmachineid", desired.id.clone()),
                        ("type", "ROOT".to_string()),
                    ],
                )
                .await?;
            let volume_id = str_at(&volumes, "/volume/0/id");
            self.call_async(
                "resizeVolume",
                vec![("id", volume_id), ("size", desired.disk_size.to_string())],
            )
            .await?;
        }
        Provider::<CsVm>::read(self, desired)
            .await?
            .ok_or_else(|| ProviderError::not_found("vm", &desired.name))
    }

    async fn delete(&self, observed: &CsVm) -> ProviderResult<()> {
        let result = self
            .call_async(
                "destroyVirtualMachine",
                vec![("id", observed.id.clone()), ("expunge", "true".to_string())],
            )
            .await;
        gone_ok(result.map(|_| ()))
    }
}

#[async_trait]
impl Provider<PortForwardingRule> for HttpCloudStack {
    async fn read(
        &self,
        observed: &PortForwardingRule,
    ) -> ProviderResult<Option<PortForwardingRule>> {
        let list = self
            .call("listPortForwardingRules", vec![("id", observed.id.clone())])
            .await;
        let list = match list {
            Err(e) if e.is_not_found() => return Ok(None),
            other => other?,
        };
        Ok(array_at(&list, "/portforwardingrule")
            .first()
            .map(|live| parse_rule(live, observed)))
    }

    async fn create(&self, desired: &PortForwardingRule) -> ProviderResult<PortForwardingRule> {
        let result = self
            .call_async(
                "createPortForwardingRule",
                vec![
                    ("ipaddressid", desired.ip_address_id.clone()),
                    ("privateport", desired.private_port.to_string()),
                    ("privateendport", desired.private_port.to_string()),
                    ("publicport", desired.public_port.to_string()),
                    ("publicendport", desired.public_port.to_string()),
                    ("protocol", desired.protocol.to_lowercase()),
                    ("virtualmachineid", desired.vm_id.clone()),
                    ("networkid", desired.network_id.clone()),
                    ("openfirewall", "false".to_string()),
                ],
            )
            .await?;
        let live = result.get("portforwardingrule").ok_or_else(|| {
            ProviderError::Permanent("createPortForwardingRule returned no rule".into())
        })?;
        let created = PortForwardingRule {
            created_at: Some(Utc::now()),
            ..desired.clone()
        };
        Ok(parse_rule(live, &created))
    }

    async fn update(&self, desired: &PortForwardingRule) -> ProviderResult<PortForwardingRule> {
        Provider::<PortForwardingRule>::delete(self, desired).await?;
        Provider::<PortForwardingRule>::create(self, desired).await
    }

    async fn delete(&self, observed: &PortForwardingRule) -> ProviderResult<()> {
        let result = self
            .call_async(
                "deletePortForwardingRule",
                vec![("id", observed.id.clone())],
            )
            .await;
        gone_ok(result.map(|_| ()))
    }
}

#[async_trait]
impl Provider<CsSnapshot> for HttpCloudStack {
    async fn read(&self, observed: &CsSnapshot) -> ProviderResult<Option<CsSnapshot>> {
        let list = self
            .call("listVMSnapshot", vec![("vmsnapshotid", observed.id.clone())])
            .await?;
        Ok(array_at(&list, "/vmSnapshot")
            .first()
            .map(|live| parse_snapshot(live, observed)))
    }

    async fn create(&self, desired: &CsSnapshot) -> ProviderResult<CsSnapshot> {
        let result = self
            .call_async(
                "createVMSnapshot",
                vec![
                    ("virtualmachineid", desired.vm_id.clone()),
                    ("name", desired.name.clone()),
                    ("description", desired.description.clone()),
                    ("snapshotmemory", "false".to_string()),
                ],
            )
            .await?;
        let live = result.get("vmsnapshot").ok_or_else(|| {
            ProviderError::Permanent("createVMSnapshot returned no snapshot".into())
        })?;
        info!(vm_id = %desired.vm_id, name = %desired.name, "VM snapshot created");
        Ok(parse_snapshot(live, desired))
    }

    async fn update(&self, desired: &CsSnapshot) -> ProviderResult<CsSnapshot> {
        Err(ProviderError::Permanent(format!(
            "snapshot {} cannot be updated",
            desired.name
        )))
    }

    async fn delete(&self, observed: &CsSnapshot) -> ProviderResult<()> {
        let result = self
            .call_async(
                "deleteVMSnapshot",
                vec![("vmsnapshotid", observed.id.clone())],
            )
            .await;
        gone_ok(result.map(|_| ()))
    }
}

#[async_trait]
impl CloudStackApi for HttpCloudStack {
    async fn list_hosts(&self) -> ProviderResult<Vec<HostCapacity>> {
        Ok(self.hosts().await?.iter().map(host_capacity).collect())
    }

    async fn list_gpus(&self) -> ProviderResult<Vec<GpuDevice>> {
        Ok(self.hosts().await?.iter().flat_map(host_gpus).collect())
    }

    async fn attach_gpu(&self, vm_id: &str, gpu_id: &str, host: &str) -> ProviderResult<()> {
        let bus = gpu_id
            .strip_suffix(&format!("-{host}"))
            .ok_or_else(|| ProviderError::Permanent(format!("gpu {gpu_id} is not on {host}")))?;
        self.stop(vm_id).await?;
        self.set_extra_config(vm_id, urlencoding::encode(&gpu_extra_config(bus)).into_owned())
            .await?;
        self.start_on(vm_id, Some(host)).await?;
        info!(vm_id, gpu_id, host, "GPU attached");
        Ok(())
    }

    async fn detach_gpu(&self, vm_id: &str) -> ProviderResult<()> {
        let was_running = self.power_state(vm_id).await? == Some(PowerState::Running);
        self.stop(vm_id).await?;
        self.set_extra_config(vm_id, String::new()).await?;
        if was_running {
            self.start_on(vm_id, None).await?;
        }
        info!(vm_id, "GPU detached");
        Ok(())
    }

    async fn power_state(&self, vm_id: &str) -> ProviderResult<Option<PowerState>> {
        Ok(self
            .find_vm("id", vm_id)
            .await?
            .and_then(|vm| power_state(&str_at(&vm, "/state"))))
    }

    async fn vm_action(&self, vm_id: &str, action: VmAction) -> ProviderResult<()> {
        let state = self
            .power_state(vm_id)
            .await?
            .ok_or_else(|| ProviderError::not_found("vm", vm_id))?;
        let command = match (action, state) {
            (VmAction::Start, PowerState::Stopped | PowerState::Error) => "startVirtualMachine",
            (VmAction::Stop, PowerState::Running | PowerState::Error) => "stopVirtualMachine",
            (VmAction::Reboot, PowerState::Stopped) => "startVirtualMachine",
            (VmAction::Reboot, PowerState::Running) => "rebootVirtualMachine",
            _ => {
                debug!(vm_id, ?action, ?state, "Power action not needed");
                return Ok(());
            }
        };
        self.call_async(command, vec![("id", vm_id.to_string())])
            .await?;
        Ok(())
    }

    async fn list_snapshots(&self, vm_id: &str) -> ProviderResult<Vec<CsSnapshot>> {
        let list = self
            .call(
                "listVMSnapshot",
                vec![("virtualmachineid", vm_id.to_string())],
            )
            .await?;
        Ok(array_at(&list, "/vmSnapshot")
            .iter()
            .map(|live| {
                let user_created = !str_at(live, "/description").starts_with("auto-");
                parse_snapshot(
                    live,
                    &CsSnapshot {
                        user_created,
                        ..Default::default()
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_is_sorted_and_signed() {
        let query = signed_query(
            "key",
            "secret",
            "listVirtualMachines",
            vec![("name", "my vm".to_string())],
        )
        .unwrap();
        let (unsigned, signature) = query.split_once("&signature=").unwrap();
        assert_eq!(
            unsigned,
            "apiKey=key&command=listVirtualMachines&name=my%20vm&response=json"
        );

        let mut mac = Hmac::<Sha1>::new_from_slice(b"secret").unwrap();
        mac.update(unsigned.to_lowercase().as_bytes());
        let expected = STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(urlencoding::decode(signature).unwrap(), expected);
    }

    #[test]
    fn test_timestamps_without_colon_offset() {
        let t = parse_time("2025-01-01T01:00:00+0100").unwrap();
        assert_eq!(t.timestamp(), 1_735_689_600);
        assert!(parse_time("").is_none());
    }

    #[test]
    fn test_host_capacity() {
        let host = json!({
            "name": "h1",
            "cpunumber": 32,
            "cpuallocated": "25%",
            "memorytotal": 64 * GIB,
            "memoryallocatedbytes": 16 * GIB,
            "resourcestate": "Enabled",
        });
        let capacity = host_capacity(&host);
        assert_eq!(capacity.cpu_cores_used, 8);
        assert_eq!(capacity.free_ram(), 48);
        assert!(capacity.enabled);
    }

    #[test]
    fn test_gpus_from_host_tags() {
        let host = json!({
            "name": "h1",
            "hosttags": "ssd,gpu:81:NVIDIA A100, gpu:c1:NVIDIA A100",
        });
        let gpus = host_gpus(&host);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].id, "81-h1");
        assert_eq!(gpus[1].id, "c1-h1");
        assert_eq!(gpus[0].name, "NVIDIA A100");
        assert!(gpu_extra_config("81").contains("bus='0x81'"));
    }

    #[test]
    fn test_power_states() {
        assert_eq!(power_state("Running"), Some(PowerState::Running));
        assert_eq!(power_state("Migrating"), Some(PowerState::Starting));
        assert_eq!(power_state("Expunging"), None);
        assert_eq!(power_state("Unknown"), Some(PowerState::Error));
    }

    #[test]
    fn test_rule_keeps_declared_protocol_case() {
        let observed = PortForwardingRule {
            name: "ssh".to_string(),
            protocol: "TCP".to_string(),
            ..Default::default()
        };
        let live = json!({
            "id": "r-1",
            "virtualmachineid": "vm-1",
            "publicport": "20001",
            "privateport": "22",
            "protocol": "tcp",
        });
        let rule = parse_rule(&live, &observed);
        assert_eq!(rule.protocol, "TCP");
        assert_eq!(rule.public_port, 20001);
        assert_eq!(rule.name, "ssh");
    }
}
