// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM lifecycle and GPU leases through the HTTP API.

mod common;

use axum::http::StatusCode;
use chrono::Duration;
use serde_json::{Value, json};

use deploy_control::providers::GpuDevice;
use deploy_control::services::gpus;
use deploy_control::workers::GpuLeaseEnforcer;
use deploy_core::model::subsystems::cs::CsVm;

use common::TestContext;

fn vm_body(name: &str) -> Value {
    json!({
        "name": name,
        "zone": "vz",
        "sshPublicKey": "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFake user@host",
        "cpuCores": 2,
        "ram": 4,
        "diskSize": 20,
        "ports": [{"name": "ssh", "port": 22}],
    })
}

async fn create_vm(ctx: &TestContext, name: &str) -> String {
    let (status, accepted) = ctx.call("POST", "/v1/vms", "key-1", Some(vm_body(name))).await;
    assert_eq!(status, StatusCode::OK, "{accepted}");
    ctx.run_jobs().await;
    accepted["id"].as_str().unwrap().to_string()
}

async fn install_gpu(ctx: &TestContext) {
    ctx.providers
        .cloudstack_for("vz")
        .put_gpu(GpuDevice {
            id: "g1".to_string(),
            name: "A100".to_string(),
            host: "host-1".to_string(),
        })
        .await;
    assert_eq!(gpus::sync_inventory(&ctx.platform).await.unwrap(), 1);
}

#[tokio::test]
async fn test_vm_create_and_delete() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    let cloudstack = ctx.providers.cloudstack_for("vz");
    assert_eq!(cloudstack.backend.count::<CsVm>().await, 1);

    let uri = format!("/v1/vms/{id}");
    let (status, vm) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vm["status"], "resourceCreated");
    assert_eq!(vm["specs"]["cpuCores"], 2);
    assert_eq!(vm["ports"][0]["name"], "ssh");
    assert!(vm["ports"][0]["publicPort"].is_u64());
    assert_eq!(vm["activities"], json!([]));

    let (status, _) = ctx.call("GET", &uri, "key-2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = ctx.call("DELETE", &uri, "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    ctx.run_jobs().await;
    assert_eq!(cloudstack.backend.count::<CsVm>().await, 0);
}

#[tokio::test]
async fn test_gpu_lease_expires_and_is_detached() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    install_gpu(&ctx).await;

    let uri = format!("/v1/vms/{id}");
    let attach = json!({"command": "attachGpu", "gpuId": "g1", "leaseHours": 1});
    let (status, accepted) = ctx
        .call("POST", &format!("{uri}/command"), "key-1", Some(attach))
        .await;
    assert_eq!(status, StatusCode::OK, "{accepted}");
    ctx.run_jobs().await;

    let (_, vm) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(vm["gpu"]["id"], "g1");
    assert_eq!(vm["activities"], json!([]));

    let (status, listed) = ctx.call("GET", "/v1/vms/gpus", "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["id"], "g1");
    assert_eq!(listed[0]["lease"]["vmId"], id.as_str());

    let lease = ctx
        .platform
        .persistence
        .get_gpu("g1")
        .await
        .unwrap()
        .and_then(|gpu| gpu.lease)
        .unwrap();
    let enforcer = GpuLeaseEnforcer::new(ctx.platform.clone());
    assert_eq!(enforcer.tick_at(lease.ends_at - Duration::minutes(1)).await.unwrap(), 0);
    assert_eq!(enforcer.tick_at(lease.ends_at + Duration::seconds(1)).await.unwrap(), 1);
    ctx.run_jobs().await;

    let (_, vm) = ctx.call("GET", &uri, "key-1", None).await;
    assert!(vm["gpu"].is_null());
    assert_eq!(vm["activities"], json!([]));
    let (_, listed) = ctx.call("GET", "/v1/vms/gpus", "key-1", None).await;
    assert!(listed[0]["lease"].is_null());
    let gpu = ctx.platform.persistence.get_gpu("g1").await.unwrap().unwrap();
    assert!(gpu.lease.is_none());
}

#[tokio::test]
async fn test_leased_gpu_cannot_be_taken() {
    let ctx = TestContext::new().await;
    let first = create_vm(&ctx, "vm1").await;
    let second = create_vm(&ctx, "vm2").await;
    install_gpu(&ctx).await;

    let attach = json!({"command": "attachGpu", "gpuId": "g1", "leaseHours": 1});
    let (status, _) = ctx
        .call("POST", &format!("/v1/vms/{first}/command"), "key-1", Some(attach.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    ctx.run_jobs().await;

    let (status, body) = ctx
        .call("POST", &format!("/v1/vms/{second}/command"), "key-1", Some(attach))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("g1"));

    let any = json!({"command": "attachGpu"});
    let (status, _) = ctx
        .call("POST", &format!("/v1/vms/{second}/command"), "key-1", Some(any))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_lease_beyond_quota_is_rejected() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    install_gpu(&ctx).await;

    let attach = json!({"command": "attachGpu", "leaseHours": 48});
    let (status, body) = ctx
        .call("POST", &format!("/v1/vms/{id}/command"), "key-1", Some(attach))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "quota_exceeded");

    let forever = json!({"command": "attachGpu", "neverExpire": true});
    let (status, _) = ctx
        .call("POST", &format!("/v1/vms/{id}/command"), "key-1", Some(forever))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_terminated_command_releases_vm() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    let uri = format!("/v1/vms/{id}");

    let reboot = json!({"command": "reboot"});
    let (status, accepted) = ctx
        .call("POST", &format!("{uri}/command"), "key-1", Some(reboot.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "{accepted}");
    let job_uri = format!("/v1/jobs/{}", accepted["jobId"].as_str().unwrap());

    let cancel = json!({"status": "terminated"});
    let (status, job) = ctx.call("POST", &job_uri, "key-admin", Some(cancel)).await;
    assert_eq!(status, StatusCode::OK, "{job}");
    assert_eq!(job["status"], "terminated");
    assert_eq!(ctx.run_jobs().await, 0);

    let (_, vm) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(vm["activities"], json!([]));
    let (status, _) = ctx
        .call("POST", &format!("{uri}/command"), "key-1", Some(reboot))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_admin_lease_is_bounded() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    install_gpu(&ctx).await;
    let command = format!("/v1/vms/{id}/command");

    let huge = json!({"command": "attachGpu", "gpuId": "g1", "leaseHours": 1e12});
    let (status, body) = ctx.call("POST", &command, "key-admin", Some(huge)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");

    let (_, vm) = ctx.call("GET", &format!("/v1/vms/{id}"), "key-admin", None).await;
    assert_eq!(vm["activities"], json!([]));

    let long = json!({"command": "attachGpu", "gpuId": "g1", "leaseHours": 720});
    let (status, accepted) = ctx.call("POST", &command, "key-admin", Some(long)).await;
    assert_eq!(status, StatusCode::OK, "{accepted}");
    ctx.run_jobs().await;
    let (_, vm) = ctx.call("GET", &format!("/v1/vms/{id}"), "key-admin", None).await;
    assert_eq!(vm["gpu"]["id"], "g1");
}

#[tokio::test]
async fn test_resubmitted_gpu_attach_returns_same_job() {
    let ctx = TestContext::new().await;
    let id = create_vm(&ctx, "vm1").await;
    install_gpu(&ctx).await;

    let uri = format!("/v1/vms/{id}/command?jobId=attach-vm1");
    let attach = json!({"command": "attachGpu", "gpuId": "g1", "leaseHours": 1});
    let (status, first) = ctx.call("POST", &uri, "key-1", Some(attach.clone())).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    let (status, second) = ctx.call("POST", &uri, "key-1", Some(attach.clone())).await;
    assert_eq!(status, StatusCode::OK, "{second}");
    assert_eq!(first, second);
    assert_eq!(ctx.run_jobs().await, 1);

    let (status, again) = ctx.call("POST", &uri, "key-1", Some(attach)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["jobId"], "attach-vm1");
    assert_eq!(ctx.run_jobs().await, 0);
}
