// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment lifecycle through the HTTP API.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};

use deploy_control::api::webhooks::sign;
use deploy_control::generators::github::GITHUB_HOOK_PATH;
use deploy_control::providers::memory::MemoryObject;
use deploy_control::workers::{Confirmer, Repairer, Worker};
use deploy_core::model::subsystems::k8s::{Ingress, K8sDeployment};

use common::TestContext;

async fn create(ctx: &TestContext, body: Value) -> String {
    let (status, accepted) = ctx.call("POST", "/v1/deployments", "key-1", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{accepted}");
    ctx.run_jobs().await;
    accepted["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_happy_path_deployment() {
    let ctx = TestContext::new().await;
    let body = json!({
        "name": "a1",
        "image": "nginx",
        "internalPort": 80,
        "replicas": 1,
        "zone": "z1",
        "envs": [{"name": "MODE", "value": "prod"}],
    });
    let id = create(&ctx, body).await;

    let (status, d) = ctx.call("GET", &format!("/v1/deployments/{id}"), "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(d["status"], "resourceCreated");
    assert_eq!(d["url"], "https://a1.z1.example");
    assert_eq!(d["activities"], json!([]));
    assert_eq!(d["image"], "nginx");
    assert_eq!(d["internalPort"], 80);
    assert_eq!(d["replicas"], 1);
    assert_eq!(d["envs"][0]["name"], "MODE");

    let doc = ctx.platform.deployments.get(&id).await.unwrap();
    assert!(doc.subsystems.k8s.deployment_map.contains_key("a1"));
    assert!(doc.subsystems.k8s.service_map.contains_key("a1"));
    assert!(doc.subsystems.k8s.ingress_map.contains_key("a1"));

    let (status, list) = ctx.call("GET", "/v1/deployments", "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    let (_, other) = ctx.call("GET", "/v1/deployments", "key-2", None).await;
    assert_eq!(other, json!([]));
}

#[tokio::test]
async fn test_resubmitted_jobs_are_not_queued_twice() {
    let ctx = TestContext::new().await;
    let body = json!({"name": "a1", "image": "nginx", "zone": "z1"});
    let uri = "/v1/deployments?jobId=create-a1";

    let (status, first) = ctx.call("POST", uri, "key-1", Some(body.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = ctx.call("POST", uri, "key-1", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first, second);
    assert_eq!(first["jobId"], "create-a1");

    let jobs = ctx.platform.jobs.list(&Default::default(), None).await.unwrap();
    assert_eq!(jobs.iter().filter(|j| j.id == "create-a1").count(), 1);
    assert_eq!(ctx.run_jobs().await, 1);

    let (status, job) = ctx.call("GET", "/v1/jobs/create-a1", "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "finished");

    let id = first["id"].as_str().unwrap();
    let uri = format!("/v1/deployments/{id}/command?jobId=restart-a1");
    let restart = json!({"command": "restart"});
    let (status, first) = ctx.call("POST", &uri, "key-1", Some(restart.clone())).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    let (status, second) = ctx.call("POST", &uri, "key-1", Some(restart)).await;
    assert_eq!(status, StatusCode::OK, "{second}");
    assert_eq!(first, second);
    assert_eq!(first["jobId"], "restart-a1");
    assert_eq!(ctx.run_jobs().await, 1);

    let (status, d) = ctx.call("GET", &format!("/v1/deployments/{id}"), "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(d["activities"], json!([]));
}

#[tokio::test]
async fn test_converged_deployment_needs_no_provider_calls() {
    let ctx = TestContext::new().await;
    let id = create(&ctx, json!({"name": "a1", "image": "nginx", "zone": "z1"})).await;
    let before_doc = ctx.platform.deployments.get(&id).await.unwrap();
    let calls = ctx.provider_calls();

    let uri = format!("/v1/deployments/{id}");
    let (status, accepted) = ctx.call("POST", &uri, "key-1", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(accepted["jobId"].is_null());

    let (status, _) = ctx
        .call("POST", &format!("{uri}/command"), "key-1", Some(json!({"command": "repair"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    ctx.run_jobs().await;

    assert_eq!(ctx.provider_calls(), calls);
    let after_doc = ctx.platform.deployments.get(&id).await.unwrap();
    assert_eq!(after_doc.updated_at, before_doc.updated_at);
    assert_eq!(after_doc.subsystems, before_doc.subsystems);
    assert!(after_doc.activities.is_empty());
}

#[tokio::test]
async fn test_update_changes_workload_and_clears_activity() {
    let ctx = TestContext::new().await;
    let id = create(&ctx, json!({"name": "a1", "image": "nginx", "zone": "z1"})).await;

    let uri = format!("/v1/deployments/{id}");
    let patch = json!({"image": "nginx:1.27", "replicas": 2});
    let (status, accepted) = ctx.call("POST", &uri, "key-1", Some(patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(accepted["jobId"].is_string());

    let (_, busy) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(busy["activities"], json!(["updating"]));

    ctx.run_jobs().await;
    let (_, d) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(d["image"], "nginx:1.27");
    assert_eq!(d["replicas"], 2);
    assert_eq!(d["activities"], json!([]));
    assert!(d["updatedAt"].is_string());

    let workload = ctx.platform.deployments.get(&id).await.unwrap();
    let live = ctx
        .providers
        .kube_for("z1")
        .backend
        .get::<K8sDeployment>(&workload.subsystems.k8s.deployment_map["a1"].key())
        .await
        .unwrap();
    assert_eq!(live.replicas, 2);
}

#[tokio::test]
async fn test_busy_deployment_rejects_commands() {
    let ctx = TestContext::new().await;
    let id = create(&ctx, json!({"name": "a1", "image": "nginx", "zone": "z1"})).await;
    let uri = format!("/v1/deployments/{id}");

    let (status, _) = ctx.call("DELETE", &uri, "key-1", None).await;
    assert_eq!(status, StatusCode::OK);

    let restart = json!({"command": "restart"});
    let (status, body) = ctx
        .call("POST", &format!("{uri}/command"), "key-1", Some(restart))
        .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["code"], "activity_blocked");
    assert!(body["error"].as_str().unwrap().contains("beingDeleted"));
}

#[tokio::test]
async fn test_delete_removes_every_provider_object() {
    let ctx = TestContext::new().await;
    let id = create(&ctx, json!({"name": "a1", "image": "nginx", "zone": "z1"})).await;
    let kube = ctx.providers.kube_for("z1");
    assert_eq!(kube.backend.count::<K8sDeployment>().await, 1);

    let uri = format!("/v1/deployments/{id}");
    let (status, _) = ctx.call("DELETE", &uri, "key-1", None).await;
    assert_eq!(status, StatusCode::OK);
    ctx.run_jobs().await;

    assert_eq!(kube.backend.count::<K8sDeployment>().await, 0);
    assert_eq!(kube.backend.count::<Ingress>().await, 0);
    let (status, _) = ctx.call("GET", &uri, "key-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Confirmer::new(ctx.platform.clone()).run_once().await.unwrap();
    let gone = ctx.platform.deployments.find_including_deleted(&id).await.unwrap();
    assert!(gone.is_none());
}

#[tokio::test]
async fn test_repairer_recreates_externally_deleted_workload() {
    let ctx = TestContext::new().await;
    let id = create(&ctx, json!({"name": "a1", "image": "nginx", "zone": "z1"})).await;
    let before = ctx.platform.deployments.get(&id).await.unwrap();
    let observed = before.subsystems.k8s.deployment_map["a1"].clone();

    let kube = ctx.providers.kube_for("z1");
    assert!(kube.backend.remove::<K8sDeployment>(&observed.key()).await);

    let repairer = Repairer::new(ctx.platform.clone()).with_quiescence(Duration::ZERO);
    assert!(repairer.run_once().await.unwrap());
    ctx.run_jobs().await;

    let after = ctx.platform.deployments.get(&id).await.unwrap();
    let recreated = &after.subsystems.k8s.deployment_map["a1"];
    assert_ne!(recreated.id, observed.id);
    assert_eq!(after.spec, before.spec);
    assert_eq!(kube.backend.count::<K8sDeployment>().await, 1);
}

#[tokio::test]
async fn test_custom_domain_in_use_is_rejected() {
    let ctx = TestContext::new().await;
    let a1 = json!({"name": "a1", "image": "nginx", "zone": "z1", "customDomain": "foo.example"});
    create(&ctx, a1).await;
    let a2 = create(&ctx, json!({"name": "a2", "image": "nginx", "zone": "z1"})).await;
    let before = ctx.platform.deployments.get(&a2).await.unwrap();
    let calls = ctx.provider_calls();

    let uri = format!("/v1/deployments/{a2}");
    let patch = json!({"customDomain": "foo.example"});
    let (status, body) = ctx.call("POST", &uri, "key-1", Some(patch)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "custom_domain_in_use");

    ctx.run_jobs().await;
    let after = ctx.platform.deployments.get(&a2).await.unwrap();
    assert_eq!(
        after.subsystems.k8s.ingress_map,
        before.subsystems.k8s.ingress_map
    );
    assert!(after.activities.is_empty());
    assert_eq!(ctx.provider_calls(), calls);
}

#[tokio::test]
async fn test_github_hook_with_bad_signature_is_rejected() {
    let ctx = TestContext::new().await;
    let body = json!({
        "name": "app",
        "zone": "z1",
        "github": {"token": "gho_x", "repositoryId": 42},
    });
    let id = create(&ctx, body).await;
    let d = ctx.platform.deployments.get(&id).await.unwrap();
    let hook = d.subsystems.github.webhook.clone().unwrap();
    assert!(!hook.id.is_empty());
    let jobs_before = ctx.platform.jobs.list(&Default::default(), None).await.unwrap().len();

    let payload = br#"{
        "ref": "refs/heads/main",
        "after": "abc123",
        "repository": {"full_name": "acme/app", "default_branch": "main"}
    }"#;
    let forged = sign("not-the-secret", payload).unwrap();
    let request = Request::post(GITHUB_HOOK_PATH)
        .header("x-github-event", "push")
        .header("x-github-hook-id", hook.id.as_str())
        .header("x-hub-signature-256", forged)
        .body(Body::from(payload.to_vec()))
        .unwrap();
    let (status, _) = ctx.send(request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let jobs_after = ctx.platform.jobs.list(&Default::default(), None).await.unwrap().len();
    assert_eq!(jobs_after, jobs_before);

    let signed = sign(&hook.secret, payload).unwrap();
    let request = Request::post(GITHUB_HOOK_PATH)
        .header("x-github-event", "push")
        .header("x-github-hook-id", hook.id.as_str())
        .header("x-hub-signature-256", signed)
        .body(Body::from(payload.to_vec()))
        .unwrap();
    let (status, queued) = ctx.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queued["ids"], json!([id]));
}
