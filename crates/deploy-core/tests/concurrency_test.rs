// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Races between concurrent writers on one store.

mod common;

use std::collections::BTreeSet;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;

use deploy_core::model::NewJob;
use deploy_core::{Activity, ActivityOutcome};

use common::TestStore;

const CONTENDERS: usize = 8;

async fn race(store: &TestStore, id: &str, activity: Activity) -> Vec<ActivityOutcome> {
    let attempts = (0..CONTENDERS).map(|_| {
        let deployments = store.deployments.clone();
        let id = id.to_string();
        tokio::spawn(async move { deployments.add_activity(&id, activity).await })
    });
    join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_self_guarded_activity_starts_once() {
    let store = TestStore::new().await;
    store.deployment("d-1", "web").await;

    let outcomes = race(&store, "d-1", Activity::Repairing).await;
    let started = outcomes.iter().filter(|o| o.is_started()).count();
    assert_eq!(started, 1);
    assert!(
        outcomes
            .iter()
            .filter(|o| !o.is_started())
            .all(|o| *o == ActivityOutcome::Blocked(Activity::Repairing))
    );

    let d = store.deployments.get("d-1").await.unwrap();
    assert_eq!(d.activities, BTreeSet::from([Activity::Repairing]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_contenders_leave_consistent_activities() {
    let store = TestStore::new().await;
    store.deployment("d-1", "web").await;

    let restart = race(&store, "d-1", Activity::Restarting);
    let build = race(&store, "d-1", Activity::Building);
    let (restart, build) = tokio::join!(restart, build);

    assert_eq!(restart.iter().filter(|o| o.is_started()).count(), 1);
    assert_eq!(build.iter().filter(|o| o.is_started()).count(), 1);

    let d = store.deployments.get("d-1").await.unwrap();
    assert_eq!(
        d.activities,
        BTreeSet::from([Activity::Restarting, Activity::Building])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_hand_out_one_job_per_resource() {
    let store = TestStore::new().await;
    let now = Utc::now();
    for i in 0..3 {
        let job = NewJob {
            id: format!("job-{i}"),
            user_id: "user-1".to_string(),
            job_type: "repairDeployment".to_string(),
            args: json!({"id": "d-1"}),
            resource_id: Some("d-1".to_string()),
            version: "1.0.0".to_string(),
            created_at: now + chrono::Duration::milliseconds(i),
            run_after: now,
        };
        assert!(store.persistence.insert_job(&job).await.unwrap());
    }

    let claim_at = now + chrono::Duration::seconds(1);
    let claims = (0..CONTENDERS).map(|_| {
        let persistence = store.persistence.clone();
        tokio::spawn(async move { persistence.claim_job(claim_at).await })
    });
    let claimed: Vec<_> = join_all(claims)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "job-0");
}
