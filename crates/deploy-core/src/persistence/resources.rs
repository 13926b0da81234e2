// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed access to resource documents.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::activity::{Activity, ActivityOutcome};
use crate::error::{Result, StoreError};
use crate::model::{Document, Pagination, ResourceSpec, ResourceStatus};

use super::{
    DocumentColumn, DocumentPath, FieldUpdate, Persistence, ResourceFilter, ResourceRecord,
    Timestamp,
};

/// Partial update of a resource: identity fields plus spec paths.
#[derive(Debug, Clone, Default)]
pub struct UpdateParams {
    /// New name.
    pub name: Option<String>,
    /// New owner.
    pub owner_id: Option<String>,
    /// Spec paths to overwrite.
    pub spec: Vec<(DocumentPath, Value)>,
}

impl UpdateParams {
    /// Overwrite `path` in the spec with `value`.
    pub fn with_spec<T: Serialize>(mut self, path: &str, value: &T) -> Result<Self> {
        self.spec
            .push((DocumentPath::parse(path)?, serde_json::to_value(value)?));
        Ok(self)
    }

    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.owner_id.is_none() && self.spec.is_empty()
    }
}

/// Typed view over the documents of one resource kind.
pub struct ResourceStore<S: ResourceSpec> {
    persistence: Arc<dyn Persistence>,
    _spec: PhantomData<fn() -> S>,
}

impl<S: ResourceSpec> Clone for ResourceStore<S> {
    fn clone(&self) -> Self {
        Self {
            persistence: self.persistence.clone(),
            _spec: PhantomData,
        }
    }
}

impl<S: ResourceSpec> ResourceStore<S> {
    /// Create a store over `persistence`.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            _spec: PhantomData,
        }
    }

    /// Underlying persistence.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    fn to_record(doc: &Document<S>) -> Result<ResourceRecord> {
        Ok(ResourceRecord {
            id: doc.id.clone(),
            name: doc.name.clone(),
            owner_id: doc.owner_id.clone(),
            zone: doc.zone.clone(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
            repaired_at: doc.repaired_at,
            restarted_at: doc.restarted_at,
            deleted_at: doc.deleted_at,
            activities: doc.activities.clone(),
            spec: serde_json::to_value(&doc.spec)?,
            subsystems: serde_json::to_value(&doc.subsystems)?,
            status_code: doc.status_code,
            status_message: doc.status_message.clone(),
        })
    }

    fn from_record(record: ResourceRecord) -> Result<Document<S>> {
        Ok(Document {
            id: record.id,
            name: record.name,
            owner_id: record.owner_id,
            zone: record.zone,
            created_at: record.created_at,
            updated_at: record.updated_at,
            repaired_at: record.repaired_at,
            restarted_at: record.restarted_at,
            deleted_at: record.deleted_at,
            activities: record.activities,
            spec: serde_json::from_value(record.spec)?,
            subsystems: serde_json::from_value(record.subsystems)?,
            status_code: record.status_code,
            status_message: record.status_message,
        })
    }

    /// Insert a new document. The subsystem skeleton is written in full so
    /// later keyed writes always find their parent maps.
    pub async fn create(&self, doc: &Document<S>) -> Result<()> {
        let record = Self::to_record(doc)?;
        self.persistence.insert_resource(S::KIND, &record).await
    }

    /// Fetch a live document or fail with [`StoreError::NotFound`].
    pub async fn get(&self, id: &str) -> Result<Document<S>> {
        self.find(id)
            .await?
            .ok_or_else(|| StoreError::not_found(S::KIND.as_str(), id))
    }

    /// Fetch a live document.
    pub async fn find(&self, id: &str) -> Result<Option<Document<S>>> {
        self.persistence
            .get_resource(S::KIND, id, false)
            .await?
            .map(Self::from_record)
            .transpose()
    }

    /// Fetch a document even when soft-deleted.
    pub async fn find_including_deleted(&self, id: &str) -> Result<Option<Document<S>>> {
        self.persistence
            .get_resource(S::KIND, id, true)
            .await?
            .map(Self::from_record)
            .transpose()
    }

    /// Fetch a live document by name.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Document<S>>> {
        self.persistence
            .get_resource_by_name(S::KIND, name, false)
            .await?
            .map(Self::from_record)
            .transpose()
    }

    /// List documents ordered by creation.
    pub async fn list(
        &self,
        filter: &ResourceFilter,
        pagination: Option<Pagination>,
    ) -> Result<Vec<Document<S>>> {
        self.persistence
            .list_resources(S::KIND, filter, pagination)
            .await?
            .into_iter()
            .map(Self::from_record)
            .collect()
    }

    /// Apply identity changes and spec path writes.
    pub async fn update_with_params(&self, id: &str, params: &UpdateParams) -> Result<()> {
        let fields = FieldUpdate {
            name: params.name.clone(),
            owner_id: params.owner_id.clone(),
        };
        self.persistence
            .update_resource_fields(S::KIND, id, &fields)
            .await?;
        for (path, value) in &params.spec {
            self.persistence
                .set_document_path(S::KIND, id, DocumentColumn::Spec, path, value)
                .await?;
        }
        Ok(())
    }

    /// Record an observed subsystem object at `path`; `None` removes the key.
    pub async fn set_subsystem<T: Serialize + ?Sized>(
        &self,
        id: &str,
        path: &str,
        value: Option<&T>,
    ) -> Result<()> {
        let path = DocumentPath::parse(path)?;
        match value {
            Some(value) => {
                let value = serde_json::to_value(value)?;
                self.persistence
                    .set_document_path(S::KIND, id, DocumentColumn::Subsystems, &path, &value)
                    .await
            }
            None => {
                self.persistence
                    .unset_document_path(S::KIND, id, DocumentColumn::Subsystems, &path)
                    .await
            }
        }
    }

    /// Remove the subsystem key at `path`.
    pub async fn unset_subsystem(&self, id: &str, path: &str) -> Result<()> {
        self.set_subsystem::<Value>(id, path, None).await
    }

    /// Add `activity` unless one of its guards is present.
    pub async fn add_activity(&self, id: &str, activity: Activity) -> Result<ActivityOutcome> {
        self.persistence.add_activity(S::KIND, id, activity).await
    }

    /// Remove `activity`.
    pub async fn remove_activity(&self, id: &str, activity: Activity) -> Result<()> {
        self.persistence
            .remove_activity(S::KIND, id, activity)
            .await
    }

    /// Stamp `repaired_at`, optionally clearing an activity.
    pub async fn mark_repaired(&self, id: &str, clear: Option<Activity>) -> Result<()> {
        self.persistence
            .stamp_resource(S::KIND, id, Timestamp::Repaired, Utc::now(), clear)
            .await
    }

    /// Stamp `updated_at`, optionally clearing an activity.
    pub async fn mark_updated(&self, id: &str, clear: Option<Activity>) -> Result<()> {
        self.persistence
            .stamp_resource(S::KIND, id, Timestamp::Updated, Utc::now(), clear)
            .await
    }

    /// Stamp `restarted_at`, optionally clearing an activity.
    pub async fn mark_restarted(&self, id: &str, clear: Option<Activity>) -> Result<()> {
        self.persistence
            .stamp_resource(S::KIND, id, Timestamp::Restarted, Utc::now(), clear)
            .await
    }

    /// Soft-delete: the name becomes free, the row stays readable.
    pub async fn mark_deleted(&self, id: &str) -> Result<()> {
        self.persistence
            .stamp_resource(S::KIND, id, Timestamp::Deleted, Utc::now(), None)
            .await
    }

    /// Documents without activities whose last repair is older than `older_than`.
    pub async fn get_with_no_activities(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Document<S>>> {
        self.persistence
            .list_quiescent_resources(S::KIND, older_than, limit)
            .await?
            .into_iter()
            .map(Self::from_record)
            .collect()
    }

    /// Record the lifecycle status.
    pub async fn set_status(
        &self,
        id: &str,
        status: ResourceStatus,
        message: impl AsRef<str>,
    ) -> Result<()> {
        self.persistence
            .set_resource_status(S::KIND, id, status, message.as_ref())
            .await
    }

    /// Remove the row entirely.
    pub async fn purge(&self, id: &str) -> Result<()> {
        self.persistence.delete_resource(S::KIND, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::subsystems::k8s::{K8sDeployment, Namespace};
    use crate::model::vm::VmSpecs;
    use crate::model::{App, Deployment, DeploymentSpec, DeploymentType, Vm, VmSpec};
    use crate::persistence::SqlitePersistence;

    async fn stores() -> (ResourceStore<DeploymentSpec>, ResourceStore<VmSpec>) {
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("Failed to create store"),
        );
        (
            ResourceStore::new(persistence.clone()),
            ResourceStore::new(persistence),
        )
    }

    fn deployment(name: &str) -> Deployment {
        Deployment::new(
            uuid::Uuid::new_v4().to_string(),
            name,
            "user-1",
            "se-sto",
            DeploymentSpec::single(DeploymentType::Prebuilt, App::new("nginx:1.25", 80)),
        )
    }

    #[tokio::test]
    async fn test_create_and_get_typed() {
        let (deployments, _) = stores().await;
        let doc = deployment("web");
        deployments.create(&doc).await.unwrap();

        let fetched = deployments.get(&doc.id).await.unwrap();
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.spec, doc.spec);
        assert!(fetched.has_activity(Activity::BeingCreated));
        assert!(fetched.subsystems.k8s.deployment_map.is_empty());
    }

    #[tokio::test]
    async fn test_set_and_unset_subsystem() {
        let (deployments, _) = stores().await;
        let doc = deployment("web");
        deployments.create(&doc).await.unwrap();

        let namespace = Namespace {
            id: "ns-1".to_string(),
            name: "user-1".to_string(),
            created_at: None,
        };
        deployments
            .set_subsystem(&doc.id, "k8s.namespace", Some(&namespace))
            .await
            .unwrap();
        let workload = K8sDeployment {
            id: "d-1".to_string(),
            name: "main".to_string(),
            ..Default::default()
        };
        deployments
            .set_subsystem(&doc.id, "k8s.deploymentMap.main", Some(&workload))
            .await
            .unwrap();

        let fetched = deployments.get(&doc.id).await.unwrap();
        assert_eq!(fetched.subsystems.k8s.namespace, Some(namespace));
        assert_eq!(fetched.subsystems.k8s.deployment_map["main"], workload);

        deployments
            .unset_subsystem(&doc.id, "k8s.deploymentMap.main")
            .await
            .unwrap();
        deployments
            .set_subsystem::<Namespace>(&doc.id, "k8s.namespace", None)
            .await
            .unwrap();
        let fetched = deployments.get(&doc.id).await.unwrap();
        assert!(fetched.subsystems.k8s.deployment_map.is_empty());
        assert!(fetched.subsystems.k8s.namespace.is_none());
    }

    #[tokio::test]
    async fn test_update_with_params() {
        let (deployments, _) = stores().await;
        let doc = deployment("web");
        deployments.create(&doc).await.unwrap();

        let params = UpdateParams {
            name: Some("web-2".to_string()),
            ..Default::default()
        }
        .with_spec("apps.main.replicas", &3)
        .unwrap();
        deployments.update_with_params(&doc.id, &params).await.unwrap();

        let fetched = deployments.get(&doc.id).await.unwrap();
        assert_eq!(fetched.name, "web-2");
        assert_eq!(fetched.spec.apps["main"].replicas, 3);
        assert_eq!(fetched.spec.apps["main"].image, "nginx:1.25");
    }

    #[tokio::test]
    async fn test_soft_delete_hides_document() {
        let (_, vms) = stores().await;
        let spec = VmSpec {
            ssh_public_key: "ssh-ed25519 AAAA".to_string(),
            specs: VmSpecs {
                cpu_cores: 2,
                ram: 4,
                disk_size: 20,
            },
            ports: Vec::new(),
            host: None,
            gpu: None,
        };
        let vm = Vm::new("vm-1", "box", "user-1", "se-sto", spec);
        vms.create(&vm).await.unwrap();

        vms.mark_deleted("vm-1").await.unwrap();
        assert!(vms.find("vm-1").await.unwrap().is_none());
        assert!(matches!(
            vms.get("vm-1").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        let deleted = vms.find_including_deleted("vm-1").await.unwrap().unwrap();
        assert!(deleted.is_being_deleted());
    }

    #[tokio::test]
    async fn test_mark_repaired_clears_activity() {
        let (deployments, _) = stores().await;
        let doc = deployment("web");
        deployments.create(&doc).await.unwrap();

        deployments
            .mark_repaired(&doc.id, Some(Activity::BeingCreated))
            .await
            .unwrap();
        let fetched = deployments.get(&doc.id).await.unwrap();
        assert!(fetched.activities.is_empty());
        assert!(fetched.repaired_at.is_some());
    }
}
