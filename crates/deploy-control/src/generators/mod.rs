// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Desired-state generators.
//!
//! Each generator is a pure function from a resource document, its zone and
//! explicit parameters to the provider objects that should exist. Fields the
//! provider assigns (IDs, creation times, robot secrets, allocated ports) are
//! copied from the observed object when one is recorded, so regenerating the
//! desired state of a converged resource yields exactly what is observed.

use deploy_core::model::subsystems::SubsystemObject;
use deploy_core::model::subsystems::k8s::{
    Ingress, K8sDeployment, K8sJob, K8sSubsystem, Namespace, PersistentVolume,
    PersistentVolumeClaim, Secret, Service,
};

pub mod cs;
pub mod github;
pub mod harbor;
pub mod k8s;
pub mod naming;

/// Desired Kubernetes objects of one resource, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sDesired {
    /// Namespace holding everything else.
    pub namespace: Option<Namespace>,
    /// Secrets.
    pub secrets: Vec<Secret>,
    /// Volumes.
    pub pvs: Vec<PersistentVolume>,
    /// Claims.
    pub pvcs: Vec<PersistentVolumeClaim>,
    /// Workloads.
    pub deployments: Vec<K8sDeployment>,
    /// Services.
    pub services: Vec<Service>,
    /// Ingresses.
    pub ingresses: Vec<Ingress>,
    /// One-shot jobs.
    pub jobs: Vec<K8sJob>,
}

impl K8sDesired {
    /// Copy provider-assigned fields from the observed subsystem.
    pub fn preserve(mut self, observed: &K8sSubsystem) -> Self {
        if let (Some(ns), Some(obs)) = (self.namespace.as_mut(), observed.namespace.as_ref()) {
            preserve_one(ns, obs);
        }
        preserve_all(&mut self.secrets, |n| observed.secret_map.get(n));
        preserve_all(&mut self.pvs, |n| observed.pv_map.get(n));
        preserve_all(&mut self.pvcs, |n| observed.pvc_map.get(n));
        preserve_all(&mut self.deployments, |n| observed.deployment_map.get(n));
        preserve_all(&mut self.services, |n| observed.service_map.get(n));
        preserve_all(&mut self.ingresses, |n| observed.ingress_map.get(n));
        preserve_all(&mut self.jobs, |n| observed.job_map.get(n));
        self
    }

    /// Whether the set holds no object at all.
    pub fn is_empty(&self) -> bool {
        self.namespace.is_none()
            && self.secrets.is_empty()
            && self.pvs.is_empty()
            && self.pvcs.is_empty()
            && self.deployments.is_empty()
            && self.services.is_empty()
            && self.ingresses.is_empty()
            && self.jobs.is_empty()
    }
}

fn preserve_one<T: SubsystemObject>(desired: &mut T, observed: &T) {
    if observed.is_created() && !observed.is_placeholder() {
        desired.preserve_from(observed);
    }
}

fn preserve_all<'a, T, F>(desired: &mut [T], lookup: F)
where
    T: SubsystemObject + 'a,
    F: Fn(&str) -> Option<&'a T>,
{
    for object in desired.iter_mut() {
        if let Some(observed) = lookup(object.object_name()) {
            preserve_one(object, observed);
        }
    }
}
