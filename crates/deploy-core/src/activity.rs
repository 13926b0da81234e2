// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activities on a resource.
//!
//! An activity names an operation that is currently in progress. Starting an
//! activity is refused while any activity from its guard set is present:
//!
//! | Start activity | Blocked by |
//! |---|---|
//! | `beingCreated` | any |
//! | `beingDeleted` | `beingCreated` |
//! | `updating` | `beingCreated`, `beingDeleted` |
//! | `restarting` | `beingCreated`, `beingDeleted`, `restarting` |
//! | `repairing` | `beingCreated`, `beingDeleted`, `repairing` |
//! | `building` | `beingCreated`, `beingDeleted`, `building` |
//! | `attachingGpu` / `detachingGpu` | `beingCreated`, `beingDeleted`, `attachingGpu`, `detachingGpu` |

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// An in-progress operation on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Activity {
    /// The resource is being provisioned for the first time.
    BeingCreated,
    /// The resource is being torn down.
    BeingDeleted,
    /// A spec update is being applied.
    Updating,
    /// The workload is being restarted.
    Restarting,
    /// Observed state is being re-converged with the spec.
    Repairing,
    /// A new image is being built.
    Building,
    /// A GPU lease is being attached.
    #[serde(rename = "attachingGpu")]
    AttachingGpu,
    /// A GPU lease is being released.
    #[serde(rename = "detachingGpu")]
    DetachingGpu,
}

impl Activity {
    /// All activity variants.
    pub const ALL: [Activity; 8] = [
        Activity::BeingCreated,
        Activity::BeingDeleted,
        Activity::Updating,
        Activity::Restarting,
        Activity::Repairing,
        Activity::Building,
        Activity::AttachingGpu,
        Activity::DetachingGpu,
    ];

    /// Stored name of the activity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeingCreated => "beingCreated",
            Self::BeingDeleted => "beingDeleted",
            Self::Updating => "updating",
            Self::Restarting => "restarting",
            Self::Repairing => "repairing",
            Self::Building => "building",
            Self::AttachingGpu => "attachingGpu",
            Self::DetachingGpu => "detachingGpu",
        }
    }

    /// Activities whose presence blocks starting `self`.
    pub fn guards(&self) -> &'static [Activity] {
        use Activity::*;
        match self {
            BeingCreated => &Self::ALL,
            BeingDeleted => &[BeingCreated],
            Updating => &[BeingCreated, BeingDeleted],
            Restarting => &[BeingCreated, BeingDeleted, Restarting],
            Repairing => &[BeingCreated, BeingDeleted, Repairing],
            Building => &[BeingCreated, BeingDeleted, Building],
            AttachingGpu | DetachingGpu => {
                &[BeingCreated, BeingDeleted, AttachingGpu, DetachingGpu]
            }
        }
    }

    /// First activity in `present` that blocks starting `self`, if any.
    pub fn blocked_by<'a>(
        &self,
        present: impl IntoIterator<Item = &'a Activity>,
    ) -> Option<Activity> {
        let guards = self.guards();
        present.into_iter().find(|a| guards.contains(a)).copied()
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activity {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| StoreError::InvalidValue {
                field: "activity",
                value: s.to_string(),
            })
    }
}

/// Result of a conditional activity start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// The activity is now present on the resource.
    Started,
    /// The activity was refused because of the given present activity.
    Blocked(Activity),
}

impl ActivityOutcome {
    /// Whether the activity was started.
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }
}

/// A resource is ready when it is neither being created nor being deleted.
pub fn is_ready(activities: &BTreeSet<Activity>) -> bool {
    !activities.contains(&Activity::BeingCreated) && !activities.contains(&Activity::BeingDeleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_being_created_blocked_by_everything() {
        for a in Activity::ALL {
            assert_eq!(Activity::BeingCreated.blocked_by([&a]), Some(a));
        }
    }

    #[test]
    fn test_restart_guards() {
        let present = [Activity::Updating];
        assert_eq!(Activity::Restarting.blocked_by(&present), None);

        let present = [Activity::Updating, Activity::BeingDeleted];
        assert_eq!(
            Activity::Restarting.blocked_by(&present),
            Some(Activity::BeingDeleted)
        );

        let present = [Activity::Restarting];
        assert_eq!(
            Activity::Restarting.blocked_by(&present),
            Some(Activity::Restarting)
        );
    }

    #[test]
    fn test_gpu_activities_block_each_other() {
        let present = [Activity::AttachingGpu];
        assert_eq!(
            Activity::DetachingGpu.blocked_by(&present),
            Some(Activity::AttachingGpu)
        );
        assert_eq!(Activity::Updating.blocked_by(&present), None);
    }

    #[test]
    fn test_round_trip_names() {
        for a in Activity::ALL {
            assert_eq!(a.as_str().parse::<Activity>().unwrap(), a);
            let json = serde_json::to_string(&a).unwrap();
            assert_eq!(json, format!("\"{}\"", a.as_str()));
        }
        assert!("sleeping".parse::<Activity>().is_err());
    }

    #[test]
    fn test_is_ready() {
        let mut set = BTreeSet::new();
        assert!(is_ready(&set));
        set.insert(Activity::Updating);
        assert!(is_ready(&set));
        set.insert(Activity::BeingDeleted);
        assert!(!is_ready(&set));
    }
}
