// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Job lifecycle status. Transitions are monotonic except for retries
/// (`running` back to `pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by an executor.
    Running,
    /// Completed successfully.
    Finished,
    /// Gave up after a permanent error or exhausted retries.
    Failed,
    /// Cancelled by an administrator.
    Terminated,
}

impl JobStatus {
    /// Stored name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Terminated)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(StoreError::InvalidValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A job to insert into the queue.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Externally supplied ID; resubmitting the same ID is a no-op.
    pub id: String,
    /// Submitting user.
    pub user_id: String,
    /// Registered job type.
    pub job_type: String,
    /// Type-specific arguments.
    pub args: Value,
    /// Resource the job operates on, used for per-resource serialisation.
    pub resource_id: Option<String>,
    /// Handler version.
    pub version: String,
    /// Creation time (FIFO key).
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may run.
    pub run_after: DateTime<Utc>,
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job ID.
    pub id: String,
    /// Submitting user.
    pub user_id: String,
    /// Registered job type.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Type-specific arguments.
    pub args: Value,
    /// Resource the job operates on.
    pub resource_id: Option<String>,
    /// Current status.
    pub status: JobStatus,
    /// Errors from every failed attempt.
    pub error_logs: Vec<String>,
    /// Number of failed attempts so far.
    pub attempts: i32,
    /// Handler version.
    pub version: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may run.
    pub run_after: DateTime<Utc>,
    /// When the job was last claimed.
    pub last_run_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Only jobs submitted by this user.
    pub user_id: Option<String>,
    /// Only jobs with this status.
    pub status: Option<JobStatus>,
    /// Only jobs for this resource.
    pub resource_id: Option<String>,
    /// Only jobs of this type.
    pub job_type: Option<String>,
}
