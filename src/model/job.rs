//! Provisioning job and audit records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle operation recorded by a provisioning job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Create,
    Scale,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Create => "create",
            JobType::Scale => "scale",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of `provisioning_jobs`
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisioningJob {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs: String,
    pub error_message: Option<String>,
}

/// Step log accumulated while a job runs and stored when it closes
#[derive(Clone, Debug, Default)]
pub struct JobLog {
    lines: Vec<String>,
}

impl JobLog {
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(format!(
            "{} {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            line.into()
        ));
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

/// Append-only audit record written for every state-changing operation
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub team_id: Uuid,
    pub resource_id: Uuid,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        team_id: Uuid,
        resource_id: Uuid,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            team_id,
            resource_id,
            details,
        }
    }
}
