//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Statuses are stored as plain strings so the wire format stays stable;
//! the enums below own the string mapping. Domain types live in the
//! `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Inactive,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active"   => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "archived" => Ok(Self::Archived),
            other      => Err(format!("unknown workflow status: {other}")),
        }
    }
}

/// Possible statuses for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending   => write!(f, "pending"),
            Self::Running   => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed    => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending"   => Ok(Self::Pending),
            "running"   => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Possible statuses for a task within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued    => write!(f, "queued"),
            Self::Running   => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed    => write!(f, "failed"),
            Self::Skipped   => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued"    => Ok(Self::Queued),
            "running"   => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "skipped"   => Ok(Self::Skipped),
            other       => Err(format!("unknown task status: {other}")),
        }
    }
}

/// How an execution was started. Unrecognised wire values fail to parse,
/// which rejects execution creation with a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Webhook,
    Slack,
    Chain,
    Trigger,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual    => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Webhook   => write!(f, "webhook"),
            Self::Slack     => write!(f, "slack"),
            Self::Chain     => write!(f, "chain"),
            Self::Trigger   => write!(f, "trigger"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual"    => Ok(Self::Manual),
            "scheduled" => Ok(Self::Scheduled),
            "webhook"   => Ok(Self::Webhook),
            "slack"     => Ok(Self::Slack),
            "chain"     => Ok(Self::Chain),
            "trigger"   => Ok(Self::Trigger),
            other       => Err(format!("unknown trigger type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    pub owner_id: String,
    pub workspace_id: Option<String>,
    pub status: String,
    /// Monotonically increasing; bumped by the caller on update.
    pub version: i32,
    pub timeout_secs: i64,
    pub max_retries: i32,
    /// Cron-style schedule expression. Persisted only; evaluation is the
    /// scheduler daemon's concern.
    pub schedule: Option<String>,
    /// Full JSON workflow definition (tasks, variables, on_error, …).
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRow {
    /// New `active` workflow at version 1.
    pub fn new(
        name: impl Into<String>,
        owner_id: impl Into<String>,
        definition: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id: owner_id.into(),
            workspace_id: None,
            status: WorkflowStatus::Active.to_string(),
            version: 1,
            timeout_secs: 3600,
            max_retries: 3,
            schedule: None,
            definition,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// A persisted workflow execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: String,
    pub trigger_type: String,
    /// User id or source-execution id, depending on the trigger.
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the execution reaches a terminal state.
    pub duration_ms: Option<i64>,
    /// Set only when status = completed.
    pub output: Option<serde_json::Value>,
    /// Set only when status = failed.
    pub error_message: Option<String>,
}

impl ExecutionRow {
    /// New `pending` execution.
    pub fn new(workflow_id: Uuid, trigger_type: TriggerType, triggered_by: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Pending.to_string(),
            trigger_type: trigger_type.to_string(),
            triggered_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            error_message: None,
        }
    }
}

// ---------------------------------------------------------------------------
// tasks
// ---------------------------------------------------------------------------

/// A persisted task row, created lazily as its execution reaches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Unique within the parent workflow; doubles as the dependency key.
    pub name: String,
    pub agent_type: String,
    pub action: String,
    /// Parameters after variable substitution.
    pub parameters: serde_json::Value,
    pub status: String,
    pub retry_count: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

impl TaskRow {
    /// New `queued` task.
    pub fn queued(
        execution_id: Uuid,
        name: impl Into<String>,
        agent_type: impl Into<String>,
        action: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            name: name.into(),
            agent_type: agent_type.into(),
            action: action.into(),
            parameters,
            status: TaskStatus::Queued.to_string(),
            retry_count: 0,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
            error_message: None,
        }
    }
}
