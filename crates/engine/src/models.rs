//! Core domain models for the orchestration engine.
//!
//! These types are the source of truth for what a workflow definition looks
//! like in memory. They serialise to/from the JSON `definition` column of
//! the `workflows` table.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use agents::JsonMap;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Distinguishes plain workflows from chains (meta-workflows composed of
/// other workflows).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    #[default]
    Workflow,
    Chain,
}

/// What the orchestrator does when a task exhausts its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Finalise the execution as failed; no further tasks run.
    #[default]
    Stop,
    /// Record the failure and proceed to the next task.
    Continue,
    /// Re-run the whole workflow once more, then stop.
    Retry,
}

/// The `definition` payload of a workflow row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default, rename = "type")]
    pub kind: DefinitionKind,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    /// Workflow-level variables; callers may shadow them at execution time.
    #[serde(default)]
    pub variables: JsonMap,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
    /// Chain entries; populated only when `kind = chain`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<ChainEntry>,
}

impl WorkflowDefinition {
    pub fn is_chain(&self) -> bool {
        self.kind == DefinitionKind::Chain
    }

    /// A definition runs on the DAG engine when any task declares a
    /// dependency; otherwise tasks run sequentially in declaration order.
    pub fn has_dependencies(&self) -> bool {
        self.tasks.iter().any(|t| !t.depends_on.is_empty())
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition
// ---------------------------------------------------------------------------

/// A single step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within this workflow; acts as the dependency identifier.
    pub name: String,
    /// First half of the agent registry key.
    pub agent_type: String,
    /// Second half of the agent registry key.
    pub action: String,
    /// Arbitrary configuration; `${name}` string values are substituted
    /// from the variable scope at execution time.
    #[serde(default)]
    pub parameters: JsonMap,
    /// Names of tasks that must reach a terminal state before this one runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Per-task timeout; enforced by the executor, not the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-task override of the workflow's retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskDefinition {
    /// Convenience constructor for testing.
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: JsonMap::new(),
            depends_on: Vec::new(),
            timeout_secs: None,
            max_retries: None,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: JsonMap) -> Self {
        self.parameters = parameters;
        self
    }
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// One workflow inside a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    /// Target workflow to execute.
    pub workflow_id: Uuid,
    /// Scheduling tier; entries with the same order run concurrently.
    pub order: u32,
    /// Workflow ids (within the chain) that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Uuid>,
    /// Optional gate evaluated against dependency outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ChainCondition>,
    /// Output-to-variable mappings applied before launching the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_mapping: Vec<DataMapping>,
}

/// Comparison operator for `output` conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    GreaterThan,
    LessThan,
}

/// A gate on a chain entry, evaluated against dependency outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainCondition {
    /// True iff the first declared dependency completed.
    Status,
    /// Compare a dot-path field of the first dependency's output.
    Output {
        field: String,
        operator: ConditionOperator,
        value: serde_json::Value,
    },
    /// Sandboxed expression over the dependency outputs.
    Expression { expression: String },
}

/// One `(from, to)` pair of a data mapping. `from` is
/// `<workflow_id>.<dot.path.in.output>`; `to` is a variable name in the
/// target workflow's input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Dereference a dot-notation path inside a JSON value.
pub fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}
