//! Workflow orchestrator.
//!
//! `Orchestrator` owns a single execution end to end:
//! 1. Loads the workflow and rejects missing/inactive ones.
//! 2. Creates the execution row and transitions it `pending → running`.
//! 3. Walks tasks sequentially, or hands them to the DAG engine when any
//!    task declares dependencies.
//! 4. Resolves `${name}` parameters, dispatches via the agent registry,
//!    and retries `Retryable` failures with exponential back-off.
//! 5. Finalises the execution with aggregated output and duration.
//!
//! Cancellation is cooperative: a cancel request flips the row status and
//! the orchestrator observes it between tasks; in-flight executor calls
//! are never aborted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use agents::{AgentError, AgentRegistry};
use db::{
    ExecutionRow, ExecutionStatus, TaskRow, TaskStatus, TriggerType, WorkflowRow, WorkflowStatus,
    WorkflowStore,
};

use crate::dag::{build_dag, DagConfig, DagEngine, DagNode, NodeExecutor};
use crate::models::{JsonMap, OnErrorPolicy, TaskDefinition, WorkflowDefinition};
use crate::variables::resolve_params;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base delay for exponential back-off between task retries.
    pub retry_base_delay: Duration,
    /// DAG engine settings used when a workflow declares dependencies.
    pub dag: DagConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay: Duration::from_secs(1),
            dag: DagConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run outcomes
// ---------------------------------------------------------------------------

enum RunOutcome {
    Completed { output: JsonMap },
    Failed { error: String },
    Cancelled,
}

pub(crate) enum TaskOutcome {
    Completed(JsonMap),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Orchestrates workflow executions against a store and an agent registry.
///
/// Cheap to clone; clones share the same store and registry, so the
/// orchestrator can be used as a process-wide handle or as a plain value
/// in tests.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) store: Arc<dyn WorkflowStore>,
    registry: Arc<AgentRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<AgentRegistry>) -> Self {
        Self::with_config(store, registry, OrchestratorConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<AgentRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Run the workflow to completion and return the terminal execution.
    #[instrument(skip(self, variables), fields(workflow_id = %workflow_id))]
    pub async fn execute_workflow(
        &self,
        workflow_id: Uuid,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
        variables: Option<JsonMap>,
    ) -> Result<ExecutionRow, EngineError> {
        let (workflow, definition) = self.prepare(workflow_id).await?;
        let execution = self
            .store
            .create_execution(ExecutionRow::new(workflow_id, trigger_type, triggered_by))
            .await?;

        self.run_execution(workflow, definition, execution, variables.unwrap_or_default())
            .await
    }

    /// Create the pending execution row, run the body on a background task,
    /// and return the row immediately. Used by the chain manager, which
    /// polls the store for completion.
    pub async fn spawn_workflow(
        &self,
        workflow_id: Uuid,
        triggered_by: Option<String>,
        trigger_type: TriggerType,
        variables: Option<JsonMap>,
    ) -> Result<ExecutionRow, EngineError> {
        let (workflow, definition) = self.prepare(workflow_id).await?;
        let execution = self
            .store
            .create_execution(ExecutionRow::new(workflow_id, trigger_type, triggered_by))
            .await?;

        let this = self.clone();
        let pending = execution.clone();
        let caller_variables = variables.unwrap_or_default();
        tokio::spawn(async move {
            if let Err(err) = this
                .run_execution(workflow, definition, execution, caller_variables)
                .await
            {
                error!(error = %err, "background workflow execution failed");
            }
        });

        Ok(pending)
    }

    /// Request cancellation. Only pending/running executions transition;
    /// cancelling an already-terminal execution is a no-op.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let mut execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;

        if let Ok(ExecutionStatus::Pending | ExecutionStatus::Running) =
            execution.status.parse::<ExecutionStatus>()
        {
            execution.status = ExecutionStatus::Cancelled.to_string();
            self.store.update_execution(execution).await?;
            info!(execution = %execution_id, "execution cancelled");
        }

        Ok(())
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<ExecutionRow>, EngineError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

    pub async fn get_execution_tasks(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<TaskRow>, EngineError> {
        Ok(self.store.list_tasks(execution_id).await?)
    }

    // -----------------------------------------------------------------------
    // Internal: preparation and the execution body
    // -----------------------------------------------------------------------

    async fn prepare(
        &self,
        workflow_id: Uuid,
    ) -> Result<(WorkflowRow, WorkflowDefinition), EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let active = workflow
            .status
            .parse::<WorkflowStatus>()
            .map(|s| s == WorkflowStatus::Active)
            .unwrap_or(false);
        if !active {
            return Err(EngineError::WorkflowNotActive {
                id: workflow_id,
                status: workflow.status.clone(),
            });
        }

        let definition: WorkflowDefinition = serde_json::from_value(workflow.definition.clone())
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;

        Ok((workflow, definition))
    }

    async fn run_execution(
        &self,
        workflow: WorkflowRow,
        definition: WorkflowDefinition,
        mut execution: ExecutionRow,
        caller_variables: JsonMap,
    ) -> Result<ExecutionRow, EngineError> {
        execution.status = ExecutionStatus::Running.to_string();
        execution.started_at = Some(Utc::now());
        execution = self.store.update_execution(execution).await?;
        info!(
            execution = %execution.id,
            workflow = %workflow.id,
            trigger = %execution.trigger_type,
            "execution started"
        );

        let default_max_retries = workflow.max_retries.max(0) as u32;

        let first = self
            .run_tasks_once(&definition, &execution, &caller_variables, default_max_retries)
            .await;

        let outcome = match first {
            Ok(RunOutcome::Failed { error }) if definition.on_error == OnErrorPolicy::Retry => {
                // The retry policy overlaps with per-task max_retries; the
                // chosen semantics are a single whole-workflow re-run.
                warn!(
                    execution = %execution.id,
                    %error,
                    "on_error=retry: re-running the whole workflow once"
                );
                self.run_tasks_once(&definition, &execution, &caller_variables, default_max_retries)
                    .await
            }
            other => other,
        };

        match outcome {
            Ok(outcome) => self.finalize(execution, outcome).await,
            Err(err) => {
                // Graph validation failures abort the execution; the row
                // still terminates in a failed state.
                let _ = self
                    .finalize(
                        execution,
                        RunOutcome::Failed {
                            error: err.to_string(),
                        },
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn run_tasks_once(
        &self,
        definition: &WorkflowDefinition,
        execution: &ExecutionRow,
        caller_variables: &JsonMap,
        default_max_retries: u32,
    ) -> Result<RunOutcome, EngineError> {
        if definition.has_dependencies() {
            self.run_dag(definition, execution, caller_variables, default_max_retries)
                .await
        } else {
            self.run_sequential(definition, execution, caller_variables, default_max_retries)
                .await
        }
    }

    /// Walk tasks in declaration order.
    async fn run_sequential(
        &self,
        definition: &WorkflowDefinition,
        execution: &ExecutionRow,
        caller_variables: &JsonMap,
        default_max_retries: u32,
    ) -> Result<RunOutcome, EngineError> {
        let mut task_results = JsonMap::new();

        for task in &definition.tasks {
            // Observe cooperative cancellation between tasks.
            if let Some(current) = self.store.get_execution(execution.id).await? {
                if current.status == ExecutionStatus::Cancelled.to_string() {
                    info!(execution = %execution.id, "cancellation observed, draining");
                    return Ok(RunOutcome::Cancelled);
                }
            }

            let scope = merge_scope(&definition.variables, &task_results, caller_variables);

            match self
                .run_task(execution.id, task, &scope, default_max_retries)
                .await?
            {
                TaskOutcome::Completed(output) => {
                    task_results.insert(task.name.clone(), Value::Object(output));
                }
                TaskOutcome::Failed(reason) => match definition.on_error {
                    OnErrorPolicy::Continue => {
                        // Null sentinel so downstream tasks see the miss.
                        task_results.insert(task.name.clone(), Value::Null);
                    }
                    OnErrorPolicy::Stop | OnErrorPolicy::Retry => {
                        return Ok(RunOutcome::Failed { error: reason });
                    }
                },
            }
        }

        Ok(RunOutcome::Completed {
            output: task_results,
        })
    }

    /// Hand the task list to the DAG engine.
    async fn run_dag(
        &self,
        definition: &WorkflowDefinition,
        execution: &ExecutionRow,
        caller_variables: &JsonMap,
        default_max_retries: u32,
    ) -> Result<RunOutcome, EngineError> {
        let nodes = build_dag(&definition.tasks)?;

        let runner = Arc::new(DagRunner {
            orchestrator: self.clone(),
            execution_id: execution.id,
            base_variables: definition.variables.clone(),
            caller_variables: caller_variables.clone(),
            default_max_retries,
            results: Mutex::new(JsonMap::new()),
        });

        let engine = DagEngine::new(self.config.dag.clone());
        let result = engine.execute_parallel(&nodes, runner.clone()).await;

        let task_results = runner.results.lock().await.clone();

        if result.failed.is_empty() {
            Ok(RunOutcome::Completed {
                output: task_results,
            })
        } else {
            // Report the lowest-level failure: that is the root cause, the
            // rest is propagation.
            let error = nodes
                .iter()
                .filter(|n| result.failed.contains_key(n.name()))
                .min_by_key(|n| n.level)
                .and_then(|n| result.failed.get(n.name()).cloned())
                .unwrap_or_else(|| "task failed".to_owned());
            Ok(RunOutcome::Failed { error })
        }
    }

    /// Execute a single task: create its row, resolve the agent, retry
    /// `Retryable` failures up to the budget with exponential back-off.
    pub(crate) async fn run_task(
        &self,
        execution_id: Uuid,
        task: &TaskDefinition,
        scope: &JsonMap,
        default_max_retries: u32,
    ) -> Result<TaskOutcome, EngineError> {
        let resolved = resolve_params(&task.parameters, scope);
        let mut row = self
            .store
            .create_task(TaskRow::queued(
                execution_id,
                &task.name,
                &task.agent_type,
                &task.action,
                Value::Object(resolved.clone()),
            ))
            .await?;

        // A registry miss is a deterministic failure, never retried.
        let Some(executor) = self.registry.resolve(&task.agent_type, &task.action) else {
            let reason = EngineError::AgentUnresolvable {
                agent_type: task.agent_type.clone(),
                action: task.action.clone(),
            }
            .to_string();
            warn!(task = %task.name, %reason, "task failed deterministically");
            row.status = TaskStatus::Failed.to_string();
            row.completed_at = Some(Utc::now());
            row.error_message = Some(reason.clone());
            self.store.update_task(row).await?;
            return Ok(TaskOutcome::Failed(reason));
        };

        let max_retries = task.max_retries.unwrap_or(default_max_retries);

        row.status = TaskStatus::Running.to_string();
        row.started_at = Some(Utc::now());
        row = self.store.update_task(row).await?;

        let mut attempt: u32 = 0;
        loop {
            match executor.execute(resolved.clone()).await {
                Ok(output) => {
                    row.status = TaskStatus::Completed.to_string();
                    row.completed_at = Some(Utc::now());
                    row.output = Some(Value::Object(output.clone()));
                    self.store.update_task(row).await?;
                    info!(task = %task.name, "task completed");
                    return Ok(TaskOutcome::Completed(output));
                }

                Err(AgentError::Fatal(message)) => {
                    row.status = TaskStatus::Failed.to_string();
                    row.completed_at = Some(Utc::now());
                    row.error_message = Some(message.clone());
                    self.store.update_task(row).await?;
                    error!(task = %task.name, error = %message, "task failed fatally");
                    return Ok(TaskOutcome::Failed(message));
                }

                Err(AgentError::Retryable(message)) => {
                    if attempt >= max_retries {
                        let reason = EngineError::TaskFailed {
                            task: task.name.clone(),
                            attempts: attempt + 1,
                            message: message.clone(),
                        }
                        .to_string();
                        row.status = TaskStatus::Failed.to_string();
                        row.completed_at = Some(Utc::now());
                        row.error_message = Some(reason.clone());
                        self.store.update_task(row).await?;
                        error!(task = %task.name, error = %message, "task retries exhausted");
                        return Ok(TaskOutcome::Failed(reason));
                    }

                    let delay = self.config.retry_base_delay * 2u32.pow(attempt);
                    attempt += 1;
                    row.retry_count = attempt as i32;
                    row.error_message = Some(message.clone());
                    row = self.store.update_task(row).await?;
                    warn!(
                        task = %task.name,
                        attempt,
                        max_retries,
                        ?delay,
                        error = %message,
                        "task attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Write the terminal state. A row that already reached a terminal
    /// state (cancellation) is only stamped, never overwritten.
    async fn finalize(
        &self,
        mut execution: ExecutionRow,
        outcome: RunOutcome,
    ) -> Result<ExecutionRow, EngineError> {
        if let Some(current) = self.store.get_execution(execution.id).await? {
            let terminal = current
                .status
                .parse::<ExecutionStatus>()
                .map(ExecutionStatus::is_terminal)
                .unwrap_or(false);
            if terminal {
                let mut execution = current;
                if execution.completed_at.is_none() {
                    let completed_at = Utc::now();
                    execution.completed_at = Some(completed_at);
                    execution.duration_ms = execution
                        .started_at
                        .map(|s| (completed_at - s).num_milliseconds());
                    execution = self.store.update_execution(execution).await?;
                }
                return Ok(execution);
            }
        }

        match outcome {
            RunOutcome::Completed { output } => {
                execution.status = ExecutionStatus::Completed.to_string();
                execution.output = Some(Value::Object(output));
            }
            RunOutcome::Failed { error } => {
                execution.status = ExecutionStatus::Failed.to_string();
                execution.error_message = Some(error);
            }
            RunOutcome::Cancelled => {
                execution.status = ExecutionStatus::Cancelled.to_string();
            }
        }

        let completed_at = Utc::now();
        execution.completed_at = Some(completed_at);
        execution.duration_ms = execution
            .started_at
            .map(|s| (completed_at - s).num_milliseconds());

        info!(
            execution = %execution.id,
            status = %execution.status,
            duration_ms = execution.duration_ms,
            "execution finalised"
        );
        Ok(self.store.update_execution(execution).await?)
    }
}

/// Later maps win on key collision: workflow variables, then accumulated
/// task results, then caller-supplied variables.
fn merge_scope(base: &JsonMap, results: &JsonMap, caller: &JsonMap) -> JsonMap {
    let mut scope = base.clone();
    for (key, value) in results {
        scope.insert(key.clone(), value.clone());
    }
    for (key, value) in caller {
        scope.insert(key.clone(), value.clone());
    }
    scope
}

// ---------------------------------------------------------------------------
// DAG bridge
// ---------------------------------------------------------------------------

/// `NodeExecutor` implementation that persists task rows and shares a
/// task-results map across the execution.
struct DagRunner {
    orchestrator: Orchestrator,
    execution_id: Uuid,
    base_variables: JsonMap,
    caller_variables: JsonMap,
    default_max_retries: u32,
    results: Mutex<JsonMap>,
}

#[async_trait::async_trait]
impl NodeExecutor for DagRunner {
    async fn execute(&self, node: &DagNode) -> Result<JsonMap, String> {
        let scope = {
            let results = self.results.lock().await;
            merge_scope(&self.base_variables, &results, &self.caller_variables)
        };

        match self
            .orchestrator
            .run_task(self.execution_id, &node.task, &scope, self.default_max_retries)
            .await
        {
            Ok(TaskOutcome::Completed(output)) => {
                self.results
                    .lock()
                    .await
                    .insert(node.task.name.clone(), Value::Object(output.clone()));
                Ok(output)
            }
            Ok(TaskOutcome::Failed(reason)) => Err(reason),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Persist the skip: the node never ran, so the row goes straight from
    /// queued to skipped with no started/completed timestamps.
    async fn dependency_failed(&self, node: &DagNode) {
        let mut row = TaskRow::queued(
            self.execution_id,
            &node.task.name,
            &node.task.agent_type,
            &node.task.action,
            Value::Object(node.task.parameters.clone()),
        );
        row.status = TaskStatus::Skipped.to_string();
        row.error_message = Some(EngineError::DependencyFailed.to_string());

        if let Err(err) = self.orchestrator.store.create_task(row).await {
            error!(task = %node.task.name, error = %err, "failed to persist skipped task");
        }
    }
}
