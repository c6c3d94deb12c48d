//! Workflow chain manager.
//!
//! Chains compose workflows into higher-order pipelines: entries carry an
//! order level, dependencies on other entries, an optional condition, and
//! a data mapping that feeds upstream outputs into downstream variables.
//! Entries at the same order run concurrently; a dependency that did not
//! complete, or a condition that is not met, skips the entry without
//! failing the chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use db::{ExecutionRow, ExecutionStatus, TriggerType, WorkflowRow, WorkflowStore};

use crate::models::{
    lookup_path, ChainCondition, ChainEntry, ConditionOperator, DataMapping, DefinitionKind,
    JsonMap, WorkflowDefinition,
};
use crate::{EngineError, Orchestrator};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for chain execution.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// How often a sub-execution's status is polled.
    pub poll_interval: Duration,
    /// Cap on how long a single sub-execution may be waited for.
    pub wait_timeout: Duration,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Terminal status of one chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEntryStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

/// Per-entry record kept while a chain runs.
#[derive(Debug, Clone)]
pub struct ChainEntryContext {
    pub status: ChainEntryStatus,
    pub execution_id: Option<Uuid>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ChainEntryContext {
    fn pending() -> Self {
        Self {
            status: ChainEntryStatus::Pending,
            execution_id: None,
            output: None,
            error: None,
        }
    }
}

/// Aggregate outcome of a chain run.
#[derive(Debug)]
pub struct ChainResult {
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub contexts: HashMap<Uuid, ChainEntryContext>,
    pub duration_ms: i64,
}

enum EntryOutcome {
    Completed { execution_id: Uuid, output: Value },
    Skipped(String),
    Failed {
        execution_id: Option<Uuid>,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// ChainManager
// ---------------------------------------------------------------------------

/// Creates and executes workflow chains, and fires cross-workflow triggers.
#[derive(Clone)]
pub struct ChainManager {
    store: Arc<dyn WorkflowStore>,
    orchestrator: Orchestrator,
    config: ChainConfig,
}

impl ChainManager {
    pub fn new(store: Arc<dyn WorkflowStore>, orchestrator: Orchestrator) -> Self {
        Self::with_config(store, orchestrator, ChainConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        orchestrator: Orchestrator,
        config: ChainConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Chain creation
    // -----------------------------------------------------------------------

    /// Validate the entries and persist the chain as a workflow row whose
    /// definition is tagged `type: chain`.
    pub async fn create_chain(
        &self,
        name: &str,
        owner_id: &str,
        entries: Vec<ChainEntry>,
    ) -> Result<WorkflowRow, EngineError> {
        let member_ids: HashSet<Uuid> = entries.iter().map(|e| e.workflow_id).collect();
        if member_ids.len() != entries.len() {
            return Err(EngineError::ChainValidation(
                "duplicate workflow in chain".to_owned(),
            ));
        }

        for entry in &entries {
            if self.store.get_workflow(entry.workflow_id).await?.is_none() {
                return Err(EngineError::ChainValidation(format!(
                    "target workflow {} does not exist",
                    entry.workflow_id
                )));
            }
            for dep in &entry.depends_on {
                if !member_ids.contains(dep) {
                    return Err(EngineError::ChainValidation(format!(
                        "entry {} depends on {} which is not part of the chain",
                        entry.workflow_id, dep
                    )));
                }
            }
        }

        assert_chain_acyclic(&entries)?;

        let definition = WorkflowDefinition {
            kind: DefinitionKind::Chain,
            workflows: entries,
            ..Default::default()
        };
        let definition = serde_json::to_value(&definition)
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;

        let row = self
            .store
            .create_workflow(WorkflowRow::new(name, owner_id, definition))
            .await?;
        info!(chain = %row.id, %name, "chain created");
        Ok(row)
    }

    // -----------------------------------------------------------------------
    // Chain execution
    // -----------------------------------------------------------------------

    /// Run every entry of the chain, order level by order level.
    #[instrument(skip(self, initial_variables), fields(chain_id = %chain_id))]
    pub async fn execute_chain(
        &self,
        chain_id: Uuid,
        initial_variables: Option<JsonMap>,
    ) -> Result<ChainResult, EngineError> {
        let chain = self
            .store
            .get_workflow(chain_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(chain_id))?;
        let definition: WorkflowDefinition = serde_json::from_value(chain.definition.clone())
            .map_err(|e| EngineError::InvalidDefinition(e.to_string()))?;
        if !definition.is_chain() {
            return Err(EngineError::ChainValidation(format!(
                "workflow {chain_id} is not a chain"
            )));
        }

        let entries = definition.workflows;
        let initial = initial_variables.unwrap_or_default();
        let started = Instant::now();

        let mut contexts: HashMap<Uuid, ChainEntryContext> = entries
            .iter()
            .map(|e| (e.workflow_id, ChainEntryContext::pending()))
            .collect();
        let mut outputs: HashMap<Uuid, Value> = HashMap::new();

        let max_order = entries.iter().map(|e| e.order).max().unwrap_or(0);
        for order in 0..=max_order {
            let level: Vec<&ChainEntry> = entries.iter().filter(|e| e.order == order).collect();
            if level.is_empty() {
                continue;
            }
            info!(order, entries = level.len(), "running chain order level");

            // Same-order entries run concurrently; they only read the
            // contexts of strictly lower orders.
            let outcomes = join_all(
                level
                    .iter()
                    .copied()
                    .map(|entry| self.run_entry(chain_id, entry, &contexts, &outputs, &initial)),
            )
            .await;

            for (entry, outcome) in level.iter().zip(outcomes) {
                let context = match outcome {
                    EntryOutcome::Completed {
                        execution_id,
                        output,
                    } => {
                        outputs.insert(entry.workflow_id, output.clone());
                        ChainEntryContext {
                            status: ChainEntryStatus::Completed,
                            execution_id: Some(execution_id),
                            output: Some(output),
                            error: None,
                        }
                    }
                    EntryOutcome::Skipped(reason) => {
                        info!(workflow = %entry.workflow_id, %reason, "chain entry skipped");
                        ChainEntryContext {
                            status: ChainEntryStatus::Skipped,
                            execution_id: None,
                            output: None,
                            error: Some(reason),
                        }
                    }
                    EntryOutcome::Failed {
                        execution_id,
                        error,
                    } => {
                        warn!(workflow = %entry.workflow_id, %error, "chain entry failed");
                        ChainEntryContext {
                            status: ChainEntryStatus::Failed,
                            execution_id,
                            output: None,
                            error: Some(error),
                        }
                    }
                };
                contexts.insert(entry.workflow_id, context);
            }
        }

        let count = |status: ChainEntryStatus| {
            contexts.values().filter(|c| c.status == status).count()
        };
        let executed = count(ChainEntryStatus::Completed);
        let skipped = count(ChainEntryStatus::Skipped);
        let failed = count(ChainEntryStatus::Failed);

        let result = ChainResult {
            total: entries.len(),
            executed,
            skipped,
            failed,
            contexts,
            duration_ms: started.elapsed().as_millis() as i64,
        };
        info!(
            total = result.total,
            executed = result.executed,
            skipped = result.skipped,
            failed = result.failed,
            "chain finished"
        );
        Ok(result)
    }

    async fn run_entry(
        &self,
        chain_id: Uuid,
        entry: &ChainEntry,
        contexts: &HashMap<Uuid, ChainEntryContext>,
        outputs: &HashMap<Uuid, Value>,
        initial: &JsonMap,
    ) -> EntryOutcome {
        let deps_completed = entry.depends_on.iter().all(|dep| {
            contexts
                .get(dep)
                .map(|c| c.status == ChainEntryStatus::Completed)
                .unwrap_or(false)
        });
        if !deps_completed {
            return EntryOutcome::Skipped("Dependencies not completed".to_owned());
        }

        if !evaluate_condition(entry.condition.as_ref(), &entry.depends_on, outputs) {
            return EntryOutcome::Skipped("Condition not met".to_owned());
        }

        let mut variables = initial.clone();
        apply_mapping(&mut variables, &entry.data_mapping, outputs);

        let execution = match self
            .orchestrator
            .spawn_workflow(
                entry.workflow_id,
                Some(chain_id.to_string()),
                TriggerType::Chain,
                Some(variables),
            )
            .await
        {
            Ok(execution) => execution,
            Err(err) => {
                return EntryOutcome::Failed {
                    execution_id: None,
                    error: err.to_string(),
                }
            }
        };

        self.wait_for_execution(execution.id).await
    }

    /// Poll the store until the sub-execution is terminal or the wait cap
    /// is reached.
    async fn wait_for_execution(&self, execution_id: Uuid) -> EntryOutcome {
        let deadline = Instant::now() + self.config.wait_timeout;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            let execution = match self.store.get_execution(execution_id).await {
                Ok(Some(execution)) => execution,
                Ok(None) => {
                    return EntryOutcome::Failed {
                        execution_id: Some(execution_id),
                        error: EngineError::ExecutionNotFound(execution_id).to_string(),
                    }
                }
                Err(err) => {
                    return EntryOutcome::Failed {
                        execution_id: Some(execution_id),
                        error: err.to_string(),
                    }
                }
            };

            match execution.status.parse::<ExecutionStatus>() {
                Ok(ExecutionStatus::Completed) => {
                    return EntryOutcome::Completed {
                        execution_id,
                        output: execution
                            .output
                            .unwrap_or_else(|| Value::Object(JsonMap::new())),
                    }
                }
                Ok(ExecutionStatus::Failed) => {
                    return EntryOutcome::Failed {
                        execution_id: Some(execution_id),
                        error: execution
                            .error_message
                            .unwrap_or_else(|| "execution failed".to_owned()),
                    }
                }
                Ok(ExecutionStatus::Cancelled) => {
                    return EntryOutcome::Failed {
                        execution_id: Some(execution_id),
                        error: EngineError::ExecutionCancelled(execution_id).to_string(),
                    }
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return EntryOutcome::Failed {
                    execution_id: Some(execution_id),
                    error: EngineError::ExecutionTimeout(self.config.wait_timeout, execution_id)
                        .to_string(),
                };
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cross-workflow triggers and data passing
    // -----------------------------------------------------------------------

    /// Launch `target_workflow_id` from a completed source execution,
    /// passing the source output as the target's variables.
    pub async fn trigger_workflow(
        &self,
        source_execution_id: Uuid,
        target_workflow_id: Uuid,
    ) -> Result<ExecutionRow, EngineError> {
        let source = self.completed_execution(source_execution_id).await?;
        self.orchestrator
            .spawn_workflow(
                target_workflow_id,
                Some(source_execution_id.to_string()),
                TriggerType::Trigger,
                Some(output_map(&source)),
            )
            .await
    }

    /// Like [`trigger_workflow`](Self::trigger_workflow), but gated on a
    /// condition evaluated against the source output. Returns `Ok(None)`
    /// when the condition is not met.
    pub async fn conditional_trigger(
        &self,
        source_execution_id: Uuid,
        target_workflow_id: Uuid,
        condition: &ChainCondition,
    ) -> Result<Option<ExecutionRow>, EngineError> {
        let source = self.completed_execution(source_execution_id).await?;

        let mut outputs = HashMap::new();
        outputs.insert(
            source.workflow_id,
            source
                .output
                .clone()
                .unwrap_or_else(|| Value::Object(JsonMap::new())),
        );
        let deps = [source.workflow_id];

        if !evaluate_condition(Some(condition), &deps, &outputs) {
            info!(
                source = %source_execution_id,
                target = %target_workflow_id,
                "conditional trigger skipped"
            );
            return Ok(None);
        }

        let execution = self
            .orchestrator
            .spawn_workflow(
                target_workflow_id,
                Some(source_execution_id.to_string()),
                TriggerType::Trigger,
                Some(output_map(&source)),
            )
            .await?;
        Ok(Some(execution))
    }

    /// Apply a data mapping to a completed source execution's output and
    /// return the resulting variables, without launching anything.
    pub async fn pass_data(
        &self,
        source_execution_id: Uuid,
        target_workflow_id: Uuid,
        data_mapping: &[DataMapping],
    ) -> Result<JsonMap, EngineError> {
        self.store
            .get_workflow(target_workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(target_workflow_id))?;
        let source = self.completed_execution(source_execution_id).await?;

        let mut outputs = HashMap::new();
        outputs.insert(
            source.workflow_id,
            source
                .output
                .clone()
                .unwrap_or_else(|| Value::Object(JsonMap::new())),
        );

        let mut variables = JsonMap::new();
        apply_mapping(&mut variables, data_mapping, &outputs);
        Ok(variables)
    }

    /// Most recent execution of the given workflow, for chain status
    /// tooling.
    pub async fn latest_chain_execution(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ExecutionRow>, EngineError> {
        Ok(self.store.latest_chain_execution(workflow_id).await?)
    }

    async fn completed_execution(&self, id: Uuid) -> Result<ExecutionRow, EngineError> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))?;
        if execution.status != ExecutionStatus::Completed.to_string() {
            return Err(EngineError::ChainValidation(format!(
                "source execution {id} is not completed (status: {})",
                execution.status
            )));
        }
        Ok(execution)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// DFS with a recursion stack over the entry dependency graph.
fn assert_chain_acyclic(entries: &[ChainEntry]) -> Result<(), EngineError> {
    fn visit(
        id: Uuid,
        by_id: &HashMap<Uuid, &ChainEntry>,
        done: &mut HashSet<Uuid>,
        visiting: &mut HashSet<Uuid>,
    ) -> Result<(), EngineError> {
        if done.contains(&id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(EngineError::CircularDependency(id.to_string()));
        }
        if let Some(entry) = by_id.get(&id) {
            for dep in &entry.depends_on {
                visit(*dep, by_id, done, visiting)?;
            }
        }
        visiting.remove(&id);
        done.insert(id);
        Ok(())
    }

    let by_id: HashMap<Uuid, &ChainEntry> =
        entries.iter().map(|e| (e.workflow_id, e)).collect();
    let mut done = HashSet::new();
    let mut visiting = HashSet::new();
    for entry in entries {
        visit(entry.workflow_id, &by_id, &mut done, &mut visiting)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Condition evaluation
// ---------------------------------------------------------------------------

/// Evaluate a chain condition against dependency outputs.
///
/// `status` is true iff the first declared dependency produced an output
/// (no dependency means true). `output` dereferences a dot path of the
/// first dependency's output and compares. `expression` runs in a capped
/// rhai engine whose scope holds an `outputs` map keyed by workflow-id
/// string (workflow ids are not valid identifiers), e.g.
/// `outputs["<id>"].count > 10`; evaluation errors count as false.
pub fn evaluate_condition(
    condition: Option<&ChainCondition>,
    depends_on: &[Uuid],
    outputs: &HashMap<Uuid, Value>,
) -> bool {
    match condition {
        None => true,
        Some(ChainCondition::Status) => depends_on
            .first()
            .map_or(true, |dep| outputs.contains_key(dep)),
        Some(ChainCondition::Output {
            field,
            operator,
            value,
        }) => {
            let Some(dep) = depends_on.first() else {
                return false;
            };
            let Some(actual) = outputs.get(dep).and_then(|o| lookup_path(o, field)) else {
                return false;
            };
            compare(actual, *operator, value)
        }
        Some(ChainCondition::Expression { expression }) => {
            evaluate_expression(expression, outputs)
        }
    }
}

fn compare(actual: &Value, operator: ConditionOperator, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => actual == expected,
        ConditionOperator::Contains => coerce_string(actual).contains(&coerce_string(expected)),
        ConditionOperator::GreaterThan => match (coerce_number(actual), coerce_number(expected)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (coerce_number(actual), coerce_number(expected)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        _ => None,
    }
}

fn evaluate_expression(expression: &str, outputs: &HashMap<Uuid, Value>) -> bool {
    let mut engine = rhai::Engine::new();
    // The engine sees nothing but the outputs scope; cap complexity so a
    // hostile expression cannot spin.
    engine.set_max_operations(10_000);
    engine.set_max_expr_depths(32, 32);

    let table: JsonMap = outputs
        .iter()
        .map(|(id, value)| (id.to_string(), value.clone()))
        .collect();

    let mut scope = rhai::Scope::new();
    match rhai::serde::to_dynamic(Value::Object(table)) {
        Ok(dynamic) => {
            scope.push_dynamic("outputs", dynamic);
        }
        Err(err) => {
            let err = EngineError::ConditionEvaluation(err.to_string());
            warn!(error = %err, "expression condition treated as false");
            return false;
        }
    }

    match engine.eval_with_scope::<rhai::Dynamic>(&mut scope, expression) {
        Ok(value) => is_truthy(&value),
        Err(err) => {
            let err = EngineError::ConditionEvaluation(err.to_string());
            warn!(error = %err, "expression condition treated as false");
            false
        }
    }
}

fn is_truthy(value: &rhai::Dynamic) -> bool {
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Ok(i) = value.as_int() {
        return i != 0;
    }
    if let Ok(f) = value.as_float() {
        return f != 0.0;
    }
    if let Ok(s) = value.clone().into_string() {
        return !s.is_empty();
    }
    !value.is::<()>()
}

// ---------------------------------------------------------------------------
// Data mapping
// ---------------------------------------------------------------------------

/// `from` is `<workflow_id>.<dot.path>`; the dereferenced value lands in
/// `variables[to]`. Unresolvable mappings are logged and skipped.
fn apply_mapping(
    variables: &mut JsonMap,
    mappings: &[DataMapping],
    outputs: &HashMap<Uuid, Value>,
) {
    for mapping in mappings {
        let Some((source, path)) = mapping.from.split_once('.') else {
            warn!(from = %mapping.from, "data mapping is missing a field path");
            continue;
        };
        let Ok(source_id) = source.parse::<Uuid>() else {
            warn!(from = %mapping.from, "data mapping source is not a workflow id");
            continue;
        };
        match outputs.get(&source_id).and_then(|o| lookup_path(o, path)) {
            Some(value) => {
                variables.insert(mapping.to.clone(), value.clone());
            }
            None => {
                warn!(from = %mapping.from, "data mapping source value not found");
            }
        }
    }
}

fn output_map(execution: &ExecutionRow) -> JsonMap {
    match &execution.output {
        Some(Value::Object(map)) => map.clone(),
        _ => JsonMap::new(),
    }
}
