//! Integration tests for the orchestrator.
//!
//! These run against `MemoryStore` and `MockAgent`, so no Postgres or real
//! agents are required. Retry back-off and the DAG sampler are tuned down
//! via `OrchestratorConfig` to keep the suite fast.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use agents::mock::MockAgent;
use agents::AgentRegistry;
use db::{
    ExecutionStatus, MemoryStore, TaskStatus, TriggerType, WorkflowRow, WorkflowStatus,
    WorkflowStore,
};

use crate::dag::DagConfig;
use crate::models::JsonMap;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_base_delay: Duration::from_millis(10),
        dag: DagConfig {
            max_concurrency: 3,
            sample_interval: Duration::from_millis(20),
        },
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    orchestrator: Orchestrator,
}

fn harness(registry: AgentRegistry) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let orchestrator =
        Orchestrator::with_config(store.clone(), Arc::new(registry), fast_config());
    Harness {
        store,
        orchestrator,
    }
}

async fn create_workflow(store: &MemoryStore, definition: Value) -> WorkflowRow {
    store
        .create_workflow(WorkflowRow::new("wf", "owner-1", definition))
        .await
        .unwrap()
}

fn map(value: Value) -> JsonMap {
    value.as_object().unwrap().clone()
}

// ---------------------------------------------------------------------------
// Sequential path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_happy_path_runs_tasks_in_order() {
    let mut registry = AgentRegistry::new();
    registry.register(
        "test",
        "echo",
        Arc::new(MockAgent::returning("echo", json!({ "ok": true }))),
    );
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [
                { "name": "T1", "agent_type": "test", "action": "echo" },
                { "name": "T2", "agent_type": "test", "action": "echo" },
                { "name": "T3", "agent_type": "test", "action": "echo" },
            ]
        }),
    )
    .await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());
    assert_eq!(
        execution.output,
        Some(json!({
            "T1": { "ok": true },
            "T2": { "ok": true },
            "T3": { "ok": true },
        }))
    );
    assert!(execution.error_message.is_none());

    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["T1", "T2", "T3"]);
    assert!(tasks
        .iter()
        .all(|t| t.status == TaskStatus::Completed.to_string()));
}

#[tokio::test]
async fn empty_task_list_completes_immediately_with_empty_output() {
    let h = harness(AgentRegistry::new());
    let workflow = create_workflow(&h.store, json!({ "tasks": [] })).await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());
    assert_eq!(execution.output, Some(json!({})));
    assert!(h
        .orchestrator
        .get_execution_tasks(execution.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn retry_then_success_records_retry_count() {
    let flaky = Arc::new(MockAgent::fail_times_then_return(
        "flaky",
        2,
        "transient failure",
        json!({ "done": true }),
    ));
    let mut registry = AgentRegistry::new();
    registry.register("test", "flaky", flaky.clone());
    let h = harness(registry);

    let mut row = WorkflowRow::new(
        "wf",
        "owner-1",
        json!({
            "tasks": [{ "name": "only", "agent_type": "test", "action": "flaky" }]
        }),
    );
    row.max_retries = 2;
    let workflow = h.store.create_workflow(row).await.unwrap();

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());
    // Failed twice, succeeded on the third attempt.
    assert_eq!(flaky.call_count(), 3);

    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].retry_count, 2);
    assert_eq!(tasks[0].status, TaskStatus::Completed.to_string());
}

#[tokio::test]
async fn zero_retries_failing_task_stops_or_continues_by_policy() {
    for (policy, expected_status) in [
        ("stop", ExecutionStatus::Failed),
        ("continue", ExecutionStatus::Completed),
    ] {
        let boom = Arc::new(MockAgent::failing_retryable("boom", "nope"));
        let mut registry = AgentRegistry::new();
        registry.register("test", "boom", boom.clone());
        let h = harness(registry);

        let mut row = WorkflowRow::new(
            "wf",
            "owner-1",
            json!({
                "tasks": [{ "name": "T1", "agent_type": "test", "action": "boom" }],
                "on_error": policy
            }),
        );
        row.max_retries = 0;
        let workflow = h.store.create_workflow(row).await.unwrap();

        let execution = h
            .orchestrator
            .execute_workflow(workflow.id, None, TriggerType::Manual, None)
            .await
            .unwrap();

        // Exactly one attempt with max_retries = 0.
        assert_eq!(boom.call_count(), 1, "policy {policy}");
        assert_eq!(execution.status, expected_status.to_string(), "policy {policy}");

        let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed.to_string());

        match expected_status {
            ExecutionStatus::Failed => {
                assert!(execution.error_message.is_some());
                assert!(execution.output.is_none());
            }
            _ => {
                // continue: the failed task is recorded as a null sentinel.
                assert_eq!(execution.output, Some(json!({ "T1": null })));
            }
        }
    }
}

#[tokio::test]
async fn on_error_retry_reruns_the_whole_workflow_once() {
    // Fails once, succeeds on the re-run (per-task retries are disabled).
    let flaky = Arc::new(MockAgent::fail_times_then_return(
        "flaky",
        1,
        "first run breaks",
        json!({ "ok": true }),
    ));
    let mut registry = AgentRegistry::new();
    registry.register("test", "flaky", flaky.clone());
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [{
                "name": "T1", "agent_type": "test", "action": "flaky", "max_retries": 0
            }],
            "on_error": "retry"
        }),
    )
    .await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());
    assert_eq!(flaky.call_count(), 2);

    // Both runs created a task row for T1.
    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].status, TaskStatus::Failed.to_string());
    assert_eq!(tasks[1].status, TaskStatus::Completed.to_string());
}

#[tokio::test]
async fn unresolvable_agent_fails_without_retry() {
    let h = harness(AgentRegistry::new());
    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [{ "name": "T1", "agent_type": "ghost", "action": "run" }]
        }),
    )
    .await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed.to_string());
    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed.to_string());
    assert_eq!(tasks[0].retry_count, 0);
    assert!(tasks[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("no agent registered"));
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_workflow_is_rejected() {
    let h = harness(AgentRegistry::new());
    let missing = Uuid::new_v4();

    let err = h
        .orchestrator
        .execute_workflow(missing, None, TriggerType::Manual, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotFound(id) if id == missing));
}

#[tokio::test]
async fn inactive_workflow_is_rejected() {
    let h = harness(AgentRegistry::new());
    let mut row = WorkflowRow::new("wf", "owner-1", json!({ "tasks": [] }));
    row.status = WorkflowStatus::Inactive.to_string();
    let workflow = h.store.create_workflow(row).await.unwrap();

    let err = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowNotActive { .. }));
}

#[test]
fn unknown_trigger_type_fails_to_parse() {
    assert!("slack".parse::<TriggerType>().is_ok());
    assert!("carrier_pigeon".parse::<TriggerType>().is_err());
}

// ---------------------------------------------------------------------------
// Variable scope
// ---------------------------------------------------------------------------

#[tokio::test]
async fn caller_variables_shadow_workflow_variables() {
    let echo = Arc::new(MockAgent::returning("echo", json!({ "ok": true })));
    let mut registry = AgentRegistry::new();
    registry.register("test", "echo", echo.clone());
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [{
                "name": "T1", "agent_type": "test", "action": "echo",
                "parameters": { "msg": "${greeting}" }
            }],
            "variables": { "greeting": "hello" }
        }),
    )
    .await;

    h.orchestrator
        .execute_workflow(
            workflow.id,
            None,
            TriggerType::Manual,
            Some(map(json!({ "greeting": "bonjour" }))),
        )
        .await
        .unwrap();

    assert_eq!(echo.call(0).unwrap()["msg"], json!("bonjour"));
}

#[tokio::test]
async fn downstream_tasks_see_upstream_outputs_by_name() {
    let producer = Arc::new(MockAgent::returning("producer", json!({ "x": 1 })));
    let consumer = Arc::new(MockAgent::returning("consumer", json!({ "ok": true })));
    let mut registry = AgentRegistry::new();
    registry.register("test", "produce", producer.clone());
    registry.register("test", "consume", consumer.clone());
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [
                { "name": "T1", "agent_type": "test", "action": "produce" },
                {
                    "name": "T2", "agent_type": "test", "action": "consume",
                    "parameters": { "prev": "${T1}" }
                },
            ]
        }),
    )
    .await;

    h.orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(consumer.call(0).unwrap()["prev"], json!({ "x": 1 }));
}

// ---------------------------------------------------------------------------
// DAG path (through the orchestrator)
// ---------------------------------------------------------------------------

fn diamond_definition() -> Value {
    json!({
        "tasks": [
            { "name": "A", "agent_type": "test", "action": "a" },
            { "name": "B", "agent_type": "test", "action": "b", "depends_on": ["A"] },
            { "name": "C", "agent_type": "test", "action": "c", "depends_on": ["A"] },
            { "name": "D", "agent_type": "test", "action": "d", "depends_on": ["B", "C"] },
        ]
    })
}

#[tokio::test]
async fn dag_diamond_orders_terminal_timestamps() {
    let mut registry = AgentRegistry::new();
    registry.register(
        "test",
        "a",
        Arc::new(MockAgent::returning("a", json!({ "v": 1 }))),
    );
    registry.register(
        "test",
        "b",
        Arc::new(
            MockAgent::returning("b", json!({ "b": 2 })).with_delay(Duration::from_millis(40)),
        ),
    );
    registry.register(
        "test",
        "c",
        Arc::new(
            MockAgent::returning("c", json!({ "c": 3 })).with_delay(Duration::from_millis(40)),
        ),
    );
    registry.register(
        "test",
        "d",
        Arc::new(MockAgent::returning("d", json!({ "d": 4 }))),
    );
    let h = harness(registry);

    let workflow = create_workflow(&h.store, diamond_definition()).await;
    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());
    assert_eq!(
        execution.output,
        Some(json!({
            "A": { "v": 1 },
            "B": { "b": 2 },
            "C": { "c": 3 },
            "D": { "d": 4 },
        }))
    );

    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    let row = |name: &str| tasks.iter().find(|t| t.name == name).unwrap().clone();

    let (a, b, c, d) = (row("A"), row("B"), row("C"), row("D"));
    // A terminates before B and C start; D starts after both terminate.
    assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
    assert!(a.completed_at.unwrap() <= c.started_at.unwrap());
    assert!(d.started_at.unwrap() >= b.completed_at.unwrap());
    assert!(d.started_at.unwrap() >= c.completed_at.unwrap());
}

#[tokio::test]
async fn dag_dependency_failure_skips_dependents() {
    let d_agent = Arc::new(MockAgent::returning("d", json!({ "d": 4 })));
    let mut registry = AgentRegistry::new();
    registry.register(
        "test",
        "a",
        Arc::new(MockAgent::returning("a", json!({ "v": 1 }))),
    );
    registry.register("test", "b", Arc::new(MockAgent::failing_fatal("b", "boom")));
    registry.register(
        "test",
        "c",
        Arc::new(MockAgent::returning("c", json!({ "c": 3 }))),
    );
    registry.register("test", "d", d_agent.clone());
    let h = harness(registry);

    let workflow = create_workflow(&h.store, diamond_definition()).await;
    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed.to_string());
    assert_eq!(execution.error_message.as_deref(), Some("boom"));

    let tasks = h.orchestrator.get_execution_tasks(execution.id).await.unwrap();
    let status = |name: &str| tasks.iter().find(|t| t.name == name).unwrap().status.clone();

    assert_eq!(status("A"), TaskStatus::Completed.to_string());
    assert_eq!(status("B"), TaskStatus::Failed.to_string());
    assert_eq!(status("C"), TaskStatus::Completed.to_string());
    assert_eq!(status("D"), TaskStatus::Skipped.to_string());

    let d = tasks.iter().find(|t| t.name == "D").unwrap();
    assert_eq!(d.error_message.as_deref(), Some("Dependency failed"));
    // Skipped tasks never started.
    assert!(d.started_at.is_none() && d.completed_at.is_none());
    assert_eq!(d_agent.call_count(), 0);
}

#[tokio::test]
async fn dag_cycle_aborts_and_fails_the_execution() {
    let h = harness(AgentRegistry::new());
    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [
                { "name": "A", "agent_type": "test", "action": "a", "depends_on": ["B"] },
                { "name": "B", "agent_type": "test", "action": "b", "depends_on": ["A"] },
            ]
        }),
    )
    .await;

    let err = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CircularDependency(_)));

    // The execution row still terminated in a failed state.
    let execution = h
        .orchestrator
        .get_execution(
            h.store
                .latest_chain_execution(workflow.id)
                .await
                .unwrap()
                .unwrap()
                .id,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed.to_string());
}

// ---------------------------------------------------------------------------
// Cancellation and invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_is_observed_between_tasks() {
    let slow = Arc::new(
        MockAgent::returning("slow", json!({ "ok": true })).with_delay(Duration::from_millis(100)),
    );
    let never = Arc::new(MockAgent::returning("never", json!({ "ok": true })));
    let mut registry = AgentRegistry::new();
    registry.register("test", "slow", slow.clone());
    registry.register("test", "never", never.clone());
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [
                { "name": "T1", "agent_type": "test", "action": "slow" },
                { "name": "T2", "agent_type": "test", "action": "never" },
            ]
        }),
    )
    .await;

    let pending = h
        .orchestrator
        .spawn_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    // Cancel while T1 is in flight; T1 drains, T2 is never scheduled.
    tokio::time::sleep(Duration::from_millis(40)).await;
    h.orchestrator.cancel_execution(pending.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let execution = h.orchestrator.get_execution(pending.id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled.to_string());
    assert!(execution.completed_at.is_some());

    assert_eq!(slow.call_count(), 1);
    assert_eq!(never.call_count(), 0);
}

#[tokio::test]
async fn cancelling_a_terminal_execution_is_a_no_op() {
    let mut registry = AgentRegistry::new();
    registry.register(
        "test",
        "echo",
        Arc::new(MockAgent::returning("echo", json!({ "ok": true }))),
    );
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [{ "name": "T1", "agent_type": "test", "action": "echo" }]
        }),
    )
    .await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed.to_string());

    h.orchestrator.cancel_execution(execution.id).await.unwrap();

    let after = h.orchestrator.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(after.status, ExecutionStatus::Completed.to_string());
    assert_eq!(after.completed_at, execution.completed_at);
}

#[tokio::test]
async fn terminal_rows_satisfy_timestamp_invariants() {
    let mut registry = AgentRegistry::new();
    registry.register(
        "test",
        "echo",
        Arc::new(
            MockAgent::returning("echo", json!({ "ok": true })).with_delay(Duration::from_millis(15)),
        ),
    );
    let h = harness(registry);

    let workflow = create_workflow(
        &h.store,
        json!({
            "tasks": [
                { "name": "T1", "agent_type": "test", "action": "echo" },
                { "name": "T2", "agent_type": "test", "action": "echo" },
            ]
        }),
    )
    .await;

    let execution = h
        .orchestrator
        .execute_workflow(workflow.id, None, TriggerType::Manual, None)
        .await
        .unwrap();

    let started_at = execution.started_at.unwrap();
    let completed_at = execution.completed_at.unwrap();
    assert!(started_at <= completed_at);
    assert_eq!(
        execution.duration_ms,
        Some((completed_at - started_at).num_milliseconds())
    );

    for task in h.orchestrator.get_execution_tasks(execution.id).await.unwrap() {
        let task_started = task.started_at.unwrap();
        let task_completed = task.completed_at.unwrap();
        assert!(task.queued_at <= task_started);
        assert!(task_started <= task_completed);
    }
}
