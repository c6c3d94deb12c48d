//! Storage abstraction over the three core tables.
//!
//! [`WorkflowStore`] is the interface the engine consumes; [`MemoryStore`]
//! is the default backend for tests and single-process deployments, and
//! [`PgStore`](crate::PgStore) is the durable Postgres backend.
//!
//! Guarantees required by callers: single-row updates are atomic, and reads
//! on the same handle observe prior writes. No cross-row transactions.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::models::{ExecutionRow, TaskRow, WorkflowRow};
use crate::DbError;

/// Repository interface for workflows, executions, and tasks.
///
/// All operations are async so network-backed stores can implement the
/// trait without blocking the scheduler. `update_*` methods replace the
/// whole row and return [`DbError::NotFound`] when the id is unknown.
#[async_trait::async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError>;
    /// All workflows owned by `owner_id`, newest first.
    async fn list_workflows(&self, owner_id: &str) -> Result<Vec<WorkflowRow>, DbError>;
    async fn update_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError>;
    /// Hard delete. Soft deletion is an `update_workflow` to `archived`.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError>;

    async fn create_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError>;
    async fn update_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError>;
    /// Most recent execution of the given workflow, by creation time.
    async fn latest_chain_execution(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ExecutionRow>, DbError>;

    async fn create_task(&self, row: TaskRow) -> Result<TaskRow, DbError>;
    async fn update_task(&self, row: TaskRow) -> Result<TaskRow, DbError>;
    /// Tasks of an execution ordered by `queued_at`.
    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<TaskRow>, DbError>;
}

/// In-memory implementation for development and testing.
///
/// Uses `RwLock<HashMap>` per table; guards are held only for the copy, so
/// holding one across an await point is impossible by construction.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<Uuid, WorkflowRow>>,
    executions: RwLock<HashMap<Uuid, ExecutionRow>>,
    tasks: RwLock<HashMap<Uuid, TaskRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl WorkflowStore for MemoryStore {
    async fn create_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        let mut workflows = self.workflows.write().unwrap();
        workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        let workflows = self.workflows.read().unwrap();
        Ok(workflows.get(&id).cloned())
    }

    async fn list_workflows(&self, owner_id: &str) -> Result<Vec<WorkflowRow>, DbError> {
        let workflows = self.workflows.read().unwrap();
        let mut rows: Vec<WorkflowRow> = workflows
            .values()
            .filter(|w| w.owner_id == owner_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn update_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        let mut workflows = self.workflows.write().unwrap();
        if !workflows.contains_key(&row.id) {
            return Err(DbError::NotFound);
        }
        workflows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        let mut workflows = self.workflows.write().unwrap();
        workflows.remove(&id).map(|_| ()).ok_or(DbError::NotFound)
    }

    async fn create_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError> {
        let mut executions = self.executions.write().unwrap();
        executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError> {
        let executions = self.executions.read().unwrap();
        Ok(executions.get(&id).cloned())
    }

    async fn update_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError> {
        let mut executions = self.executions.write().unwrap();
        if !executions.contains_key(&row.id) {
            return Err(DbError::NotFound);
        }
        executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn latest_chain_execution(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ExecutionRow>, DbError> {
        let executions = self.executions.read().unwrap();
        Ok(executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .max_by_key(|e| e.created_at)
            .cloned())
    }

    async fn create_task(&self, row: TaskRow) -> Result<TaskRow, DbError> {
        let mut tasks = self.tasks.write().unwrap();
        tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_task(&self, row: TaskRow) -> Result<TaskRow, DbError> {
        let mut tasks = self.tasks.write().unwrap();
        if !tasks.contains_key(&row.id) {
            return Err(DbError::NotFound);
        }
        tasks.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        let tasks = self.tasks.read().unwrap();
        let mut rows: Vec<TaskRow> = tasks
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.queued_at);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionRow, TaskRow, TriggerType, WorkflowRow};
    use serde_json::json;

    #[tokio::test]
    async fn workflow_definition_round_trips_unchanged() {
        let store = MemoryStore::new();
        let definition = json!({
            "tasks": [{ "name": "t1", "agent_type": "http", "action": "get" }],
            "variables": { "base_url": "https://example.test" },
            "on_error": "stop"
        });

        let created = store
            .create_workflow(WorkflowRow::new("fetch", "user-1", definition.clone()))
            .await
            .unwrap();
        let read = store.get_workflow(created.id).await.unwrap().unwrap();

        assert_eq!(read.definition, definition);
        // The JSON channel preserves the definition byte-for-byte.
        assert_eq!(
            serde_json::to_string(&read.definition).unwrap(),
            serde_json::to_string(&definition).unwrap()
        );
    }

    #[tokio::test]
    async fn list_workflows_filters_by_owner() {
        let store = MemoryStore::new();
        store
            .create_workflow(WorkflowRow::new("a", "alice", json!({})))
            .await
            .unwrap();
        store
            .create_workflow(WorkflowRow::new("b", "bob", json!({})))
            .await
            .unwrap();

        let rows = store.list_workflows("alice").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "a");
    }

    #[tokio::test]
    async fn update_of_missing_execution_is_not_found() {
        let store = MemoryStore::new();
        let row = ExecutionRow::new(uuid::Uuid::new_v4(), TriggerType::Manual, None);
        assert!(matches!(
            store.update_execution(row).await,
            Err(DbError::NotFound)
        ));
    }

    #[tokio::test]
    async fn tasks_are_listed_in_queue_order() {
        let store = MemoryStore::new();
        let execution_id = uuid::Uuid::new_v4();

        for name in ["first", "second", "third"] {
            let mut row = TaskRow::queued(execution_id, name, "mock", "run", json!({}));
            // Force distinct, increasing timestamps.
            row.queued_at = chrono::Utc::now();
            store.create_task(row).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let rows = store.list_tasks(execution_id).await.unwrap();
        let names: Vec<&str> = rows.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn latest_chain_execution_picks_newest() {
        let store = MemoryStore::new();
        let workflow_id = uuid::Uuid::new_v4();

        let old = ExecutionRow::new(workflow_id, TriggerType::Chain, None);
        store.create_execution(old).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let newer = ExecutionRow::new(workflow_id, TriggerType::Chain, None);
        let newer_id = newer.id;
        store.create_execution(newer).await.unwrap();

        let latest = store
            .latest_chain_execution(workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, newer_id);
    }
}
