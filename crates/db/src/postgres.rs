//! Postgres implementation of [`WorkflowStore`].
//!
//! JSON-valued columns (`definition`, `parameters`, `output`) are stored as
//! opaque TEXT and parsed on read, so the stringified payload round-trips
//! verbatim. Queries are runtime-checked; the schema lives in `migrations/`.

use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{ExecutionRow, TaskRow, WorkflowRow};
use crate::store::WorkflowStore;
use crate::{DbError, DbPool};

/// Durable store backed by a Postgres connection pool.
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn workflow_from_row(row: &PgRow) -> Result<WorkflowRow, DbError> {
    let definition: String = row.try_get("definition")?;
    Ok(WorkflowRow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_id: row.try_get("owner_id")?,
        workspace_id: row.try_get("workspace_id")?,
        status: row.try_get("status")?,
        version: row.try_get("version")?,
        timeout_secs: row.try_get("timeout_secs")?,
        max_retries: row.try_get("max_retries")?,
        schedule: row.try_get("schedule")?,
        definition: serde_json::from_str(&definition)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRow, DbError> {
    let output: Option<String> = row.try_get("output")?;
    Ok(ExecutionRow {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        status: row.try_get("status")?,
        trigger_type: row.try_get("trigger_type")?,
        triggered_by: row.try_get("triggered_by")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        duration_ms: row.try_get("duration_ms")?,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<TaskRow, DbError> {
    let parameters: String = row.try_get("parameters")?;
    let output: Option<String> = row.try_get("output")?;
    Ok(TaskRow {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        name: row.try_get("name")?,
        agent_type: row.try_get("agent_type")?,
        action: row.try_get("action")?,
        parameters: serde_json::from_str(&parameters)?,
        status: row.try_get("status")?,
        retry_count: row.try_get("retry_count")?,
        queued_at: row.try_get("queued_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error_message: row.try_get("error_message")?,
    })
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl WorkflowStore for PgStore {
    async fn create_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, name, owner_id, workspace_id, status, version, timeout_secs,
                 max_retries, schedule, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.owner_id)
        .bind(&row.workspace_id)
        .bind(&row.status)
        .bind(row.version)
        .bind(row.timeout_secs)
        .bind(row.max_retries)
        .bind(&row.schedule)
        .bind(row.definition.to_string())
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRow>, DbError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self, owner_id: &str) -> Result<Vec<WorkflowRow>, DbError> {
        let rows =
            sqlx::query("SELECT * FROM workflows WHERE owner_id = $1 ORDER BY created_at DESC")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn update_workflow(&self, row: WorkflowRow) -> Result<WorkflowRow, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET name = $2, owner_id = $3, workspace_id = $4, status = $5, version = $6,
                timeout_secs = $7, max_retries = $8, schedule = $9, definition = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.owner_id)
        .bind(&row.workspace_id)
        .bind(&row.status)
        .bind(row.version)
        .bind(row.timeout_secs)
        .bind(row.max_retries)
        .bind(&row.schedule)
        .bind(row.definition.to_string())
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(row)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), DbError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn create_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError> {
        sqlx::query(
            r#"
            INSERT INTO executions
                (id, workflow_id, status, trigger_type, triggered_by, created_at,
                 started_at, completed_at, duration_ms, output, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(row.id)
        .bind(row.workflow_id)
        .bind(&row.status)
        .bind(&row.trigger_type)
        .bind(&row.triggered_by)
        .bind(row.created_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.duration_ms)
        .bind(row.output.as_ref().map(|v| v.to_string()))
        .bind(&row.error_message)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DbError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn update_execution(&self, row: ExecutionRow) -> Result<ExecutionRow, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, started_at = $3, completed_at = $4, duration_ms = $5,
                output = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.status)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.duration_ms)
        .bind(row.output.as_ref().map(|v| v.to_string()))
        .bind(&row.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(row)
    }

    async fn latest_chain_execution(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ExecutionRow>, DbError> {
        let row = sqlx::query(
            "SELECT * FROM executions WHERE workflow_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn create_task(&self, row: TaskRow) -> Result<TaskRow, DbError> {
        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, execution_id, name, agent_type, action, parameters, status,
                 retry_count, queued_at, started_at, completed_at, output, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(row.id)
        .bind(row.execution_id)
        .bind(&row.name)
        .bind(&row.agent_type)
        .bind(&row.action)
        .bind(row.parameters.to_string())
        .bind(&row.status)
        .bind(row.retry_count)
        .bind(row.queued_at)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.output.as_ref().map(|v| v.to_string()))
        .bind(&row.error_message)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    async fn update_task(&self, row: TaskRow) -> Result<TaskRow, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, retry_count = $3, started_at = $4, completed_at = $5,
                output = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&row.status)
        .bind(row.retry_count)
        .bind(row.started_at)
        .bind(row.completed_at)
        .bind(row.output.as_ref().map(|v| v.to_string()))
        .bind(&row.error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(row)
    }

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<TaskRow>, DbError> {
        let rows =
            sqlx::query("SELECT * FROM tasks WHERE execution_id = $1 ORDER BY queued_at ASC")
                .bind(execution_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(task_from_row).collect()
    }
}
