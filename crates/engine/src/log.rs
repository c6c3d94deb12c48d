//! Execution log projector.
//!
//! Derives a human-readable, chronologically-sorted event stream and a
//! progress percentage from persisted task rows. Pure projection: nothing
//! here mutates state.

use chrono::{DateTime, Utc};
use db::{TaskRow, TaskStatus};

/// Severity of a projected event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Info,
    Error,
}

/// One task transition, ready for display.
#[derive(Debug, Clone)]
pub struct ExecutionEvent {
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub task: String,
    pub message: String,
    pub retry_count: i32,
    pub error: Option<String>,
}

/// Project one event per observed task transition (queued, started,
/// completed/failed/skipped), sorted chronologically.
pub fn project_events(tasks: &[TaskRow]) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();

    for task in tasks {
        events.push(ExecutionEvent {
            timestamp: task.queued_at,
            level: EventLevel::Info,
            task: task.name.clone(),
            message: format!("Task '{}' queued", task.name),
            retry_count: task.retry_count,
            error: None,
        });

        if let Some(started_at) = task.started_at {
            events.push(ExecutionEvent {
                timestamp: started_at,
                level: EventLevel::Info,
                task: task.name.clone(),
                message: format!("Task '{}' started", task.name),
                retry_count: task.retry_count,
                error: None,
            });
        }

        match task.status.parse::<TaskStatus>() {
            Ok(TaskStatus::Completed) => {
                if let Some(completed_at) = task.completed_at {
                    let duration_ms = task
                        .started_at
                        .map(|s| (completed_at - s).num_milliseconds())
                        .unwrap_or(0);
                    events.push(ExecutionEvent {
                        timestamp: completed_at,
                        level: EventLevel::Info,
                        task: task.name.clone(),
                        message: format!("Task '{}' completed in {duration_ms}ms", task.name),
                        retry_count: task.retry_count,
                        error: None,
                    });
                }
            }
            Ok(TaskStatus::Failed) => {
                if let Some(completed_at) = task.completed_at {
                    events.push(ExecutionEvent {
                        timestamp: completed_at,
                        level: EventLevel::Error,
                        task: task.name.clone(),
                        message: format!("Task '{}' failed", task.name),
                        retry_count: task.retry_count,
                        error: task.error_message.clone(),
                    });
                }
            }
            // Skipped tasks never started; the skip is reported at queue
            // time with the recorded reason.
            Ok(TaskStatus::Skipped) => {
                events.push(ExecutionEvent {
                    timestamp: task.queued_at,
                    level: EventLevel::Error,
                    task: task.name.clone(),
                    message: format!("Task '{}' skipped", task.name),
                    retry_count: task.retry_count,
                    error: task.error_message.clone(),
                });
            }
            _ => {}
        }
    }

    events.sort_by_key(|e| e.timestamp);
    events
}

/// Percentage of completed tasks, rounded; 0 with no tasks.
pub fn progress(tasks: &[TaskRow]) -> u8 {
    if tasks.is_empty() {
        return 0;
    }
    let completed = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed.to_string())
        .count();
    ((100.0 * completed as f64 / tasks.len() as f64).round()) as u8
}
