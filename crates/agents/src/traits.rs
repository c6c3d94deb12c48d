//! The `AgentExecutor` trait — the contract every agent must fulfil.

use async_trait::async_trait;

use crate::AgentError;

/// String-keyed parameter and output maps exchanged with agents.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The core agent trait.
///
/// Executors may perform I/O and may be long-running; per-task timeouts are
/// enforced by the executor itself, not by the engine.
///
/// The error variant drives the engine's retry decision: a
/// [`AgentError::Retryable`] failure is re-attempted with exponential
/// back-off up to the task's budget, while [`AgentError::Fatal`] marks the
/// task failed on the spot. A key with no registered executor is treated
/// like a fatal failure and is never retried.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Execute the agent action with fully-resolved parameters and return
    /// the output map.
    async fn execute(&self, params: JsonMap) -> Result<JsonMap, AgentError>;
}
