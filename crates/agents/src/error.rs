//! How agents signal failure.

use thiserror::Error;

/// Failure classification an agent hands back from `execute`.
///
/// Agents pick the variant; the retry policy that reacts to it lives in
/// the engine crate (see [`AgentExecutor`](crate::AgentExecutor) for the
/// contract).
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// The failure is worth another attempt (network hiccup, rate limit,
    /// stale browser session).
    #[error("agent failed transiently: {0}")]
    Retryable(String),

    /// Re-running cannot succeed (bad credentials, malformed parameters,
    /// missing remote resource).
    #[error("agent failed permanently: {0}")]
    Fatal(String),
}
