//! `MockAgent` — a test double for `AgentExecutor`.
//!
//! Useful in unit and integration tests where a real agent implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{AgentError, AgentExecutor, JsonMap};

/// Behaviour injected into `MockAgent` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON object.
    ReturnValue(JsonMap),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Retryable` error a fixed number of times, then succeed.
    FailThenSucceed {
        remaining: Mutex<u32>,
        error: String,
        value: JsonMap,
    },
}

/// A mock agent that records every call it receives and returns a
/// programmer-specified result.
pub struct MockAgent {
    /// Label used in test assertions.
    pub name: String,
    /// What the agent will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// Artificial execution time, for concurrency tests.
    pub delay: Option<Duration>,
    /// All parameter maps seen by this agent (in call order).
    pub calls: Arc<Mutex<Vec<JsonMap>>>,
}

fn as_map(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = JsonMap::new();
            map.insert("value".into(), other);
            map
        }
    }
}

impl MockAgent {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::ReturnValue(as_map(value)),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailRetryable(msg.into()),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailFatal(msg.into()),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that fails `times` times with a `Retryable` error and
    /// then succeeds with `value`.
    pub fn fail_times_then_return(
        name: impl Into<String>,
        times: u32,
        msg: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            name: name.into(),
            behaviour: MockBehaviour::FailThenSucceed {
                remaining: Mutex::new(times),
                error: msg.into(),
                value: as_map(value),
            },
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make every call take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times this agent has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Parameters seen on call `index`.
    pub fn call(&self, index: usize) -> Option<JsonMap> {
        self.calls.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl AgentExecutor for MockAgent {
    async fn execute(&self, params: JsonMap) -> Result<JsonMap, AgentError> {
        self.calls.lock().unwrap().push(params);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.behaviour {
            MockBehaviour::ReturnValue(map) => Ok(map.clone()),
            MockBehaviour::FailRetryable(msg) => Err(AgentError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(AgentError::Fatal(msg.clone())),
            MockBehaviour::FailThenSucceed {
                remaining,
                error,
                value,
            } => {
                let mut left = remaining.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    Err(AgentError::Retryable(error.clone()))
                } else {
                    Ok(value.clone())
                }
            }
        }
    }
}
