//! Agent registry — `(agent_type, action)` → executor lookup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::AgentExecutor;

/// Maps `(agent_type, action)` pairs to boxed [`AgentExecutor`]
/// implementations. Populated once at startup; a failed lookup is a
/// deterministic task failure and is never retried.
#[derive(Default)]
pub struct AgentRegistry {
    executors: HashMap<(String, String), Arc<dyn AgentExecutor>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under the given key, replacing any previous one.
    pub fn register(
        &mut self,
        agent_type: impl Into<String>,
        action: impl Into<String>,
        executor: Arc<dyn AgentExecutor>,
    ) {
        self.executors
            .insert((agent_type.into(), action.into()), executor);
    }

    /// Look up the executor for the given key.
    pub fn resolve(&self, agent_type: &str, action: &str) -> Option<Arc<dyn AgentExecutor>> {
        self.executors
            .get(&(agent_type.to_owned(), action.to_owned()))
            .cloned()
    }
}
