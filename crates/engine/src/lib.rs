//! `engine` crate — core domain models, the sequential orchestrator, the
//! parallel DAG engine, and the workflow chain manager.

pub mod chain;
pub mod dag;
pub mod error;
pub mod log;
pub mod models;
pub mod orchestrator;
pub mod variables;

pub use chain::{
    ChainConfig, ChainEntryContext, ChainEntryStatus, ChainManager, ChainResult,
    evaluate_condition,
};
pub use dag::{
    build_dag, DagConfig, DagEngine, DagNode, NodeExecutor, ParallelResult, RollbackExecutor,
};
pub use error::EngineError;
pub use log::{progress, project_events, EventLevel, ExecutionEvent};
pub use models::{
    ChainCondition, ChainEntry, ConditionOperator, DataMapping, DefinitionKind, JsonMap,
    OnErrorPolicy, TaskDefinition, WorkflowDefinition,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use variables::resolve_params;

#[cfg(test)]
mod orchestrator_tests;
