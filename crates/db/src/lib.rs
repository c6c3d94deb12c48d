//! `db` crate — pure persistence layer.
//!
//! Provides typed row structs, the [`WorkflowStore`] repository trait with
//! in-memory and Postgres implementations, and a connection pool.
//! No business logic lives here.

pub mod error;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod store;

pub use error::DbError;
pub use models::{
    ExecutionRow, ExecutionStatus, TaskRow, TaskStatus, TriggerType, WorkflowRow, WorkflowStatus,
};
pub use pool::DbPool;
pub use postgres::PgStore;
pub use store::{MemoryStore, WorkflowStore};
