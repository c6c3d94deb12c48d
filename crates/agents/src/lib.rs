//! `agents` crate — the `AgentExecutor` trait and the registry that maps
//! `(agent_type, action)` pairs to executor capabilities.
//!
//! Every agent — browser driver, data processor, storage adapter alike —
//! implements [`AgentExecutor`]. The engine crate dispatches execution
//! through this trait object and never enumerates agents itself.

pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::AgentError;
pub use registry::AgentRegistry;
pub use traits::{AgentExecutor, JsonMap};
