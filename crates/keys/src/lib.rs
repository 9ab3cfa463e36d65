//! Key registry orchestration
//!
//! Every key operation runs inside a connection scope opened for the caller's
//! identity: [`ConnectionManager::scoped`] acquires the connection, runs the
//! operation and releases the connection before returning, whatever the
//! outcome. [`KeyOrchestrator`] implements the operations on top of that
//! scope, and [`Representation`] selects how keys are rendered for callers.

pub mod error;
pub mod manager;
pub mod orchestrator;
pub mod representation;

pub use error::{KeyError, KeyResult};
pub use manager::{ConnectionGuard, ConnectionManager};
pub use orchestrator::{KeyOrchestrator, Reply, ReplyStatus, KEY_EXISTS};
pub use representation::Representation;
