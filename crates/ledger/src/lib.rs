//! Ledger registry interface for keyledger
//!
//! This crate describes how a service talks to a transactional ledger: an
//! identity-scoped [`LedgerConnection`] hands out typed [`Registry`] handles
//! over [`Resource`]s, serializes them for callers and submits transactions.
//! [`MemoryLedger`] is an in-process implementation used by the node in
//! development mode and by every test suite in the workspace.

pub mod connection;
pub mod errors;
pub mod factory;
pub mod memory;
pub mod resolution;
pub mod transaction;
pub mod types;

pub use connection::{LedgerConnection, LedgerConnector, Registry};
pub use errors::*;
pub use factory::ModelFactory;
pub use memory::{LedgerOp, MemoryLedger, SessionStats};
pub use transaction::{Transaction, TransactionReceipt};
pub use types::*;
