use crate::errors::{ConnectionError, Result};
use crate::factory::ModelFactory;
use crate::transaction::{Transaction, TransactionReceipt};
use crate::types::{Identity, RegistryKind, Resource};
use async_trait::async_trait;
use serde_json::Value;

/// Opens identity-scoped connections to a ledger.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> std::result::Result<Box<dyn LedgerConnection>, ConnectionError>;
}

/// A live session with the ledger on behalf of one identity.
///
/// Implementations must tolerate `disconnect` being called more than once,
/// but callers are expected to call it exactly once.
#[async_trait]
pub trait LedgerConnection: Send + Sync {
    fn identity(&self) -> &Identity;

    /// Model factory matching the ledger's deployed schema.
    fn factory(&self) -> &ModelFactory;

    /// Registry handle for `kind`, valid only while this connection is live.
    async fn registry<'a>(&'a self, kind: RegistryKind) -> Result<Box<dyn Registry + 'a>>;

    fn serialize_to_json(&self, resource: &Resource) -> Result<Value>;

    fn serialize_from_json(&self, kind: RegistryKind, value: &Value) -> Result<Resource>;

    async fn submit_transaction(&self, transaction: Transaction) -> Result<TransactionReceipt>;

    async fn disconnect(&self) -> Result<()>;
}

/// Collection of resources of one [`RegistryKind`].
#[async_trait]
pub trait Registry: Send + Sync {
    fn kind(&self) -> RegistryKind;

    async fn exists(&self, id: &str) -> Result<bool>;

    /// Stored (unresolved) form; fails with `NotFound` if absent.
    async fn get(&self, id: &str) -> Result<Resource>;

    /// Caller-safe form with every relationship expanded.
    async fn resolve(&self, id: &str) -> Result<Value>;

    async fn get_all(&self) -> Result<Vec<Resource>>;

    async fn resolve_all(&self) -> Result<Vec<Value>>;

    /// Fails with `AlreadyExists` if the id is taken.
    async fn add(&self, resource: Resource) -> Result<()>;

    /// Fails with `NotFound` if the id is absent.
    async fn update(&self, resource: Resource) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;
}
