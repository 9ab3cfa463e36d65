//! In-memory ledger
//!
//! Keeps every registry in process behind a single lock so each call, and
//! each submitted transaction, is applied atomically. Participants must be
//! registered before they can connect. Session accounting and one-shot fault
//! injection make connection lifecycle behaviour observable from tests.

use crate::connection::{LedgerConnection, LedgerConnector, Registry};
use crate::errors::*;
use crate::factory::ModelFactory;
use crate::resolution::resolve_resource;
use crate::transaction::{Transaction, TransactionReceipt};
use crate::types::*;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Ledger calls that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    Connect,
    Registry,
    Exists,
    Get,
    Resolve,
    GetAll,
    ResolveAll,
    Add,
    Update,
    Remove,
    Serialize,
    SubmitTransaction,
    Disconnect,
}

/// Point-in-time view of session accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub opened: u64,
    /// Every call to `disconnect`, including repeated ones.
    pub disconnect_calls: u64,
    /// Sessions that transitioned from live to released.
    pub closed: u64,
}

impl SessionStats {
    pub fn open(&self) -> u64 {
        self.opened.saturating_sub(self.closed)
    }
}

#[derive(Debug, Default)]
struct SessionCounters {
    opened: AtomicU64,
    disconnect_calls: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug, Default)]
struct LedgerState {
    participants: HashSet<Identity>,
    registries: HashMap<RegistryKind, BTreeMap<String, Resource>>,
    transactions: Vec<(TransactionReceipt, Transaction)>,
    faults: HashSet<LedgerOp>,
    stale_exists: bool,
    offline: bool,
}

impl LedgerState {
    fn registry(&self, kind: RegistryKind) -> Option<&BTreeMap<String, Resource>> {
        self.registries.get(&kind)
    }

    fn lookup(&self, reference: &ResourceRef) -> Option<Resource> {
        self.registry(reference.kind)
            .and_then(|resources| resources.get(&reference.id))
            .cloned()
    }

    fn insert_new(&mut self, resource: Resource) -> Result<()> {
        let registry = self.registries.entry(resource.kind).or_default();
        if registry.contains_key(&resource.id) {
            return Err(LedgerError::AlreadyExists {
                kind: resource.kind,
                id: resource.id,
            });
        }
        registry.insert(resource.id.clone(), resource);
        Ok(())
    }

    fn replace(&mut self, resource: Resource) -> Result<()> {
        match self
            .registries
            .get_mut(&resource.kind)
            .and_then(|registry| registry.get_mut(&resource.id))
        {
            Some(slot) => {
                *slot = resource;
                Ok(())
            }
            None => Err(LedgerError::NotFound {
                kind: resource.kind,
                id: resource.id,
            }),
        }
    }

    fn delete(&mut self, kind: RegistryKind, id: &str) -> Result<()> {
        self.registries
            .get_mut(&kind)
            .and_then(|registry| registry.remove(id))
            .map(|_| ())
            .ok_or_else(|| LedgerError::NotFound {
                kind,
                id: id.to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct MemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    sessions: Arc<SessionCounters>,
    factory: Arc<ModelFactory>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_factory(ModelFactory::default())
    }

    pub fn with_factory(factory: ModelFactory) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            sessions: Arc::new(SessionCounters::default()),
            factory: Arc::new(factory),
        }
    }

    pub fn factory(&self) -> &ModelFactory {
        &self.factory
    }

    /// Allow `identity` to open connections.
    pub fn register_participant(&self, identity: impl Into<String>) {
        self.state
            .write()
            .participants
            .insert(Identity::new(identity));
    }

    pub fn revoke_participant(&self, identity: &Identity) -> bool {
        self.state.write().participants.remove(identity)
    }

    /// While offline every `connect` fails as unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    /// Make the next `op` call fail with a backend error.
    pub fn inject_fault(&self, op: LedgerOp) {
        self.state.write().faults.insert(op);
    }

    pub fn clear_faults(&self) {
        self.state.write().faults.clear();
    }

    /// Invert the next `exists` answer, as if another session added or
    /// removed the resource right after the check.
    pub fn stale_next_exists(&self) {
        self.state.write().stale_exists = true;
    }

    /// Store a resource directly, bypassing connections.
    pub fn seed(&self, resource: Resource) -> Result<()> {
        self.state.write().insert_new(resource)
    }

    pub fn contains(&self, kind: RegistryKind, id: &str) -> bool {
        self.state
            .read()
            .registry(kind)
            .is_some_and(|registry| registry.contains_key(id))
    }

    pub fn stored(&self, kind: RegistryKind, id: &str) -> Option<Resource> {
        self.state.read().lookup(&ResourceRef::new(kind, id))
    }

    pub fn count(&self, kind: RegistryKind) -> usize {
        self.state.read().registry(kind).map_or(0, BTreeMap::len)
    }

    /// Committed transactions in submission order.
    pub fn transactions(&self) -> Vec<(TransactionReceipt, Transaction)> {
        self.state.read().transactions.clone()
    }

    pub fn session_stats(&self) -> SessionStats {
        SessionStats {
            opened: self.sessions.opened.load(Ordering::SeqCst),
            disconnect_calls: self.sessions.disconnect_calls.load(Ordering::SeqCst),
            closed: self.sessions.closed.load(Ordering::SeqCst),
        }
    }

    fn trip(&self, op: LedgerOp) -> Result<()> {
        if self.state.write().faults.remove(&op) {
            return Err(LedgerError::Backend(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn exists(&self, kind: RegistryKind, id: &str) -> bool {
        let present = self.contains(kind, id);
        let stale = std::mem::take(&mut self.state.write().stale_exists);
        present != stale
    }

    fn get(&self, kind: RegistryKind, id: &str) -> Result<Resource> {
        self.stored(kind, id).ok_or_else(|| LedgerError::NotFound {
            kind,
            id: id.to_string(),
        })
    }

    fn resolve(&self, kind: RegistryKind, id: &str) -> Result<Value> {
        let state = self.state.read();
        let resource = state
            .lookup(&ResourceRef::new(kind, id))
            .ok_or_else(|| LedgerError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        resolve_resource(&resource, &|reference: &ResourceRef| state.lookup(reference))
    }

    fn get_all(&self, kind: RegistryKind) -> Vec<Resource> {
        self.state
            .read()
            .registry(kind)
            .map(|registry| registry.values().cloned().collect())
            .unwrap_or_default()
    }

    fn resolve_all(&self, kind: RegistryKind) -> Result<Vec<Value>> {
        let state = self.state.read();
        let Some(registry) = state.registry(kind) else {
            return Ok(Vec::new());
        };
        let lookup = |reference: &ResourceRef| state.lookup(reference);
        registry
            .values()
            .map(|resource| resolve_resource(resource, &lookup))
            .collect()
    }

    fn apply(&self, submitted_by: &Identity, transaction: Transaction) -> Result<TransactionReceipt> {
        let mut state = self.state.write();
        match &transaction {
            Transaction::AddAsset { resource } => state.insert_new(resource.clone())?,
            Transaction::UpdateAsset { resource } => state.replace(resource.clone())?,
            Transaction::RemoveAsset { kind, id } => state.delete(*kind, id)?,
        }
        let receipt = TransactionReceipt::new(submitted_by.clone());
        state.transactions.push((receipt.clone(), transaction));
        Ok(receipt)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerConnector for MemoryLedger {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> std::result::Result<Box<dyn LedgerConnection>, ConnectionError> {
        if identity.is_empty() {
            return Err(ConnectionError::EmptyIdentity);
        }
        if self.trip(LedgerOp::Connect).is_err() {
            return Err(ConnectionError::Unreachable(
                "injected connect failure".into(),
            ));
        }
        {
            let state = self.state.read();
            if state.offline {
                return Err(ConnectionError::Unreachable("ledger is offline".into()));
            }
            if !state.participants.contains(identity) {
                return Err(ConnectionError::Unauthorized {
                    identity: identity.to_string(),
                });
            }
        }

        let session = self.sessions.opened.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%identity, session, "memory ledger session opened");
        Ok(Box::new(MemoryConnection {
            identity: identity.clone(),
            session,
            ledger: self.clone(),
            live: AtomicBool::new(true),
        }))
    }
}

/// Connection handed out by [`MemoryLedger`].
#[derive(Debug)]
pub struct MemoryConnection {
    identity: Identity,
    session: u64,
    ledger: MemoryLedger,
    live: AtomicBool,
}

impl MemoryConnection {
    pub fn session(&self) -> u64 {
        self.session
    }

    fn check(&self, op: LedgerOp) -> Result<()> {
        if !self.live.load(Ordering::SeqCst) {
            return Err(LedgerError::Disconnected);
        }
        self.ledger.trip(op)
    }
}

#[async_trait]
impl LedgerConnection for MemoryConnection {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn factory(&self) -> &ModelFactory {
        self.ledger.factory()
    }

    async fn registry<'a>(&'a self, kind: RegistryKind) -> Result<Box<dyn Registry + 'a>> {
        self.check(LedgerOp::Registry)?;
        Ok(Box::new(MemoryRegistry {
            connection: self,
            kind,
        }))
    }

    fn serialize_to_json(&self, resource: &Resource) -> Result<Value> {
        self.check(LedgerOp::Serialize)?;
        Ok(resource.to_unresolved_json())
    }

    fn serialize_from_json(&self, kind: RegistryKind, value: &Value) -> Result<Resource> {
        self.check(LedgerOp::Serialize)?;
        self.factory().create(kind, value)
    }

    async fn submit_transaction(&self, transaction: Transaction) -> Result<TransactionReceipt> {
        self.check(LedgerOp::SubmitTransaction)?;
        self.ledger.apply(&self.identity, transaction)
    }

    async fn disconnect(&self) -> Result<()> {
        self.ledger
            .sessions
            .disconnect_calls
            .fetch_add(1, Ordering::SeqCst);
        if self.live.swap(false, Ordering::SeqCst) {
            self.ledger.sessions.closed.fetch_add(1, Ordering::SeqCst);
            debug!(identity = %self.identity, session = self.session, "memory ledger session closed");
        }
        self.ledger.trip(LedgerOp::Disconnect)
    }
}

struct MemoryRegistry<'a> {
    connection: &'a MemoryConnection,
    kind: RegistryKind,
}

impl MemoryRegistry<'_> {
    fn ledger(&self) -> &MemoryLedger {
        &self.connection.ledger
    }
}

#[async_trait]
impl Registry for MemoryRegistry<'_> {
    fn kind(&self) -> RegistryKind {
        self.kind
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        self.connection.check(LedgerOp::Exists)?;
        Ok(self.ledger().exists(self.kind, id))
    }

    async fn get(&self, id: &str) -> Result<Resource> {
        self.connection.check(LedgerOp::Get)?;
        self.ledger().get(self.kind, id)
    }

    async fn resolve(&self, id: &str) -> Result<Value> {
        self.connection.check(LedgerOp::Resolve)?;
        self.ledger().resolve(self.kind, id)
    }

    async fn get_all(&self) -> Result<Vec<Resource>> {
        self.connection.check(LedgerOp::GetAll)?;
        Ok(self.ledger().get_all(self.kind))
    }

    async fn resolve_all(&self) -> Result<Vec<Value>> {
        self.connection.check(LedgerOp::ResolveAll)?;
        self.ledger().resolve_all(self.kind)
    }

    async fn add(&self, resource: Resource) -> Result<()> {
        self.connection.check(LedgerOp::Add)?;
        if resource.kind != self.kind {
            return Err(LedgerError::InvalidPayload(format!(
                "cannot add a {} to the {} registry",
                resource.kind, self.kind
            )));
        }
        self.ledger().state.write().insert_new(resource)
    }

    async fn update(&self, resource: Resource) -> Result<()> {
        self.connection.check(LedgerOp::Update)?;
        if resource.kind != self.kind {
            return Err(LedgerError::InvalidPayload(format!(
                "cannot update a {} in the {} registry",
                resource.kind, self.kind
            )));
        }
        self.ledger().state.write().replace(resource)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.connection.check(LedgerOp::Remove)?;
        self.ledger().state.write().delete(self.kind, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger_with(identity: &str) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.register_participant(identity);
        ledger
    }

    #[tokio::test]
    async fn test_connect_requires_registered_participant() {
        let ledger = ledger_with("u1");

        assert!(ledger.connect(&Identity::new("u1")).await.is_ok());
        assert!(matches!(
            ledger.connect(&Identity::new("mallory")).await,
            Err(ConnectionError::Unauthorized { .. })
        ));
        assert!(matches!(
            ledger.connect(&Identity::new("")).await,
            Err(ConnectionError::EmptyIdentity)
        ));
    }

    #[tokio::test]
    async fn test_offline_ledger_is_unreachable() {
        let ledger = ledger_with("u1");
        ledger.set_offline(true);
        assert!(matches!(
            ledger.connect(&Identity::new("u1")).await,
            Err(ConnectionError::Unreachable(_))
        ));
        assert_eq!(ledger.session_stats().opened, 0);
    }

    #[tokio::test]
    async fn test_registry_crud() {
        let ledger = ledger_with("u1");
        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        let key = Resource::new(RegistryKind::Keys, "k1").with_value("scope", json!("read"));
        registry.add(key.clone()).await.unwrap();
        assert!(registry.exists("k1").await.unwrap());
        assert!(matches!(
            registry.add(key.clone()).await,
            Err(LedgerError::AlreadyExists { .. })
        ));

        let updated = key.with_value("scope", json!("write"));
        registry.update(updated.clone()).await.unwrap();
        assert_eq!(registry.get("k1").await.unwrap(), updated);

        registry.remove("k1").await.unwrap();
        assert!(!registry.exists("k1").await.unwrap());
        assert!(registry.get("k1").await.unwrap_err().is_not_found(RegistryKind::Keys, "k1"));
        assert!(matches!(
            registry.update(updated).await,
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_expands_members() {
        let ledger = ledger_with("u1");
        ledger
            .seed(Resource::new(RegistryKind::Members, "u1").with_value("name", json!("Ada")))
            .unwrap();
        ledger
            .seed(
                Resource::new(RegistryKind::Keys, "k1")
                    .with_reference("owner", ResourceRef::new(RegistryKind::Members, "u1")),
            )
            .unwrap();

        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        let resolved = registry.resolve("k1").await.unwrap();
        assert_eq!(resolved, json!({"id": "k1", "owner": {"id": "u1", "name": "Ada"}}));

        let all = registry.resolve_all().await.unwrap();
        assert_eq!(all, vec![resolved]);
    }

    #[tokio::test]
    async fn test_disconnected_connection_rejects_calls() {
        let ledger = ledger_with("u1");
        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        connection.disconnect().await.unwrap();

        assert!(matches!(
            connection.registry(RegistryKind::Keys).await,
            Err(LedgerError::Disconnected)
        ));

        // Repeated release is tolerated but counted.
        connection.disconnect().await.unwrap();
        let stats = ledger.session_stats();
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.disconnect_calls, 2);
        assert_eq!(stats.open(), 0);
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let ledger = ledger_with("u1");
        ledger.inject_fault(LedgerOp::Exists);

        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        assert!(matches!(
            registry.exists("k1").await,
            Err(LedgerError::Backend(_))
        ));
        assert!(!registry.exists("k1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_exists_inverts_one_answer() {
        let ledger = ledger_with("u1");
        ledger.seed(Resource::new(RegistryKind::Keys, "k1")).unwrap();
        ledger.stale_next_exists();

        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        assert!(!registry.exists("k1").await.unwrap());
        assert!(registry.exists("k1").await.unwrap());
        assert!(!registry.exists("k2").await.unwrap());
    }

    #[tokio::test]
    async fn test_transactions_apply_atomically() {
        let ledger = ledger_with("u1");
        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let key = Resource::new(RegistryKind::Keys, "k1");

        let receipt = connection
            .submit_transaction(Transaction::AddAsset {
                resource: key.clone(),
            })
            .await
            .unwrap();
        assert_eq!(receipt.submitted_by, Identity::new("u1"));

        let err = connection
            .submit_transaction(Transaction::AddAsset { resource: key })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));

        let log = ledger.transactions();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0.transaction_id, receipt.transaction_id);
        assert_eq!(log[0].1.target_id(), "k1");
        assert_eq!(ledger.count(RegistryKind::Keys), 1);
    }

    #[test]
    fn test_registry_rejects_resources_of_another_kind() {
        let ledger = ledger_with("u1");
        tokio_test::block_on(async {
            let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
            let registry = connection.registry(RegistryKind::Keys).await.unwrap();

            let member = connection
                .serialize_from_json(RegistryKind::Members, &json!({"id": "alice"}))
                .unwrap();
            assert!(matches!(
                registry.add(member).await,
                Err(LedgerError::InvalidPayload(_))
            ));
            assert_eq!(ledger.count(RegistryKind::Members), 0);
        });
    }
}
