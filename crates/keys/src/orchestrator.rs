//! Key operations over connection-scoped registry access

use crate::error::{KeyError, KeyResult};
use crate::manager::ConnectionManager;
use crate::representation::Representation;
use keyledger_ledger::{
    Identity, LedgerConnection, LedgerConnector, LedgerError, RegistryKind, Transaction,
};
use metrics::counter;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Conflict message returned when a create targets an existing key.
pub const KEY_EXISTS: &str = "key already exists";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Created,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Created => "created",
        }
    }
}

/// Successful outcome of a key operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub body: Value,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: ReplyStatus::Ok,
            body,
        }
    }

    pub fn created(body: Value) -> Self {
        Self {
            status: ReplyStatus::Created,
            body,
        }
    }
}

/// Entry point for every key operation.
///
/// Each call opens a connection for the caller's identity, works against the
/// Keys registry and releases the connection before returning. Nothing is
/// shared between calls except the connector.
#[derive(Debug, Clone)]
pub struct KeyOrchestrator {
    connections: ConnectionManager,
}

impl KeyOrchestrator {
    pub fn new(connector: Arc<dyn LedgerConnector>) -> Self {
        Self {
            connections: ConnectionManager::new(connector),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    #[instrument(skip_all, fields(identity = %identity, ?representation))]
    pub async fn list(&self, identity: &Identity, representation: Representation) -> KeyResult<Reply> {
        let result = self
            .connections
            .scoped(identity, move |conn| Box::pin(list_keys(conn, representation)))
            .await;
        finish("list", result)
    }

    #[instrument(skip_all, fields(identity = %identity, key_id = tracing::field::Empty))]
    pub async fn create(&self, identity: &Identity, payload: Value) -> KeyResult<Reply> {
        let result = match payload_id(&payload) {
            Ok(id) => {
                tracing::Span::current().record("key_id", id.as_str());
                self.connections
                    .scoped(identity, move |conn| Box::pin(create_key(conn, id, payload)))
                    .await
            }
            Err(err) => Err(err),
        };
        finish("create", result)
    }

    /// Create through a ledger transaction instead of a direct registry add.
    #[instrument(skip_all, fields(identity = %identity, key_id = tracing::field::Empty))]
    pub async fn create_by_transaction(
        &self,
        identity: &Identity,
        payload: Value,
    ) -> KeyResult<Reply> {
        let result = match payload_id(&payload) {
            Ok(id) => {
                tracing::Span::current().record("key_id", id.as_str());
                self.connections
                    .scoped(identity, move |conn| {
                        Box::pin(create_key_by_transaction(conn, id, payload))
                    })
                    .await
            }
            Err(err) => Err(err),
        };
        finish("create_by_transaction", result)
    }

    #[instrument(skip_all, fields(identity = %identity, key_id = %id, ?representation))]
    pub async fn get(
        &self,
        identity: &Identity,
        id: &str,
        representation: Representation,
    ) -> KeyResult<Reply> {
        let id = id.to_owned();
        let result = self
            .connections
            .scoped(identity, move |conn| Box::pin(get_key(conn, id, representation)))
            .await;
        finish("get", result)
    }

    #[instrument(skip_all, fields(identity = %identity, key_id = %id))]
    pub async fn delete(&self, identity: &Identity, id: &str) -> KeyResult<Reply> {
        let id = id.to_owned();
        let result = self
            .connections
            .scoped(identity, move |conn| Box::pin(delete_key(conn, id)))
            .await;
        finish("delete", result)
    }

    #[instrument(skip_all, fields(identity = %identity, key_id = %id))]
    pub async fn update(&self, identity: &Identity, id: &str, payload: Value) -> KeyResult<Reply> {
        let result = if payload.is_object() {
            let id = id.to_owned();
            self.connections
                .scoped(identity, move |conn| Box::pin(update_key(conn, id, payload)))
                .await
        } else {
            Err(KeyError::InvalidRequest("update payload must be an object".into()))
        };
        finish("update", result)
    }
}

async fn list_keys(conn: &dyn LedgerConnection, representation: Representation) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    let keys = representation.render_all(conn, registry.as_ref()).await?;
    debug!(count = keys.len(), "listed keys");
    Ok(Reply::ok(Value::Array(keys)))
}

async fn create_key(conn: &dyn LedgerConnection, id: String, payload: Value) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    if registry.exists(&id).await? {
        return Err(KeyError::Conflict(KEY_EXISTS.into()));
    }

    let key = conn.factory().create_key(&payload)?;
    registry.add(key).await.map_err(conflict_on_duplicate)?;
    info!(key_id = %id, "key created");
    Ok(Reply::created(payload))
}

async fn create_key_by_transaction(
    conn: &dyn LedgerConnection,
    id: String,
    payload: Value,
) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    if registry.exists(&id).await? {
        return Err(KeyError::Conflict(KEY_EXISTS.into()));
    }

    let key = conn.factory().create_key(&payload)?;
    let receipt = conn
        .submit_transaction(Transaction::AddAsset { resource: key })
        .await
        .map_err(conflict_on_duplicate)?;
    info!(key_id = %id, transaction_id = %receipt.transaction_id, "key created by transaction");

    let receipt = serde_json::to_value(&receipt).map_err(LedgerError::from)?;
    Ok(Reply::created(json!({ "key": payload, "transaction": receipt })))
}

async fn get_key(
    conn: &dyn LedgerConnection,
    id: String,
    representation: Representation,
) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    if !registry.exists(&id).await? {
        return Err(KeyError::not_found(id));
    }

    let key = representation
        .render_one(conn, registry.as_ref(), &id)
        .await
        .map_err(|err| missing_as_not_found(&id, err))?;
    Ok(Reply::ok(key))
}

async fn delete_key(conn: &dyn LedgerConnection, id: String) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    if !registry.exists(&id).await? {
        return Err(KeyError::not_found(id));
    }

    registry
        .remove(&id)
        .await
        .map_err(|err| missing_as_not_found(&id, err))?;
    info!(key_id = %id, "key deleted");
    Ok(Reply::ok(json!({ "id": id })))
}

async fn update_key(conn: &dyn LedgerConnection, id: String, payload: Value) -> KeyResult<Reply> {
    let registry = conn.registry(RegistryKind::Keys).await?;
    if !registry.exists(&id).await? {
        return Err(KeyError::not_found(id));
    }

    let existing = registry
        .get(&id)
        .await
        .map_err(|err| missing_as_not_found(&id, err))?;
    let updated = conn.factory().edit_key(existing, &payload)?;
    registry
        .update(updated.clone())
        .await
        .map_err(|err| missing_as_not_found(&id, err))?;
    info!(key_id = %id, fields = payload.as_object().map_or(0, |p| p.len()), "key updated");
    Ok(Reply::ok(conn.serialize_to_json(&updated)?))
}

/// The registry stays the authority on uniqueness: a duplicate reported by the
/// add itself is the same conflict the pre-check reports.
fn conflict_on_duplicate(err: LedgerError) -> KeyError {
    match err {
        LedgerError::AlreadyExists {
            kind: RegistryKind::Keys,
            ..
        } => KeyError::Conflict(KEY_EXISTS.into()),
        other => KeyError::from(other),
    }
}

/// A key removed between the existence check and the follow-up call.
fn missing_as_not_found(id: &str, err: LedgerError) -> KeyError {
    if err.is_not_found(RegistryKind::Keys, id) {
        KeyError::not_found(id)
    } else {
        KeyError::from(err)
    }
}

fn payload_id(payload: &Value) -> KeyResult<String> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_owned)
        .ok_or_else(|| KeyError::InvalidRequest("payload.id must be a non-empty string".into()))
}

fn finish(op: &'static str, result: KeyResult<Reply>) -> KeyResult<Reply> {
    let outcome = match &result {
        Ok(reply) => reply.status.as_str(),
        Err(err) => {
            if err.is_client_error() {
                debug!(op, error = %err, "key operation rejected");
            } else {
                warn!(op, error = %err, "key operation failed");
            }
            err.outcome()
        }
    };
    counter!("keyledger_key_operations_total", "op" => op, "outcome" => outcome).increment(1);
    result
}
