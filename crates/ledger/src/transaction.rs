//! Ledger transactions submitted through a connection

use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single atomic change applied by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    AddAsset { resource: Resource },
    UpdateAsset { resource: Resource },
    RemoveAsset { kind: RegistryKind, id: String },
}

impl Transaction {
    pub fn kind(&self) -> RegistryKind {
        match self {
            Transaction::AddAsset { resource } | Transaction::UpdateAsset { resource } => {
                resource.kind
            }
            Transaction::RemoveAsset { kind, .. } => *kind,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            Transaction::AddAsset { resource } | Transaction::UpdateAsset { resource } => {
                &resource.id
            }
            Transaction::RemoveAsset { id, .. } => id,
        }
    }
}

/// Proof that the ledger committed a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_id: Uuid,
    pub submitted_by: Identity,
    pub committed_at: DateTime<Utc>,
}

impl TransactionReceipt {
    pub fn new(submitted_by: Identity) -> Self {
        Self {
            transaction_id: Uuid::new_v4(),
            submitted_by,
            committed_at: Utc::now(),
        }
    }
}
