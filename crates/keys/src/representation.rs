use keyledger_ledger::{LedgerConnection, Registry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How keys are rendered for the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Every relationship expanded into the referenced object.
    Resolved,
    /// Stored form, relationships as identifiers only.
    #[default]
    Unresolved,
}

impl Representation {
    pub fn from_resolve_flag(resolve: bool) -> Self {
        if resolve {
            Representation::Resolved
        } else {
            Representation::Unresolved
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Representation::Resolved)
    }

    /// Render the key stored under `id`. The caller has already checked that
    /// it exists.
    pub async fn render_one(
        self,
        connection: &dyn LedgerConnection,
        registry: &dyn Registry,
        id: &str,
    ) -> keyledger_ledger::Result<Value> {
        match self {
            Representation::Resolved => registry.resolve(id).await,
            Representation::Unresolved => {
                let key = registry.get(id).await?;
                connection.serialize_to_json(&key)
            }
        }
    }

    /// Render every key in the registry snapshot.
    pub async fn render_all(
        self,
        connection: &dyn LedgerConnection,
        registry: &dyn Registry,
    ) -> keyledger_ledger::Result<Vec<Value>> {
        match self {
            Representation::Resolved => registry.resolve_all().await,
            Representation::Unresolved => registry
                .get_all()
                .await?
                .iter()
                .map(|key| connection.serialize_to_json(key))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyledger_ledger::{
        Identity, LedgerConnector, MemoryLedger, RegistryKind, Resource, ResourceRef,
    };
    use serde_json::json;

    fn seeded() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.register_participant("u1");
        ledger
            .seed(Resource::new(RegistryKind::Members, "alice").with_value("name", json!("Alice")))
            .unwrap();
        ledger
            .seed(
                Resource::new(RegistryKind::Keys, "k1")
                    .with_value("scope", json!("read"))
                    .with_reference("owner", ResourceRef::new(RegistryKind::Members, "alice")),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn test_resolve_flag_selects_representation() {
        assert_eq!(Representation::from_resolve_flag(true), Representation::Resolved);
        assert_eq!(Representation::from_resolve_flag(false), Representation::Unresolved);
        assert_eq!(Representation::default(), Representation::Unresolved);
    }

    #[tokio::test]
    async fn test_render_one_in_both_forms() {
        let ledger = seeded();
        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        let unresolved = Representation::Unresolved
            .render_one(connection.as_ref(), registry.as_ref(), "k1")
            .await
            .unwrap();
        assert_eq!(unresolved["scope"], json!("read"));
        assert_eq!(
            unresolved["owner"],
            json!("resource:org.keyledger.Member#alice")
        );

        let resolved = Representation::Resolved
            .render_one(connection.as_ref(), registry.as_ref(), "k1")
            .await
            .unwrap();
        assert_eq!(resolved["owner"]["id"], json!("alice"));
        assert_eq!(resolved["owner"]["name"], json!("Alice"));

        drop(registry);
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_render_all_counts_every_key() {
        let ledger = seeded();
        ledger
            .seed(Resource::new(RegistryKind::Keys, "k2").with_value("scope", json!("write")))
            .unwrap();
        let connection = ledger.connect(&Identity::new("u1")).await.unwrap();
        let registry = connection.registry(RegistryKind::Keys).await.unwrap();

        for representation in [Representation::Resolved, Representation::Unresolved] {
            let keys = representation
                .render_all(connection.as_ref(), registry.as_ref())
                .await
                .unwrap();
            assert_eq!(keys.len(), 2);
        }

        drop(registry);
        connection.disconnect().await.unwrap();
    }
}
