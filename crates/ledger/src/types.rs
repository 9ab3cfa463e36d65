//! Resource model shared by every ledger registry

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Namespace prefix of every resource type name.
pub const NAMESPACE: &str = "org.keyledger";

const RESOURCE_SCHEME: &str = "resource:";

/// Opaque caller identity a connection is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whitespace-only identities count as empty.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed set of resource collections held by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegistryKind {
    Keys,
    Members,
    Vehicles,
}

impl RegistryKind {
    pub const ALL: [RegistryKind; 3] = [
        RegistryKind::Keys,
        RegistryKind::Members,
        RegistryKind::Vehicles,
    ];

    /// Unqualified type name of the resources stored in this registry
    pub fn type_name(&self) -> &'static str {
        match self {
            RegistryKind::Keys => "Key",
            RegistryKind::Members => "Member",
            RegistryKind::Vehicles => "Vehicle",
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{NAMESPACE}.{}", self.type_name())
    }

    /// Accepts either `Key` or `org.keyledger.Key`.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let bare = name
            .strip_prefix(NAMESPACE)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);
        Self::ALL.into_iter().find(|kind| kind.type_name() == bare)
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Cross-reference from one resource to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: RegistryKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: RegistryKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Identifier-only form, e.g. `resource:org.keyledger.Member#alice`
    pub fn to_uri(&self) -> String {
        format!("{RESOURCE_SCHEME}{}#{}", self.kind.qualified_name(), self.id)
    }

    pub fn parse_uri(value: &str) -> Option<Self> {
        let rest = value.strip_prefix(RESOURCE_SCHEME)?;
        let (type_name, id) = rest.split_once('#')?;
        if id.is_empty() {
            return None;
        }
        let kind = RegistryKind::from_type_name(type_name)?;
        Some(Self::new(kind, id))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

/// A stored attribute: either a plain value or a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Field {
    Value(Value),
    Reference(ResourceRef),
}

/// Stored form of every ledger asset.
///
/// This is the unresolved representation: relationships are kept as
/// [`ResourceRef`]s and only expanded by a registry `resolve` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: RegistryKind,
    pub id: String,
    pub fields: BTreeMap<String, Field>,
}

impl Resource {
    pub fn new(kind: RegistryKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), Field::Value(value));
        self
    }

    pub fn with_reference(mut self, name: impl Into<String>, reference: ResourceRef) -> Self {
        self.fields.insert(name.into(), Field::Reference(reference));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, self.id.clone())
    }

    pub fn references(&self) -> impl Iterator<Item = (&String, &ResourceRef)> {
        self.fields.iter().filter_map(|(name, field)| match field {
            Field::Reference(reference) => Some((name, reference)),
            Field::Value(_) => None,
        })
    }

    /// Caller-safe JSON with every relationship rendered as its URI.
    pub fn to_unresolved_json(&self) -> Value {
        Value::Object(self.unresolved_object())
    }

    pub fn unresolved_object(&self) -> Map<String, Value> {
        let mut object = Map::new();
        object.insert("id".to_string(), Value::String(self.id.clone()));
        for (name, field) in &self.fields {
            let value = match field {
                Field::Value(value) => value.clone(),
                Field::Reference(reference) => Value::String(reference.to_uri()),
            };
            object.insert(name.clone(), value);
        }
        object
    }
}
