//! Builds and edits resources from caller payloads
//!
//! The factory owns the relationship schema of every registry: which payload
//! fields are references and which kind they point to. Everything else in a
//! payload is stored verbatim.

use crate::errors::*;
use crate::types::*;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct ModelFactory {
    relationships: HashMap<RegistryKind, BTreeMap<String, RegistryKind>>,
}

impl ModelFactory {
    /// Factory with no relationships declared for any registry.
    pub fn empty() -> Self {
        Self {
            relationships: HashMap::new(),
        }
    }

    /// Declare that `field` on `kind` resources references a `target` resource.
    pub fn with_relationship(
        mut self,
        kind: RegistryKind,
        field: impl Into<String>,
        target: RegistryKind,
    ) -> Self {
        self.relationships
            .entry(kind)
            .or_default()
            .insert(field.into(), target);
        self
    }

    pub fn relationship(&self, kind: RegistryKind, field: &str) -> Option<RegistryKind> {
        self.relationships
            .get(&kind)
            .and_then(|fields| fields.get(field))
            .copied()
    }

    pub fn create_key(&self, payload: &Value) -> Result<Resource> {
        self.create(RegistryKind::Keys, payload)
    }

    pub fn edit_key(&self, existing: Resource, payload: &Value) -> Result<Resource> {
        self.edit(existing, payload)
    }

    /// Build a resource from either serialized form.
    ///
    /// Relationship fields accept a bare id, a `resource:` URI, or an embedded
    /// (resolved) object carrying an `id`, so resolved and unresolved output
    /// both parse back to the same resource.
    pub fn create(&self, kind: RegistryKind, payload: &Value) -> Result<Resource> {
        let object = payload_object(payload)?;
        let id = payload_id(object)?;

        let mut resource = Resource::new(kind, id);
        for (name, value) in object {
            if name == "id" {
                continue;
            }
            let field = self.parse_field(kind, name, value)?;
            resource.fields.insert(name.clone(), field);
        }
        Ok(resource)
    }

    /// Shallow merge of `payload` onto `existing`.
    ///
    /// Fields present in the payload overwrite, absent fields are kept and a
    /// payload `id` is ignored.
    pub fn edit(&self, mut existing: Resource, payload: &Value) -> Result<Resource> {
        let object = payload_object(payload)?;
        for (name, value) in object {
            if name == "id" {
                continue;
            }
            let field = self.parse_field(existing.kind, name, value)?;
            existing.fields.insert(name.clone(), field);
        }
        Ok(existing)
    }

    fn parse_field(&self, kind: RegistryKind, name: &str, value: &Value) -> Result<Field> {
        let Some(target) = self.relationship(kind, name) else {
            return Ok(Field::Value(value.clone()));
        };

        match value {
            Value::Null => Ok(Field::Value(Value::Null)),
            Value::String(raw) => match ResourceRef::parse_uri(raw) {
                Some(reference) if reference.kind == target => Ok(Field::Reference(reference)),
                Some(reference) => Err(LedgerError::InvalidPayload(format!(
                    "field {name} must reference a {target}, got {reference}"
                ))),
                None if raw.is_empty() => Err(LedgerError::InvalidPayload(format!(
                    "field {name} must not be an empty reference"
                ))),
                None => Ok(Field::Reference(ResourceRef::new(target, raw.clone()))),
            },
            Value::Object(embedded) => match embedded.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => Ok(Field::Reference(ResourceRef::new(target, id))),
                _ => Err(LedgerError::InvalidPayload(format!(
                    "embedded {target} in field {name} has no id"
                ))),
            },
            _ => Err(LedgerError::InvalidPayload(format!(
                "field {name} must be a {target} identifier"
            ))),
        }
    }
}

impl Default for ModelFactory {
    /// Key owners are members and keys open vehicles, which are owned by members too.
    fn default() -> Self {
        Self::empty()
            .with_relationship(RegistryKind::Keys, "owner", RegistryKind::Members)
            .with_relationship(RegistryKind::Keys, "vehicle", RegistryKind::Vehicles)
            .with_relationship(RegistryKind::Vehicles, "owner", RegistryKind::Members)
    }
}

fn payload_object(payload: &Value) -> Result<&Map<String, Value>> {
    payload
        .as_object()
        .ok_or_else(|| LedgerError::InvalidPayload("payload must be a JSON object".into()))
}

fn payload_id(object: &Map<String, Value>) -> Result<String> {
    match object.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(LedgerError::InvalidPayload(
            "payload.id must be a non-empty string".into(),
        )),
    }
}
