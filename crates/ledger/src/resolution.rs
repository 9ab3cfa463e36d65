//! Expansion of resource relationships into embedded objects

use crate::errors::*;
use crate::types::*;
use serde_json::Value;
use std::collections::HashSet;

/// Resolve `resource` into caller-safe JSON with every relationship expanded.
///
/// `lookup` fetches the current stored form of a referenced resource. A
/// reference back to a resource already being expanded on the current path is
/// left in its URI form, so cyclic graphs terminate. A referent that does not
/// exist fails the whole resolution.
pub fn resolve_resource<F>(resource: &Resource, lookup: &F) -> Result<Value>
where
    F: Fn(&ResourceRef) -> Option<Resource>,
{
    let mut path = HashSet::new();
    expand(resource, lookup, &mut path)
}

fn expand<F>(resource: &Resource, lookup: &F, path: &mut HashSet<ResourceRef>) -> Result<Value>
where
    F: Fn(&ResourceRef) -> Option<Resource>,
{
    let this = resource.reference();
    path.insert(this.clone());

    let mut object = resource.unresolved_object();

    for (name, reference) in resource.references() {
        if path.contains(reference) {
            continue;
        }
        let target = lookup(reference).ok_or_else(|| LedgerError::UnresolvedReference {
            reference: reference.to_uri(),
        })?;
        let expanded = expand(&target, lookup, path)?;
        object.insert(name.clone(), expanded);
    }

    path.remove(&this);
    Ok(Value::Object(object))
}
