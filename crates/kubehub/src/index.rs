//! Type index: loosely-formatted type names to canonical descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::{FleetError, ResourceTypeDescriptor};
use inflector::string::singularize::to_singular;

/// Immutable lookup table built from one discovery pass.
///
/// The primary key is the lower-cased kind (`pod`). Secondary keys cover the
/// plural resource name (`pods`) and group-qualified forms (`deployment.apps`,
/// `deployments.apps`).
#[derive(Debug, Clone, Default)]
pub struct TypeIndex {
    by_kind: HashMap<String, Arc<ResourceTypeDescriptor>>,
    aliases: HashMap<String, Arc<ResourceTypeDescriptor>>,
    by_key: HashMap<String, Arc<ResourceTypeDescriptor>>,
}

/// Core group types win kind collisions; otherwise the lowest group name does.
fn preferred(current: &ResourceTypeDescriptor, candidate: &ResourceTypeDescriptor) -> bool {
    match (current.group.is_empty(), candidate.group.is_empty()) {
        (true, false) => false,
        (false, true) => true,
        _ => candidate.group < current.group,
    }
}

impl TypeIndex {
    pub fn build(descriptors: &[ResourceTypeDescriptor]) -> Self {
        let mut index = TypeIndex::default();
        for d in descriptors {
            let d = Arc::new(d.clone());
            let kind = d.kind.to_lowercase();
            let plural = d.plural.to_lowercase();

            let replace = match index.by_kind.get(&kind) {
                Some(cur) => preferred(cur, &d),
                None => true,
            };
            if replace {
                index.by_kind.insert(kind.clone(), d.clone());
            }
            if replace || !index.aliases.contains_key(&plural) {
                index.aliases.insert(plural.clone(), d.clone());
            }
            if !d.group.is_empty() {
                index.aliases.insert(format!("{}.{}", kind, d.group), d.clone());
                index.aliases.insert(format!("{}.{}", plural, d.group), d.clone());
            }
            index.by_key.insert(d.key(), d);
        }
        index
    }

    fn lookup(&self, key: &str) -> Option<&Arc<ResourceTypeDescriptor>> {
        self.by_kind.get(key).or_else(|| self.aliases.get(key))
    }

    /// Resolve `pod`, `pods`, `Pod`, `Pods` (and qualified forms) to one descriptor.
    pub fn resolve(&self, raw: &str) -> Result<&Arc<ResourceTypeDescriptor>, FleetError> {
        let key = raw.trim().to_lowercase();
        if let Some(d) = self.lookup(&key) {
            return Ok(d);
        }
        let singular = to_singular(&key);
        if singular != key {
            if let Some(d) = self.lookup(&singular) {
                return Ok(d);
            }
        }
        Err(FleetError::UnknownKind(raw.to_string()))
    }

    /// Look up by canonical `group/version/plural` key.
    pub fn get(&self, key: &str) -> Option<&Arc<ResourceTypeDescriptor>> {
        self.by_key.get(key)
    }

    /// Every descriptor, sorted by canonical key.
    pub fn descriptors(&self) -> Vec<ResourceTypeDescriptor> {
        let mut out: Vec<_> = self.by_key.values().map(|d| (**d).clone()).collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
