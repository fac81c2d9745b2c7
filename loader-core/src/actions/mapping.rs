//! ``src/actions/mapping.rs``
//! ============================================================================
//! # Action Mapping Tables
//!
//! Published-file-type and entity-type tables mapping to ordered action
//! identifiers. `*` is the fallback key in both tables. Lookups never fail:
//! an unmapped type without a wildcard simply has no actions.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, LoaderResult};
use crate::host::{ActionDescriptor, ActionTarget};

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMapping {
    #[serde(default)]
    pub by_published_file_type: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub by_entity_type: IndexMap<String, Vec<String>>,
}

impl ActionMapping {
    #[must_use]
    pub const fn new(
        by_published_file_type: IndexMap<String, Vec<String>>,
        by_entity_type: IndexMap<String, Vec<String>>,
    ) -> Self {
        Self {
            by_published_file_type,
            by_entity_type,
        }
    }

    /// Reject empty identifiers and collapse repeated ones, keeping the
    /// first position.
    pub fn validated(mut self) -> LoaderResult<Self> {
        for (table_name, table) in [
            ("action_mappings", &mut self.by_published_file_type),
            ("entity_mappings", &mut self.by_entity_type),
        ] {
            for (key, ids) in table.iter_mut() {
                if ids.iter().any(|id| id.trim().is_empty()) {
                    return Err(LoaderError::configuration(
                        format!("{table_name}.{key}"),
                        "empty action identifier",
                    ));
                }
                let mut seen = indexmap::IndexSet::new();
                ids.retain(|id| seen.insert(id.clone()));
            }
        }
        Ok(self)
    }

    /// Ordered action identifiers for `target`.
    #[must_use]
    pub fn action_ids(&self, target: &ActionTarget) -> &[String] {
        let (table, key) = match target {
            ActionTarget::Publish(publish) => {
                (&self.by_published_file_type, publish.published_file_type.as_str())
            }
            ActionTarget::Entity(entity) => (&self.by_entity_type, entity.entity_type.as_str()),
        };

        table
            .get(key)
            .or_else(|| table.get(WILDCARD))
            .map_or(&[], Vec::as_slice)
    }

    /// Descriptors straight from the tables, captions derived from ids.
    #[must_use]
    pub fn resolve(&self, target: &ActionTarget) -> Vec<ActionDescriptor> {
        self.action_ids(target)
            .iter()
            .map(|id| ActionDescriptor::from_identifier(id))
            .collect()
    }
}
