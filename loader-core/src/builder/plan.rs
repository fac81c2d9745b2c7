//! ``src/builder/plan.rs``
//! ============================================================================
//! # Expansion Plans
//!
//! Decides, on the UI thread, what remote work expanding a node needs, and
//! runs that work on a background worker turning the answer into
//! [`NodeSpec`]s. Plans own all their inputs so they can cross threads.

use tracing::{debug, info_span};

use crate::builder::grouping::group_records;
use crate::error::{LoaderError, LoaderResult};
use crate::host::EntityDatabase;
use crate::model::entity::{Context, HierarchyEntry};
use crate::model::filter::{FilterPredicate, resolve_all};
use crate::model::tab::{TabDefinition, TabKind, resolve_root_path};
use crate::model::tree::{GroupingKey, NodeSpec, TreeNode};

/// Remote work that produces one level (or, for queries, the whole tree).
#[derive(Debug, Clone, PartialEq)]
pub enum ExpandPlan {
    /// List a navigation path.
    ListPath { path: String },
    /// One entity query grouped client-side.
    Query {
        entity_type: String,
        filters: Vec<FilterPredicate>,
        hierarchy_fields: Vec<String>,
    },
}

impl ExpandPlan {
    /// Plan for expanding `node` of `tab`. `None` when the node's children are
    /// produced by an ancestor (Query grouping levels) or it has a complete
    /// listing already built in.
    pub fn for_node(
        tab: &TabDefinition,
        node: &TreeNode,
        is_root: bool,
        context: &Context,
    ) -> LoaderResult<Option<Self>> {
        match &tab.kind {
            TabKind::Hierarchy { root_path } => {
                let path = if is_root {
                    resolve_root_path(root_path, context)?
                } else {
                    match &node.path {
                        Some(path) => path.clone(),
                        None => return Ok(None),
                    }
                };
                Ok(Some(Self::ListPath { path }))
            }
            TabKind::Query {
                entity_type,
                filters,
                hierarchy_fields,
            } => Ok(is_root.then(|| Self::Query {
                entity_type: entity_type.clone(),
                filters: resolve_all(filters, context),
                hierarchy_fields: hierarchy_fields.clone(),
            })),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::ListPath { path } => format!("children of {path}"),
            Self::Query { entity_type, .. } => format!("{entity_type} query"),
        }
    }

    /// Run on a worker thread.
    pub fn execute(&self, database: &dyn EntityDatabase) -> LoaderResult<Vec<NodeSpec>> {
        let _span = info_span!("expand", plan = %self.describe()).entered();

        match self {
            Self::ListPath { path } => {
                let entries = database
                    .list_children(path)
                    .map_err(|e| as_query_failure(&self.describe(), e))?;
                debug!(
                    marker = "EXPAND",
                    operation_type = "list_children",
                    count = entries.len(),
                    "Listed hierarchy children"
                );
                Ok(entries.into_iter().map(hierarchy_spec).collect())
            }
            Self::Query {
                entity_type,
                filters,
                hierarchy_fields,
            } => {
                let records = database
                    .find(entity_type, filters)
                    .map_err(|e| as_query_failure(&self.describe(), e))?;
                debug!(
                    marker = "EXPAND",
                    operation_type = "entity_query",
                    count = records.len(),
                    "Entity query returned"
                );
                Ok(group_records(&records, hierarchy_fields))
            }
        }
    }
}

fn hierarchy_spec(entry: HierarchyEntry) -> NodeSpec {
    let key = entry
        .entity_ref
        .as_ref()
        .map_or_else(|| GroupingKey::Path(entry.path.clone()), GroupingKey::for_entity);

    NodeSpec {
        key,
        label: entry.label,
        entity_ref: entry.entity_ref,
        path: Some(entry.path),
        // Nothing below: the node is a finished leaf.
        complete: !entry.has_children,
        children: Vec::new(),
    }
}

pub(crate) fn as_query_failure(target: &str, error: LoaderError) -> LoaderError {
    match error {
        LoaderError::QueryFailed { .. } => error,
        other => LoaderError::query_failed(target, other.to_string()),
    }
}
