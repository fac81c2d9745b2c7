//! ``src/model/tab.rs``
//! ============================================================================
//! # Tab Definitions
//!
//! Validated, immutable descriptions of the browser tabs. Raw TOML tables are
//! converted through `TryFrom` so malformed tabs are rejected at load time.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{LoaderError, LoaderResult};
use crate::model::entity::Context;
use crate::model::filter::{ContextToken, FilterPredicate};

/// How a tab's tree is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TabKind {
    /// Walk the navigation hierarchy from `root_path`.
    Hierarchy { root_path: String },
    /// One entity query grouped by `hierarchy_fields`.
    Query {
        entity_type: String,
        filters: Vec<FilterPredicate>,
        hierarchy_fields: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TabDefinition {
    pub caption: String,
    pub kind: TabKind,
    /// Sent with the publish query, ahead of the global filters.
    pub publish_filters: Vec<FilterPredicate>,
    /// `None` defers to the global setting.
    pub show_all_versions: Option<bool>,
}

impl TabDefinition {
    #[must_use]
    pub const fn is_hierarchy(&self) -> bool {
        matches!(self.kind, TabKind::Hierarchy { .. })
    }

    /// Depth of grouping levels above the leaves (Query tabs only).
    #[must_use]
    pub fn grouping_depth(&self) -> usize {
        match &self.kind {
            TabKind::Query { hierarchy_fields, .. } => hierarchy_fields.len(),
            TabKind::Hierarchy { .. } => 0,
        }
    }
}

/// Resolve a hierarchy root token into a navigation path.
///
/// `{context.project}` becomes `/Project/<id>`; an empty root is the site root.
/// Paths without tokens pass through unchanged.
pub fn resolve_root_path(root: &str, context: &Context) -> LoaderResult<String> {
    let trimmed = root.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return Ok("/".to_owned());
    }

    match ContextToken::parse(trimmed) {
        None => Ok(trimmed.to_owned()),
        Some(ContextToken::ProjectId) => Err(LoaderError::configuration(
            "root",
            "{context.project.id} is not a navigation path",
        )),
        Some(token) => {
            let link = token.resolve(context);
            let entity_type = link.get("type").and_then(Value::as_str);
            let id = link.get("id").and_then(Value::as_i64);

            match (entity_type, id) {
                (Some(entity_type), Some(id)) => Ok(format!("/{entity_type}/{id}")),
                _ => Err(LoaderError::query_failed(
                    trimmed,
                    "context has no value for this root token",
                )),
            }
        }
    }
}

/// Tab table exactly as it appears in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RawTabDefinition {
    pub caption: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub root: Option<String>,
    pub entity_type: Option<String>,
    #[serde(default)]
    pub filters: Vec<Value>,
    #[serde(default)]
    pub hierarchy: Vec<String>,
    #[serde(default)]
    pub publish_filters: Vec<Value>,
    pub show_all_versions: Option<bool>,
}

pub(crate) fn parse_filters(raw: &[Value], location: &str) -> LoaderResult<Vec<FilterPredicate>> {
    raw.iter()
        .enumerate()
        .map(|(i, triple)| {
            FilterPredicate::from_triple(triple).map_err(|e| match e {
                LoaderError::Configuration { message, .. } => {
                    LoaderError::configuration(format!("{location}[{i}]"), message)
                }
                other => other,
            })
        })
        .collect()
}

impl TryFrom<RawTabDefinition> for TabDefinition {
    type Error = LoaderError;

    fn try_from(raw: RawTabDefinition) -> Result<Self, Self::Error> {
        let caption = raw
            .caption
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LoaderError::configuration("tab", "missing caption"))?;
        let location = format!("tab '{caption}'");

        let kind = match raw.kind.as_deref() {
            Some("Hierarchy") => TabKind::Hierarchy {
                root_path: raw.root.unwrap_or_default(),
            },
            Some("Query") => {
                let entity_type = raw
                    .entity_type
                    .filter(|t| !t.trim().is_empty())
                    .ok_or_else(|| LoaderError::configuration(&location, "Query tab needs entity_type"))?;

                if raw.hierarchy.iter().any(|f| f.trim().is_empty()) {
                    return Err(LoaderError::configuration(&location, "empty hierarchy field"));
                }

                TabKind::Query {
                    entity_type,
                    filters: parse_filters(&raw.filters, &format!("{location}.filters"))?,
                    hierarchy_fields: raw.hierarchy,
                }
            }
            Some(other) => {
                return Err(LoaderError::configuration(
                    &location,
                    format!("unknown tab type '{other}'"),
                ));
            }
            None => return Err(LoaderError::configuration(&location, "missing type")),
        };

        Ok(Self {
            caption,
            kind,
            publish_filters: parse_filters(&raw.publish_filters, &format!("{location}.publish_filters"))?,
            show_all_versions: raw.show_all_versions,
        })
    }
}
