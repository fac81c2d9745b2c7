//! ``src/host.rs``
//! ============================================================================
//! # Host Collaborators
//!
//! Capability interfaces the engine calls through. The host injects concrete
//! implementations at session construction; the engine never depends on them
//! directly. Database and filter-hook methods are invoked from background
//! workers concurrently and must be reentrant.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoaderError, LoaderResult};
use crate::model::entity::{EntityRecord, EntityRef, HierarchyEntry, PublishRecord, ThumbnailRef};
use crate::model::filter::FilterPredicate;

/// Which publishes a node asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishScope {
    /// Publishes whose `entity` is this entity.
    LinkedTo(EntityRef),
    /// Publishes linked to any of these entities.
    LinkedToAny(Vec<EntityRef>),
    /// Everything registered under a navigation path.
    UnderPath(String),
}

/// Remote entity database.
pub trait EntityDatabase: Send + Sync {
    /// Run one entity query with already-resolved filters.
    fn find(&self, entity_type: &str, filters: &[FilterPredicate]) -> LoaderResult<Vec<EntityRecord>>;

    /// Children of a navigation path.
    fn list_children(&self, path: &str) -> LoaderResult<Vec<HierarchyEntry>>;

    /// Publishes in `scope` matching `filters` (server side).
    fn find_publishes(
        &self,
        scope: &PublishScope,
        filters: &[FilterPredicate],
    ) -> LoaderResult<Vec<PublishRecord>>;

    /// Raw thumbnail bytes.
    fn download_thumbnail(&self, thumbnail: &ThumbnailRef) -> LoaderResult<Bytes>;
}

/// Where the publish list being filtered comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationContext {
    pub tab_caption: String,
    pub label_path: Vec<String>,
    pub entity_ref: Option<EntityRef>,
    pub path: Option<String>,
}

/// User hook that may reduce a publish listing.
pub trait FilterPublishesHook: Send + Sync {
    fn filter(
        &self,
        records: Vec<PublishRecord>,
        location: &LocationContext,
    ) -> LoaderResult<Vec<PublishRecord>>;
}

/// Default hook: keep everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughFilter;

impl FilterPublishesHook for PassThroughFilter {
    fn filter(
        &self,
        records: Vec<PublishRecord>,
        _location: &LocationContext,
    ) -> LoaderResult<Vec<PublishRecord>> {
        Ok(records)
    }
}

/// UI area an action list is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UiArea {
    Main,
    Details,
    History,
}

/// What an action runs against.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionTarget {
    Publish(PublishRecord),
    Entity(EntityRef),
}

impl ActionTarget {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Publish(p) => format!("{} {} v{:03}", p.published_file_type, p.id, p.version_number),
            Self::Entity(e) => format!("{} {}", e.entity_type, e.id),
        }
    }
}

/// One executable action instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    /// Identifier from the mapping tables.
    pub name: String,
    /// Display label.
    pub caption: String,
    #[serde(default)]
    pub description: String,
    /// Extra data handed back to `execute_action`.
    #[serde(default)]
    pub params: Option<Value>,
}

impl ActionDescriptor {
    /// Descriptor with a caption derived from the identifier
    /// (`open_folder` → `Open Folder`).
    #[must_use]
    pub fn from_identifier(name: &str) -> Self {
        let caption = name
            .split(['_', '-', ' '])
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                chars.next().map_or_else(String::new, |first| {
                    first.to_uppercase().chain(chars).collect::<String>()
                })
            })
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            name: name.to_owned(),
            caption,
            description: String::new(),
            params: None,
        }
    }
}

/// Host-side action implementation.
pub trait ActionsHook: Send + Sync {
    /// Expand mapped action identifiers into concrete instances for `target`.
    /// An identifier may yield zero, one or several instances.
    fn generate_actions(
        &self,
        target: &ActionTarget,
        actions: &[String],
        ui_area: UiArea,
    ) -> LoaderResult<Vec<ActionDescriptor>>;

    fn execute_action(&self, target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()>;

    /// Run a batch in order, stopping at the first failure.
    fn execute_multiple_actions(&self, batch: &[(ActionTarget, ActionDescriptor)]) -> LoaderResult<()> {
        for (target, action) in batch {
            self.execute_action(target, action)?;
        }
        Ok(())
    }
}

/// Collaborators handed to a session.
#[derive(Clone)]
pub struct Collaborators {
    pub database: Arc<dyn EntityDatabase>,
    pub actions: Arc<dyn ActionsHook>,
    pub filter_publishes: Arc<dyn FilterPublishesHook>,
}

impl Collaborators {
    #[must_use]
    pub fn new(database: Arc<dyn EntityDatabase>, actions: Arc<dyn ActionsHook>) -> Self {
        Self {
            database,
            actions,
            filter_publishes: Arc::new(PassThroughFilter),
        }
    }

    #[must_use]
    pub fn with_filter_hook(mut self, hook: Arc<dyn FilterPublishesHook>) -> Self {
        self.filter_publishes = hook;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Actions hook that returns one default descriptor per identifier and
/// refuses to execute; useful when the host wires actions elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActions;

impl ActionsHook for NoActions {
    fn generate_actions(
        &self,
        _target: &ActionTarget,
        actions: &[String],
        _ui_area: UiArea,
    ) -> LoaderResult<Vec<ActionDescriptor>> {
        Ok(actions.iter().map(|a| ActionDescriptor::from_identifier(a)).collect())
    }

    fn execute_action(&self, _target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()> {
        Err(LoaderError::action_hook_failed(&action.name, "no actions hook configured"))
    }
}
