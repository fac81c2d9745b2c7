//! ``src/session.rs``
//! ============================================================================
//! # Loader Session
//!
//! Host-facing facade owning one tree per configured tab, the fetch
//! coordinator, the thumbnail cache and the action dispatcher. Everything is
//! scoped to the current [`Context`]; switching context tears it all down.
//!
//! The session is owned by the UI thread. Calls that need remote data return
//! immediately with a pending ticket; results are applied only when the
//! owner drains completions through [`LoaderSession::pump`] or
//! [`LoaderSession::next_event`].

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::actions::dispatcher::ActionDispatcher;
use crate::builder::plan::ExpandPlan;
use crate::cache::thumbnail_cache::{ThumbnailCache, ThumbnailKey, ThumbnailLookup};
use crate::config::LoaderConfig;
use crate::controller::coordinator::{
    Completion, FetchCoordinator, FetchKey, FetchKind, FetchOutcome, FetchPayload, FetchTicket,
};
use crate::error::{LoaderError, LoaderResult};
use crate::host::{ActionDescriptor, ActionTarget, Collaborators, UiArea};
use crate::model::entity::{Context, PublishRecord};
use crate::model::tab::{TabDefinition, TabKind};
use crate::model::tree::{FetchState, NodeId, Tree, TreeNode};
use crate::publish::pipeline::PublishRequest;

/// What changed after a completion was applied.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    ChildrenChanged {
        tab: usize,
        node: NodeId,
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    ChildrenFailed {
        tab: usize,
        node: NodeId,
        error: Arc<LoaderError>,
    },
    PublishesReady {
        tab: usize,
        node: NodeId,
        count: usize,
    },
    PublishesFailed {
        tab: usize,
        node: NodeId,
        error: Arc<LoaderError>,
    },
    ThumbnailReady {
        key: ThumbnailKey,
    },
    ThumbnailFailed {
        key: ThumbnailKey,
    },
}

/// Result of asking for a node's children.
#[derive(Debug)]
pub enum Expansion {
    /// Children are already materialised.
    Ready,
    Pending(FetchTicket),
}

/// Result of asking for a node's publishes.
#[derive(Debug)]
pub enum PublishLookup {
    Ready(Arc<Vec<PublishRecord>>),
    Pending(FetchTicket),
}

/// One configured tab and its live tree.
#[derive(Debug)]
pub struct TabState {
    definition: TabDefinition,
    tree: Tree,
}

impl TabState {
    fn new(index: usize, definition: TabDefinition) -> Self {
        let tree = Tree::new(index, &definition.caption);
        Self { definition, tree }
    }

    #[must_use]
    pub const fn definition(&self) -> &TabDefinition {
        &self.definition
    }

    #[must_use]
    pub const fn tree(&self) -> &Tree {
        &self.tree
    }
}

pub struct LoaderSession {
    config: Arc<LoaderConfig>,
    context: Context,
    collaborators: Collaborators,
    dispatcher: ActionDispatcher,
    coordinator: FetchCoordinator,
    thumbnails: ThumbnailCache,
    tabs: Vec<TabState>,
}

impl LoaderSession {
    /// Build a session whose workers run on `runtime`.
    #[must_use]
    pub fn new(config: LoaderConfig, context: Context, collaborators: Collaborators, runtime: Handle) -> Self {
        let config = Arc::new(config);
        let dispatcher = ActionDispatcher::new(
            Arc::new(config.action_mapping.clone()),
            collaborators.actions.clone(),
        );
        let coordinator = FetchCoordinator::new(runtime, config.fetch.max_workers);
        let thumbnails = ThumbnailCache::new(config.download_thumbnails, &config.thumbnails);
        let tabs = build_tabs(&config);

        info!(
            marker = "SESSION",
            operation_type = "session_created",
            tabs = tabs.len(),
            max_workers = config.fetch.max_workers,
            "Loader session created"
        );

        Self {
            config,
            context,
            collaborators,
            dispatcher,
            coordinator,
            thumbnails,
            tabs,
        }
    }

    /// Build a session on the ambient Tokio runtime.
    pub fn from_current_runtime(
        config: LoaderConfig,
        context: Context,
        collaborators: Collaborators,
    ) -> LoaderResult<Self> {
        let runtime = Handle::try_current().map_err(|e| LoaderError::RuntimeUnavailable(e.to_string().into()))?;
        Ok(Self::new(config, context, collaborators, runtime))
    }

    #[must_use]
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    #[must_use]
    pub fn tabs(&self) -> &[TabState] {
        &self.tabs
    }

    pub fn tab(&self, tab: usize) -> LoaderResult<&TabState> {
        self.tabs.get(tab).ok_or(LoaderError::UnknownTab(tab))
    }

    fn tab_mut(&mut self, tab: usize) -> LoaderResult<&mut TabState> {
        self.tabs.get_mut(tab).ok_or(LoaderError::UnknownTab(tab))
    }

    pub fn root(&self, tab: usize) -> LoaderResult<NodeId> {
        Ok(self.tab(tab)?.tree.root())
    }

    pub fn node(&self, tab: usize, node: NodeId) -> LoaderResult<&TreeNode> {
        let tree = &self.tab(tab)?.tree;
        tree.get(node).ok_or_else(|| tree.unknown(node))
    }

    /// Children in display order.
    pub fn children(&self, tab: usize, node: NodeId) -> LoaderResult<Vec<NodeId>> {
        self.node(tab, node)?;
        Ok(self.tab(tab)?.tree.children(node))
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight_count()
    }

    // ────────────────────────────────────────────────────────────
    // Tree building
    // ────────────────────────────────────────────────────────────

    /// Materialise `node`'s children. Already-fetched nodes are `Ready`; a
    /// node being fetched hands back a ticket for the request in flight.
    #[instrument(skip(self))]
    pub fn expand(&mut self, tab: usize, node: NodeId) -> LoaderResult<Expansion> {
        let state = self.node(tab, node)?.fetch_state;
        match state {
            FetchState::Fetched => Ok(Expansion::Ready),
            FetchState::Fetching => self.join_children(tab, node),
            FetchState::NotFetched | FetchState::Failed => self.start_children_fetch(tab, node),
        }
    }

    /// Fetch again and merge. Query tabs always re-run their root query.
    /// Cached publishes of every node under the refreshed one are dropped.
    #[instrument(skip(self))]
    pub fn refresh(&mut self, tab: usize, node: NodeId) -> LoaderResult<Expansion> {
        self.node(tab, node)?;
        let state = self.tab(tab)?;
        let target = match state.definition.kind {
            TabKind::Query { .. } => state.tree.root(),
            TabKind::Hierarchy { .. } => node,
        };
        self.invalidate_subtree_publishes(tab, target)?;

        if self.node(tab, target)?.fetch_state == FetchState::Fetching {
            return self.join_children(tab, target);
        }
        self.start_children_fetch(tab, target)
    }

    fn join_children(&mut self, tab: usize, node: NodeId) -> LoaderResult<Expansion> {
        if let Some(ticket) = self.coordinator.join(&FetchKey::children(tab, node)) {
            return Ok(Expansion::Pending(ticket));
        }
        // Cancelled earlier; start over.
        self.tab_mut(tab)?.tree.reset_fetch_state(node)?;
        self.start_children_fetch(tab, node)
    }

    fn start_children_fetch(&mut self, tab: usize, node: NodeId) -> LoaderResult<Expansion> {
        let plan = {
            let state = self.tab(tab)?;
            let tree_node = state.tree.get(node).ok_or_else(|| state.tree.unknown(node))?;
            ExpandPlan::for_node(&state.definition, tree_node, node == state.tree.root(), &self.context)
        };

        let tree = &mut self.tab_mut(tab)?.tree;
        tree.set_fetch_state(node, FetchState::Fetching)?;

        let plan = match plan {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                // Produced by an ancestor's listing; nothing to ask for.
                tree.set_fetch_state(node, FetchState::Fetched)?;
                return Ok(Expansion::Ready);
            }
            Err(error) => {
                tree.set_fetch_state(node, FetchState::Failed)?;
                let error = error.trace();
                if let Some(entry) = tree.get_mut(node) {
                    entry.error = Some(Arc::new(error.clone()));
                }
                return Err(error);
            }
        };

        let database = self.collaborators.database.clone();
        debug!(
            marker = "SESSION",
            operation_type = "expand",
            plan = %plan.describe(),
            "Children fetch scheduled"
        );
        let ticket = self
            .coordinator
            .submit(FetchKey::children(tab, node), move || -> FetchOutcome {
                plan.execute(database.as_ref()).map(FetchPayload::Children)
            });
        Ok(Expansion::Pending(ticket))
    }

    // ────────────────────────────────────────────────────────────
    // Publishes
    // ────────────────────────────────────────────────────────────

    /// Cached listing, if fetched.
    pub fn publishes(&self, tab: usize, node: NodeId) -> LoaderResult<Option<Arc<Vec<PublishRecord>>>> {
        Ok(self.node(tab, node)?.publishes.clone())
    }

    /// Cached listing or a ticket for the fetch that produces it. Concurrent
    /// requests for the same node share one fetch.
    #[instrument(skip(self))]
    pub fn request_publishes(&mut self, tab: usize, node: NodeId) -> LoaderResult<PublishLookup> {
        let entry = self.node(tab, node)?;
        if let (FetchState::Fetched, Some(cached)) = (entry.publish_state, &entry.publishes) {
            return Ok(PublishLookup::Ready(cached.clone()));
        }

        let key = FetchKey::publishes(tab, node);
        if let Some(ticket) = self.coordinator.join(&key) {
            return Ok(PublishLookup::Pending(ticket));
        }

        let request = {
            let state = self.tab(tab)?;
            PublishRequest::for_node(
                &state.definition,
                &state.tree,
                node,
                &self.config.publish_filters,
                self.config.show_all_versions,
                &self.context,
            )?
        };

        let tree = &mut self.tab_mut(tab)?.tree;
        if tree.get(node).is_some_and(|n| n.publish_state == FetchState::Fetching) {
            // Cancelled earlier; start over.
            tree.invalidate_publishes(node)?;
        }
        tree.set_publish_state(node, FetchState::Fetching)?;

        let database = self.collaborators.database.clone();
        let hook = self.collaborators.filter_publishes.clone();
        let ticket = self.coordinator.submit(key, move || -> FetchOutcome {
            request
                .run(database.as_ref(), hook.as_ref())
                .map(|records| FetchPayload::Publishes(Arc::new(records)))
        });
        Ok(PublishLookup::Pending(ticket))
    }

    /// Forget the cached listing and cancel any fetch for it.
    pub fn invalidate_publishes(&mut self, tab: usize, node: NodeId) -> LoaderResult<()> {
        self.coordinator.cancel(&FetchKey::publishes(tab, node));
        self.tab_mut(tab)?.tree.invalidate_publishes(node)
    }

    fn invalidate_subtree_publishes(&mut self, tab: usize, node: NodeId) -> LoaderResult<()> {
        let nodes = self.tab(tab)?.tree.subtree(node);
        for id in nodes {
            self.invalidate_publishes(tab, id)?;
        }
        Ok(())
    }

    /// Thumbnail for `record`; never blocks.
    pub fn thumbnail(&mut self, record: &PublishRecord) -> ThumbnailLookup {
        self.thumbnails.get_or_fetch(
            record.thumbnail_ref.as_ref(),
            &mut self.coordinator,
            &self.collaborators.database,
        )
    }

    // ────────────────────────────────────────────────────────────
    // Actions
    // ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn resolve_actions(&self, target: &ActionTarget) -> Vec<ActionDescriptor> {
        self.dispatcher.resolve_actions(target)
    }

    pub fn list_actions(&self, target: &ActionTarget, ui_area: UiArea) -> LoaderResult<Vec<ActionDescriptor>> {
        self.dispatcher.list_actions(target, ui_area)
    }

    pub fn invoke(&self, target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()> {
        self.dispatcher.invoke(target, action)
    }

    pub fn invoke_many(&self, batch: &[(ActionTarget, ActionDescriptor)]) -> LoaderResult<()> {
        self.dispatcher.invoke_many(batch)
    }

    // ────────────────────────────────────────────────────────────
    // Context
    // ────────────────────────────────────────────────────────────

    /// Tear down every tree and cache and start over under `context`.
    pub fn switch_context(&mut self, context: Context) {
        let cancelled = self.coordinator.cancel_all();
        self.thumbnails = ThumbnailCache::new(self.config.download_thumbnails, &self.config.thumbnails);
        self.tabs = build_tabs(&self.config);
        self.context = context;

        info!(
            marker = "SESSION",
            operation_type = "context_switch",
            cancelled,
            "Context switched; trees rebuilt"
        );
    }

    // ────────────────────────────────────────────────────────────
    // Completion delivery
    // ────────────────────────────────────────────────────────────

    /// Apply every completion already queued.
    pub fn pump(&mut self) -> Vec<LoaderEvent> {
        let mut events = Vec::new();
        while let Some(completion) = self.coordinator.try_next() {
            events.extend(self.apply(completion));
        }
        events
    }

    /// Wait for the next completion that changes something. `None` once
    /// nothing is in flight.
    pub async fn next_event(&mut self) -> Option<LoaderEvent> {
        loop {
            let completion = self.coordinator.next().await?;
            if let Some(event) = self.apply(completion) {
                return Some(event);
            }
        }
    }

    fn apply(&mut self, completion: Completion) -> Option<LoaderEvent> {
        let (key, outcome) = self.coordinator.accept(completion)?;

        match key {
            FetchKey::Node { tab, node, kind } => {
                let result = match kind {
                    FetchKind::Children => self.apply_children(tab, node, &outcome),
                    FetchKind::Publishes => self.apply_publishes(tab, node, &outcome),
                };
                match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(
                            marker = "SESSION",
                            operation_type = "apply_completion",
                            tab,
                            node = %node,
                            error = %e,
                            "Completion could not be applied"
                        );
                        None
                    }
                }
            }
            FetchKey::Thumbnail(key) => {
                self.thumbnails.complete(&key, &outcome);
                Some(match &*outcome {
                    Ok(_) => LoaderEvent::ThumbnailReady { key },
                    Err(e) => {
                        debug!(
                            marker = "SESSION",
                            operation_type = "thumbnail_failed",
                            error = %e,
                            "Thumbnail unavailable; will retry on next view"
                        );
                        LoaderEvent::ThumbnailFailed { key }
                    }
                })
            }
        }
    }

    fn apply_children(
        &mut self,
        tab: usize,
        node: NodeId,
        outcome: &FetchOutcome,
    ) -> LoaderResult<Option<LoaderEvent>> {
        let tree = &mut self.tab_mut(tab)?.tree;
        if tree.get(node).map(|n| n.fetch_state) != Some(FetchState::Fetching) {
            return Ok(None);
        }

        match outcome {
            Ok(FetchPayload::Children(specs)) => {
                let merged = tree.merge_children(node, specs.clone())?;
                tree.set_fetch_state(node, FetchState::Fetched)?;
                if let Some(entry) = tree.get_mut(node) {
                    entry.error = None;
                }
                self.coordinator.cancel_nodes(tab, &merged.removed);

                // Query groupings list publishes of their descendants, which
                // the merge may have changed.
                let regrouped = matches!(self.tab(tab)?.definition.kind, TabKind::Query { .. })
                    && !(merged.added.is_empty() && merged.removed.is_empty());
                if regrouped {
                    self.invalidate_subtree_publishes(tab, node)?;
                }

                Ok(Some(LoaderEvent::ChildrenChanged {
                    tab,
                    node,
                    added: merged.added,
                    removed: merged.removed,
                }))
            }
            Ok(_) => Err(LoaderError::other("children fetch returned another payload")),
            Err(error) => {
                let error = Arc::new(error.clone().trace());
                tree.set_fetch_state(node, FetchState::Failed)?;
                if let Some(entry) = tree.get_mut(node) {
                    entry.error = Some(error.clone());
                }
                Ok(Some(LoaderEvent::ChildrenFailed { tab, node, error }))
            }
        }
    }

    fn apply_publishes(
        &mut self,
        tab: usize,
        node: NodeId,
        outcome: &FetchOutcome,
    ) -> LoaderResult<Option<LoaderEvent>> {
        let tree = &mut self.tab_mut(tab)?.tree;

        match outcome {
            Ok(FetchPayload::Publishes(records)) => {
                tree.set_publish_state(node, FetchState::Fetched)?;
                if let Some(entry) = tree.get_mut(node) {
                    entry.publishes = Some(records.clone());
                }
                Ok(Some(LoaderEvent::PublishesReady {
                    tab,
                    node,
                    count: records.len(),
                }))
            }
            Ok(_) => Err(LoaderError::other("publish fetch returned another payload")),
            Err(error) => {
                let error = Arc::new(error.clone().trace());
                tree.set_publish_state(node, FetchState::Failed)?;
                if let Some(entry) = tree.get_mut(node) {
                    entry.error = Some(error.clone());
                }
                Ok(Some(LoaderEvent::PublishesFailed { tab, node, error }))
            }
        }
    }
}

fn build_tabs(config: &LoaderConfig) -> Vec<TabState> {
    config
        .tabs
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, definition)| TabState::new(index, definition))
        .collect()
}

impl std::fmt::Debug for LoaderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderSession")
            .field("context", &self.context)
            .field("tabs", &self.tabs.len())
            .field("coordinator", &self.coordinator)
            .field("thumbnails", &self.thumbnails)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::{EntityRecord, EntityRef, HierarchyEntry};
    use crate::testing::{FailingFilter, Gate, InMemoryDatabase, RecordingActions};
    use serde_json::json;
    use std::time::Duration;

    const CONFIG: &str = r#"
download_thumbnails = true
action_mappings = { "Alembic Cache" = ["reference"], "*" = ["open_folder"] }

[[entities]]
caption = "My Tasks"
type = "Query"
entity_type = "Task"
filters = [["task_assignees", "is", "{context.user}"]]
hierarchy = ["entity", "content"]

[[entities]]
caption = "Project"
type = "Hierarchy"
root = "{context.project}"
"#;

    fn user() -> EntityRef {
        EntityRef::named("HumanUser", 42, "artist")
    }

    fn context() -> Context {
        Context::for_project(EntityRef::new("Project", 65)).with_user(user())
    }

    fn task(id: i64, shot: i64, content: &str) -> EntityRecord {
        EntityRecord::new("Task", id)
            .with_field("entity", json!({"type": "Shot", "id": shot, "name": format!("sh{shot:03}")}))
            .with_field("content", json!(content))
            .with_field("task_assignees", json!([user().to_value()]))
    }

    fn session(db: &InMemoryDatabase) -> LoaderSession {
        let config = LoaderConfig::from_toml_str(CONFIG).unwrap().config;
        let collaborators = Collaborators::new(Arc::new(db.clone()), Arc::new(RecordingActions::default()));
        LoaderSession::new(config, context(), collaborators, Handle::current())
    }

    async fn next(session: &mut LoaderSession) -> LoaderEvent {
        tokio::time::timeout(Duration::from_secs(5), session.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_tab_builds_full_tree_in_arrival_order() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "layout"), task(2, 10, "anim"), task(3, 20, "fx")]);
        let mut session = session(&db);
        let root = session.root(0).unwrap();

        assert!(matches!(session.expand(0, root).unwrap(), Expansion::Pending(_)));
        assert!(matches!(next(&mut session).await, LoaderEvent::ChildrenChanged { .. }));

        let tree = session.tab(0).unwrap().tree();
        assert_eq!(tree.depth_below(root), 3);
        let shots: Vec<_> = tree.children(root).iter().map(|id| tree.get(*id).unwrap().label.clone()).collect();
        assert_eq!(shots, ["sh010", "sh020"]);

        let first_shot = tree.children(root)[0];
        let contents: Vec<_> = tree
            .children(first_shot)
            .iter()
            .map(|id| tree.get(*id).unwrap().label.clone())
            .collect();
        assert_eq!(contents, ["layout", "anim"]);

        // Grouping nodes came complete with the root query.
        assert!(matches!(session.expand(0, first_shot).unwrap(), Expansion::Ready));
        assert_eq!(db.find_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_is_per_node_and_retryable() {
        let db = InMemoryDatabase::default();
        db.fail_queries("Task", "timeout");
        db.add_children(
            "/Project/65",
            vec![HierarchyEntry {
                label: "Assets".into(),
                path: "/Project/65/Asset".into(),
                entity_ref: None,
                has_children: true,
            }],
        );
        let mut session = session(&db);

        session.expand(0, session.root(0).unwrap()).unwrap();
        session.expand(1, session.root(1).unwrap()).unwrap();

        let mut failed = 0;
        let mut changed = 0;
        for _ in 0..2 {
            match next(&mut session).await {
                LoaderEvent::ChildrenFailed { tab: 0, .. } => failed += 1,
                LoaderEvent::ChildrenChanged { tab: 1, .. } => changed += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!((failed, changed), (1, 1));
        assert_eq!(db.list_calls(), 1);

        let root = session.root(0).unwrap();
        assert_eq!(session.node(0, root).unwrap().fetch_state, FetchState::Failed);
        assert!(session.node(0, root).unwrap().error.is_some());

        db.clear_failures();
        db.add_records("Task", vec![task(1, 10, "anim")]);
        session.expand(0, root).unwrap();
        next(&mut session).await;
        assert_eq!(session.node(0, root).unwrap().fetch_state, FetchState::Fetched);
        assert!(session.node(0, root).unwrap().error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_publish_requests_share_one_fetch() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "anim")]);
        let leaf_entity = EntityRef::new("Task", 1);
        db.add_publishes(vec![
            PublishRecord::new(1, "Maya Scene", "/p/a_v1.ma", 1).linked_to(leaf_entity.clone()),
            PublishRecord::new(2, "Maya Scene", "/p/a_v2.ma", 2).linked_to(leaf_entity),
        ]);
        let mut session = session(&db);
        let root = session.root(0).unwrap();
        session.expand(0, root).unwrap();
        next(&mut session).await;

        let tree = session.tab(0).unwrap().tree();
        let leaf = tree.children(tree.children(tree.children(root)[0])[0])[0];

        let gate = Arc::new(Gate::closed());
        db.hold_with(gate.clone());
        let PublishLookup::Pending(first) = session.request_publishes(0, leaf).unwrap() else {
            panic!("expected pending");
        };
        let PublishLookup::Pending(second) = session.request_publishes(0, leaf).unwrap() else {
            panic!("expected pending");
        };
        assert!(second.joined);
        gate.open();

        assert!(matches!(next(&mut session).await, LoaderEvent::PublishesReady { count: 1, .. }));
        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.publish_calls(), 1);

        // Cached now.
        assert!(matches!(session.request_publishes(0, leaf).unwrap(), PublishLookup::Ready(_)));
        assert_eq!(session.publishes(0, leaf).unwrap().unwrap()[0].version_number, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_context_switch_drops_in_flight_results() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "anim")]);
        let gate = Arc::new(Gate::closed());
        db.hold_with(gate.clone());
        let mut session = session(&db);

        let root = session.root(0).unwrap();
        let Expansion::Pending(ticket) = session.expand(0, root).unwrap() else {
            panic!("expected pending");
        };
        while db.find_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        session.switch_context(Context::for_project(EntityRef::new("Project", 66)));
        gate.open();
        assert!(matches!(ticket.wait().await, Err(LoaderError::Cancelled)));

        // Let the late completion land, then drain it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.pump().is_empty());

        let root = session.root(0).unwrap();
        let fresh = session.node(0, root).unwrap();
        assert_eq!(fresh.fetch_state, FetchState::NotFetched);
        assert!(session.children(0, root).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_merges_and_keeps_ids() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "anim"), task(2, 20, "fx")]);
        let mut session = session(&db);
        let root = session.root(0).unwrap();
        session.expand(0, root).unwrap();
        next(&mut session).await;
        let before = session.children(0, root).unwrap();

        db.replace_records("Task", vec![task(3, 30, "lighting"), task(1, 10, "anim")]);
        let leaf = {
            let tree = session.tab(0).unwrap().tree();
            tree.children(tree.children(before[0])[0])[0]
        };
        session.refresh(0, leaf).unwrap();
        let LoaderEvent::ChildrenChanged { removed, .. } = next(&mut session).await else {
            panic!("expected merge");
        };

        let after = session.children(0, root).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[1], before[0]);
        assert!(removed.contains(&before[1]));
        assert_eq!(db.find_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_refresh_drops_stale_group_publishes() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "anim"), task(2, 10, "layout")]);
        db.add_publishes(vec![
            PublishRecord::new(1, "Maya Scene", "/p/anim_v1.ma", 1).linked_to(EntityRef::new("Task", 1)),
            PublishRecord::new(2, "Maya Scene", "/p/layout_v1.ma", 1).linked_to(EntityRef::new("Task", 2)),
        ]);
        let mut session = session(&db);
        let root = session.root(0).unwrap();
        session.expand(0, root).unwrap();
        next(&mut session).await;
        let shot = session.children(0, root).unwrap()[0];

        session.request_publishes(0, shot).unwrap();
        assert!(matches!(next(&mut session).await, LoaderEvent::PublishesReady { count: 2, .. }));

        db.replace_records("Task", vec![task(1, 10, "anim")]);
        session.refresh(0, shot).unwrap();
        assert!(matches!(next(&mut session).await, LoaderEvent::ChildrenChanged { .. }));
        assert_eq!(session.children(0, root).unwrap(), [shot]);
        assert!(session.publishes(0, shot).unwrap().is_none());

        assert!(matches!(session.request_publishes(0, shot).unwrap(), PublishLookup::Pending(_)));
        assert!(matches!(next(&mut session).await, LoaderEvent::PublishesReady { count: 1, .. }));
        assert_eq!(db.publish_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_expand_restarts_abandoned_fetch() {
        let db = InMemoryDatabase::default();
        db.add_children(
            "/Project/65",
            vec![HierarchyEntry {
                label: "Assets".into(),
                path: "/Project/65/Asset".into(),
                entity_ref: None,
                has_children: true,
            }],
        );
        let gate = Arc::new(Gate::closed());
        db.hold_with(gate.clone());
        let mut session = session(&db);
        let root = session.root(1).unwrap();

        session.expand(1, root).unwrap();
        while db.list_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.coordinator.cancel(&FetchKey::children(1, root)));
        assert_eq!(session.node(1, root).unwrap().fetch_state, FetchState::Fetching);

        assert!(matches!(session.expand(1, root).unwrap(), Expansion::Pending(_)));
        gate.open();

        assert!(matches!(next(&mut session).await, LoaderEvent::ChildrenChanged { tab: 1, .. }));
        assert_eq!(session.node(1, root).unwrap().fetch_state, FetchState::Fetched);
        assert_eq!(session.children(1, root).unwrap().len(), 1);
        assert_eq!(db.list_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_filter_hook_failure_fails_only_that_node() {
        let db = InMemoryDatabase::default();
        db.add_records("Task", vec![task(1, 10, "anim"), task(2, 20, "fx")]);
        db.add_publishes(vec![
            PublishRecord::new(1, "Maya Scene", "/p/anim_v1.ma", 1).linked_to(EntityRef::new("Task", 1)),
        ]);
        let config = LoaderConfig::from_toml_str(CONFIG).unwrap().config;
        let collaborators = Collaborators::new(Arc::new(db.clone()), Arc::new(RecordingActions::default()))
            .with_filter_hook(Arc::new(FailingFilter));
        let mut session = LoaderSession::new(config, context(), collaborators, Handle::current());

        let root = session.root(0).unwrap();
        session.expand(0, root).unwrap();
        next(&mut session).await;
        let (anim, fx) = {
            let tree = session.tab(0).unwrap().tree();
            let leaves: Vec<_> = tree
                .children(root)
                .into_iter()
                .map(|shot| tree.children(tree.children(shot)[0])[0])
                .collect();
            (leaves[0], leaves[1])
        };

        session.request_publishes(0, anim).unwrap();
        let LoaderEvent::PublishesFailed { node, error, .. } = next(&mut session).await else {
            panic!("expected publish failure");
        };
        assert_eq!(node, anim);
        assert!(matches!(*error, LoaderError::FilterHookFailed { .. }));

        assert_eq!(session.node(0, anim).unwrap().publish_state, FetchState::Failed);
        assert!(session.publishes(0, anim).unwrap().is_none());
        assert_eq!(session.node(0, fx).unwrap().publish_state, FetchState::NotFetched);
        assert_eq!(session.node(0, root).unwrap().fetch_state, FetchState::Fetched);

        // Not cached; asking again retries.
        assert!(matches!(session.request_publishes(0, anim).unwrap(), PublishLookup::Pending(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_actions_through_session() {
        let db = InMemoryDatabase::default();
        let session = session(&db);
        let maya = ActionTarget::Publish(PublishRecord::new(7, "Maya Scene", "/p/x.ma", 3));

        let names: Vec<_> = session.resolve_actions(&maya).into_iter().map(|a| a.name).collect();
        assert_eq!(names, ["open_folder"]);

        let listed = session.list_actions(&maya, UiArea::Main).unwrap();
        assert!(session.invoke(&maya, &listed[0]).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_tab_and_node() {
        let db = InMemoryDatabase::default();
        let mut session = session(&db);

        assert!(matches!(session.expand(9, NodeId(0)), Err(LoaderError::UnknownTab(9))));
        assert!(matches!(session.expand(0, NodeId(99)), Err(LoaderError::UnknownNode { .. })));
    }
}
