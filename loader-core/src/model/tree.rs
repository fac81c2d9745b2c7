//! ``src/model/tree.rs``
//! ============================================================================
//! # Entity Tree
//!
//! Slab-backed arena of [`TreeNode`]s for one tab. Children are kept in an
//! `IndexMap` keyed by [`GroupingKey`] so ordering follows first occurrence in
//! the source listing and merges can match nodes by identity.
//!
//! Node ids are never reused within a tree: a removed node's id stays dead, so
//! a stale id held by the UI resolves to nothing rather than a different node.
//!
//! The tree is owned by the session on the UI thread; background workers never
//! see it. Results arrive as [`NodeSpec`]s and are merged in.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use indexmap::IndexMap;
use serde_json::Value;
use slab::Slab;

use crate::error::{LoaderError, LoaderResult};
use crate::model::entity::{EntityRef, PublishRecord};

/// Identity of a node within its tab, allocated monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// NotFetched → Fetching → {Fetched | Failed}; Failed and Fetched may re-enter
/// Fetching (retry / refresh).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchState {
    #[default]
    NotFetched,
    Fetching,
    Fetched,
    Failed,
}

impl FetchState {
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotFetched | Self::Failed | Self::Fetched, Self::Fetching)
                | (Self::Fetching, Self::Fetched | Self::Failed)
        )
    }

    fn transition(&mut self, to: Self) -> LoaderResult<()> {
        if !self.can_transition_to(to) {
            return Err(LoaderError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

/// Identity of a node among its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupingKey {
    Root,
    /// Null, missing or empty grouping value.
    Unassigned,
    /// Canonical JSON text of the raw field value (object keys sorted).
    Value(CompactString),
    /// A concrete entity (query leaves, hierarchy entries bound to one).
    Entity { entity_type: CompactString, id: i64 },
    /// Hierarchy folder without an entity.
    Path(String),
}

pub const UNASSIGNED_LABEL: &str = "Unassigned";

impl GroupingKey {
    #[must_use]
    pub fn from_field(value: &Value) -> Self {
        if is_unassigned(value) {
            Self::Unassigned
        } else {
            Self::Value(CompactString::from(canonical_value(value).to_string()))
        }
    }

    #[must_use]
    pub fn for_entity(entity: &EntityRef) -> Self {
        Self::Entity {
            entity_type: entity.entity_type.clone(),
            id: entity.id,
        }
    }
}

/// `value` with object keys sorted at every level, so equal values print alike.
fn canonical_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), canonical_value(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_value).collect()),
        other => other.clone(),
    }
}

fn is_unassigned(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Human label for a grouping value.
#[must_use]
pub fn label_for_value(value: &Value) -> String {
    if is_unassigned(value) {
        return UNASSIGNED_LABEL.to_owned();
    }
    if let Some(entity) = EntityRef::from_value(value) {
        return entity.display_name();
    }
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(label_for_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub label: String,
    pub grouping_key: GroupingKey,
    /// Set on leaves and entity-bound folders; pure groupings have none.
    pub entity_ref: Option<EntityRef>,
    /// Navigation path (Hierarchy tabs).
    pub path: Option<String>,
    pub parent: Option<NodeId>,
    pub depth: usize,
    pub children: IndexMap<GroupingKey, NodeId>,
    pub fetch_state: FetchState,
    pub publish_state: FetchState,
    pub publishes: Option<Arc<Vec<PublishRecord>>>,
    /// Last failure shown to the UI for this node.
    pub error: Option<Arc<LoaderError>>,
}

impl TreeNode {
    fn new(label: String, grouping_key: GroupingKey, parent: Option<NodeId>, depth: usize) -> Self {
        Self {
            label,
            grouping_key,
            entity_ref: None,
            path: None,
            parent,
            depth,
            children: IndexMap::new(),
            fetch_state: FetchState::NotFetched,
            publish_state: FetchState::NotFetched,
            publishes: None,
            error: None,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.fetch_state == FetchState::Fetched && self.children.is_empty()
    }
}

/// Description of a node produced off the UI thread, merged by key.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub key: GroupingKey,
    pub label: String,
    pub entity_ref: Option<EntityRef>,
    pub path: Option<String>,
    /// Children are already known (`children` is complete, possibly empty).
    pub complete: bool,
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    #[must_use]
    pub fn group(key: GroupingKey, label: String) -> Self {
        Self {
            key,
            label,
            entity_ref: None,
            path: None,
            complete: true,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn leaf(entity: EntityRef, label: String) -> Self {
        Self {
            key: GroupingKey::for_entity(&entity),
            label,
            entity_ref: Some(entity),
            path: None,
            complete: true,
            children: Vec::new(),
        }
    }
}

/// What a merge changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Tree {
    tab: usize,
    nodes: Slab<TreeNode>,
    slots: AHashMap<NodeId, usize>,
    next_id: usize,
    root: NodeId,
}

impl Tree {
    #[must_use]
    pub fn new(tab: usize, root_label: &str) -> Self {
        let mut tree = Self {
            tab,
            nodes: Slab::new(),
            slots: AHashMap::new(),
            next_id: 0,
            root: NodeId(0),
        };
        tree.root = tree.alloc(TreeNode::new(root_label.to_owned(), GroupingKey::Root, None, 0));
        tree
    }

    fn alloc(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let slot = self.nodes.insert(node);
        self.slots.insert(id, slot);
        id
    }

    // Internal lookups for ids reachable from the root; those are always live.
    fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[self.slots[&id]]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        let slot = self.slots[&id];
        &mut self.nodes[slot]
    }

    #[must_use]
    pub const fn tab(&self) -> usize {
        self.tab
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        self.root
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.slots.get(&id).and_then(|slot| self.nodes.get(*slot))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        let slot = *self.slots.get(&id)?;
        self.nodes.get_mut(slot)
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children in display order.
    #[must_use]
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id)
            .map(|n| n.children.values().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) const fn unknown(&self, id: NodeId) -> LoaderError {
        LoaderError::UnknownNode {
            tab: self.tab,
            node: id.0,
        }
    }

    pub fn set_fetch_state(&mut self, id: NodeId, to: FetchState) -> LoaderResult<()> {
        let unknown = self.unknown(id);
        let node = self.get_mut(id).ok_or(unknown)?;
        node.fetch_state.transition(to)
    }

    pub fn set_publish_state(&mut self, id: NodeId, to: FetchState) -> LoaderResult<()> {
        let unknown = self.unknown(id);
        let node = self.get_mut(id).ok_or(unknown)?;
        node.publish_state.transition(to)
    }

    /// Drop the cached publish listing; the next request fetches again.
    pub fn invalidate_publishes(&mut self, id: NodeId) -> LoaderResult<()> {
        let unknown = self.unknown(id);
        let node = self.get_mut(id).ok_or(unknown)?;
        node.publishes = None;
        node.publish_state = FetchState::NotFetched;
        Ok(())
    }

    /// Return a node whose fetch was abandoned to `NotFetched`.
    pub fn reset_fetch_state(&mut self, id: NodeId) -> LoaderResult<()> {
        let unknown = self.unknown(id);
        let node = self.get_mut(id).ok_or(unknown)?;
        node.fetch_state = FetchState::NotFetched;
        Ok(())
    }

    /// `id` followed by every node beneath it, depth first.
    #[must_use]
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else { continue };
            out.push(current);
            stack.extend(node.children.values().rev().copied());
        }
        out
    }

    /// Merge `specs` as the complete child list of `parent`.
    ///
    /// Existing children matched by key keep their ids; the final order follows
    /// `specs`. Children absent from `specs` are removed with their subtrees.
    pub fn merge_children(&mut self, parent: NodeId, specs: Vec<NodeSpec>) -> LoaderResult<MergeOutcome> {
        let mut outcome = MergeOutcome::default();
        self.merge_into(parent, specs, &mut outcome)?;
        Ok(outcome)
    }

    fn merge_into(
        &mut self,
        parent: NodeId,
        specs: Vec<NodeSpec>,
        outcome: &mut MergeOutcome,
    ) -> LoaderResult<()> {
        let unknown = self.unknown(parent);
        let parent_node = self.get_mut(parent).ok_or(unknown)?;
        let depth = parent_node.depth + 1;
        let mut previous = std::mem::take(&mut parent_node.children);
        let mut ordered: IndexMap<GroupingKey, NodeId> = IndexMap::with_capacity(specs.len());

        for spec in specs {
            // Duplicate keys within one listing: first occurrence wins.
            if ordered.contains_key(&spec.key) {
                continue;
            }

            let id = if let Some(existing) = previous.shift_remove(&spec.key) {
                let node = self.node_mut(existing);
                node.label.clone_from(&spec.label);
                node.entity_ref = spec.entity_ref;
                node.path = spec.path;
                if spec.complete {
                    // A completed listing replaces a pending or failed one.
                    node.fetch_state = FetchState::Fetched;
                    node.error = None;
                    self.merge_into(existing, spec.children, outcome)?;
                }
                existing
            } else {
                self.insert_spec(parent, depth, spec, outcome)
            };

            ordered.insert(self.node(id).grouping_key.clone(), id);
        }

        for (_, stale) in previous {
            self.remove_subtree(stale, &mut outcome.removed);
        }

        self.node_mut(parent).children = ordered;
        Ok(())
    }

    fn insert_spec(
        &mut self,
        parent: NodeId,
        depth: usize,
        spec: NodeSpec,
        outcome: &mut MergeOutcome,
    ) -> NodeId {
        let mut node = TreeNode::new(spec.label, spec.key, Some(parent), depth);
        node.entity_ref = spec.entity_ref;
        node.path = spec.path;
        if spec.complete {
            node.fetch_state = FetchState::Fetched;
        }

        let id = self.alloc(node);
        outcome.added.push(id);

        for child in spec.children {
            if self.node(id).children.contains_key(&child.key) {
                continue;
            }
            let key = child.key.clone();
            let child_id = self.insert_spec(id, depth + 1, child, outcome);
            self.node_mut(id).children.insert(key, child_id);
        }

        id
    }

    fn remove_subtree(&mut self, id: NodeId, removed: &mut Vec<NodeId>) {
        let Some(node) = self.slots.remove(&id).and_then(|slot| self.nodes.try_remove(slot)) else {
            return;
        };
        removed.push(id);
        for child in node.children.into_values() {
            self.remove_subtree(child, removed);
        }
    }

    /// Number of levels below `id`: a node with only leaf children has depth 1.
    #[must_use]
    pub fn depth_below(&self, id: NodeId) -> usize {
        self.get(id).map_or(0, |node| {
            node.children
                .values()
                .map(|child| 1 + self.depth_below(*child))
                .max()
                .unwrap_or(0)
        })
    }

    /// Entity refs of every bound node beneath `id` (excluding `id`).
    #[must_use]
    pub fn descendant_entities(&self, id: NodeId) -> Vec<EntityRef> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).into_iter().rev().collect();

        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else { continue };
            if let Some(entity) = &node.entity_ref {
                out.push(entity.clone());
            }
            stack.extend(node.children.values().rev().copied());
        }
        out
    }

    /// Labels from the first level down to `id` (root excluded).
    #[must_use]
    pub fn label_path(&self, id: NodeId) -> Vec<String> {
        let mut labels = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let Some(node) = self.get(node_id) else { break };
            if node.parent.is_some() {
                labels.push(node.label.clone());
            }
            current = node.parent;
        }
        labels.reverse();
        labels
    }

    /// Depth-first `(depth, label)` listing below `id`, for inspection.
    #[must_use]
    pub fn outline(&self, id: NodeId) -> Vec<(usize, String)> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).into_iter().rev().collect();

        while let Some(current) = stack.pop() {
            let Some(node) = self.get(current) else { continue };
            out.push((node.depth, node.label.clone()));
            stack.extend(node.children.values().rev().copied());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn folder(name: &str, complete: bool) -> NodeSpec {
        NodeSpec {
            key: GroupingKey::Path(format!("/{name}")),
            label: name.to_owned(),
            entity_ref: None,
            path: Some(format!("/{name}")),
            complete,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_fetch_state_transitions() {
        let mut tree = Tree::new(0, "root");
        let root = tree.root();

        assert!(tree.set_fetch_state(root, FetchState::Fetched).is_err());
        tree.set_fetch_state(root, FetchState::Fetching).unwrap();
        tree.set_fetch_state(root, FetchState::Failed).unwrap();
        // Failed may be retried.
        tree.set_fetch_state(root, FetchState::Fetching).unwrap();
        tree.set_fetch_state(root, FetchState::Fetched).unwrap();
        assert!(tree.set_fetch_state(root, FetchState::Failed).is_err());
    }

    #[test]
    fn test_merge_keeps_ids_and_removes_vanished() {
        let mut tree = Tree::new(0, "root");
        let root = tree.root();

        let first = tree
            .merge_children(root, vec![folder("a", false), folder("b", false)])
            .unwrap();
        assert_eq!(first.added.len(), 2);
        let a_id = tree.children(root)[0];

        let second = tree
            .merge_children(root, vec![folder("c", false), folder("a", false)])
            .unwrap();

        assert_eq!(second.added.len(), 1);
        assert_eq!(second.removed.len(), 1);
        assert_eq!(tree.children(root)[1], a_id);
        assert_eq!(
            tree.outline(root),
            vec![(1, "c".to_owned()), (1, "a".to_owned())]
        );
    }

    #[test]
    fn test_removed_ids_are_not_reused() {
        let mut tree = Tree::new(0, "root");
        let root = tree.root();
        let mut a = folder("a", true);
        a.children = vec![NodeSpec::leaf(EntityRef::new("Task", 1), "t1".into())];

        tree.merge_children(root, vec![a, folder("b", false)]).unwrap();
        let leaf = tree.children(tree.children(root)[0])[0];

        let refreshed = tree
            .merge_children(root, vec![folder("a", true), folder("b", false), folder("c", false)])
            .unwrap();

        assert_eq!(refreshed.removed, vec![leaf]);
        assert_eq!(refreshed.added.len(), 1);
        assert!(refreshed.added.iter().all(|id| !refreshed.removed.contains(id)));
        assert!(tree.get(leaf).is_none());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_grouping_key_ignores_object_key_order() {
        let forward = GroupingKey::from_field(&json!({"type": "Shot", "id": 10}));
        let backward = GroupingKey::from_field(&json!({"id": 10, "type": "Shot"}));
        assert_eq!(forward, backward);
        assert_ne!(forward, GroupingKey::from_field(&json!({"type": "Shot", "id": 20})));
    }

    #[test]
    fn test_unassigned_keys() {
        assert_eq!(GroupingKey::from_field(&Value::Null), GroupingKey::Unassigned);
        assert_eq!(GroupingKey::from_field(&json!("")), GroupingKey::Unassigned);
        assert_eq!(GroupingKey::from_field(&json!([])), GroupingKey::Unassigned);
        assert_ne!(GroupingKey::from_field(&json!(0)), GroupingKey::Unassigned);
        assert_eq!(label_for_value(&json!({"type": "Asset", "id": 1, "name": "chair"})), "chair");
    }

    #[test]
    fn test_depth_and_descendants() {
        let mut tree = Tree::new(0, "root");
        let root = tree.root();
        let mut group = NodeSpec::group(GroupingKey::from_field(&json!("anim")), "anim".into());
        group.children = vec![
            NodeSpec::leaf(EntityRef::new("Task", 1), "t1".into()),
            NodeSpec::leaf(EntityRef::new("Task", 2), "t2".into()),
        ];
        tree.merge_children(root, vec![group]).unwrap();

        assert_eq!(tree.depth_below(root), 2);
        assert_eq!(tree.descendant_entities(root).len(), 2);

        let leaf = tree.children(tree.children(root)[0])[1];
        assert_eq!(tree.label_path(leaf), vec!["anim".to_owned(), "t2".to_owned()]);
        assert!(tree.get(leaf).unwrap().is_leaf());
    }
}
