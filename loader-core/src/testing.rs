//! ``src/testing.rs``
//! ============================================================================
//! # Test Fixtures
//!
//! In-memory collaborators with call counters, failure injection and a gate
//! that holds worker calls in flight until a test releases them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use crate::error::{LoaderError, LoaderResult};
use crate::host::{
    ActionDescriptor, ActionTarget, ActionsHook, EntityDatabase, FilterPublishesHook, LocationContext,
    PublishScope, UiArea,
};
use crate::model::entity::{EntityRecord, HierarchyEntry, PublishRecord, ThumbnailRef};
use crate::model::filter::FilterPredicate;

/// Blocks callers of [`Gate::wait`] until opened.
#[derive(Debug, Default)]
pub struct Gate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl Gate {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.changed.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.changed.wait(&mut open);
        }
    }
}

#[derive(Debug, Default)]
struct DatabaseState {
    records: AHashMap<String, Vec<EntityRecord>>,
    children: AHashMap<String, Vec<HierarchyEntry>>,
    publishes: Vec<PublishRecord>,
    thumbnails: AHashMap<String, Bytes>,
    failures: AHashMap<String, String>,
    gate: Option<Arc<Gate>>,
}

#[derive(Debug, Default)]
struct Counters {
    find: AtomicUsize,
    list: AtomicUsize,
    publishes: AtomicUsize,
    thumbnails: AtomicUsize,
}

/// Entity database backed by maps. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
    counters: Arc<Counters>,
}

impl InMemoryDatabase {
    pub fn add_records(&self, entity_type: &str, records: Vec<EntityRecord>) {
        self.state
            .lock()
            .records
            .entry(entity_type.to_owned())
            .or_default()
            .extend(records);
    }

    pub fn replace_records(&self, entity_type: &str, records: Vec<EntityRecord>) {
        self.state.lock().records.insert(entity_type.to_owned(), records);
    }

    pub fn add_children(&self, path: &str, entries: Vec<HierarchyEntry>) {
        self.state.lock().children.insert(path.to_owned(), entries);
    }

    pub fn add_publishes(&self, publishes: Vec<PublishRecord>) {
        self.state.lock().publishes.extend(publishes);
    }

    pub fn add_thumbnail(&self, key: &str, bytes: &[u8]) {
        self.state
            .lock()
            .thumbnails
            .insert(key.to_owned(), Bytes::copy_from_slice(bytes));
    }

    /// Fail calls whose entity type or path equals `target`; `"publishes"`
    /// fails every publish query.
    pub fn fail_queries(&self, target: &str, reason: &str) {
        self.state.lock().failures.insert(target.to_owned(), reason.to_owned());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Hold every call until `gate` opens.
    pub fn hold_with(&self, gate: Arc<Gate>) {
        self.state.lock().gate = Some(gate);
    }

    pub fn find_calls(&self) -> usize {
        self.counters.find.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.counters.list.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.counters.publishes.load(Ordering::SeqCst)
    }

    pub fn thumbnail_calls(&self) -> usize {
        self.counters.thumbnails.load(Ordering::SeqCst)
    }

    fn pass_gate(&self) {
        let gate = self.state.lock().gate.clone();
        if let Some(gate) = gate {
            gate.wait();
        }
    }

    fn check_failure(&self, target: &str) -> LoaderResult<()> {
        match self.state.lock().failures.get(target) {
            Some(reason) => Err(LoaderError::query_failed(target, reason)),
            None => Ok(()),
        }
    }
}

impl EntityDatabase for InMemoryDatabase {
    fn find(&self, entity_type: &str, filters: &[FilterPredicate]) -> LoaderResult<Vec<EntityRecord>> {
        self.counters.find.fetch_add(1, Ordering::SeqCst);
        self.pass_gate();
        self.check_failure(entity_type)?;

        Ok(self
            .state
            .lock()
            .records
            .get(entity_type)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| filters.iter().all(|f| f.matches(*r)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn list_children(&self, path: &str) -> LoaderResult<Vec<HierarchyEntry>> {
        self.counters.list.fetch_add(1, Ordering::SeqCst);
        self.pass_gate();
        self.check_failure(path)?;

        Ok(self.state.lock().children.get(path).cloned().unwrap_or_default())
    }

    fn find_publishes(&self, scope: &PublishScope, filters: &[FilterPredicate]) -> LoaderResult<Vec<PublishRecord>> {
        self.counters.publishes.fetch_add(1, Ordering::SeqCst);
        self.pass_gate();
        self.check_failure("publishes")?;

        let in_scope = |record: &PublishRecord| match scope {
            PublishScope::LinkedTo(entity) => record
                .linked_entity
                .as_ref()
                .is_some_and(|linked| linked.same_entity(entity)),
            PublishScope::LinkedToAny(entities) => record
                .linked_entity
                .as_ref()
                .is_some_and(|linked| entities.iter().any(|e| e.same_entity(linked))),
            PublishScope::UnderPath(path) => record.path.starts_with(path.as_str()),
        };

        Ok(self
            .state
            .lock()
            .publishes
            .iter()
            .filter(|r| in_scope(*r) && filters.iter().all(|f| f.matches(*r)))
            .cloned()
            .collect())
    }

    fn download_thumbnail(&self, thumbnail: &ThumbnailRef) -> LoaderResult<Bytes> {
        self.counters.thumbnails.fetch_add(1, Ordering::SeqCst);
        self.pass_gate();

        self.state
            .lock()
            .thumbnails
            .get(thumbnail.key.as_str())
            .cloned()
            .ok_or_else(|| LoaderError::thumbnail_failed(&thumbnail.key, "404 not found"))
    }
}

/// Actions hook recording every call.
#[derive(Debug, Default)]
pub struct RecordingActions {
    pub generated: Mutex<Vec<(String, Vec<String>, UiArea)>>,
    pub executed: Mutex<Vec<String>>,
    failing: Option<String>,
}

impl RecordingActions {
    pub fn failing(action: &str) -> Self {
        Self {
            failing: Some(action.to_owned()),
            ..Self::default()
        }
    }
}

impl ActionsHook for RecordingActions {
    fn generate_actions(
        &self,
        target: &ActionTarget,
        actions: &[String],
        ui_area: UiArea,
    ) -> LoaderResult<Vec<ActionDescriptor>> {
        self.generated
            .lock()
            .push((target.describe(), actions.to_vec(), ui_area));
        Ok(actions.iter().map(|a| ActionDescriptor::from_identifier(a)).collect())
    }

    fn execute_action(&self, _target: &ActionTarget, action: &ActionDescriptor) -> LoaderResult<()> {
        self.executed.lock().push(action.name.clone());
        if self.failing.as_deref() == Some(action.name.as_str()) {
            return Err(LoaderError::other("host refused"));
        }
        Ok(())
    }
}

/// Pass-through filter hook that remembers what it saw.
#[derive(Debug, Default)]
pub struct RecordingFilter {
    /// Record count per call.
    pub seen: Mutex<Vec<usize>>,
    pub locations: Mutex<Vec<LocationContext>>,
}

impl FilterPublishesHook for RecordingFilter {
    fn filter(&self, records: Vec<PublishRecord>, location: &LocationContext) -> LoaderResult<Vec<PublishRecord>> {
        self.seen.lock().push(records.len());
        self.locations.lock().push(location.clone());
        Ok(records)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FailingFilter;

impl FilterPublishesHook for FailingFilter {
    fn filter(&self, _records: Vec<PublishRecord>, _location: &LocationContext) -> LoaderResult<Vec<PublishRecord>> {
        Err(LoaderError::other("hook raised"))
    }
}
