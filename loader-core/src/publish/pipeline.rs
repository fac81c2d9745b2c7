//! ``src/publish/pipeline.rs``
//! ============================================================================
//! # Publish Pipeline
//!
//! Produces the publish listing for one node in four stages:
//!
//! 1. server query scoped to the node with the tab's publish filters
//! 2. global publish filters evaluated client-side
//! 3. the host's filter hook
//! 4. latest-version collapse unless the effective policy shows all versions
//!
//! The stage order is fixed. A hook failure aborts the listing.

use std::time::Instant;

use ahash::AHashMap;
use compact_str::CompactString;
use tracing::{debug, info_span, warn};

use crate::builder::plan::as_query_failure;
use crate::error::{LoaderError, LoaderResult};
use crate::host::{EntityDatabase, FilterPublishesHook, LocationContext, PublishScope};
use crate::model::entity::{Context, PublishRecord};
use crate::model::filter::{FilterPredicate, resolve_all};
use crate::model::tab::TabDefinition;
use crate::model::tree::{NodeId, Tree};

/// Everything a worker needs to list one node's publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub scope: PublishScope,
    pub tab_filters: Vec<FilterPredicate>,
    pub global_filters: Vec<FilterPredicate>,
    pub show_all_versions: bool,
    pub location: LocationContext,
}

impl PublishRequest {
    /// Build the request for `node`, resolving context tokens now.
    pub fn for_node(
        tab: &TabDefinition,
        tree: &Tree,
        node: NodeId,
        global_filters: &[FilterPredicate],
        global_show_all_versions: bool,
        context: &Context,
    ) -> LoaderResult<Self> {
        let entry = tree.get(node).ok_or_else(|| tree.unknown(node))?;

        let scope = match (&entry.entity_ref, &entry.path) {
            (Some(entity), _) => PublishScope::LinkedTo(entity.clone()),
            (None, Some(path)) => PublishScope::UnderPath(path.clone()),
            (None, None) => PublishScope::LinkedToAny(tree.descendant_entities(node)),
        };

        Ok(Self {
            scope,
            tab_filters: resolve_all(&tab.publish_filters, context),
            global_filters: resolve_all(global_filters, context),
            show_all_versions: tab.show_all_versions.unwrap_or(global_show_all_versions),
            location: LocationContext {
                tab_caption: tab.caption.clone(),
                label_path: tree.label_path(node),
                entity_ref: entry.entity_ref.clone(),
                path: entry.path.clone(),
            },
        })
    }

    fn describe(&self) -> String {
        match &self.scope {
            PublishScope::LinkedTo(entity) => format!("publishes of {} {}", entity.entity_type, entity.id),
            PublishScope::LinkedToAny(entities) => format!("publishes of {} entities", entities.len()),
            PublishScope::UnderPath(path) => format!("publishes under {path}"),
        }
    }

    /// Run all four stages. Called on a worker thread.
    pub fn run(
        &self,
        database: &dyn EntityDatabase,
        hook: &dyn FilterPublishesHook,
    ) -> LoaderResult<Vec<PublishRecord>> {
        let target = self.describe();
        let _span = info_span!("publish_pipeline", target = %target).entered();
        let started = Instant::now();

        if matches!(&self.scope, PublishScope::LinkedToAny(entities) if entities.is_empty()) {
            return Ok(Vec::new());
        }

        let fetched = database
            .find_publishes(&self.scope, &self.tab_filters)
            .map_err(|e| as_query_failure(&target, e))?;
        let fetched_count = fetched.len();

        let filtered = apply_global_filters(fetched, &self.global_filters);

        let hooked = hook.filter(filtered, &self.location).map_err(|e| {
            let err = match e {
                LoaderError::FilterHookFailed { .. } => e,
                other => LoaderError::filter_hook_failed(other.to_string()),
            };
            warn!(
                marker = "PUBLISH_PIPELINE",
                operation_type = "filter_hook",
                error = %err,
                "Filter hook failed; listing aborted"
            );
            err
        })?;

        let records = if self.show_all_versions {
            hooked
        } else {
            latest_versions_only(hooked)
        };

        debug!(
            marker = "PUBLISH_PIPELINE",
            operation_type = "publish_listing",
            fetched = fetched_count,
            listed = records.len(),
            duration_us = started.elapsed().as_micros(),
            "Publish listing ready"
        );
        Ok(records)
    }
}

/// Keep records matching every filter.
#[must_use]
pub fn apply_global_filters(records: Vec<PublishRecord>, filters: &[FilterPredicate]) -> Vec<PublishRecord> {
    if filters.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|record| filters.iter().all(|f| f.matches(record)))
        .collect()
}

/// Collapse each `(linked entity, published file type)` stream to its highest
/// version. Survivors keep their original relative order; on a version tie
/// the first record wins.
#[must_use]
pub fn latest_versions_only(records: Vec<PublishRecord>) -> Vec<PublishRecord> {
    type StreamKey = (Option<(CompactString, i64)>, String);

    let mut best: AHashMap<StreamKey, usize> = AHashMap::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        let (entity, kind) = record.version_stream();
        best.entry((entity, kind.to_owned()))
            .and_modify(|current| {
                if record.version_number > records[*current].version_number {
                    *current = index;
                }
            })
            .or_insert(index);
    }

    let mut keep = vec![false; records.len()];
    for index in best.into_values() {
        keep[index] = true;
    }

    records
        .into_iter()
        .zip(keep)
        .filter_map(|(record, kept)| kept.then_some(record))
        .collect()
}
