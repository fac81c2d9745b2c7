//! ``src/builder/grouping.rs``
//! ============================================================================
//! # Record Grouping
//!
//! Turns a flat query result into nested [`NodeSpec`]s: one level per
//! hierarchy field, then one leaf per record. Buckets keep first-occurrence
//! order, so the same input always yields the same tree.

use indexmap::IndexMap;

use crate::model::entity::{EntityRecord, FieldSource};
use crate::model::tree::{GroupingKey, NodeSpec, label_for_value};

/// Group `records` by `hierarchy_fields` in order.
#[must_use]
pub fn group_records(records: &[EntityRecord], hierarchy_fields: &[String]) -> Vec<NodeSpec> {
    group_level(records.iter().collect(), hierarchy_fields)
}

fn group_level(records: Vec<&EntityRecord>, fields: &[String]) -> Vec<NodeSpec> {
    let Some((field, rest)) = fields.split_first() else {
        return records
            .into_iter()
            .map(|record| NodeSpec::leaf(record.entity_ref(), record.display_name()))
            .collect();
    };

    let mut buckets: IndexMap<GroupingKey, (String, Vec<&EntityRecord>)> = IndexMap::new();
    for record in records {
        let value = record.field_value(field);
        buckets
            .entry(GroupingKey::from_field(&value))
            .or_insert_with(|| (label_for_value(&value), Vec::new()))
            .1
            .push(record);
    }

    buckets
        .into_iter()
        .map(|(key, (label, members))| {
            let mut spec = NodeSpec::group(key, label);
            spec.children = group_level(members, rest);
            spec
        })
        .collect()
}
