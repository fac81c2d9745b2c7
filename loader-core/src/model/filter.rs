//! ``src/model/filter.rs``
//! ============================================================================
//! # Filter Predicates
//!
//! `[field, operator, value]` triples from configuration. Values may hold
//! late-bound tokens such as `{context.user}` which are resolved against the
//! session [`Context`] right before a query is issued. The same predicates
//! are evaluated client-side for the global publish filter stage.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LoaderError, LoaderResult};
use crate::model::entity::{Context, EntityRef, FieldSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Is,
    IsNot,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

impl FilterOperator {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Is => "is",
            Self::IsNot => "is_not",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
        }
    }
}

impl FromStr for FilterOperator {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "is" => Self::Is,
            "is_not" => Self::IsNot,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "not_contains" => Self::NotContains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "greater_than" => Self::GreaterThan,
            "less_than" => Self::LessThan,
            other => {
                return Err(LoaderError::configuration(
                    "filter",
                    format!("unknown operator '{other}'"),
                ));
            }
        })
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context slot a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextToken {
    Project,
    ProjectId,
    User,
    Entity,
    Step,
    Task,
}

impl ContextToken {
    /// Recognise `{context.<slot>}`; any other string is a literal.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix("{context.")?.strip_suffix('}')?;
        match inner {
            "project" => Some(Self::Project),
            "project.id" => Some(Self::ProjectId),
            "user" => Some(Self::User),
            "entity" => Some(Self::Entity),
            "step" => Some(Self::Step),
            "task" => Some(Self::Task),
            _ => None,
        }
    }

    /// Value for this slot; empty slots resolve to null.
    #[must_use]
    pub fn resolve(self, context: &Context) -> Value {
        let link = |slot: &Option<EntityRef>| slot.as_ref().map_or(Value::Null, EntityRef::to_value);

        match self {
            Self::Project => link(&context.project),
            Self::ProjectId => context
                .project
                .as_ref()
                .map_or(Value::Null, |p| Value::from(p.id)),
            Self::User => link(&context.user),
            Self::Entity => link(&context.entity),
            Self::Step => link(&context.step),
            Self::Task => link(&context.task),
        }
    }
}

/// Substitute every context token inside `value`.
#[must_use]
pub fn resolve_tokens(value: &Value, context: &Context) -> Value {
    match value {
        Value::String(raw) => {
            ContextToken::parse(raw).map_or_else(|| value.clone(), |token| token.resolve(context))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_tokens(v, context)).collect()),
        _ => value.clone(),
    }
}

/// A single filter triple. `value` may still contain unresolved tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl FilterPredicate {
    #[must_use]
    pub fn new(field: &str, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.to_owned(),
            operator,
            value,
        }
    }

    /// Build from a raw `[field, operator, value]` triple.
    pub fn from_triple(raw: &Value) -> LoaderResult<Self> {
        let items = raw.as_array().ok_or_else(|| {
            LoaderError::configuration("filter", format!("expected [field, operator, value], got {raw}"))
        })?;

        let [field, operator, value] = items.as_slice() else {
            return Err(LoaderError::configuration(
                "filter",
                format!("expected 3 elements, got {}", items.len()),
            ));
        };

        let field = field
            .as_str()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| LoaderError::configuration("filter", "field must be a non-empty string"))?;

        let operator: FilterOperator = operator
            .as_str()
            .ok_or_else(|| LoaderError::configuration("filter", "operator must be a string"))?
            .parse()?;

        if matches!(operator, FilterOperator::In | FilterOperator::NotIn) && !value.is_array() {
            return Err(LoaderError::configuration(
                "filter",
                format!("operator '{operator}' on '{field}' needs a list value"),
            ));
        }

        Ok(Self::new(field, operator, value.clone()))
    }

    #[must_use]
    pub fn resolve(&self, context: &Context) -> Self {
        Self {
            field: self.field.clone(),
            operator: self.operator,
            value: resolve_tokens(&self.value, context),
        }
    }

    /// Client-side evaluation against a record.
    #[must_use]
    pub fn matches(&self, source: &dyn FieldSource) -> bool {
        let actual = source.field_value(&self.field);
        let expected = &self.value;

        match self.operator {
            FilterOperator::Is => is_match(&actual, expected),
            FilterOperator::IsNot => !is_match(&actual, expected),
            FilterOperator::In => expected
                .as_array()
                .is_some_and(|items| items.iter().any(|v| is_match(&actual, v))),
            FilterOperator::NotIn => !expected
                .as_array()
                .is_some_and(|items| items.iter().any(|v| is_match(&actual, v))),
            FilterOperator::Contains => contains(&actual, expected),
            FilterOperator::NotContains => !contains(&actual, expected),
            FilterOperator::StartsWith => str_pair(&actual, expected).is_some_and(|(a, e)| a.starts_with(e)),
            FilterOperator::EndsWith => str_pair(&actual, expected).is_some_and(|(a, e)| a.ends_with(e)),
            FilterOperator::GreaterThan => compare(&actual, expected) == Some(Ordering::Greater),
            FilterOperator::LessThan => compare(&actual, expected) == Some(Ordering::Less),
        }
    }
}

/// Resolve a whole filter list.
#[must_use]
pub fn resolve_all(filters: &[FilterPredicate], context: &Context) -> Vec<FilterPredicate> {
    filters.iter().map(|f| f.resolve(context)).collect()
}

/// Entity links compare by type and id; numbers compare numerically.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(left), Some(right)) = (EntityRef::from_value(a), EntityRef::from_value(b)) {
        return left.same_entity(&right);
    }
    if let (Some(left), Some(right)) = (a.as_f64(), b.as_f64()) {
        return left == right;
    }
    a == b
}

/// Multi-entity fields match `is` when any member matches.
fn is_match(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) if !expected.is_array() => items.iter().any(|v| values_equal(v, expected)),
        _ => values_equal(actual, expected),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|v| values_equal(v, expected)),
        Value::String(s) => expected.as_str().is_some_and(|e| s.contains(e)),
        _ => false,
    }
}

fn str_pair<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(left), Some(right)) = (a.as_f64(), b.as_f64()) {
        return left.partial_cmp(&right);
    }
    str_pair(a, b).map(|(left, right)| left.cmp(right))
}
