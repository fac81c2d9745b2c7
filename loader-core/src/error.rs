//! `src/error.rs`
//! ============================================================================
//! # `LoaderError`: Unified Error Type for the Loader Engine
//!
//! • One enum for every failure the engine can surface
//! • Grouped by concern: remote queries, hooks, thumbnails, configuration
//! • First-class `tracing` integration via [`LoaderError::trace`]
//! • `#[non_exhaustive]` for forward-compatible extension

use std::io;

use compact_str::CompactString;
use smallvec::{SmallVec, smallvec};
use thiserror::Error;
use tracing::{Level, event};

use crate::model::tree::FetchState;

/// Convenient alias carrying the unified error type
pub type LoaderResult<T> = Result<T, LoaderError>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LoaderError {
    // ────────────────────────────────────────────────────────────
    // Remote entity database
    // ────────────────────────────────────────────────────────────
    #[error("Query failed for {target}: {reason}")]
    QueryFailed {
        target: CompactString,
        reason: CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // User hooks
    // ────────────────────────────────────────────────────────────
    #[error("Publish filter hook failed: {reason}")]
    FilterHookFailed { reason: CompactString },

    #[error("Action '{action}' failed: {reason}")]
    ActionHookFailed {
        action: CompactString,
        reason: CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // Thumbnails (transient, never propagated past the cache)
    // ────────────────────────────────────────────────────────────
    #[error("Thumbnail fetch failed for {key}: {reason}")]
    ThumbnailFailed {
        key: CompactString,
        reason: CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // Configuration
    // ────────────────────────────────────────────────────────────
    #[error("Configuration error in {location}: {message}")]
    Configuration {
        location: CompactString,
        message: CompactString,
    },

    // ────────────────────────────────────────────────────────────
    // Tree state
    // ────────────────────────────────────────────────────────────
    #[error("Invalid fetch state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: FetchState, to: FetchState },

    #[error("Unknown tab index {0}")]
    UnknownTab(usize),

    #[error("Unknown node {node} in tab {tab}")]
    UnknownNode { tab: usize, node: usize },

    // ────────────────────────────────────────────────────────────
    // Scheduling
    // ────────────────────────────────────────────────────────────
    #[error("Fetch was cancelled before completion")]
    Cancelled,

    #[error("No async runtime available: {0}")]
    RuntimeUnavailable(CompactString),

    // ────────────────────────────────────────────────────────────
    // Plumbing
    // ────────────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other error, with description.
    #[error("Unexpected error: {0}")]
    Other(CompactString),
}

// Errors cross the worker boundary inside shared outcomes, so clones degrade
// non-clonable sources into their messages.
impl Clone for LoaderError {
    fn clone(&self) -> Self {
        match self {
            Self::QueryFailed { target, reason } => Self::QueryFailed {
                target: target.clone(),
                reason: reason.clone(),
            },
            Self::FilterHookFailed { reason } => Self::FilterHookFailed {
                reason: reason.clone(),
            },
            Self::ActionHookFailed { action, reason } => Self::ActionHookFailed {
                action: action.clone(),
                reason: reason.clone(),
            },
            Self::ThumbnailFailed { key, reason } => Self::ThumbnailFailed {
                key: key.clone(),
                reason: reason.clone(),
            },
            Self::Configuration { location, message } => Self::Configuration {
                location: location.clone(),
                message: message.clone(),
            },
            Self::InvalidTransition { from, to } => Self::InvalidTransition {
                from: *from,
                to: *to,
            },
            Self::UnknownTab(tab) => Self::UnknownTab(*tab),
            Self::UnknownNode { tab, node } => Self::UnknownNode {
                tab: *tab,
                node: *node,
            },
            Self::Cancelled => Self::Cancelled,
            Self::RuntimeUnavailable(msg) => Self::RuntimeUnavailable(msg.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Toml(e) => Self::Other(CompactString::from(format!("Config parse error: {e}"))),
            Self::Json(e) => Self::Other(CompactString::from(format!("Serialization error: {e}"))),
            Self::Other(msg) => Self::Other(msg.clone()),
        }
    }
}

impl LoaderError {
    /// Whether the UI may offer a retry for the failed operation
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QueryFailed { .. }
                | Self::FilterHookFailed { .. }
                | Self::ThumbnailFailed { .. }
                | Self::Cancelled
                | Self::Io(_)
        )
    }

    // ────────────────────────────────────────────────────────────
    // Attribute helpers – used for structured log grouping
    // ────────────────────────────────────────────────────────────
    #[inline]
    #[must_use]
    pub const fn operation_type(&self) -> &'static str {
        match self {
            Self::QueryFailed { .. } => "entity_query",

            Self::FilterHookFailed { .. } | Self::ActionHookFailed { .. } => "user_hook",

            Self::ThumbnailFailed { .. } => "thumbnail_fetch",

            Self::Configuration { .. } | Self::Toml(_) => "configuration",

            Self::InvalidTransition { .. } | Self::UnknownTab(_) | Self::UnknownNode { .. } => {
                "tree_state"
            }

            Self::Cancelled | Self::RuntimeUnavailable(_) => "scheduling",

            Self::Io(_) | Self::Json(_) => "io",

            Self::Other(_) => "unknown_error",
        }
    }

    #[inline]
    #[must_use]
    pub const fn error_marker(&self) -> &'static str {
        match self {
            Self::QueryFailed { .. } => "ERROR_QUERY_FAILED",
            Self::FilterHookFailed { .. } => "ERROR_FILTER_HOOK",
            Self::ActionHookFailed { .. } => "ERROR_ACTION_HOOK",
            Self::ThumbnailFailed { .. } => "ERROR_THUMBNAIL",
            Self::Configuration { .. } => "ERROR_CONFIGURATION",
            Self::InvalidTransition { .. } => "ERROR_INVALID_TRANSITION",
            Self::UnknownTab(_) => "ERROR_UNKNOWN_TAB",
            Self::UnknownNode { .. } => "ERROR_UNKNOWN_NODE",
            Self::Cancelled => "ERROR_CANCELLED",
            Self::RuntimeUnavailable(_) => "ERROR_RUNTIME_UNAVAILABLE",
            Self::Io(_) => "ERROR_IO",
            Self::Toml(_) => "ERROR_TOML",
            Self::Json(_) => "ERROR_JSON",
            Self::Other(_) => "ERROR_UNKNOWN",
        }
    }

    #[must_use]
    pub fn extract_trace_fields(&self) -> SmallVec<[(&'static str, CompactString); 4]> {
        match self {
            Self::QueryFailed { target, reason } => smallvec![
                ("target", target.clone()),
                ("reason", reason.clone()),
            ],

            Self::ActionHookFailed { action, reason } => smallvec![
                ("action", action.clone()),
                ("reason", reason.clone()),
            ],

            Self::Configuration { location, message } => smallvec![
                ("location", location.clone()),
                ("message", message.clone()),
            ],

            Self::ThumbnailFailed { key, .. } => smallvec![("key", key.clone())],

            _ => smallvec![],
        }
    }

    /// Emit a single structured error event and hand the error back.
    #[must_use]
    pub fn trace(self) -> Self {
        let extra = self.extract_trace_fields();

        event!(
            Level::ERROR,
            marker = self.error_marker(),
            operation_type = self.operation_type(),
            error = %self,
            recoverable = self.is_recoverable(),
            extra = ?extra,
        );

        self
    }

    // ────────────────────────────────────────────────────────────
    // Smart constructors
    // ────────────────────────────────────────────────────────────
    #[must_use]
    pub fn query_failed(target: impl AsRef<str>, reason: impl AsRef<str>) -> Self {
        Self::QueryFailed {
            target: CompactString::new(target),
            reason: CompactString::new(reason),
        }
    }

    #[must_use]
    pub fn filter_hook_failed(reason: impl AsRef<str>) -> Self {
        Self::FilterHookFailed {
            reason: CompactString::new(reason),
        }
    }

    #[must_use]
    pub fn action_hook_failed(action: impl AsRef<str>, reason: impl AsRef<str>) -> Self {
        Self::ActionHookFailed {
            action: CompactString::new(action),
            reason: CompactString::new(reason),
        }
    }

    #[must_use]
    pub fn thumbnail_failed(key: impl AsRef<str>, reason: impl AsRef<str>) -> Self {
        Self::ThumbnailFailed {
            key: CompactString::new(key),
            reason: CompactString::new(reason),
        }
    }

    #[must_use]
    pub fn configuration(location: impl AsRef<str>, message: impl AsRef<str>) -> Self {
        Self::Configuration {
            location: CompactString::new(location),
            message: CompactString::new(message),
        }
    }

    #[must_use]
    pub fn other(message: impl AsRef<str>) -> Self {
        Self::Other(CompactString::new(message))
    }
}

impl From<anyhow::Error> for LoaderError {
    fn from(e: anyhow::Error) -> Self {
        Self::Other(CompactString::from(e.to_string()))
    }
}
