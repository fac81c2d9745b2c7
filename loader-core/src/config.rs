//! ``src/config.rs``
//! ============================================================================
//! # Loader Configuration
//!
//! One TOML document, loaded once and immutable afterwards. Raw tables are
//! validated into [`LoaderConfig`]:
//!
//! - a malformed tab is rejected on its own and recorded in
//!   [`LoadedConfig::rejected`]; the remaining tabs still load
//! - malformed top-level keys (global filters, mappings, worker count) fail
//!   the whole load
//!
//! ## Example
//! ```toml
//! menu_name = "Load"
//! download_thumbnails = true
//! action_mappings = { "Alembic Cache" = ["reference"], "*" = ["open_folder"] }
//!
//! [[entities]]
//! caption = "My Tasks"
//! type = "Query"
//! entity_type = "Task"
//! filters = [["task_assignees", "is", "{context.user}"]]
//! hierarchy = ["entity", "content"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::actions::mapping::ActionMapping;
use crate::controller::coordinator::DEFAULT_MAX_WORKERS;
use crate::error::{LoaderError, LoaderResult};
use crate::logging::LoggerConfig;
use crate::model::filter::FilterPredicate;
use crate::model::tab::{RawTabDefinition, TabDefinition, parse_filters};

const QUALIFIER: &str = "org";
const ORGANIZATION: &str = "pipeline";
const APPLICATION: &str = "PublishLoader";

/// Background worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Concurrent remote calls; must be at least 1.
    pub max_workers: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// In-memory entries kept.
    pub max_capacity: u64,

    /// Evict from memory when not viewed for this long.
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Duration,

    /// Disk layer; `None` keeps thumbnails in memory only.
    pub cache_dir: Option<PathBuf>,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_capacity: 1024,
            time_to_idle: Duration::from_secs(600),
            cache_dir: None,
        }
    }
}

fn default_menu_name() -> String {
    "Load".to_owned()
}

fn default_title_name() -> String {
    "Loader".to_owned()
}

const fn default_true() -> bool {
    true
}

/// Document as written.
#[derive(Debug, Clone, Deserialize)]
struct RawLoaderConfig {
    #[serde(default = "default_menu_name")]
    menu_name: String,
    #[serde(default = "default_title_name")]
    title_name: String,
    #[serde(default = "default_true")]
    download_thumbnails: bool,
    #[serde(default)]
    show_all_versions: bool,
    #[serde(default)]
    action_mappings: IndexMap<String, Vec<String>>,
    #[serde(default)]
    entity_mappings: IndexMap<String, Vec<String>>,
    #[serde(default)]
    entities: Vec<Value>,
    #[serde(default)]
    publish_filters: Vec<Value>,
    #[serde(default)]
    fetch: FetchConfig,
    #[serde(default)]
    thumbnails: ThumbnailConfig,
    #[serde(default)]
    logging: LoggerConfig,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderConfig {
    pub menu_name: String,
    pub title_name: String,
    pub download_thumbnails: bool,
    /// Default for tabs without their own `show_all_versions`.
    pub show_all_versions: bool,
    pub action_mapping: ActionMapping,
    pub tabs: Vec<TabDefinition>,
    /// Applied client-side after each tab's own publish filters.
    pub publish_filters: Vec<FilterPredicate>,
    pub fetch: FetchConfig,
    pub thumbnails: ThumbnailConfig,
    pub logging: LoggerConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            menu_name: default_menu_name(),
            title_name: default_title_name(),
            download_thumbnails: true,
            show_all_versions: false,
            action_mapping: ActionMapping::default(),
            tabs: Vec::new(),
            publish_filters: Vec::new(),
            fetch: FetchConfig::default(),
            thumbnails: ThumbnailConfig::default(),
            logging: LoggerConfig::default(),
        }
    }
}

/// Parse result: the usable configuration plus the tabs that were dropped.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: LoaderConfig,
    pub rejected: Vec<LoaderError>,
}

impl LoaderConfig {
    /// Parse in-memory TOML.
    pub fn from_toml_str(text: &str) -> LoaderResult<LoadedConfig> {
        let raw: RawLoaderConfig = toml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawLoaderConfig) -> LoaderResult<LoadedConfig> {
        if raw.fetch.max_workers == 0 {
            return Err(LoaderError::configuration("fetch.max_workers", "must be at least 1"));
        }
        if raw.thumbnails.max_capacity == 0 {
            return Err(LoaderError::configuration("thumbnails.max_capacity", "must be at least 1"));
        }

        let action_mapping = ActionMapping::new(raw.action_mappings, raw.entity_mappings).validated()?;
        let publish_filters = parse_filters(&raw.publish_filters, "publish_filters")?;

        let mut tabs = Vec::with_capacity(raw.entities.len());
        let mut rejected = Vec::new();
        for (index, entry) in raw.entities.into_iter().enumerate() {
            match parse_tab(index, entry) {
                Ok(tab) => tabs.push(tab),
                Err(error) => {
                    warn!(
                        marker = "CONFIG",
                        operation_type = "tab_rejected",
                        index,
                        error = %error,
                        "Skipping malformed tab"
                    );
                    rejected.push(error);
                }
            }
        }

        Ok(LoadedConfig {
            config: Self {
                menu_name: raw.menu_name,
                title_name: raw.title_name,
                download_thumbnails: raw.download_thumbnails,
                show_all_versions: raw.show_all_versions,
                action_mapping,
                tabs,
                publish_filters,
                fetch: raw.fetch,
                thumbnails: raw.thumbnails,
                logging: raw.logging,
            },
            rejected,
        })
    }

    /// Read and parse `path`. A missing disk cache directory defaults to the
    /// platform cache location.
    pub async fn load(path: &Path) -> anyhow::Result<LoadedConfig> {
        info!("Loading loader config from {}", path.display());
        let text = tokio::fs::read_to_string(path).await?;
        let mut loaded = Self::from_toml_str(&text)?;

        if loaded.config.thumbnails.cache_dir.is_none() {
            loaded.config.thumbnails.cache_dir = Self::default_cache_dir().ok();
        }
        Ok(loaded)
    }

    /// Load from [`Self::default_path`], or defaults when the file is absent.
    pub async fn load_default() -> anyhow::Result<LoadedConfig> {
        let path = Self::default_path()?;
        if tokio::fs::try_exists(&path).await? {
            return Self::load(&path).await;
        }

        info!(
            "No config file found at {}, using default configuration",
            path.display()
        );
        Ok(LoadedConfig {
            config: Self::default(),
            rejected: Vec::new(),
        })
    }

    /// Canonical config file path.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let dirs = project_dirs()?;
        Ok(dirs.config_dir().join("loader.toml"))
    }

    /// Platform cache directory for downloaded thumbnails.
    pub fn default_cache_dir() -> anyhow::Result<PathBuf> {
        let dirs = project_dirs()?;
        Ok(dirs.cache_dir().join("thumbnails"))
    }
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory."))
}

fn parse_tab(index: usize, entry: Value) -> LoaderResult<TabDefinition> {
    let raw: RawTabDefinition = serde_json::from_value(entry)
        .map_err(|e| LoaderError::configuration(format!("entities[{index}]"), e.to_string()))?;
    TabDefinition::try_from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tab::TabKind;

    const SAMPLE: &str = r#"
menu_name = "Load"
title_name = "Publish Loader"
download_thumbnails = false
publish_filters = [["sg_status_list", "is_not", "rej"]]
action_mappings = { "Alembic Cache" = ["reference", "import"], "*" = ["open_folder"] }
entity_mappings = { "Shot" = ["open_folder"] }

[fetch]
max_workers = 2

[thumbnails]
max_capacity = 64
time_to_idle = "5m"

[[entities]]
caption = "Project"
type = "Hierarchy"
root = "{context.project}"

[[entities]]
caption = "Broken"
type = "Query"
filters = [["code", "is", "x"]]

[[entities]]
caption = "My Tasks"
type = "Query"
entity_type = "Task"
filters = [["task_assignees", "is", "{context.user}"]]
hierarchy = ["entity", "content"]
show_all_versions = true
"#;

    #[test]
    fn test_sample_config_loads_with_partial_rejection() {
        let loaded = LoaderConfig::from_toml_str(SAMPLE).unwrap();
        let config = loaded.config;

        assert_eq!(config.title_name, "Publish Loader");
        assert!(!config.download_thumbnails);
        assert_eq!(config.fetch.max_workers, 2);
        assert_eq!(config.thumbnails.time_to_idle, Duration::from_secs(300));
        assert_eq!(config.publish_filters.len(), 1);

        let captions: Vec<_> = config.tabs.iter().map(|t| t.caption.as_str()).collect();
        assert_eq!(captions, ["Project", "My Tasks"]);
        assert!(matches!(config.tabs[1].kind, TabKind::Query { .. }));
        assert_eq!(config.tabs[1].show_all_versions, Some(true));

        assert_eq!(loaded.rejected.len(), 1);
        assert!(loaded.rejected[0].to_string().contains("Broken"));
    }

    #[test]
    fn test_non_table_tab_is_rejected_alone() {
        let text = r#"
entities = ["not a table", { caption = "Assets", type = "Hierarchy" }]
"#;
        let loaded = LoaderConfig::from_toml_str(text).unwrap();
        assert_eq!(loaded.config.tabs.len(), 1);
        assert!(loaded.rejected[0].to_string().contains("entities[0]"));
    }

    #[test]
    fn test_top_level_errors_are_fatal() {
        assert!(LoaderConfig::from_toml_str("publish_filters = [[\"code\", \"like\", \"x\"]]").is_err());
        assert!(LoaderConfig::from_toml_str("[fetch]\nmax_workers = 0").is_err());
        assert!(LoaderConfig::from_toml_str("action_mappings = { \"*\" = [\"\"] }").is_err());
        assert!(LoaderConfig::from_toml_str("download_thumbnails = \"yes\"").is_err());
    }

    #[test]
    fn test_defaults() {
        let loaded = LoaderConfig::from_toml_str("").unwrap();
        assert_eq!(loaded.config, LoaderConfig::default());
        assert!(loaded.rejected.is_empty());
    }
}
