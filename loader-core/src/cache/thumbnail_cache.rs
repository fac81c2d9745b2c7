//! ``src/cache/thumbnail_cache.rs``
//! ============================================================================
//! # Thumbnail Cache
//!
//! Two layers keyed by the thumbnail's content/version identifier:
//!
//! - an in-memory `moka` index of resolved handles (bounded, time-to-idle)
//! - an optional on-disk directory of downloaded bytes
//!
//! Misses are fetched through the session's coordinator. Failed fetches are
//! never stored, so the next view retries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashSet;
use bytes::Bytes;
use compact_str::CompactString;
use moka::sync::Cache;
use tracing::{debug, instrument, trace, warn};

use crate::config::ThumbnailConfig;
use crate::controller::coordinator::{FetchCoordinator, FetchKey, FetchOutcome, FetchPayload, FetchTicket};
use crate::error::{LoaderError, LoaderResult};
use crate::host::EntityDatabase;
use crate::model::entity::ThumbnailRef;

pub type ThumbnailKey = CompactString;

const DISK_SUFFIX: &str = "thumb";

/// A resolved image.
#[derive(Clone, PartialEq, Eq)]
pub struct ThumbnailHandle {
    pub key: ThumbnailKey,
    /// Backing file when the disk layer holds a copy.
    pub path: Option<PathBuf>,
    pub bytes: Bytes,
}

impl fmt::Debug for ThumbnailHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Answer to a thumbnail request.
#[derive(Debug)]
pub enum ThumbnailLookup {
    Ready(ThumbnailHandle),
    /// A fetch is in flight; the ticket resolves when it lands.
    Pending(FetchTicket),
    /// Downloads disabled or the record has no thumbnail.
    Placeholder,
}

/// Disk layer. Cheap to clone into worker jobs.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: Arc<PathBuf>,
}

impl DiskStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.{DISK_SUFFIX}", encode_key(key)))
    }

    fn read(&self, key: &str) -> Option<ThumbnailHandle> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).ok()?;
        Some(ThumbnailHandle {
            key: CompactString::new(key),
            path: Some(path),
            bytes: Bytes::from(bytes),
        })
    }

    fn write(&self, key: &str, bytes: &Bytes) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(self.root.as_path())?;
        let path = self.path_for(key);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Filesystem-safe file stem for `key`.
///
/// Bytes outside `[A-Za-z0-9.-]` become `_xx` (lowercase hex), `_` included,
/// so distinct keys never share a file.
#[must_use]
pub fn encode_key(key: &str) -> String {
    use std::fmt::Write;

    let mut stem = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "_{byte:02x}");
        }
    }
    stem
}

/// Worker body: disk layer first, then download with best-effort write-back.
pub fn load_thumbnail(
    database: &dyn EntityDatabase,
    store: Option<&DiskStore>,
    thumbnail: &ThumbnailRef,
) -> LoaderResult<ThumbnailHandle> {
    if let Some(handle) = store.and_then(|s| s.read(&thumbnail.key)) {
        trace!(
            marker = "THUMBNAIL_CACHE",
            operation_type = "disk_hit",
            key = %thumbnail.key,
            "Thumbnail read from disk"
        );
        return Ok(handle);
    }

    let bytes = database.download_thumbnail(thumbnail).map_err(|e| match e {
        LoaderError::ThumbnailFailed { .. } => e,
        other => LoaderError::thumbnail_failed(&thumbnail.key, other.to_string()),
    })?;

    let path = store.and_then(|s| match s.write(&thumbnail.key, &bytes) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(
                marker = "THUMBNAIL_CACHE",
                operation_type = "disk_write",
                key = %thumbnail.key,
                error = %e,
                "Could not write thumbnail to disk"
            );
            None
        }
    });

    Ok(ThumbnailHandle {
        key: thumbnail.key.clone(),
        path,
        bytes,
    })
}

pub struct ThumbnailCache {
    enabled: bool,
    memory: Cache<ThumbnailKey, ThumbnailHandle>,
    pending: AHashSet<ThumbnailKey>,
    store: Option<DiskStore>,
}

impl ThumbnailCache {
    #[must_use]
    pub fn new(enabled: bool, config: &ThumbnailConfig) -> Self {
        let memory = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_idle(config.time_to_idle)
            .build();

        Self {
            enabled,
            memory,
            pending: AHashSet::new(),
            store: config.cache_dir.as_ref().map(DiskStore::new),
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<ThumbnailHandle> {
        self.memory.get(key)
    }

    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.contains(key)
    }

    /// Resolved handle, pending ticket, or placeholder. Never blocks.
    #[instrument(level = "trace", skip_all)]
    pub fn get_or_fetch(
        &mut self,
        thumbnail: Option<&ThumbnailRef>,
        coordinator: &mut FetchCoordinator,
        database: &Arc<dyn EntityDatabase>,
    ) -> ThumbnailLookup {
        let Some(thumbnail) = thumbnail.filter(|_| self.enabled) else {
            return ThumbnailLookup::Placeholder;
        };

        if let Some(handle) = self.memory.get(&thumbnail.key) {
            return ThumbnailLookup::Ready(handle);
        }

        let database = database.clone();
        let store = self.store.clone();
        let job_ref = thumbnail.clone();
        let ticket = coordinator.submit(FetchKey::Thumbnail(thumbnail.key.clone()), move || -> FetchOutcome {
            load_thumbnail(database.as_ref(), store.as_ref(), &job_ref).map(FetchPayload::Thumbnail)
        });

        if !ticket.joined {
            debug!(
                marker = "THUMBNAIL_CACHE",
                operation_type = "thumbnail_miss",
                key = %thumbnail.key,
                "Thumbnail fetch submitted"
            );
        }
        self.pending.insert(thumbnail.key.clone());
        ThumbnailLookup::Pending(ticket)
    }

    /// Apply an accepted fetch result. Failures only clear the pending mark.
    pub fn complete(&mut self, key: &ThumbnailKey, outcome: &FetchOutcome) {
        self.pending.remove(key);
        if let Ok(FetchPayload::Thumbnail(handle)) = outcome {
            self.memory.insert(key.clone(), handle.clone());
        }
    }

    /// Forget pending marks (their fetches were cancelled).
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.memory.run_pending_tasks();
        self.memory.entry_count()
    }
}

impl fmt::Debug for ThumbnailCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThumbnailCache")
            .field("enabled", &self.enabled)
            .field("pending", &self.pending.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
