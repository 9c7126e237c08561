//! On-disk snapshot format
//!
//! One JSON document holds every entry, problem, id alias and the sync
//! cursor. Writes go to a temporary file in the same directory which is
//! then renamed over the old snapshot, so a crash mid-write leaves the
//! previous snapshot intact.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{normalize_tags, EntryKind, KnowledgeEntry, Origin, ProblemRecord, SyncState};

/// Current schema version
pub const SNAPSHOT_VERSION: u32 = 2;

/// Opaque checkpoint returned by the remote; marks the last applied pull batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub String);

impl std::fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the store persists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub entries: Vec<KnowledgeEntry>,
    #[serde(default)]
    pub problems: Vec<ProblemRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SyncCursor>,
    /// Retired local id -> authoritative id
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries: Vec::new(),
            problems: Vec::new(),
            cursor: None,
            aliases: BTreeMap::new(),
        }
    }
}

/// Legacy v1 layout: a bare array of loosely typed entries
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    #[serde(default)]
    local_id: Option<u64>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

/// Load a snapshot, upgrading older layouts. `Ok(None)` when the file does not exist.
pub fn load(path: &Path, instance_id: &str) -> Result<Option<Snapshot>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Storage { path: path.to_path_buf(), source: e }),
    };

    let corrupt = |reason: String| Error::CorruptSnapshot { path: path.to_path_buf(), reason };
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    if value.is_array() {
        let legacy: Vec<LegacyEntry> = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
        info!("Upgrading legacy snapshot with {} entries", legacy.len());
        return Ok(Some(upgrade_v1(legacy, instance_id)));
    }

    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if version > SNAPSHOT_VERSION {
        return Err(Error::UnsupportedVersion { found: version, supported: SNAPSHOT_VERSION });
    }
    let mut snapshot: Snapshot = serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))?;
    snapshot.version = SNAPSHOT_VERSION;
    Ok(Some(snapshot))
}

fn upgrade_v1(legacy: Vec<LegacyEntry>, instance_id: &str) -> Snapshot {
    let now = Utc::now();
    let entries = legacy.into_iter()
        .enumerate()
        .map(|(i, old)| {
            let tags = normalize_tags(&old.tags);
            let category = old.category.unwrap_or_else(|| "general".to_string()).to_lowercase();
            let kind = if tags.contains("failure") || tags.contains("anti-pattern") || category == "anti-pattern" {
                EntryKind::FailurePattern
            } else {
                EntryKind::Solution
            };
            KnowledgeEntry {
                id: format!("local-v1-{}", old.local_id.unwrap_or(i as u64 + 1)),
                kind,
                title: old.title,
                content: old.content,
                tags,
                category,
                origin: Origin::local(instance_id),
                created_at: now,
                updated_at: now,
                usage_count: 0,
                sync_state: SyncState::LocalOnly,
                supersedes: None,
                superseded_by: None,
            }
        })
        .collect();

    Snapshot { entries, ..Snapshot::default() }
}

#[cfg(test)]
thread_local! {
    static FAIL_BEFORE_RENAME: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make persists on this thread fail after the temporary file is written
#[cfg(test)]
pub(crate) fn fail_before_rename(fail: bool) {
    FAIL_BEFORE_RENAME.with(|f| f.set(fail));
}

/// Atomically replace the snapshot at `path`
pub fn persist(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let storage = |source: std::io::Error| Error::Storage { path: path.to_path_buf(), source };

    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| storage(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(storage)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".snapshot-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(storage)?;
    tmp.write_all(&bytes).map_err(storage)?;
    tmp.as_file().sync_all().map_err(storage)?;
    #[cfg(test)]
    {
        if FAIL_BEFORE_RENAME.with(|f| f.get()) {
            return Err(storage(std::io::Error::other("write interrupted before rename")));
        }
    }
    tmp.persist(path).map_err(|e| storage(e.error))?;

    #[cfg(unix)]
    {
        // Make the rename itself durable
        if let Ok(dir) = std::fs::File::open(dir) {
            let _ = dir.sync_all();
        }
    }

    debug!("Persisted snapshot ({} bytes) to {}", bytes.len(), path.display());
    Ok(())
}
