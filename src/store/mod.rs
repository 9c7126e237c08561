//! Local knowledge store
//!
//! The only writer of on-disk knowledge state for this instance. Loaded once
//! from the snapshot into an in-memory index; every mutation builds the next
//! index on a copy, persists it atomically and then swaps it in, so readers
//! never observe a half-applied write and never wait on disk I/O.

pub mod index;
pub mod snapshot;

pub use index::QueryFilters;
pub use snapshot::{Snapshot, SyncCursor, SNAPSHOT_VERSION};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SyncError};
use crate::matching::{Match, Query, RelevanceMatcher};
use crate::types::{
    new_local_id, normalize_tags, KnowledgeEntry, Origin, ProblemRecord, ProblemStatus, SyncState,
};
use index::StoreState;

/// What `merge_remote` did with an incoming entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New to this store, inserted as collective knowledge
    Inserted(String),
    /// An unsynced local entry with the same content adopted the remote id
    Unified { local_id: String, remote_id: String },
    /// Same entry, metadata refreshed
    Updated(String),
    /// Already up to date
    Unchanged(String),
    /// Same content under two synced ids; the older one was retained as conflicted
    Conflict { winner: String, loser: String },
}

/// Result of inserting a problem record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProblemInsert {
    Inserted(String),
    Duplicate(String),
}

/// Counts reported by `status`
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub entries: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_sync_state: BTreeMap<String, usize>,
    pub problems: usize,
    pub open_problems: usize,
    pub aliases: usize,
    pub cursor: Option<String>,
    /// An in-memory change has not reached disk yet
    pub dirty: bool,
}

struct Writer {
    dirty: bool,
}

/// Durable, crash-safe container of entries and problems
pub struct LocalStore {
    path: PathBuf,
    instance_id: String,
    matcher: RelevanceMatcher,
    state: RwLock<Arc<StoreState>>,
    writer: Mutex<Writer>,
}

impl LocalStore {
    /// Load the snapshot at `path`, or start empty if there is none
    pub fn open(path: impl Into<PathBuf>, instance_id: impl Into<String>, matcher: RelevanceMatcher) -> Result<Self> {
        let path = path.into();
        let instance_id = instance_id.into();
        let state = match snapshot::load(&path, &instance_id)? {
            Some(snapshot) => {
                let state = StoreState::from_snapshot(snapshot);
                info!("Loaded {} knowledge entries from {}", state.len(), path.display());
                state
            }
            None => {
                debug!("No snapshot at {}, starting empty", path.display());
                StoreState::default()
            }
        };
        Ok(Self {
            path,
            instance_id,
            matcher,
            state: RwLock::new(Arc::new(state)),
            writer: Mutex::new(Writer { dirty: false }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn matcher(&self) -> &RelevanceMatcher {
        &self.matcher
    }

    /// Last consistent index; the read lock is held only to clone the Arc
    fn current(&self) -> Arc<StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run one serialized mutation: copy, apply, persist, swap.
    ///
    /// `f` returns the value plus whether anything changed. A failed persist
    /// still publishes the change in memory and marks the store dirty; a
    /// no-op on a dirty store writes the pending state before returning.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<(T, bool)>) -> Result<T> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        let (value, changed) = f(&mut next)?;
        if !changed {
            if writer.dirty {
                self.persist_with_retry(&self.current().to_snapshot())?;
                writer.dirty = false;
                info!("Wrote pending changes to {}", self.path.display());
            }
            return Ok(value);
        }

        let persisted = self.persist_with_retry(&next.to_snapshot());
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        match persisted {
            Ok(()) => {
                writer.dirty = false;
                Ok(value)
            }
            Err(e) => {
                writer.dirty = true;
                Err(e)
            }
        }
    }

    fn persist_with_retry(&self, snapshot: &Snapshot) -> Result<()> {
        match snapshot::persist(&self.path, snapshot) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Snapshot write failed, retrying once: {}", e);
                snapshot::persist(&self.path, snapshot).inspect_err(|e| {
                    warn!("Snapshot write failed again, keeping change in memory: {}", e);
                })
            }
        }
    }

    /// Store a new local entry and return its id.
    ///
    /// Content identical to an existing entry returns that entry's id instead.
    pub fn put(&self, mut entry: KnowledgeEntry) -> Result<String> {
        if entry.title.trim().is_empty() {
            return Err(Error::InvalidInput("title must not be empty".into()));
        }
        entry.tags = normalize_tags(&entry.tags);
        entry.category = entry.category.trim().to_lowercase();

        self.mutate(|state| {
            if let Some(prior) = entry.supersedes.take() {
                let resolved = state.entry(&prior)
                    .map(|e| e.id.clone())
                    .ok_or_else(|| Error::NotFound(format!("superseded entry {}", prior)))?;
                entry.supersedes = Some(resolved);
            }

            let hash = entry.content_hash();
            if let Some(existing) = state.ids_with_hash(&hash).into_iter()
                .find(|id| state.entry(id).is_some_and(|e| e.is_visible()))
            {
                debug!("Entry already stored as {}", existing);
                return Ok((existing, false));
            }

            if entry.id.is_empty() {
                entry.id = new_local_id();
            } else if state.entry(&entry.id).is_some() {
                return Err(Error::InvalidInput(format!("entry id {} already exists", entry.id)));
            }

            let now = Utc::now();
            entry.created_at = now;
            entry.updated_at = now;
            entry.origin = Origin::local(self.instance_id.clone());
            entry.sync_state = SyncState::LocalOnly;
            entry.superseded_by = None;
            entry.usage_count = 0;

            let id = entry.id.clone();
            state.insert_entry(entry);
            Ok((id, true))
        })
    }

    /// Look up an entry by id or by a retired local id
    pub fn get(&self, id: &str) -> Result<KnowledgeEntry> {
        self.current()
            .entry(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("entry {}", id)))
    }

    /// Rank visible entries that pass `filters`
    pub fn query(&self, query: &Query, filters: &QueryFilters) -> Vec<Match> {
        let pool = self.current().candidates(filters);
        self.matcher.rank(query, &pool)
    }

    /// Every entry, including superseded and conflicted ones, in id order
    pub fn list_entries(&self) -> Vec<KnowledgeEntry> {
        let mut entries: Vec<KnowledgeEntry> = self.current().entries().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Entries still waiting to reach the remote, oldest first
    pub fn entries_needing_push(&self) -> Vec<KnowledgeEntry> {
        let mut entries: Vec<KnowledgeEntry> = self.current().entries()
            .filter(|e| e.sync_state.needs_push())
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    /// Record that these entries were returned to and consumed by a caller
    pub fn record_usage(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.mutate(|state| {
            let mut changed = false;
            for id in ids {
                changed |= state.update_entry(id, |e| e.usage_count += 1);
            }
            Ok(((), changed))
        })
    }

    /// Move `local_only` entries to `pending` after a failed push
    pub fn mark_pending(&self, ids: &[String]) -> Result<()> {
        self.mutate(|state| {
            let mut changed = false;
            for id in ids {
                state.update_entry(id, |e| {
                    if e.sync_state == SyncState::LocalOnly {
                        e.sync_state = SyncState::Pending;
                        changed = true;
                    }
                });
            }
            Ok(((), changed))
        })
    }

    /// Confirm an entry reached the remote, adopting the remote id.
    ///
    /// Returns the id the entry is stored under afterwards.
    pub fn mark_synced(&self, id: &str, remote_id: &str, server_timestamp: DateTime<Utc>) -> Result<String> {
        self.mutate(|state| {
            let local = state.entry(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("entry {}", id)))?;

            if local.id != remote_id {
                if let Some(pulled) = state.entry(remote_id) {
                    // Already pulled under the remote id: fold the local copy into it
                    if pulled.content_hash() != local.content_hash() {
                        return Err(SyncError::Protocol(format!(
                            "remote id {} already names different content", remote_id
                        )).into());
                    }
                    // A conflicted copy is hidden, so fold into the copy that won
                    let existing = state.conflict_winner(remote_id)
                        .cloned()
                        .unwrap_or_else(|| pulled.clone());
                    state.remove_entry(&local.id);
                    state.redirect(&local.id, &existing.id);
                    state.update_entry(&existing.id, |e| e.usage_count = e.usage_count.max(local.usage_count));
                    info!("Folded local entry {} into {}", local.id, existing.id);
                    return Ok((existing.id, true));
                }
                state.rekey(&local.id, remote_id);
            }

            state.update_entry(remote_id, |e| {
                e.sync_state = SyncState::Synced;
                e.updated_at = server_timestamp;
            });
            debug!("Entry {} synced as {}", local.id, remote_id);
            Ok((remote_id.to_string(), true))
        })
    }

    /// Apply one entry pulled from the remote
    pub fn merge_remote(&self, mut incoming: KnowledgeEntry) -> Result<MergeOutcome> {
        if incoming.id.is_empty() {
            return Err(SyncError::Protocol("remote entry without id".into()).into());
        }
        incoming.tags = normalize_tags(&incoming.tags);
        incoming.sync_state = SyncState::Synced;
        incoming.superseded_by = None;
        incoming.origin = if incoming.origin.instance_id == self.instance_id {
            Origin::local(self.instance_id.clone())
        } else {
            Origin::collective(incoming.origin.instance_id.clone())
        };
        let hash = incoming.content_hash();

        self.mutate(|state| {
            // Known under this id already
            if let Some(existing) = state.entry(&incoming.id).cloned() {
                if existing.content_hash() != hash {
                    warn!("Remote entry {} changed content; entries are append-only, keeping local copy", existing.id);
                    return Ok((MergeOutcome::Unchanged(existing.id), false));
                }
                let refresh = incoming.updated_at > existing.updated_at
                    || existing.sync_state.needs_push()
                    || incoming.usage_count > existing.usage_count;
                if !refresh {
                    return Ok((MergeOutcome::Unchanged(existing.id), false));
                }
                let newer = incoming.updated_at >= existing.updated_at;
                state.update_entry(&existing.id, |e| {
                    if newer {
                        e.category = incoming.category.clone();
                        e.updated_at = incoming.updated_at;
                        e.supersedes = incoming.supersedes.clone().or(e.supersedes.take());
                    }
                    e.usage_count = e.usage_count.max(incoming.usage_count);
                    if e.sync_state != SyncState::Conflicted {
                        e.sync_state = SyncState::Synced;
                    }
                });
                return Ok((MergeOutcome::Updated(existing.id), true));
            }

            let twins: Vec<KnowledgeEntry> = state.ids_with_hash(&hash).iter()
                .filter_map(|id| state.entry(id).cloned())
                .filter(|e| e.is_visible())
                .collect();

            // Unsynced local copy of the same content: adopt the remote identity
            if let Some(local) = twins.iter().find(|e| e.sync_state.needs_push()) {
                let remote_id = incoming.id.clone();
                let mut unified = incoming.clone();
                unified.usage_count = local.usage_count;
                unified.created_at = local.created_at.min(incoming.created_at);
                unified.supersedes = incoming.supersedes.clone().or_else(|| local.supersedes.clone());
                state.remove_entry(&local.id);
                state.insert_entry(unified);
                state.redirect(&local.id, &remote_id);
                info!("Unified local entry {} with remote {}", local.id, remote_id);
                return Ok((MergeOutcome::Unified { local_id: local.id.clone(), remote_id }, true));
            }

            // Same content already synced under another id: last writer wins
            if let Some(rival) = twins.first() {
                let remote_wins = match incoming.updated_at.cmp(&rival.updated_at) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => incoming.id < rival.id,
                };
                let (winner, loser) = if remote_wins {
                    state.update_entry(&rival.id, |e| {
                        e.sync_state = SyncState::Conflicted;
                        e.superseded_by = Some(incoming.id.clone());
                    });
                    state.insert_entry(incoming.clone());
                    (incoming.id.clone(), rival.id.clone())
                } else {
                    let mut retained = incoming.clone();
                    retained.sync_state = SyncState::Conflicted;
                    retained.superseded_by = Some(rival.id.clone());
                    state.insert_entry(retained);
                    (rival.id.clone(), incoming.id.clone())
                };
                info!("Conflict detected on content {}: {} wins over {}", &hash[..12], winner, loser);
                return Ok((MergeOutcome::Conflict { winner, loser }, true));
            }

            let id = incoming.id.clone();
            state.insert_entry(incoming);
            Ok((MergeOutcome::Inserted(id), true))
        })
    }

    pub fn cursor(&self) -> Option<SyncCursor> {
        self.current().cursor.clone()
    }

    /// Advance the pull checkpoint
    pub fn set_cursor(&self, cursor: SyncCursor) -> Result<()> {
        self.mutate(|state| {
            let changed = state.cursor.as_ref() != Some(&cursor);
            state.cursor = Some(cursor);
            Ok(((), changed))
        })
    }

    /// Insert a problem unless one with the same dedup key exists
    pub fn insert_problem(&self, mut problem: ProblemRecord) -> Result<ProblemInsert> {
        if problem.text.trim().is_empty() {
            return Err(Error::InvalidInput("problem text must not be empty".into()));
        }
        self.mutate(|state| {
            let text_key = crate::types::ProblemKey::Text(crate::types::text_hash(&problem.text));
            let existing = state.problem_by_key(&problem.dedup_key())
                .or_else(|| state.problem_by_key(&text_key));
            if let Some(existing) = existing {
                return Ok((ProblemInsert::Duplicate(existing.id.clone()), false));
            }
            if problem.id.is_empty() {
                problem.id = format!("problem-{}", uuid::Uuid::new_v4());
            }
            let id = problem.id.clone();
            state.insert_problem(problem);
            Ok((ProblemInsert::Inserted(id), true))
        })
    }

    /// Apply a checked change to one problem
    pub fn update_problem(
        &self,
        id: &str,
        f: impl FnOnce(&mut ProblemRecord) -> Result<()>,
    ) -> Result<ProblemRecord> {
        self.mutate(|state| {
            let problem = state.problem_mut(id)
                .ok_or_else(|| Error::NotFound(format!("problem {}", id)))?;
            f(problem)?;
            Ok((problem.clone(), true))
        })
    }

    pub fn get_problem(&self, id: &str) -> Result<ProblemRecord> {
        self.current()
            .problem(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("problem {}", id)))
    }

    /// Every problem, oldest first
    pub fn list_problems(&self) -> Vec<ProblemRecord> {
        let mut problems: Vec<ProblemRecord> = self.current().problems().cloned().collect();
        problems.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        problems
    }

    /// Problems never acknowledged by the remote
    pub fn problems_needing_push(&self) -> Vec<ProblemRecord> {
        self.list_problems().into_iter().filter(|p| p.remote_id.is_none()).collect()
    }

    pub fn mark_problem_synced(&self, id: &str, remote_id: &str) -> Result<()> {
        self.update_problem(id, |p| {
            p.remote_id = Some(remote_id.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    /// Write the current index if an earlier persist failed
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if !writer.dirty {
            return Ok(());
        }
        self.persist_with_retry(&self.current().to_snapshot())?;
        writer.dirty = false;
        info!("Flushed knowledge store to {}", self.path.display());
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.current();
        let mut by_kind = BTreeMap::new();
        let mut by_sync_state = BTreeMap::new();
        for entry in state.entries() {
            *by_kind.entry(entry.kind.to_string()).or_insert(0) += 1;
            *by_sync_state.entry(entry.sync_state.to_string()).or_insert(0) += 1;
        }
        let problems: Vec<&ProblemRecord> = state.problems().collect();
        let dirty = self.writer.lock().map(|w| w.dirty).unwrap_or(true);
        StoreStats {
            entries: state.len(),
            by_kind,
            by_sync_state,
            problems: problems.len(),
            open_problems: problems.iter().filter(|p| p.status == ProblemStatus::Open).count(),
            aliases: state.aliases.len(),
            cursor: state.cursor.as_ref().map(|c| c.0.clone()),
            dirty,
        }
    }
}
