//! In-process collective store
//!
//! Holds entries in memory with the same content-hash dedup the real
//! remote applies. Lets several local stores sync against one shared
//! remote without a network, and can be switched offline.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::remote::{PullBatch, PushAck, Registration, RemoteStore};
use crate::error::SyncError;
use crate::store::SyncCursor;
use crate::types::{text_hash, KnowledgeEntry, ProblemRecord, SyncState};

#[derive(Default)]
struct Shared {
    /// Append-only change log; a cursor is an offset into it
    entries: Vec<KnowledgeEntry>,
    by_hash: HashMap<String, usize>,
    problems: Vec<(String, ProblemRecord)>,
    problems_by_text: HashMap<String, String>,
}

#[derive(Default)]
pub struct LoopbackRemote {
    shared: Mutex<Shared>,
    offline: AtomicBool,
    push_calls: AtomicUsize,
}

impl LoopbackRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call with a network error while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<KnowledgeEntry> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner).entries.clone()
    }

    pub fn problems(&self) -> Vec<ProblemRecord> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
            .problems.iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), SyncError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Network("loopback remote is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for LoopbackRemote {
    async fn register_instance(&self, instance_id: &str) -> Result<Registration, SyncError> {
        self.check_online()?;
        Ok(Registration {
            instance_id: instance_id.to_string(),
            api_key: format!("loopback-{}", instance_id),
        })
    }

    async fn push_entries(&self, entries: &[KnowledgeEntry]) -> Result<Vec<PushAck>, SyncError> {
        self.check_online()?;
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);

        let mut acks = Vec::with_capacity(entries.len());
        for entry in entries {
            let hash = entry.content_hash();
            if let Some(&index) = shared.by_hash.get(&hash) {
                let existing = &shared.entries[index];
                acks.push(PushAck {
                    local_id: entry.id.clone(),
                    remote_id: existing.id.clone(),
                    server_timestamp: existing.updated_at,
                });
                continue;
            }

            let now = Utc::now();
            let mut stored = entry.clone();
            stored.id = format!("remote-{}", shared.entries.len() + 1);
            stored.updated_at = now;
            stored.sync_state = SyncState::Synced;
            stored.superseded_by = None;
            acks.push(PushAck {
                local_id: entry.id.clone(),
                remote_id: stored.id.clone(),
                server_timestamp: now,
            });
            let index = shared.entries.len();
            shared.by_hash.insert(hash, index);
            shared.entries.push(stored);
        }
        Ok(acks)
    }

    async fn pull_entries(&self, since: Option<SyncCursor>, limit: usize) -> Result<PullBatch, SyncError> {
        self.check_online()?;
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let start = match since {
            Some(cursor) => cursor.0.parse::<usize>()
                .map_err(|_| SyncError::Protocol(format!("unknown cursor {}", cursor)))?,
            None => 0,
        };
        let start = start.min(shared.entries.len());
        let end = (start + limit.max(1)).min(shared.entries.len());
        Ok(PullBatch {
            entries: shared.entries[start..end].to_vec(),
            next_cursor: Some(SyncCursor(end.to_string())),
            has_more: end < shared.entries.len(),
        })
    }

    async fn post_problem(&self, problem: &ProblemRecord) -> Result<String, SyncError> {
        self.check_online()?;
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let key = text_hash(&problem.text);
        if let Some(id) = shared.problems_by_text.get(&key) {
            return Ok(id.clone());
        }
        let id = format!("remote-problem-{}", shared.problems.len() + 1);
        shared.problems_by_text.insert(key, id.clone());
        shared.problems.push((id.clone(), problem.clone()));
        Ok(id)
    }
}
