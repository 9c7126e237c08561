//! Shared record types
//!
//! Knowledge entries and problem records, plus the closed variant sets
//! used for their kind, origin, sync state, source and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::matching::text::normalize_text;

/// What a knowledge entry captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Solution,
    FailurePattern,
    Gotcha,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Solution => "solution",
            EntryKind::FailurePattern => "failure_pattern",
            EntryKind::Gotcha => "gotcha",
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "solution" => Ok(EntryKind::Solution),
            "failure_pattern" | "failure" | "anti_pattern" => Ok(EntryKind::FailurePattern),
            "gotcha" => Ok(EntryKind::Gotcha),
            other => Err(crate::error::Error::InvalidInput(format!("unknown entry kind '{}'", other))),
        }
    }
}

/// Whether an entry was authored here or learned from the collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginScope {
    Local,
    Collective,
}

/// Where an entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub scope: OriginScope,
    pub instance_id: String,
}

impl Origin {
    pub fn local(instance_id: impl Into<String>) -> Self {
        Self { scope: OriginScope::Local, instance_id: instance_id.into() }
    }

    pub fn collective(instance_id: impl Into<String>) -> Self {
        Self { scope: OriginScope::Collective, instance_id: instance_id.into() }
    }

    pub fn is_local(&self) -> bool {
        self.scope == OriginScope::Local
    }
}

/// Replication state of an entry relative to the collective store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    LocalOnly,
    Pending,
    Synced,
    Conflicted,
}

impl SyncState {
    /// Entries in these states still need to reach the remote
    pub fn needs_push(&self) -> bool {
        matches!(self, SyncState::LocalOnly | SyncState::Pending)
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::LocalOnly => write!(f, "local_only"),
            SyncState::Pending => write!(f, "pending"),
            SyncState::Synced => write!(f, "synced"),
            SyncState::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// A single persisted lesson learned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    /// Local id until the first successful sync, then the remote id
    pub id: String,
    pub kind: EntryKind,
    pub title: String,
    pub content: String,
    /// Normalized lowercase tags
    pub tags: BTreeSet<String>,
    pub category: String,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage_count: u64,
    pub sync_state: SyncState,
    /// Prior version this entry replaces
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<String>,
    /// Set on conflict losers: the entry that won the merge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl KnowledgeEntry {
    /// An entry not yet stored: no id, local origin, timestamps filled by the store
    pub fn draft(
        kind: EntryKind,
        title: impl Into<String>,
        content: impl Into<String>,
        tags: impl IntoIterator<Item = impl AsRef<str>>,
        category: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind,
            title: title.into(),
            content: content.into(),
            tags: normalize_tags(tags),
            category: category.into().trim().to_lowercase(),
            origin: Origin::local(""),
            created_at: now,
            updated_at: now,
            usage_count: 0,
            sync_state: SyncState::LocalOnly,
            supersedes: None,
            superseded_by: None,
        }
    }

    /// Merge key across instances: hash of kind, title, content and tags
    pub fn content_hash(&self) -> String {
        content_hash(self.kind, &self.title, &self.content, &self.tags)
    }

    /// Whether ranked results should show this entry
    pub fn is_visible(&self) -> bool {
        self.sync_state != SyncState::Conflicted && self.superseded_by.is_none()
    }
}

/// Hash of the immutable content fields of an entry
pub fn content_hash(kind: EntryKind, title: &str, content: &str, tags: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(title.trim().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.trim().as_bytes());
    for tag in tags {
        hasher.update([0u8]);
        hasher.update(tag.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Lowercase, trim and deduplicate tags, dropping empty ones
pub fn normalize_tags(tags: impl IntoIterator<Item = impl AsRef<str>>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Generate an id for an entry that has never been synced
pub fn new_local_id() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

/// Where an unsolved problem was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemSource {
    StackOverflow,
    Reddit,
    GitHub,
    AgentPosted,
}

impl std::fmt::Display for ProblemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProblemSource::StackOverflow => write!(f, "stackoverflow"),
            ProblemSource::Reddit => write!(f, "reddit"),
            ProblemSource::GitHub => write!(f, "github"),
            ProblemSource::AgentPosted => write!(f, "agent_posted"),
        }
    }
}

/// Problem lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemStatus {
    Open,
    Claimed,
    Resolved,
}

impl std::fmt::Display for ProblemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProblemStatus::Open => write!(f, "open"),
            ProblemStatus::Claimed => write!(f, "claimed"),
            ProblemStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// An unsolved problem awaiting a knowledge entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemRecord {
    pub id: String,
    pub source: ProblemSource,
    /// Dedup key within a non-agent source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub text: String,
    pub tags: BTreeSet<String>,
    pub status: ProblemStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl ProblemRecord {
    pub fn new(
        source: ProblemSource,
        external_id: Option<String>,
        text: impl Into<String>,
        tags: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            id: String::new(),
            source,
            external_id,
            text: text.into(),
            tags: normalize_tags(tags),
            status: ProblemStatus::Open,
            created_at: Utc::now(),
            resolved_by: None,
            remote_id: None,
        }
    }

    /// Key that must be unique across the board
    pub fn dedup_key(&self) -> ProblemKey {
        match (&self.source, &self.external_id) {
            (ProblemSource::AgentPosted, _) | (_, None) => ProblemKey::Text(text_hash(&self.text)),
            (source, Some(external)) => ProblemKey::External(*source, external.clone()),
        }
    }
}

/// Board dedup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProblemKey {
    External(ProblemSource, String),
    Text(String),
}

/// Hash of lowercased, whitespace-collapsed text
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_text(text).as_bytes()))
}
