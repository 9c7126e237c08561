//! Abstract collective store
//!
//! The sync engine talks to the remote only through [`RemoteStore`], so the
//! HTTP client, the in-process loopback and test mocks are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::store::SyncCursor;
use crate::types::{KnowledgeEntry, ProblemRecord};

/// Credentials issued by `register_instance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub instance_id: String,
    pub api_key: String,
}

/// Remote acknowledgement for one pushed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub local_id: String,
    pub remote_id: String,
    pub server_timestamp: DateTime<Utc>,
}

/// One page of entries changed after a cursor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PullBatch {
    pub entries: Vec<KnowledgeEntry>,
    /// Cursor to resume from once every entry of this page is applied
    pub next_cursor: Option<SyncCursor>,
    #[serde(default)]
    pub has_more: bool,
}

/// Operations of the collective store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Obtain an API key for this instance
    async fn register_instance(&self, instance_id: &str) -> Result<Registration, SyncError>;

    /// Send a batch; entries whose content the remote already holds are
    /// acknowledged with the existing remote id
    async fn push_entries(&self, entries: &[KnowledgeEntry]) -> Result<Vec<PushAck>, SyncError>;

    /// Entries created or updated after `since`
    async fn pull_entries(&self, since: Option<SyncCursor>, limit: usize) -> Result<PullBatch, SyncError>;

    /// Publish a problem and return its remote id
    async fn post_problem(&self, problem: &ProblemRecord) -> Result<String, SyncError>;

    /// Install an API key obtained after construction
    fn set_api_key(&self, _api_key: &str) {}
}
