//! Knowledge operations exposed to the calling agent
//!
//! Every operation answers from the local store; writes nudge the sync
//! engine but never wait for it.

use anyhow::Context;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::board::{PostOutcome, ProblemBoard};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::matching::{ErrorSignature, Match, Query, RelevanceMatcher};
use crate::security::{identity_path, Identity};
use crate::store::{LocalStore, QueryFilters, StoreStats};
use crate::sync::{HttpRemote, SyncEngine, SyncReport, SyncStatus};
use crate::types::{EntryKind, KnowledgeEntry, ProblemRecord, ProblemSource, ProblemStatus};

/// Input to `memorize`
#[derive(Debug, Clone)]
pub struct MemorizeRequest {
    pub kind: EntryKind,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub category: String,
    /// Appended to the content as a fenced block
    pub code_example: Option<String>,
    /// Prior entry this one replaces
    pub supersedes: Option<String>,
    /// Problem this entry answers
    pub resolves_problem: Option<String>,
}

impl MemorizeRequest {
    pub fn new(kind: EntryKind, title: impl Into<String>, content: impl Into<String>, tags: Vec<String>, category: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            content: content.into(),
            tags,
            category: category.into(),
            code_example: None,
            supersedes: None,
            resolves_problem: None,
        }
    }
}

/// Input to `report_failure`
#[derive(Debug, Clone)]
pub enum FailureReport {
    Plain {
        title: String,
        content: String,
        tags: Vec<String>,
    },
    Structured {
        what_i_tried: String,
        why_it_failed: String,
        context: Option<String>,
        better_alternative: Option<String>,
        tags: Vec<String>,
    },
}

const FAILURE_TITLE_CHARS: usize = 80;

impl FailureReport {
    fn into_request(self) -> MemorizeRequest {
        let (title, content, mut tags) = match self {
            FailureReport::Plain { title, content, tags } => (title, content, tags),
            FailureReport::Structured { what_i_tried, why_it_failed, context, better_alternative, tags } => {
                let mut parts = vec![
                    "## What was tried".to_string(),
                    what_i_tried.clone(),
                    String::new(),
                    "## Why it failed".to_string(),
                    why_it_failed,
                ];
                if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
                    parts.extend(["".to_string(), "## Context".to_string(), context]);
                }
                if let Some(alternative) = better_alternative.filter(|a| !a.trim().is_empty()) {
                    parts.extend(["".to_string(), "## What worked instead".to_string(), alternative]);
                }
                let mut title: String = what_i_tried.chars().take(FAILURE_TITLE_CHARS).collect();
                if what_i_tried.chars().count() > FAILURE_TITLE_CHARS {
                    title.push_str("...");
                }
                (format!("Anti-pattern: {}", title), parts.join("\n"), tags)
            }
        };
        tags.extend(["failure".to_string(), "anti-pattern".to_string()]);
        MemorizeRequest::new(EntryKind::FailurePattern, title, content, tags, "anti-pattern")
    }
}

/// Result of `intercept`
#[derive(Debug, Clone, Serialize)]
pub struct Interception {
    pub signature: ErrorSignature,
    pub matches: Vec<Match>,
}

/// Result of `known_failures`
#[derive(Debug, Clone, Serialize)]
pub struct KnownFailures {
    pub matches: Vec<Match>,
    /// No failure pattern matched; these are related entries of any kind
    pub fallback: bool,
}

/// Result of `whats_trending`
#[derive(Debug, Clone, Serialize)]
pub struct Trending {
    pub entries: Vec<KnowledgeEntry>,
    pub open_problems: Vec<ProblemRecord>,
}

/// Combined health for `status`
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub instance_id: String,
    pub snapshot: String,
    pub store: StoreStats,
    pub sync: Option<SyncStatus>,
}

/// The agent-facing knowledge tools over one local store
pub struct Collective {
    store: Arc<LocalStore>,
    board: ProblemBoard,
    sync: Option<Arc<SyncEngine>>,
    default_limit: usize,
}

impl Collective {
    pub fn new(store: Arc<LocalStore>, board: ProblemBoard, sync: Option<Arc<SyncEngine>>) -> Self {
        let default_limit = store.matcher().config().default_limit.max(1);
        Self { store, board, sync, default_limit }
    }

    /// Assemble identity, store, remote client and sync engine from configuration
    pub fn from_config(config: &Config, config_dir: &Path) -> anyhow::Result<Self> {
        let identity_file = identity_path(config_dir);
        let identity = Identity::load_or_create(&identity_file)
            .context("Failed to create instance identity")?;
        let instance_id = std::env::var("COLLECTIVE_INSTANCE_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| identity.instance_id.clone());

        let snapshot = config.snapshot_path()?;
        let store = Arc::new(
            LocalStore::open(&snapshot, instance_id.clone(), RelevanceMatcher::new(config.matcher.clone()))
                .with_context(|| format!("Failed to open knowledge store {}", snapshot.display()))?,
        );

        let api_key = identity.resolve_api_key().map(|(key, source)| {
            debug!("Using API key from {:?}", source);
            key
        });
        let remote = HttpRemote::new(
            &config.sync.base_url,
            instance_id,
            api_key.clone(),
            Duration::from_secs(config.sync.request_timeout_secs.max(1)),
        )
        .context("Failed to build HTTP client")?;

        let engine = SyncEngine::new(store.clone(), Arc::new(remote), config.sync.clone(), api_key.is_some())
            .on_register(move |registration| {
                let mut identity = Identity::load_or_create(&identity_file)?;
                identity.set_api_key(&identity_file, &registration.api_key)
            });

        let board = ProblemBoard::new(store.clone(), config.board.clone());
        Ok(Self::new(store, board, Some(Arc::new(engine))))
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn board(&self) -> &ProblemBoard {
        &self.board
    }

    pub fn sync_engine(&self) -> Option<&Arc<SyncEngine>> {
        self.sync.as_ref()
    }

    fn limit(&self, limit: Option<usize>) -> usize {
        limit.filter(|l| *l > 0).unwrap_or(self.default_limit)
    }

    /// Count returned entries as consumed; failure to persist the count is not fatal
    fn consume(&self, mut matches: Vec<Match>, limit: usize) -> Vec<Match> {
        matches.truncate(limit);
        let ids: Vec<String> = matches.iter().map(|m| m.entry.id.clone()).collect();
        if let Err(e) = self.store.record_usage(&ids) {
            warn!("Could not record usage: {}", e);
        }
        for m in &mut matches {
            m.entry.usage_count += 1;
        }
        matches
    }

    fn enqueue_sync(&self) {
        if let Some(engine) = &self.sync {
            engine.notify();
        }
    }

    /// Parse error text and rank knowledge against its signature
    pub fn intercept(&self, error_text: &str, context: Option<&str>, limit: Option<usize>) -> Interception {
        let signature = ErrorSignature::parse_with_context(error_text, context);
        let matches = self.store.query(&Query::Signature(signature.clone()), &QueryFilters::default());
        Interception {
            matches: self.consume(matches, self.limit(limit)),
            signature,
        }
    }

    pub fn recall(&self, query: &str, filters: &QueryFilters, limit: Option<usize>) -> Vec<Match> {
        let matches = self.store.query(&Query::from(query), filters);
        self.consume(matches, self.limit(limit))
    }

    /// Store a new entry; resolves the linked problem when one is given.
    ///
    /// An unknown or already resolved problem is rejected before anything is
    /// stored. Once the entry is stored only a storage failure is reported.
    pub fn memorize(&self, request: MemorizeRequest) -> Result<String> {
        if let Some(problem_id) = &request.resolves_problem {
            let problem = self.store.get_problem(problem_id)?;
            if problem.status == ProblemStatus::Resolved {
                return Err(Error::InvalidInput(format!("problem {} is already resolved", problem_id)));
            }
        }

        let mut content = request.content;
        if let Some(code) = request.code_example.filter(|c| !c.trim().is_empty()) {
            content.push_str(&format!("\n\n## Code\n```\n{}\n```", code.trim_end()));
        }
        let mut entry = KnowledgeEntry::draft(request.kind, request.title, content, &request.tags, request.category);
        entry.supersedes = request.supersedes;

        let id = self.store.put(entry)?;
        info!("Memorized {} entry {}", request.kind, id);
        self.enqueue_sync();
        if let Some(problem_id) = request.resolves_problem {
            match self.board.resolve(&problem_id, &id) {
                Ok(_) => {}
                Err(e @ Error::Storage { .. }) => return Err(e),
                Err(e) => warn!("Stored {} but could not resolve problem {}: {}", id, problem_id, e),
            }
        }
        Ok(id)
    }

    pub fn report_failure(&self, report: FailureReport) -> Result<String> {
        self.memorize(report.into_request())
    }

    /// Failure patterns for a query, or related knowledge of any kind when none match
    pub fn known_failures(&self, query: &str, limit: Option<usize>) -> KnownFailures {
        let limit = self.limit(limit);
        let failures = self.store.query(&Query::from(query), &QueryFilters::kind(EntryKind::FailurePattern));
        if !failures.is_empty() {
            return KnownFailures { matches: self.consume(failures, limit), fallback: false };
        }
        let related = self.store.query(&Query::from(query), &QueryFilters::default());
        KnownFailures { matches: self.consume(related, limit.min(3)), fallback: true }
    }

    /// Existing matches when knowledge already covers the problem, otherwise a new problem id
    pub fn ask_community(&self, problem_text: &str, tags: &[String]) -> Result<PostOutcome> {
        let problem = ProblemRecord::new(ProblemSource::AgentPosted, None, problem_text, tags);
        let outcome = self.board.post(problem)?;
        if let PostOutcome::Posted(_) = &outcome {
            self.enqueue_sync();
        }
        Ok(outcome)
    }

    /// Recent collective entries by recency then usage, plus open problems
    pub fn whats_trending(&self, limit: Option<usize>) -> Trending {
        let limit = self.limit(limit);
        let visible: Vec<KnowledgeEntry> = self.store.list_entries()
            .into_iter()
            .filter(|e| e.is_visible())
            .collect();
        let collective: Vec<KnowledgeEntry> = visible.iter().filter(|e| !e.origin.is_local()).cloned().collect();
        let mut entries = if collective.is_empty() { visible } else { collective };
        entries.sort_by(|a, b| {
            b.updated_at.cmp(&a.updated_at)
                .then_with(|| b.usage_count.cmp(&a.usage_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        entries.truncate(limit);

        let mut open_problems = self.board.open_problems();
        open_problems.reverse();
        open_problems.truncate(limit);
        Trending { entries, open_problems }
    }

    /// Point-in-time listing of every entry
    pub fn knowledge_snapshot(&self) -> Vec<KnowledgeEntry> {
        self.store.list_entries()
    }

    /// Point-in-time listing of the problem board
    pub fn problem_snapshot(&self) -> Vec<ProblemRecord> {
        self.board.list()
    }

    pub async fn status(&self) -> Status {
        let sync = match &self.sync {
            Some(engine) => Some(engine.status().await),
            None => None,
        };
        Status {
            instance_id: self.store.instance_id().to_string(),
            snapshot: self.store.path().display().to_string(),
            store: self.store.stats(),
            sync,
        }
    }

    /// Explicit sync pass
    pub async fn sync_now(&self) -> Result<SyncReport> {
        match &self.sync {
            Some(engine) => engine.sync_now().await,
            None => Err(Error::InvalidInput("sync is not configured".into())),
        }
    }

    /// Persist anything an earlier failed write left in memory
    pub fn shutdown(&self) -> Result<()> {
        self.store.flush()
    }
}
