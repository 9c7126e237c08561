//! Sync engine - reconciles the local store with the collective store
//!
//! Pushes entries that have not reached the remote yet, pulls entries
//! changed since the stored cursor and merges them by content hash.
//! Runs on its own schedule with exponential backoff after failures;
//! tool calls never wait on it.

pub mod backoff;
pub mod http;
pub mod loopback;
pub mod remote;

pub use backoff::Backoff;
pub use http::HttpRemote;
pub use loopback::LoopbackRemote;
pub use remote::{PullBatch, PushAck, Registration, RemoteStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result, SyncError};
use crate::store::{LocalStore, MergeOutcome};

/// Sync configuration (`[sync]` in config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Collective store endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Seconds between regular sync passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Base backoff duration in seconds
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: u64,
    /// Maximum backoff duration in seconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Bound on every remote call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_push_batch")]
    pub push_batch_size: usize,
    #[serde(default = "default_pull_page")]
    pub pull_page_size: usize,
    /// Request an API key on first sync when none is configured
    #[serde(default = "default_enabled")]
    pub auto_register: bool,
}

fn default_enabled() -> bool { true }
fn default_base_url() -> String { "https://analyticalfire.com".to_string() }
fn default_interval() -> u64 { 300 }
fn default_base_backoff() -> u64 { 30 }
fn default_max_backoff() -> u64 { 3600 }
fn default_request_timeout() -> u64 { 15 }
fn default_push_batch() -> usize { 50 }
fn default_pull_page() -> usize { 100 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            base_url: default_base_url(),
            interval_secs: default_interval(),
            base_backoff_secs: default_base_backoff(),
            max_backoff_secs: default_max_backoff(),
            request_timeout_secs: default_request_timeout(),
            push_batch_size: default_push_batch(),
            pull_page_size: default_pull_page(),
            auto_register: default_enabled(),
        }
    }
}

/// What one sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub inserted: usize,
    pub unified: usize,
    pub conflicts: usize,
    pub problems_pushed: usize,
    /// Malformed remote entries dropped while pulling
    pub skipped: usize,
    /// Sync is turned off in config
    pub disabled: bool,
}

/// Engine health for `status`
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub anonymous: bool,
    pub consecutive_failures: u32,
    pub next_delay_secs: u64,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_report: Option<SyncReport>,
}

struct EngineState {
    backoff: Backoff,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
    last_report: Option<SyncReport>,
}

type RegisterHook = Box<dyn Fn(&Registration) -> anyhow::Result<()> + Send + Sync>;

/// Background reconciler between a [`LocalStore`] and a [`RemoteStore`]
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    request_timeout: Duration,
    has_api_key: AtomicBool,
    registration_attempted: AtomicBool,
    on_register: Option<RegisterHook>,
    state: Mutex<EngineState>,
    /// One pass at a time
    pass: Mutex<()>,
    wake: Notify,
}

impl SyncEngine {
    pub fn new(store: Arc<LocalStore>, remote: Arc<dyn RemoteStore>, config: SyncConfig, has_api_key: bool) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(config.base_backoff_secs),
            Duration::from_secs(config.max_backoff_secs),
        );
        Self {
            store,
            remote,
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            config,
            has_api_key: AtomicBool::new(has_api_key),
            registration_attempted: AtomicBool::new(false),
            on_register: None,
            state: Mutex::new(EngineState {
                backoff,
                last_error: None,
                last_success: None,
                last_report: None,
            }),
            pass: Mutex::new(()),
            wake: Notify::new(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Called with fresh credentials after a successful registration
    pub fn on_register(mut self, hook: impl Fn(&Registration) -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.on_register = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Ask the background loop for an early pass after a local write
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    async fn bounded<T>(&self, call: impl Future<Output = std::result::Result<T, SyncError>>) -> std::result::Result<T, SyncError> {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.request_timeout)),
        }
    }

    /// Push pending entries only
    pub async fn push(&self) -> Result<usize> {
        let _pass = self.pass.lock().await;
        let mut report = SyncReport::default();
        self.push_entries(&mut report).await?;
        Ok(report.pushed)
    }

    /// Pull and merge remote changes only
    pub async fn pull(&self) -> Result<usize> {
        let _pass = self.pass.lock().await;
        let mut report = SyncReport::default();
        self.pull_entries(&mut report).await?;
        Ok(report.pulled)
    }

    /// Run a full pass now: register if needed, push entries and problems, pull
    pub async fn sync_now(&self) -> Result<SyncReport> {
        if !self.config.enabled {
            return Ok(SyncReport { disabled: true, ..SyncReport::default() });
        }
        let _pass = self.pass.lock().await;
        let mut report = SyncReport::default();

        self.ensure_registered().await;
        let result: Result<()> = async {
            self.push_entries(&mut report).await?;
            self.push_problems(&mut report).await?;
            self.pull_entries(&mut report).await
        }
        .await;

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                state.backoff.reset();
                state.last_error = None;
                state.last_success = Some(Utc::now());
                state.last_report = Some(report.clone());
                debug!(
                    "Sync pass: pushed {}, pulled {}, conflicts {}",
                    report.pushed, report.pulled, report.conflicts
                );
                Ok(report)
            }
            Err(e) => {
                state.backoff.record_failure();
                state.last_error = Some(e.to_string());
                state.last_report = Some(report);
                warn!(
                    "Sync pass failed ({} consecutive), retrying in {:?}: {}",
                    state.backoff.failures(),
                    state.backoff.delay(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn ensure_registered(&self) {
        if !self.config.auto_register
            || self.has_api_key.load(Ordering::SeqCst)
            || self.registration_attempted.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let instance_id = self.store.instance_id().to_string();
        match self.bounded(self.remote.register_instance(&instance_id)).await {
            Ok(registration) => {
                self.remote.set_api_key(&registration.api_key);
                self.has_api_key.store(true, Ordering::SeqCst);
                if let Some(hook) = &self.on_register {
                    if let Err(e) = hook(&registration) {
                        warn!("Could not save API key: {}", e);
                    }
                }
                info!("Registered instance {} with the collective", registration.instance_id);
            }
            Err(e) => warn!("Registration failed, continuing anonymously: {}", e),
        }
    }

    async fn push_entries(&self, report: &mut SyncReport) -> Result<()> {
        let pending = self.store.entries_needing_push();
        if pending.is_empty() {
            return Ok(());
        }

        for batch in pending.chunks(self.config.push_batch_size.max(1)) {
            let ids: Vec<String> = batch.iter().map(|e| e.id.clone()).collect();
            let acks = match self.bounded(self.remote.push_entries(batch)).await {
                Ok(acks) => acks,
                Err(e) => {
                    if let Err(store_err) = self.store.mark_pending(&ids) {
                        warn!("Could not mark entries pending: {}", store_err);
                    }
                    return Err(e.into());
                }
            };

            let mut acked = HashSet::new();
            for ack in acks {
                match self.store.mark_synced(&ack.local_id, &ack.remote_id, ack.server_timestamp) {
                    Ok(_) => {
                        acked.insert(ack.local_id);
                        report.pushed += 1;
                    }
                    Err(Error::NotFound(_)) => debug!("Acknowledged entry {} no longer present", ack.local_id),
                    Err(e) => return Err(e),
                }
            }

            let missing: Vec<String> = ids.into_iter().filter(|id| !acked.contains(id)).collect();
            if !missing.is_empty() {
                warn!("Remote did not acknowledge {} entries", missing.len());
                self.store.mark_pending(&missing)?;
            }
        }
        Ok(())
    }

    async fn push_problems(&self, report: &mut SyncReport) -> Result<()> {
        for problem in self.store.problems_needing_push() {
            let remote_id = self.bounded(self.remote.post_problem(&problem)).await?;
            self.store.mark_problem_synced(&problem.id, &remote_id)?;
            report.problems_pushed += 1;
        }
        Ok(())
    }

    /// Pull pages until the remote has no more; the cursor only moves after a whole page is merged
    async fn pull_entries(&self, report: &mut SyncReport) -> Result<()> {
        let mut cursor = self.store.cursor();
        loop {
            let page = self.bounded(
                self.remote.pull_entries(cursor.clone(), self.config.pull_page_size.max(1)),
            ).await?;
            let count = page.entries.len();

            for entry in page.entries {
                match self.store.merge_remote(entry) {
                    Ok(outcome) => {
                        report.pulled += 1;
                        match outcome {
                            MergeOutcome::Inserted(_) => report.inserted += 1,
                            MergeOutcome::Unified { .. } => report.unified += 1,
                            MergeOutcome::Conflict { .. } => report.conflicts += 1,
                            MergeOutcome::Updated(_) | MergeOutcome::Unchanged(_) => {}
                        }
                    }
                    // Malformed entries are dropped and the cursor still moves past them,
                    // otherwise one bad entry would stall every later pull
                    Err(Error::Sync(e)) => {
                        warn!("Skipping malformed remote entry: {}", e);
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            if let Some(next) = page.next_cursor {
                if cursor.as_ref() != Some(&next) {
                    self.store.set_cursor(next.clone())?;
                }
                cursor = Some(next);
            }
            if !page.has_more || count == 0 {
                return Ok(());
            }
        }
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            enabled: self.config.enabled,
            anonymous: !self.has_api_key.load(Ordering::SeqCst),
            consecutive_failures: state.backoff.failures(),
            next_delay_secs: state.backoff.next_delay(self.interval()).as_secs(),
            last_error: state.last_error.clone(),
            last_success: state.last_success,
            last_report: state.last_report.clone(),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs.max(1))
    }

    /// Run passes on the configured interval until shutdown
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("Sync disabled, background engine not started");
            return;
        }
        info!("Sync engine started (interval: {}s, remote: {})", self.config.interval_secs, self.config.base_url);

        loop {
            let (delay, backing_off) = {
                let state = self.state.lock().await;
                (state.backoff.next_delay(self.interval()), state.backoff.failures() > 0)
            };
            let deadline = tokio::time::Instant::now() + delay;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = self.wake.notified() => {
                        // Writes shorten the regular wait but never cut a backoff short
                        if !backing_off {
                            debug!("Sync woken by local write");
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Sync engine shutting down");
                        return;
                    }
                }
            }

            if let Err(e) = self.sync_now().await {
                debug!("Background sync failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::remote::MockRemoteStore;
    use crate::matching::RelevanceMatcher;
    use crate::store::SyncCursor;
    use crate::types::{EntryKind, KnowledgeEntry, SyncState};

    fn store(dir: &std::path::Path) -> Arc<LocalStore> {
        Arc::new(LocalStore::open(dir.join("knowledge.json"), "inst-a", RelevanceMatcher::default()).unwrap())
    }

    fn draft(title: &str) -> KnowledgeEntry {
        KnowledgeEntry::draft(EntryKind::Solution, title, "content", ["x"], "general")
    }

    fn config() -> SyncConfig {
        SyncConfig { auto_register: false, ..SyncConfig::default() }
    }

    #[tokio::test]
    async fn test_push_failure_leaves_pending_and_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.put(draft("offline lesson")).unwrap();

        let mut remote = MockRemoteStore::new();
        remote.expect_push_entries().returning(|_| Err(SyncError::Unavailable(503)));
        let engine = SyncEngine::new(store.clone(), Arc::new(remote), config(), true);

        let err = engine.sync_now().await.unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::Unavailable(503))));
        assert_eq!(store.get(&id).unwrap().sync_state, SyncState::Pending);

        let status = engine.status().await;
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.next_delay_secs, 60);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_push_marks_synced_with_remote_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.put(draft("pushed lesson")).unwrap();

        let mut remote = MockRemoteStore::new();
        remote.expect_push_entries().times(1).returning(|entries| {
            Ok(entries.iter().map(|e| PushAck {
                local_id: e.id.clone(),
                remote_id: "remote-42".into(),
                server_timestamp: Utc::now(),
            }).collect())
        });
        let engine = SyncEngine::new(store.clone(), Arc::new(remote), config(), true);

        assert_eq!(engine.push().await.unwrap(), 1);
        let entry = store.get(&id).unwrap();
        assert_eq!(entry.id, "remote-42");
        assert_eq!(entry.sync_state, SyncState::Synced);

        // Nothing left to send: the mock allows exactly one call
        assert_eq!(engine.push().await.unwrap(), 0);
    }

    struct SlowRemote;

    #[async_trait::async_trait]
    impl RemoteStore for SlowRemote {
        async fn register_instance(&self, _: &str) -> std::result::Result<Registration, SyncError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(SyncError::Network("unreachable".into()))
        }
        async fn push_entries(&self, _: &[KnowledgeEntry]) -> std::result::Result<Vec<PushAck>, SyncError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
        async fn pull_entries(&self, _: Option<SyncCursor>, _: usize) -> std::result::Result<PullBatch, SyncError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(PullBatch::default())
        }
        async fn post_problem(&self, _: &crate::types::ProblemRecord) -> std::result::Result<String, SyncError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let id = store.put(draft("slow network")).unwrap();

        let engine = SyncEngine::new(store.clone(), Arc::new(SlowRemote), config(), true)
            .with_request_timeout(Duration::from_millis(50));

        let err = engine.sync_now().await.unwrap_err();
        assert!(matches!(err, Error::Sync(SyncError::Timeout(_))));
        assert_eq!(store.get(&id).unwrap().sync_state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_pull_cursor_advances_per_page_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut remote = MockRemoteStore::new();
        let mut seq = mockall::Sequence::new();
        remote.expect_pull_entries()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                let mut entry = KnowledgeEntry::draft(EntryKind::Gotcha, "page one", "body", ["y"], "general");
                entry.id = "r1".into();
                entry.origin = crate::types::Origin::local("inst-b");
                Ok(PullBatch { entries: vec![entry], next_cursor: Some(SyncCursor("1".into())), has_more: true })
            });
        remote.expect_pull_entries()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(SyncError::Network("connection reset".into())));
        let engine = SyncEngine::new(store.clone(), Arc::new(remote), config(), true);

        assert!(engine.pull().await.is_err());
        assert_eq!(store.cursor(), Some(SyncCursor("1".into())));
        assert!(store.get("r1").is_ok());
    }

    #[tokio::test]
    async fn test_malformed_remote_entry_is_counted_as_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut remote = MockRemoteStore::new();
        remote.expect_pull_entries().times(1).returning(|_, _| {
            let nameless = KnowledgeEntry::draft(EntryKind::Solution, "no id", "body", ["z"], "general");
            let mut good = KnowledgeEntry::draft(EntryKind::Solution, "has id", "body", ["z"], "general");
            good.id = "r5".into();
            good.origin = crate::types::Origin::local("inst-b");
            Ok(PullBatch { entries: vec![nameless, good], next_cursor: Some(SyncCursor("5".into())), has_more: false })
        });
        let engine = SyncEngine::new(store.clone(), Arc::new(remote), config(), true);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.cursor(), Some(SyncCursor("5".into())));
        assert_eq!(store.list_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_registration_installs_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut remote = MockRemoteStore::new();
        remote.expect_register_instance().times(1).returning(|id| {
            Ok(Registration { instance_id: id.to_string(), api_key: "issued".into() })
        });
        remote.expect_set_api_key().times(1).return_const(());
        remote.expect_pull_entries().returning(|_, _| Ok(PullBatch::default()));

        let saved = Arc::new(std::sync::Mutex::new(None));
        let sink = saved.clone();
        let engine = SyncEngine::new(store, Arc::new(remote), SyncConfig::default(), false)
            .on_register(move |reg| {
                *sink.lock().unwrap() = Some(reg.api_key.clone());
                Ok(())
            });

        engine.sync_now().await.unwrap();
        engine.sync_now().await.unwrap();
        assert_eq!(saved.lock().unwrap().as_deref(), Some("issued"));
        assert!(!engine.status().await.anonymous);
    }

    /// Loopback remote that refuses to register anyone
    struct Unregistered(Arc<LoopbackRemote>);

    #[async_trait::async_trait]
    impl RemoteStore for Unregistered {
        async fn register_instance(&self, _: &str) -> std::result::Result<Registration, SyncError> {
            Err(SyncError::Auth(403))
        }
        async fn push_entries(&self, entries: &[KnowledgeEntry]) -> std::result::Result<Vec<PushAck>, SyncError> {
            self.0.push_entries(entries).await
        }
        async fn pull_entries(&self, since: Option<SyncCursor>, limit: usize) -> std::result::Result<PullBatch, SyncError> {
            self.0.pull_entries(since, limit).await
        }
        async fn post_problem(&self, problem: &crate::types::ProblemRecord) -> std::result::Result<String, SyncError> {
            self.0.post_problem(problem).await
        }
    }

    #[tokio::test]
    async fn test_registration_failure_stays_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.put(draft("still pushed")).unwrap();

        let loopback = Arc::new(LoopbackRemote::new());
        let engine = SyncEngine::new(store, Arc::new(Unregistered(loopback.clone())), SyncConfig::default(), false);
        let report = engine.sync_now().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(engine.status().await.anonymous);
        assert_eq!(loopback.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_sync_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let engine = SyncEngine::new(
            store,
            Arc::new(MockRemoteStore::new()),
            SyncConfig { enabled: false, ..config() },
            false,
        );
        assert!(engine.sync_now().await.unwrap().disabled);
    }

    #[tokio::test]
    async fn test_run_wakes_on_write_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let remote = Arc::new(LoopbackRemote::new());
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            SyncConfig { interval_secs: 3600, ..config() },
            true,
        ));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        store.put(draft("wake me")).unwrap();
        engine.notify();

        let mut synced = false;
        for _ in 0..100 {
            if remote.entries().len() == 1 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
