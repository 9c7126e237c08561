//! The agent-facing tools end to end, with a collective store behind them

use std::sync::Arc;

use collective_memory::board::BoardConfig;
use collective_memory::sync::SyncConfig;
use collective_memory::tools::{execute_tool, ToolCall};
use collective_memory::{
    Collective, EntryKind, LocalStore, LoopbackRemote, MemorizeRequest, PostOutcome, ProblemBoard, RelevanceMatcher,
    RemoteStore, SyncEngine, SyncState,
};
use serde_json::json;

fn collective(dir: &std::path::Path, instance: &str, remote: &Arc<LoopbackRemote>) -> Collective {
    let store = Arc::new(
        LocalStore::open(dir.join(instance).join("knowledge.json"), instance, RelevanceMatcher::default()).unwrap(),
    );
    let remote: Arc<dyn RemoteStore> = remote.clone();
    let engine = SyncEngine::new(store.clone(), remote, SyncConfig::default(), false);
    let board = ProblemBoard::new(store.clone(), BoardConfig::default());
    Collective::new(store, board, Some(Arc::new(engine)))
}

fn tags(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn ask_community_returns_known_fix_instead_of_posting() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(LoopbackRemote::new());
    let c = collective(dir.path(), "inst-a", &remote);

    c.memorize(MemorizeRequest::new(
        EntryKind::Solution,
        "passlib fails with bcrypt 4.1",
        "bcrypt 4.1 removed __about__, which passlib reads. Pin bcrypt==4.0.1.",
        tags(&["bcrypt", "passlib", "python"]),
        "dependencies",
    ))
    .unwrap();

    let outcome = c.ask_community("AttributeError from bcrypt when hashing with passlib", &tags(&["bcrypt"])).unwrap();
    let PostOutcome::ExistingSolutions(matches) = outcome else {
        panic!("expected existing solutions, got {:?}", outcome);
    };
    assert_eq!(matches[0].entry.title, "passlib fails with bcrypt 4.1");
    assert!(c.problem_snapshot().is_empty());

    let posted = c.ask_community("kubectl port-forward drops after idle timeout", &tags(&["kubernetes"])).unwrap();
    assert!(matches!(posted, PostOutcome::Posted(_)));
}

#[tokio::test]
async fn offline_memorize_reaches_the_collective_once() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(LoopbackRemote::new());
    let c = collective(dir.path(), "inst-a", &remote);

    remote.set_offline(true);
    let result = execute_tool(
        &ToolCall {
            name: "memorize".into(),
            arguments: json!({
                "kind": "gotcha",
                "title": "GitHub Actions cache keys are immutable",
                "content": "Include a hash of the lockfile in the key",
                "tags": ["github-actions", "ci"],
                "category": "ci"
            }),
        },
        &c,
    )
    .await;
    assert!(result.success, "memorize must not depend on the remote: {}", result.message);
    assert!(c.sync_now().await.is_err());

    remote.set_offline(false);
    c.sync_now().await.unwrap();
    c.sync_now().await.unwrap();

    assert_eq!(remote.entries().len(), 1);
    let entries = c.knowledge_snapshot();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sync_state, SyncState::Synced);
}

#[tokio::test]
async fn posted_problems_are_shared_and_learned_fixes_spread() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(LoopbackRemote::new());
    let a = collective(dir.path(), "inst-a", &remote);
    let b = collective(dir.path(), "inst-b", &remote);

    let PostOutcome::Posted(problem_id) = a.ask_community("sqlalchemy session leaks under celery", &tags(&["celery"])).unwrap() else {
        panic!("expected a new problem");
    };
    let report = a.sync_now().await.unwrap();
    assert_eq!(report.problems_pushed, 1);
    assert_eq!(remote.problems().len(), 1);
    assert!(a.store().get_problem(&problem_id).unwrap().remote_id.is_some());

    b.memorize(MemorizeRequest::new(
        EntryKind::Solution,
        "scope sqlalchemy sessions per celery task",
        "create the session in task_prerun and remove it in task_postrun",
        tags(&["celery", "sqlalchemy"]),
        "python",
    ))
    .unwrap();
    b.sync_now().await.unwrap();
    a.sync_now().await.unwrap();

    let hits = a.recall("sqlalchemy celery session", &Default::default(), None);
    assert_eq!(hits.len(), 1);
    assert!(!hits[0].entry.origin.is_local());

    let trending = a.whats_trending(None);
    assert_eq!(trending.entries[0].title, "scope sqlalchemy sessions per celery task");
    assert_eq!(trending.open_problems.len(), 1);
}

#[tokio::test]
async fn status_reports_anonymous_until_registered() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(LoopbackRemote::new());
    let c = collective(dir.path(), "inst-a", &remote);

    let before = c.status().await;
    assert!(before.sync.unwrap().anonymous);

    c.sync_now().await.unwrap();
    let after = c.status().await;
    assert!(!after.sync.unwrap().anonymous);
}
