//! Snapshot durability across process restarts

use chrono::Utc;
use collective_memory::store::SyncCursor;
use collective_memory::{
    EntryKind, Error, KnowledgeEntry, LocalStore, ProblemRecord, ProblemSource, RelevanceMatcher, SyncState,
};

fn open(path: &std::path::Path) -> LocalStore {
    LocalStore::open(path, "inst-a", RelevanceMatcher::default()).unwrap()
}

#[test]
fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knowledge.json");

    let (local_id, problem_id) = {
        let store = open(&path);
        let local_id = store.put(KnowledgeEntry::draft(
            EntryKind::Gotcha,
            "pydantic v2 renamed dict()",
            "use model_dump() instead",
            ["pydantic"],
            "python",
        )).unwrap();
        store.put(KnowledgeEntry::draft(EntryKind::Solution, "still local", "never synced", ["misc"], "general")).unwrap();
        store.mark_synced(&local_id, "remote-12", Utc::now()).unwrap();
        store.record_usage(&["remote-12".to_string()]).unwrap();
        store.set_cursor(SyncCursor("12".into())).unwrap();

        let problem = ProblemRecord::new(ProblemSource::GitHub, Some("issue-881".into()), "flaky asyncpg pool", ["asyncpg"]);
        let problem_id = match store.insert_problem(problem).unwrap() {
            collective_memory::store::ProblemInsert::Inserted(id) => id,
            other => panic!("unexpected {:?}", other),
        };
        (local_id, problem_id)
    };

    let store = open(&path);
    let entry = store.get(&local_id).unwrap();
    assert_eq!(entry.id, "remote-12");
    assert_eq!(entry.usage_count, 1);
    assert_eq!(entry.sync_state, SyncState::Synced);
    assert_eq!(store.cursor(), Some(SyncCursor("12".into())));
    assert_eq!(store.get_problem(&problem_id).unwrap().external_id.as_deref(), Some("issue-881"));

    let pending = store.entries_needing_push();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].title, "still local");
}

#[test]
fn leftover_temp_file_is_ignored_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knowledge.json");
    {
        let store = open(&path);
        store.put(KnowledgeEntry::draft(EntryKind::Solution, "committed", "before the crash", ["x"], "general")).unwrap();
    }

    // A write that died before its rename leaves only a temporary file behind
    std::fs::write(dir.path().join(".snapshot-interrupted.tmp"), b"{\"version\": 2, \"entr").unwrap();

    let store = open(&path);
    let entries = store.list_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].title, "committed");
}

#[test]
fn corrupt_snapshot_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knowledge.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let result = LocalStore::open(&path, "inst-a", RelevanceMatcher::default());
    assert!(matches!(result, Err(Error::CorruptSnapshot { .. })));
}

#[test]
fn legacy_array_snapshot_is_upgraded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knowledge.json");
    std::fs::write(
        &path,
        serde_json::json!([
            {
                "title": "Never use time.sleep in async code",
                "content": "It blocks the event loop",
                "category": "anti-pattern",
                "tags": ["asyncio"],
                "local_id": 3
            }
        ])
        .to_string(),
    )
    .unwrap();

    let store = open(&path);
    let entries = store.list_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::FailurePattern);
    assert_eq!(entries[0].sync_state, SyncState::LocalOnly);

    // The first write stores the current schema
    store.record_usage(&[entries[0].id.clone()]).unwrap();
    let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(raw["version"], 2);
}
