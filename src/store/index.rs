//! In-memory index over a snapshot
//!
//! Primary map by id with secondary indexes by tag, category and content
//! hash. Rebuilt in full from the snapshot on load.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::snapshot::{Snapshot, SyncCursor, SNAPSHOT_VERSION};
use crate::types::{EntryKind, KnowledgeEntry, ProblemKey, ProblemRecord};

/// Optional narrowing applied before ranking
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub kind: Option<EntryKind>,
    pub category: Option<String>,
    /// Entries must carry every one of these tags
    pub tags: BTreeSet<String>,
}

impl QueryFilters {
    pub fn kind(kind: EntryKind) -> Self {
        Self { kind: Some(kind), ..Self::default() }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    entries: HashMap<String, KnowledgeEntry>,
    by_tag: HashMap<String, BTreeSet<String>>,
    by_category: HashMap<String, BTreeSet<String>>,
    by_hash: HashMap<String, BTreeSet<String>>,
    problems: HashMap<String, ProblemRecord>,
    problem_keys: HashMap<ProblemKey, String>,
    pub(crate) aliases: BTreeMap<String, String>,
    pub(crate) cursor: Option<SyncCursor>,
}

impl StoreState {
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = Self {
            aliases: snapshot.aliases,
            cursor: snapshot.cursor,
            ..Self::default()
        };
        for entry in snapshot.entries {
            state.insert_entry(entry);
        }
        for problem in snapshot.problems {
            state.insert_problem(problem);
        }
        state
    }

    /// Serialize in id order so identical state always writes identical bytes
    pub(crate) fn to_snapshot(&self) -> Snapshot {
        let mut entries: Vec<KnowledgeEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let mut problems: Vec<ProblemRecord> = self.problems.values().cloned().collect();
        problems.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
            problems,
            cursor: self.cursor.clone(),
            aliases: self.aliases.clone(),
        }
    }

    /// Follow alias links to the authoritative id
    pub(crate) fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        let mut current = id;
        // Alias chains are short; bound the walk in case of a cycle
        for _ in 0..8 {
            match self.aliases.get(current) {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        current
    }

    pub(crate) fn entry(&self, id: &str) -> Option<&KnowledgeEntry> {
        self.entries.get(self.resolve(id))
    }

    /// The visible entry a conflicted entry lost to, or the entry itself
    pub(crate) fn conflict_winner(&self, id: &str) -> Option<&KnowledgeEntry> {
        let mut current = self.entry(id)?;
        for _ in 0..8 {
            match current.superseded_by.as_deref().and_then(|next| self.entry(next)) {
                Some(next) if next.id != current.id => current = next,
                _ => break,
            }
        }
        Some(current)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &KnowledgeEntry> {
        self.entries.values()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn ids_with_hash(&self, hash: &str) -> Vec<String> {
        self.by_hash.get(hash).map(|ids| ids.iter().cloned().collect()).unwrap_or_default()
    }

    /// Insert or replace, keeping secondary indexes consistent
    pub(crate) fn insert_entry(&mut self, entry: KnowledgeEntry) {
        if self.entries.contains_key(&entry.id) {
            self.remove_entry(&entry.id.clone());
        }
        let id = entry.id.clone();
        for tag in &entry.tags {
            self.by_tag.entry(tag.clone()).or_default().insert(id.clone());
        }
        self.by_category.entry(entry.category.clone()).or_default().insert(id.clone());
        self.by_hash.entry(entry.content_hash()).or_default().insert(id.clone());
        self.entries.insert(id, entry);
    }

    pub(crate) fn remove_entry(&mut self, id: &str) -> Option<KnowledgeEntry> {
        let entry = self.entries.remove(id)?;
        for tag in &entry.tags {
            remove_from(&mut self.by_tag, tag, id);
        }
        remove_from(&mut self.by_category, &entry.category, id);
        remove_from(&mut self.by_hash, &entry.content_hash(), id);
        Some(entry)
    }

    /// Apply `f` to an entry in place. Content fields must not change.
    pub(crate) fn update_entry(&mut self, id: &str, f: impl FnOnce(&mut KnowledgeEntry)) -> bool {
        let id = self.resolve(id).to_string();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    /// Move an entry to a new id, leaving an alias and rewriting references
    pub(crate) fn rekey(&mut self, old_id: &str, new_id: &str) {
        if old_id == new_id {
            return;
        }
        if let Some(mut entry) = self.remove_entry(old_id) {
            entry.id = new_id.to_string();
            self.insert_entry(entry);
        }
        self.redirect(old_id, new_id);
    }

    /// Point every reference to `old_id` at `new_id` and record the alias
    pub(crate) fn redirect(&mut self, old_id: &str, new_id: &str) {
        self.aliases.insert(old_id.to_string(), new_id.to_string());
        for target in self.aliases.values_mut() {
            if target == old_id {
                *target = new_id.to_string();
            }
        }
        for entry in self.entries.values_mut() {
            if entry.supersedes.as_deref() == Some(old_id) {
                entry.supersedes = Some(new_id.to_string());
            }
            if entry.superseded_by.as_deref() == Some(old_id) {
                entry.superseded_by = Some(new_id.to_string());
            }
        }
        for problem in self.problems.values_mut() {
            if problem.resolved_by.as_deref() == Some(old_id) {
                problem.resolved_by = Some(new_id.to_string());
            }
        }
    }

    /// Visible candidates after filters, excluding entries another entry supersedes
    pub(crate) fn candidates(&self, filters: &QueryFilters) -> Vec<KnowledgeEntry> {
        let superseded: HashSet<&str> = self.entries.values()
            .filter_map(|e| e.supersedes.as_deref())
            .collect();

        let mut lookups: Vec<Option<&BTreeSet<String>>> = Vec::new();
        if let Some(category) = &filters.category {
            lookups.push(self.by_category.get(&category.trim().to_lowercase()));
        }
        for tag in &filters.tags {
            lookups.push(self.by_tag.get(&tag.trim().to_lowercase()));
        }

        let mut narrowed: Option<BTreeSet<&String>> = None;
        for ids in lookups {
            let ids: BTreeSet<&String> = ids.map(|s| s.iter().collect()).unwrap_or_default();
            narrowed = Some(match narrowed {
                Some(current) => current.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        let pool: Box<dyn Iterator<Item = &KnowledgeEntry> + '_> = match narrowed {
            Some(ids) => Box::new(ids.into_iter().filter_map(|id| self.entries.get(id))),
            None => Box::new(self.entries.values()),
        };
        pool.filter(|e| filters.kind.map_or(true, |k| e.kind == k))
            .filter(|e| e.is_visible() && !superseded.contains(e.id.as_str()))
            .cloned()
            .collect()
    }

    pub(crate) fn problem(&self, id: &str) -> Option<&ProblemRecord> {
        self.problems.get(id)
    }

    pub(crate) fn problems(&self) -> impl Iterator<Item = &ProblemRecord> {
        self.problems.values()
    }

    pub(crate) fn problem_by_key(&self, key: &ProblemKey) -> Option<&ProblemRecord> {
        self.problem_keys.get(key).and_then(|id| self.problems.get(id))
    }

    pub(crate) fn insert_problem(&mut self, problem: ProblemRecord) {
        self.problem_keys.insert(problem.dedup_key(), problem.id.clone());
        // Agent problems with an external id are also reachable by text
        self.problem_keys.entry(ProblemKey::Text(crate::types::text_hash(&problem.text)))
            .or_insert_with(|| problem.id.clone());
        self.problems.insert(problem.id.clone(), problem);
    }

    pub(crate) fn problem_mut(&mut self, id: &str) -> Option<&mut ProblemRecord> {
        self.problems.get_mut(id)
    }
}

fn remove_from(index: &mut HashMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProblemSource, SyncState};

    fn entry(id: &str, kind: EntryKind, tags: &[&str], category: &str) -> KnowledgeEntry {
        let mut e = KnowledgeEntry::draft(kind, format!("title {}", id), "content", tags.iter().copied(), category);
        e.id = id.to_string();
        e
    }

    #[test]
    fn test_filters_intersect() {
        let mut state = StoreState::default();
        state.insert_entry(entry("a", EntryKind::Solution, &["ecs", "fastapi"], "deployment"));
        state.insert_entry(entry("b", EntryKind::Solution, &["ecs"], "networking"));
        state.insert_entry(entry("c", EntryKind::Gotcha, &["ecs", "fastapi"], "deployment"));

        let filters = QueryFilters {
            kind: Some(EntryKind::Solution),
            category: Some("Deployment".into()),
            tags: ["fastapi".to_string()].into_iter().collect(),
        };
        let ids: Vec<String> = state.candidates(&filters).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[test]
    fn test_superseded_and_conflicted_hidden() {
        let mut state = StoreState::default();
        state.insert_entry(entry("old", EntryKind::Solution, &[], "general"));
        let mut new = entry("new", EntryKind::Solution, &[], "general");
        new.supersedes = Some("old".into());
        state.insert_entry(new);
        let mut lost = entry("lost", EntryKind::Solution, &[], "general");
        lost.sync_state = SyncState::Conflicted;
        state.insert_entry(lost);

        let ids: Vec<String> = state.candidates(&QueryFilters::default()).into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["new".to_string()]);
        assert!(state.entry("old").is_some());
    }

    #[test]
    fn test_rekey_rewrites_links() {
        let mut state = StoreState::default();
        state.insert_entry(entry("local-1", EntryKind::Solution, &["x"], "general"));
        let mut newer = entry("local-2", EntryKind::Solution, &["x"], "general");
        newer.supersedes = Some("local-1".into());
        state.insert_entry(newer);
        let mut problem = ProblemRecord::new(ProblemSource::AgentPosted, None, "p", ["x"]);
        problem.id = "p1".into();
        problem.resolved_by = Some("local-1".into());
        state.insert_problem(problem);

        state.rekey("local-1", "remote-9");

        assert_eq!(state.entry("local-1").map(|e| e.id.as_str()), Some("remote-9"));
        assert_eq!(state.entry("local-2").and_then(|e| e.supersedes.as_deref()), Some("remote-9"));
        assert_eq!(state.problem("p1").and_then(|p| p.resolved_by.as_deref()), Some("remote-9"));
        assert_eq!(state.by_tag.get("x").map(|s| s.len()), Some(2));
    }

    #[test]
    fn test_snapshot_rebuild_matches() {
        let mut state = StoreState::default();
        state.insert_entry(entry("b", EntryKind::Solution, &["x"], "general"));
        state.insert_entry(entry("a", EntryKind::Gotcha, &["y"], "general"));
        let snapshot = state.to_snapshot();
        assert_eq!(snapshot.entries[0].id, "a");

        let rebuilt = StoreState::from_snapshot(snapshot);
        assert_eq!(rebuilt.len(), 2);
        assert_eq!(rebuilt.ids_with_hash(&state.entries["a"].content_hash()), vec!["a".to_string()]);
    }
}
