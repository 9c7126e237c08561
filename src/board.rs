//! Problem board - deduplicated unsolved problems
//!
//! Agent-posted problems are checked against existing knowledge first;
//! when something relevant exists it is returned instead of a new problem.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::{Error, Result};
use crate::matching::{Match, Query};
use crate::store::{LocalStore, ProblemInsert, QueryFilters};
use crate::types::{ProblemRecord, ProblemSource, ProblemStatus};

/// Board configuration (`[board]` in config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    /// Minimum match score that counts as an existing solution
    #[serde(default = "default_solution_threshold")]
    pub solution_threshold: f64,
    /// Existing solutions surfaced instead of posting
    #[serde(default = "default_max_existing")]
    pub max_existing: usize,
}

fn default_solution_threshold() -> f64 { 0.3 }
fn default_max_existing() -> usize { 3 }

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            solution_threshold: default_solution_threshold(),
            max_existing: default_max_existing(),
        }
    }
}

/// Result of posting a problem
#[derive(Debug, Clone)]
pub enum PostOutcome {
    Posted(String),
    /// A problem with the same key is already on the board
    Duplicate(String),
    /// Knowledge that likely answers the problem; nothing was posted
    ExistingSolutions(Vec<Match>),
}

pub struct ProblemBoard {
    store: Arc<LocalStore>,
    config: BoardConfig,
}

impl ProblemBoard {
    pub fn new(store: Arc<LocalStore>, config: BoardConfig) -> Self {
        Self { store, config }
    }

    /// Knowledge entries scoring above the solution threshold for this problem
    pub fn existing_solutions(&self, problem: &ProblemRecord) -> Vec<Match> {
        let mut text = problem.text.clone();
        for tag in &problem.tags {
            text.push(' ');
            text.push_str(tag);
        }
        self.store.query(&Query::Text(text), &QueryFilters::default())
            .into_iter()
            .filter(|m| m.score >= self.config.solution_threshold)
            .take(self.config.max_existing.max(1))
            .collect()
    }

    pub fn post(&self, problem: ProblemRecord) -> Result<PostOutcome> {
        if problem.source == ProblemSource::AgentPosted {
            let existing = self.existing_solutions(&problem);
            if !existing.is_empty() {
                return Ok(PostOutcome::ExistingSolutions(existing));
            }
        }
        match self.store.insert_problem(problem)? {
            ProblemInsert::Inserted(id) => {
                info!("Posted problem {}", id);
                Ok(PostOutcome::Posted(id))
            }
            ProblemInsert::Duplicate(id) => Ok(PostOutcome::Duplicate(id)),
        }
    }

    /// Open -> Claimed
    pub fn claim(&self, id: &str) -> Result<ProblemRecord> {
        self.store.update_problem(id, |problem| {
            if problem.status != ProblemStatus::Open {
                return Err(transition(problem, ProblemStatus::Claimed));
            }
            problem.status = ProblemStatus::Claimed;
            Ok(())
        })
    }

    /// Open or Claimed -> Resolved, linked to the entry that answers it
    pub fn resolve(&self, id: &str, entry_id: &str) -> Result<ProblemRecord> {
        let entry = self.store.get(entry_id)?;
        self.store.update_problem(id, |problem| {
            if problem.status == ProblemStatus::Resolved {
                return Err(transition(problem, ProblemStatus::Resolved));
            }
            problem.status = ProblemStatus::Resolved;
            problem.resolved_by = Some(entry.id.clone());
            Ok(())
        })
    }

    pub fn open_problems(&self) -> Vec<ProblemRecord> {
        self.store.list_problems()
            .into_iter()
            .filter(|p| p.status == ProblemStatus::Open)
            .collect()
    }

    pub fn list(&self) -> Vec<ProblemRecord> {
        self.store.list_problems()
    }
}

fn transition(problem: &ProblemRecord, to: ProblemStatus) -> Error {
    Error::InvalidTransition {
        id: problem.id.clone(),
        from: problem.status.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::RelevanceMatcher;
    use crate::types::{EntryKind, KnowledgeEntry};

    fn board(dir: &std::path::Path) -> (Arc<LocalStore>, ProblemBoard) {
        let store = Arc::new(LocalStore::open(dir.join("knowledge.json"), "inst-a", RelevanceMatcher::default()).unwrap());
        (store.clone(), ProblemBoard::new(store, BoardConfig::default()))
    }

    fn agent_problem(text: &str, tags: &[&str]) -> ProblemRecord {
        ProblemRecord::new(ProblemSource::AgentPosted, None, text, tags.iter().copied())
    }

    #[test]
    fn test_existing_solution_blocks_post() {
        let dir = tempfile::tempdir().unwrap();
        let (store, board) = board(dir.path());
        store.put(KnowledgeEntry::draft(
            EntryKind::FailurePattern,
            "bcrypt truncates passwords longer than 72 bytes",
            "bcrypt only uses the first 72 bytes of a password; pre-hash long passwords",
            ["bcrypt", "passwords", "security"],
            "security",
        )).unwrap();

        let outcome = board.post(agent_problem("bcrypt truncates passwords over 72 bytes", &["bcrypt"])).unwrap();
        assert!(matches!(outcome, PostOutcome::ExistingSolutions(ref m) if !m.is_empty()));
        assert!(board.list().is_empty());
    }

    #[test]
    fn test_post_then_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let (_, board) = board(dir.path());
        let PostOutcome::Posted(id) = board.post(agent_problem("celery worker hangs on sigterm", &["celery"])).unwrap() else {
            panic!("expected a new problem");
        };
        let again = board.post(agent_problem("Celery worker   hangs on SIGTERM", &["celery"])).unwrap();
        assert!(matches!(again, PostOutcome::Duplicate(ref existing) if *existing == id));
    }

    #[test]
    fn test_discovered_problems_skip_solution_check() {
        let dir = tempfile::tempdir().unwrap();
        let (store, board) = board(dir.path());
        store.put(KnowledgeEntry::draft(EntryKind::Solution, "redis timeout", "raise socket timeout", ["redis"], "general")).unwrap();

        let discovered = ProblemRecord::new(ProblemSource::StackOverflow, Some("991".into()), "redis timeout in docker", ["redis"]);
        assert!(matches!(board.post(discovered).unwrap(), PostOutcome::Posted(_)));
    }

    #[test]
    fn test_claim_and_resolve_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (store, board) = board(dir.path());
        let PostOutcome::Posted(id) = board.post(agent_problem("uvicorn reload loop", &[])).unwrap() else {
            panic!("expected a new problem");
        };

        assert_eq!(board.claim(&id).unwrap().status, ProblemStatus::Claimed);
        assert!(matches!(board.claim(&id), Err(Error::InvalidTransition { .. })));

        assert!(matches!(board.resolve(&id, "missing-entry"), Err(Error::NotFound(_))));
        let entry = store.put(KnowledgeEntry::draft(EntryKind::Solution, "exclude venv from reload", "--reload-dir src", ["uvicorn"], "dev")).unwrap();
        let resolved = board.resolve(&id, &entry).unwrap();
        assert_eq!(resolved.status, ProblemStatus::Resolved);
        assert_eq!(resolved.resolved_by.as_deref(), Some(entry.as_str()));
        assert!(board.open_problems().is_empty());
        assert!(matches!(board.resolve(&id, &entry), Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_unknown_problem_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_, board) = board(dir.path());
        assert!(matches!(board.claim("nope"), Err(Error::NotFound(_))));
    }
}
