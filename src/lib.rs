//! Collective Memory - shared knowledge for coding agents
//!
//! A local-first knowledge base of solutions, gotchas and failure patterns:
//! - Error signature parsing and relevance ranking
//! - Crash-safe local snapshot store with id aliasing
//! - Background sync with a remote collective store, with backoff
//! - Problem board for unsolved issues
//! - Tool surface over HTTP and CLI
//!
//! # Example
//!
//! ```ignore
//! use collective_memory::{Collective, Config};
//!
//! let config = Config::load()?;
//! let collective = Collective::from_config(&config, &collective_memory::config::config_dir()?)?;
//! let hits = collective.intercept("ModuleNotFoundError: No module named 'jose'", None, None);
//! ```

// Core modules (order matters for readability only)
pub mod error;
pub mod types;
pub mod matching;
pub mod store;
pub mod sync;
pub mod board;
pub mod security;
pub mod config;

// Surfaces
pub mod tools;
pub mod server;
pub mod cli;

pub use error::{Error, Result, SyncError};
pub use types::{EntryKind, KnowledgeEntry, ProblemRecord, ProblemSource, ProblemStatus, SyncState};
pub use matching::{ErrorSignature, Match, Query, RelevanceMatcher};
pub use store::{LocalStore, QueryFilters};
pub use sync::{LoopbackRemote, RemoteStore, SyncConfig, SyncEngine};
pub use board::{PostOutcome, ProblemBoard};
pub use config::Config;
pub use tools::{Collective, MemorizeRequest};
