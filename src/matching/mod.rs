//! Error signature parsing and relevance ranking
//!
//! The parser turns raw error output into a normalized [`ErrorSignature`];
//! the matcher ranks knowledge entries against text or signatures.

pub mod text;
pub mod signature;
pub mod matcher;

pub use signature::{ErrorSignature, Language};
pub use matcher::{Match, MatcherConfig, MatcherWeights, Query, RelevanceMatcher, ScoreFactors};
