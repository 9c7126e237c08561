//! Text normalization and tokenization shared by the parser and the matcher

use std::collections::BTreeSet;

/// Technology names recognized as tags when they appear in free text
pub const TECH_VOCABULARY: &[&str] = &[
    "python", "javascript", "typescript", "node", "react", "nextjs",
    "fastapi", "django", "flask", "express", "sqlalchemy", "pydantic",
    "docker", "kubernetes", "aws", "ecs", "fargate", "lambda",
    "postgresql", "postgres", "mysql", "redis", "mongodb", "sqlite",
    "nginx", "terraform", "git", "github", "asyncio", "httpx",
    "celery", "alembic", "jwt", "bcrypt", "cors", "ssl", "mcp",
    "pytest", "webpack", "vite", "pip", "npm", "cargo", "rust",
    "tokio", "go", "java", "uvicorn", "gunicorn", "requests",
];

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "has", "have", "in", "into", "is", "it", "its", "of", "on", "or", "so",
    "than", "that", "the", "then", "this", "to", "was", "were", "when",
    "which", "while", "with", "without", "not", "no", "over", "after",
    "before", "does", "do", "did", "my", "i", "you", "we",
];

/// Lowercase and collapse all whitespace runs to a single space
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split text into lowercase tokens, keeping version-like tokens such as `3.12`
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')))
        .map(|t| t.trim_matches(|c: char| matches!(c, '.' | '_' | '-')))
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().count() >= 2 || t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Tokens as a set
pub fn token_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

/// Whether a token names a known technology
pub fn is_technology(token: &str) -> bool {
    TECH_VOCABULARY.contains(&token)
}

/// Technologies mentioned in the text, in first-occurrence order
pub fn detect_technologies(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for token in tokenize(text) {
        let token = token.trim_end_matches(".js").to_string();
        if is_technology(&token) && !found.contains(&token) {
            found.push(token);
        }
    }
    found
}

/// Jaccard similarity of two sets; 0 when both are empty
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello\n\tWORLD  again "), "hello world again");
    }

    #[test]
    fn test_tokenize_keeps_versions_and_drops_stopwords() {
        let tokens = tokenize("SQLAlchemy 2.0 on Python 3.12, the async session!");
        assert_eq!(tokens, vec!["sqlalchemy", "2.0", "python", "3.12", "async", "session"]);
    }

    #[test]
    fn test_tokenize_keeps_addresses() {
        let tokens = tokenize("bind 0.0.0.0 not 127.0.0.1");
        assert_eq!(tokens, vec!["bind", "0.0.0.0", "127.0.0.1"]);
    }

    #[test]
    fn test_detect_technologies_order() {
        let techs = detect_technologies("Deploying FastAPI on ECS with Docker and fastapi again");
        assert_eq!(techs, vec!["fastapi", "ecs", "docker"]);
    }

    #[test]
    fn test_jaccard() {
        let a: BTreeSet<String> = ["ecs", "fargate"].iter().map(|s| s.to_string()).collect();
        let b: BTreeSet<String> = ["ecs", "fastapi"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 0.0);
    }
}
