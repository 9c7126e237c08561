//! Error signature extraction
//!
//! Turns raw error output or a stack trace into an [`ErrorSignature`]. The
//! heuristics are best-effort and never fail: text that yields no exception
//! or library falls back to its lowercased, whitespace-collapsed form.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use super::text::{detect_technologies, normalize_text, tokenize};

/// Exception-like identifiers, optionally dotted (`sqlalchemy.exc.OperationalError`)
static EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z0-9]*(?:Error|Exception|Warning|Failure|Panic))\b").unwrap()
});

/// The line that carries the exception message (`KeyError: 'x'`)
static MESSAGE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Z][A-Za-z0-9_.]*(?:Error|Exception|Warning|Failure)\s*:").unwrap()
});

/// Library locations, each capturing the library name in group 1
static LIBRARY_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Python install paths
        Regex::new(r"(?:site-packages|dist-packages)[/\\]([A-Za-z0-9_\-]+)").unwrap(),
        // Missing modules
        Regex::new(r#"No module named ['"]([A-Za-z0-9_.]+)['"]"#).unwrap(),
        Regex::new(r#"Cannot find module ['"]([@A-Za-z0-9_\-/.]+)['"]"#).unwrap(),
        // Import statements
        Regex::new(r"(?m)^\s*from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import\b").unwrap(),
        Regex::new(r"(?m)^\s*import\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap(),
        Regex::new(r#"require\(\s*['"]([@A-Za-z0-9_\-/.]+)['"]\s*\)"#).unwrap(),
        // Package manager paths
        Regex::new(r"node_modules[/\\]((?:@[A-Za-z0-9_\-.]+[/\\])?[A-Za-z0-9_\-.]+)").unwrap(),
        Regex::new(r"registry[/\\]src[/\\][^/\\\s]+[/\\]([A-Za-z0-9_\-]+?)-\d+\.\d+").unwrap(),
        Regex::new(r"pkg[/\\]mod[/\\]([A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+/[A-Za-z0-9_.\-]+?)@v").unwrap(),
    ]
});

/// HTTP status with context (`HTTP 503`, `status code: 429`) or a reason phrase
static HTTP_STATUS_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\b(?:http(?:/[\d.]+)?|status(?:\s+code)?|code)\s*[:=]?\s*([45]\d{2})\b").unwrap(),
        Regex::new(r"\b([45]\d{2})\s+(?:Bad|Unauthorized|Forbidden|Not|Method|Request|Conflict|Gone|Too|Internal|Service|Gateway|Unprocessable)\b").unwrap(),
    ]
});

static HEX_ADDR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static LINE_NO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bline \d+").unwrap());
static QUOTED_PATH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""(?:/|[A-Za-z]:\\)[^"]+""#).unwrap());
static LONG_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{5,}\b").unwrap());

static JAVA_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bat [\w$.]+\([\w$]+\.java:\d+\)").unwrap());
static JS_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.(?:js|mjs|cjs|ts|tsx):\d+").unwrap());
static RUST_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.rs:\d+|error\[E\d{4}\]").unwrap());
static GO_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.go:\d+").unwrap());
static PY_FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"File "[^"]+\.py", line \d+"#).unwrap());

/// Language the error most likely came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    JavaScript,
    Rust,
    Go,
    Java,
    Unknown,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Python => write!(f, "python"),
            Language::JavaScript => write!(f, "javascript"),
            Language::Rust => write!(f, "rust"),
            Language::Go => write!(f, "go"),
            Language::Java => write!(f, "java"),
            Language::Unknown => write!(f, "unknown"),
        }
    }
}

/// Structured, normalized form of an error text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub language_hint: Language,
    /// Libraries in order of first occurrence
    pub library_names: Vec<String>,
    /// First exception type seen
    pub exception_type: Option<String>,
    /// Every exception type, in order of first occurrence
    pub exception_types: Vec<String>,
    pub technologies: Vec<String>,
    pub http_statuses: Vec<u16>,
    pub normalized_message: String,
}

impl ErrorSignature {
    /// Parse raw error text. Identical input always yields an identical signature.
    pub fn parse(raw: &str) -> Self {
        let exception_types = extract_exceptions(raw);
        let library_names = extract_libraries(raw);

        let normalized_message = if exception_types.is_empty() && library_names.is_empty() {
            normalize_text(raw)
        } else {
            normalize_message(message_line(raw))
        };

        Self {
            language_hint: detect_language(raw),
            exception_type: exception_types.first().cloned(),
            exception_types,
            library_names,
            technologies: detect_technologies(raw),
            http_statuses: extract_http_statuses(raw),
            normalized_message,
        }
    }

    /// Parse error text together with a free-text description of what was happening
    pub fn parse_with_context(raw: &str, context: Option<&str>) -> Self {
        let mut signature = Self::parse(raw);
        if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
            for tech in detect_technologies(context) {
                if !signature.technologies.contains(&tech) {
                    signature.technologies.push(tech);
                }
            }
        }
        signature
    }

    /// True when nothing beyond the plain text could be extracted
    pub fn is_degraded(&self) -> bool {
        self.exception_types.is_empty() && self.library_names.is_empty()
    }

    /// Tags implied by the signature, for tag-overlap scoring
    pub fn query_tags(&self) -> BTreeSet<String> {
        let mut tags = BTreeSet::new();
        for name in self.library_names.iter().chain(&self.technologies).chain(&self.exception_types) {
            tags.insert(name.to_lowercase());
        }
        if self.language_hint != Language::Unknown {
            tags.insert(self.language_hint.to_string());
        }
        tags
    }

    /// Text used for lexical scoring
    pub fn query_text(&self) -> String {
        let mut parts = vec![self.normalized_message.clone()];
        parts.extend(self.exception_types.iter().cloned());
        parts.extend(self.library_names.iter().cloned());
        parts.join(" ")
    }

    /// Tokens of [`Self::query_text`]
    pub fn query_tokens(&self) -> Vec<String> {
        tokenize(&self.query_text())
    }
}

fn extract_exceptions(raw: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for cap in EXCEPTION_RE.captures_iter(raw) {
        let name = cap[1].to_string();
        if !found.contains(&name) {
            found.push(name);
        }
    }
    found
}

fn extract_libraries(raw: &str) -> Vec<String> {
    let mut hits: Vec<(usize, String)> = Vec::new();
    for pattern in LIBRARY_PATTERNS.iter() {
        for cap in pattern.captures_iter(raw) {
            if let Some(m) = cap.get(1) {
                if let Some(name) = library_name(m.as_str()) {
                    hits.push((m.start(), name));
                }
            }
        }
    }
    // Position first, then name, so overlapping patterns order deterministically
    hits.sort();

    let mut names: Vec<String> = Vec::new();
    for (_, name) in hits {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn library_name(raw: &str) -> Option<String> {
    let raw = raw.trim().replace('\\', "/");
    if raw.is_empty() || raw.starts_with('.') {
        return None;
    }
    let name = if raw.starts_with('@') || (raw.contains('/') && raw.contains('.')) {
        // Scoped npm packages and Go module paths keep their full path
        raw.to_lowercase()
    } else {
        raw.split(['.', '/']).next().unwrap_or_default().to_lowercase()
    };
    if name.is_empty() || name.ends_with(".py") {
        None
    } else {
        Some(name)
    }
}

fn extract_http_statuses(raw: &str) -> Vec<u16> {
    let mut hits: Vec<(usize, u16)> = Vec::new();
    for pattern in HTTP_STATUS_PATTERNS.iter() {
        for cap in pattern.captures_iter(raw) {
            if let Some(m) = cap.get(1) {
                if let Ok(code) = m.as_str().parse::<u16>() {
                    hits.push((m.start(), code));
                }
            }
        }
    }
    hits.sort();
    let mut codes = Vec::new();
    for (_, code) in hits {
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    codes
}

fn detect_language(raw: &str) -> Language {
    if raw.contains("Traceback (most recent call last)")
        || PY_FRAME_RE.is_match(raw)
        || raw.contains("site-packages")
        || raw.contains("No module named")
    {
        Language::Python
    } else if raw.contains("panicked at") || RUST_FRAME_RE.is_match(raw) {
        Language::Rust
    } else if raw.contains("goroutine ") || GO_FRAME_RE.is_match(raw) {
        Language::Go
    } else if raw.contains("Exception in thread") || JAVA_FRAME_RE.is_match(raw) {
        Language::Java
    } else if raw.contains("node_modules") || JS_FRAME_RE.is_match(raw) {
        Language::JavaScript
    } else {
        Language::Unknown
    }
}

/// The last line carrying an exception message, or the last non-empty line
fn message_line(raw: &str) -> &str {
    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines.iter()
        .rev()
        .find(|l| MESSAGE_LINE_RE.is_match(l))
        .or_else(|| lines.iter().rev().find(|l| EXCEPTION_RE.is_match(l)))
        .or_else(|| lines.last())
        .copied()
        .unwrap_or("")
}

/// Mask volatile fragments so equivalent errors normalize identically
fn normalize_message(line: &str) -> String {
    let masked = HEX_ADDR_RE.replace_all(line, "<addr>");
    let masked = QUOTED_PATH_RE.replace_all(&masked, "<path>");
    let masked = LINE_NO_RE.replace_all(&masked, "line <n>");
    let masked = LONG_NUMBER_RE.replace_all(&masked, "<num>");
    normalize_text(&masked)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY_TRACE: &str = r#"Traceback (most recent call last):
  File "/app/main.py", line 12, in <module>
    from sqlalchemy.ext.asyncio import create_async_engine
  File "/usr/lib/python3.12/site-packages/sqlalchemy/engine/base.py", line 88, in connect
    raise exc
sqlalchemy.exc.OperationalError: (psycopg2.OperationalError) connection to server at 0x7f3a2 refused
"#;

    #[test]
    fn test_parse_python_traceback() {
        let sig = ErrorSignature::parse(PY_TRACE);
        assert_eq!(sig.language_hint, Language::Python);
        assert_eq!(sig.exception_type.as_deref(), Some("OperationalError"));
        assert_eq!(sig.exception_types, vec!["OperationalError"]);
        assert_eq!(sig.library_names.first().map(String::as_str), Some("sqlalchemy"));
        assert!(sig.normalized_message.starts_with("sqlalchemy.exc.operationalerror:"));
        assert!(sig.normalized_message.contains("<addr>"));
    }

    #[test]
    fn test_exceptions_in_first_occurrence_order() {
        let sig = ErrorSignature::parse("KeyError: 'a'\nDuring handling, ValueError raised\nKeyError again");
        assert_eq!(sig.exception_types, vec!["KeyError", "ValueError"]);
        assert_eq!(sig.exception_type.as_deref(), Some("KeyError"));
    }

    #[test]
    fn test_unparseable_degrades_to_normalized_text() {
        let sig = ErrorSignature::parse("  The Deploy   just\nhangs forever ");
        assert!(sig.is_degraded());
        assert_eq!(sig.normalized_message, "the deploy just hangs forever");
        assert!(sig.library_names.is_empty());
        assert!(sig.exception_type.is_none());
        assert_eq!(sig.language_hint, Language::Unknown);
    }

    #[test]
    fn test_never_fails_on_arbitrary_input() {
        let long = "x".repeat(10_000);
        for input in ["", "\0\u{fffd}", "::::", "Error:", "🔥🔥 TypeError 🔥", long.as_str()] {
            let sig = ErrorSignature::parse(input);
            assert_eq!(sig, ErrorSignature::parse(input));
        }
    }

    #[test]
    fn test_node_modules_and_scoped_packages() {
        let raw = "TypeError: Cannot read properties of undefined (reading 'map')\n    at render (/srv/node_modules/@tanstack/react-query/build/index.js:10:5)\n    at /srv/node_modules/express/lib/router.js:4:1";
        let sig = ErrorSignature::parse(raw);
        assert_eq!(sig.language_hint, Language::JavaScript);
        assert_eq!(sig.library_names, vec!["@tanstack/react-query", "express"]);
        assert_eq!(sig.exception_type.as_deref(), Some("TypeError"));
    }

    #[test]
    fn test_missing_module_and_imports() {
        let sig = ErrorSignature::parse("ModuleNotFoundError: No module named 'pydantic.v1'");
        assert_eq!(sig.library_names, vec!["pydantic"]);
        assert_eq!(sig.language_hint, Language::Python);
    }

    #[test]
    fn test_cargo_registry_path() {
        let raw = "thread 'main' panicked at /home/u/.cargo/registry/src/index.crates.io-6f17d22bba15001f/tokio-1.38.0/src/runtime.rs:12:5";
        let sig = ErrorSignature::parse(raw);
        assert_eq!(sig.language_hint, Language::Rust);
        assert_eq!(sig.library_names, vec!["tokio"]);
    }

    #[test]
    fn test_http_statuses_need_context() {
        let sig = ErrorSignature::parse("upstream returned HTTP 503 then 429 Too Many Requests at line 404");
        assert_eq!(sig.http_statuses, vec![503, 429]);
    }

    #[test]
    fn test_context_adds_technologies() {
        let sig = ErrorSignature::parse_with_context(
            "ConnectionRefusedError: [Errno 111] Connection refused",
            Some("deploying fastapi to ECS Fargate"),
        );
        assert_eq!(sig.technologies, vec!["fastapi", "ecs", "fargate"]);
        let tags = sig.query_tags();
        assert!(tags.contains("ecs"));
        assert!(tags.contains("connectionrefusederror"));
    }

    #[test]
    fn test_equivalent_errors_normalize_identically() {
        let a = ErrorSignature::parse("RuntimeError: object at 0xdeadbeef failed on line 12");
        let b = ErrorSignature::parse("RuntimeError: object at 0x1234 failed on line 99");
        assert_eq!(a.normalized_message, b.normalized_message);
    }
}
