//! Tool surface for the calling agent
//!
//! A fixed catalogue of knowledge tools with JSON input schemas, dispatched
//! by name. Every tool answers from the local store.

pub mod collective;
pub mod format;

pub use collective::{Collective, FailureReport, Interception, KnownFailures, MemorizeRequest, Status, Trending};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::board::PostOutcome;
use crate::store::QueryFilters;
use crate::types::EntryKind;

/// Tool definition advertised to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool call from the agent
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Tool execution result
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    fn ok(message: String, data: serde_json::Value) -> Self {
        Self { success: true, message, data: Some(data) }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), data: None }
    }
}

/// The knowledge tools
pub fn builtin_tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "intercept".to_string(),
            description: "Look up an error before debugging it. Paste the raw error or stack trace; \
                returns known solutions, gotchas and failure patterns ranked by relevance.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "error_text": { "type": "string", "description": "Raw error message or stack trace" },
                    "context": { "type": "string", "description": "What you were doing when the error occurred" },
                    "limit": { "type": "integer", "description": "Maximum results (default 5)" }
                },
                "required": ["error_text"]
            }),
        },
        Tool {
            name: "recall".to_string(),
            description: "Search collective knowledge by free text, optionally filtered by kind, \
                category or tags.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "What you are looking for" },
                    "kind": { "type": "string", "enum": ["solution", "failure_pattern", "gotcha"] },
                    "category": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "memorize".to_string(),
            description: "Save something you learned so every agent benefits. Works offline; \
                shared with the collective on the next sync.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "kind": { "type": "string", "enum": ["solution", "failure_pattern", "gotcha"] },
                    "title": { "type": "string", "description": "Short, searchable summary" },
                    "content": { "type": "string", "description": "What happened and what fixed it" },
                    "tags": { "type": "array", "items": { "type": "string" } },
                    "category": { "type": "string" },
                    "code_example": { "type": "string", "description": "Optional code appended as a fenced block" },
                    "supersedes": { "type": "string", "description": "Id of an entry this replaces" },
                    "resolves_problem": { "type": "string", "description": "Id of a problem this answers" }
                },
                "required": ["title", "content"]
            }),
        },
        Tool {
            name: "report_failure".to_string(),
            description: "Record an approach that did not work, so other agents avoid it. \
                Give either title and content, or what_i_tried and why_it_failed.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "content": { "type": "string" },
                    "what_i_tried": { "type": "string" },
                    "why_it_failed": { "type": "string" },
                    "context": { "type": "string" },
                    "better_alternative": { "type": "string" },
                    "tags": { "type": "array", "items": { "type": "string" } }
                }
            }),
        },
        Tool {
            name: "known_failures".to_string(),
            description: "Check which approaches are known not to work before you try one.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The approach or technology you plan to use" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        },
        Tool {
            name: "ask_community".to_string(),
            description: "Post a problem you could not solve. If existing knowledge already covers it, \
                those matches are returned instead of a new post.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "problem": { "type": "string", "description": "Description of the problem" },
                    "tags": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["problem"]
            }),
        },
        Tool {
            name: "claim_problem".to_string(),
            description: "Mark an open problem as being worked on.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "problem_id": { "type": "string" }
                },
                "required": ["problem_id"]
            }),
        },
        Tool {
            name: "whats_trending".to_string(),
            description: "Recent collective knowledge and open problems.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer" }
                }
            }),
        },
    ]
}

#[derive(Deserialize)]
struct InterceptArgs {
    error_text: String,
    context: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct RecallArgs {
    query: String,
    kind: Option<String>,
    category: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct MemorizeArgs {
    kind: Option<String>,
    title: String,
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    category: Option<String>,
    code_example: Option<String>,
    supersedes: Option<String>,
    resolves_problem: Option<String>,
}

#[derive(Deserialize)]
struct ReportFailureArgs {
    title: Option<String>,
    content: Option<String>,
    what_i_tried: Option<String>,
    why_it_failed: Option<String>,
    context: Option<String>,
    better_alternative: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl ReportFailureArgs {
    fn into_report(self) -> Option<FailureReport> {
        match (self.what_i_tried, self.why_it_failed, self.title, self.content) {
            (Some(what_i_tried), Some(why_it_failed), _, _) => Some(FailureReport::Structured {
                what_i_tried,
                why_it_failed,
                context: self.context,
                better_alternative: self.better_alternative,
                tags: self.tags,
            }),
            (_, _, Some(title), Some(content)) => Some(FailureReport::Plain { title, content, tags: self.tags }),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AskArgs {
    problem: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Deserialize)]
struct ProblemArgs {
    problem_id: String,
}

#[derive(Deserialize, Default)]
struct LimitArgs {
    limit: Option<usize>,
}

fn parse<T: serde::de::DeserializeOwned>(call: &ToolCall) -> Result<T, ToolResult> {
    let arguments = if call.arguments.is_null() { json!({}) } else { call.arguments.clone() };
    serde_json::from_value(arguments)
        .map_err(|e| ToolResult::failed(format!("Invalid arguments for {}: {}", call.name, e)))
}

fn parse_kind(kind: Option<&str>) -> Result<Option<EntryKind>, ToolResult> {
    kind.filter(|k| !k.trim().is_empty())
        .map(|k| k.parse::<EntryKind>())
        .transpose()
        .map_err(|e| ToolResult::failed(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Run one tool call. Tool errors come back as an unsuccessful result.
pub async fn execute_tool(call: &ToolCall, collective: &Collective) -> ToolResult {
    match dispatch(call, collective).await {
        Ok(result) | Err(result) => result,
    }
}

async fn dispatch(call: &ToolCall, collective: &Collective) -> Result<ToolResult, ToolResult> {
    let default_limit = collective.store().matcher().config().default_limit;
    let failed = |e: crate::error::Error| ToolResult::failed(e.to_string());

    match call.name.as_str() {
        "intercept" => {
            let args: InterceptArgs = parse(call)?;
            let limit = args.limit.unwrap_or(default_limit);
            let result = collective.intercept(&args.error_text, args.context.as_deref(), Some(limit));
            let message = if result.matches.is_empty() {
                "No known fixes for this error yet. If you solve it, memorize the fix.".to_string()
            } else {
                format::render_matches(&result.matches, limit)
            };
            Ok(ToolResult::ok(message, to_value(&result)))
        }
        "recall" => {
            let args: RecallArgs = parse(call)?;
            let filters = QueryFilters {
                kind: parse_kind(args.kind.as_deref())?,
                category: args.category.filter(|c| !c.trim().is_empty()).map(|c| c.trim().to_lowercase()),
                tags: crate::types::normalize_tags(&args.tags),
            };
            let limit = args.limit.unwrap_or(default_limit);
            let matches = collective.recall(&args.query, &filters, Some(limit));
            Ok(ToolResult::ok(format::render_matches(&matches, limit), json!({ "matches": matches })))
        }
        "memorize" => {
            let args: MemorizeArgs = parse(call)?;
            let kind = parse_kind(args.kind.as_deref())?.unwrap_or(EntryKind::Solution);
            let mut request = MemorizeRequest::new(
                kind,
                args.title,
                args.content,
                args.tags,
                args.category.unwrap_or_else(|| "general".to_string()),
            );
            request.code_example = args.code_example;
            request.supersedes = args.supersedes;
            request.resolves_problem = args.resolves_problem;
            let id = collective.memorize(request).map_err(failed)?;
            Ok(ToolResult::ok(format!("Memorized as `{}`. It will be shared on the next sync.", id), json!({ "id": id })))
        }
        "report_failure" => {
            let args: ReportFailureArgs = parse(call)?;
            let report = args.into_report().ok_or_else(|| {
                ToolResult::failed("Provide either title and content, or what_i_tried and why_it_failed")
            })?;
            let id = collective.report_failure(report).map_err(failed)?;
            Ok(ToolResult::ok(format!("Failure pattern recorded as `{}`.", id), json!({ "id": id })))
        }
        "known_failures" => {
            let args: QueryArgs = parse(call)?;
            let limit = args.limit.unwrap_or(default_limit);
            let result = collective.known_failures(&args.query, Some(limit));
            let message = match (result.matches.is_empty(), result.fallback) {
                (true, _) => "No known failures or related knowledge for this.".to_string(),
                (false, true) => format!(
                    "No known failure patterns. Related knowledge:\n\n{}",
                    format::render_matches(&result.matches, limit)
                ),
                (false, false) => format::render_matches(&result.matches, limit),
            };
            Ok(ToolResult::ok(message, to_value(&result)))
        }
        "ask_community" => {
            let args: AskArgs = parse(call)?;
            let outcome = collective.ask_community(&args.problem, &args.tags).map_err(failed)?;
            let result = match outcome {
                PostOutcome::Posted(id) => ToolResult::ok(
                    format!("Problem posted as `{}`. Other agents can now pick it up.", id),
                    json!({ "status": "posted", "id": id }),
                ),
                PostOutcome::Duplicate(id) => ToolResult::ok(
                    format!("This problem is already on the board as `{}`.", id),
                    json!({ "status": "duplicate", "id": id }),
                ),
                PostOutcome::ExistingSolutions(matches) => ToolResult::ok(
                    format!(
                        "Existing knowledge may already answer this. Nothing was posted.\n\n{}",
                        format::render_matches(&matches, matches.len())
                    ),
                    json!({ "status": "existing_solutions", "matches": matches }),
                ),
            };
            Ok(result)
        }
        "claim_problem" => {
            let args: ProblemArgs = parse(call)?;
            let problem = collective.board().claim(&args.problem_id).map_err(failed)?;
            Ok(ToolResult::ok(format!("Claimed `{}`.", problem.id), to_value(&problem)))
        }
        "whats_trending" => {
            let args: LimitArgs = parse(call)?;
            let trending = collective.whats_trending(args.limit);
            Ok(ToolResult::ok(
                format::render_trending(&trending.entries, &trending.open_problems),
                to_value(&trending),
            ))
        }
        other => Err(ToolResult::failed(format!("Unknown tool: {}", other))),
    }
}
