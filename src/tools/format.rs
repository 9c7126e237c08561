//! Markdown rendering of tool results

use crate::matching::Match;
use crate::types::{KnowledgeEntry, ProblemRecord};

const CONTENT_PREVIEW: usize = 600;
const MAX_TAGS_SHOWN: usize = 6;

/// Cut long content at a sentence boundary near 600 characters
pub fn preview(content: &str) -> String {
    if content.chars().count() <= CONTENT_PREVIEW {
        return content.to_string();
    }
    let head: String = content.chars().take(CONTENT_PREVIEW).collect();
    match head.rfind(". ") {
        Some(cut) if cut > CONTENT_PREVIEW / 2 => head[..=cut].to_string(),
        _ => format!("{}...", head),
    }
}

fn render_entry(index: usize, entry: &KnowledgeEntry, score: Option<f64>) -> String {
    let mut meta = vec![
        format!("**Kind:** {}", entry.kind),
        format!("**Category:** {}", entry.category),
    ];
    if !entry.tags.is_empty() {
        let tags: Vec<&str> = entry.tags.iter().take(MAX_TAGS_SHOWN).map(String::as_str).collect();
        meta.push(format!("**Tags:** {}", tags.join(", ")));
    }
    if let Some(score) = score {
        meta.push(format!("**Score:** {:.2}", score));
    }
    meta.push(format!("**Id:** `{}`", entry.id));

    format!("### {}. {}\n{}\n\n{}\n", index, entry.title, meta.join(" | "), preview(&entry.content))
}

/// Render ranked matches, showing at most `limit`
pub fn render_matches(matches: &[Match], limit: usize) -> String {
    if matches.is_empty() {
        return "No results found.".to_string();
    }
    let limit = limit.max(1);
    let mut header = format!("Found {} result{}.", matches.len(), if matches.len() == 1 { "" } else { "s" });
    if matches.len() > limit {
        header.push_str(&format!(" Showing top {}.", limit));
    }

    let parts: Vec<String> = matches.iter()
        .take(limit)
        .enumerate()
        .map(|(i, m)| render_entry(i + 1, &m.entry, Some(m.score)))
        .collect();
    format!("{}\n\n{}", header, parts.join("\n---\n\n"))
}

pub fn render_trending(entries: &[KnowledgeEntry], problems: &[ProblemRecord]) -> String {
    let mut sections = Vec::new();
    if !entries.is_empty() {
        let mut lines = vec!["## Trending Knowledge\n".to_string()];
        for (i, entry) in entries.iter().enumerate() {
            lines.push(format!("{}. **{}** ({}, used {}x)", i + 1, entry.title, entry.category, entry.usage_count));
        }
        sections.push(lines.join("\n"));
    }
    if !problems.is_empty() {
        let mut lines = vec!["## Open Problems\n".to_string()];
        for (i, problem) in problems.iter().enumerate() {
            lines.push(format!("{}. **{}** ({}) `{}`", i + 1, problem.text, problem.source, problem.id));
        }
        sections.push(lines.join("\n"));
    }
    if sections.is_empty() {
        return "No trending activity right now. The collective is quiet.".to_string();
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;

    #[test]
    fn test_short_content_untouched() {
        assert_eq!(preview("short. text"), "short. text");
    }

    #[test]
    fn test_cut_at_sentence_boundary() {
        let sentence = "This sentence is padding for the preview. ";
        let content = sentence.repeat(30);
        let cut = preview(&content);
        assert!(cut.ends_with('.'));
        assert!(cut.chars().count() <= CONTENT_PREVIEW);
        assert!(cut.chars().count() > CONTENT_PREVIEW / 2);
    }

    #[test]
    fn test_cut_without_boundary_gets_ellipsis() {
        let content = "x".repeat(1000);
        let cut = preview(&content);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), CONTENT_PREVIEW + 3);
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_matches(&[], 5), "No results found.");
    }

    #[test]
    fn test_render_limits_results() {
        let matches: Vec<Match> = (0..3)
            .map(|i| {
                let mut entry = KnowledgeEntry::draft(EntryKind::Gotcha, format!("entry {}", i), "body", ["t"], "general");
                entry.id = format!("id-{}", i);
                Match { entry, score: 0.5, factors: Default::default() }
            })
            .collect();
        let text = render_matches(&matches, 2);
        assert!(text.starts_with("Found 3 results. Showing top 2."));
        assert!(text.contains("### 2. entry 1"));
        assert!(!text.contains("entry 2"));
    }
}
