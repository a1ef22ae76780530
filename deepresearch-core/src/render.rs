//! Deterministic markdown rendering of research results.
//!
//! The template is fixed and version-stamped in the footer. Rendering is a
//! pure function of the task, the result, and the section toggles.

use crate::types::{ResearchResult, ResearchTask};

/// Template version stamped into the output footer.
pub const TEMPLATE_VERSION: &str = "1.2";

/// Section toggles for rendering.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub include_metadata: bool,
    pub include_sources: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_metadata: true,
            include_sources: true,
        }
    }
}

/// Renders a result (plus its task metadata) into a markdown document.
pub struct ReportRenderer;

impl ReportRenderer {
    /// Render the full document.
    pub fn render(task: &ResearchTask, result: &ResearchResult, options: RenderOptions) -> String {
        let mut out = format!("# {}\n\n", Self::title(&task.query));

        if options.include_metadata {
            out.push_str("## Research Metadata\n\n");
            out.push_str(&format!("- **Task ID:** `{}`\n", task.task_id));
            out.push_str(&format!("- **Status:** {}\n", task.status));
            out.push_str(&format!("- **Model:** {}\n", task.model));
            if let Some(mode) = result.metadata.get("mode").and_then(|v| v.as_str()) {
                out.push_str(&format!("- **Mode:** {mode}\n"));
            }
            out.push_str(&format!(
                "- **Created:** {}\n",
                task.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            if let Some(completed) = task.completed_at {
                out.push_str(&format!(
                    "- **Completed:** {}\n",
                    completed.format("%Y-%m-%d %H:%M:%S UTC")
                ));
            }
            let duration = result
                .metadata
                .get("duration_minutes")
                .and_then(|v| v.as_f64())
                .unwrap_or_else(|| task.elapsed_minutes());
            out.push_str(&format!("- **Duration:** {duration:.1} minutes\n"));
            out.push_str(&format!(
                "- **Tokens:** {} in / {} out\n",
                task.tokens_in, task.tokens_out
            ));
            out.push_str(&format!("- **Cost:** ${:.4}\n", task.cost_usd));
            out.push('\n');
        }

        out.push_str("## Findings\n\n");
        if result.report.is_empty() {
            out.push_str("*No report content was produced.*\n");
        } else {
            out.push_str(&result.report);
            if !result.report.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push('\n');

        if options.include_sources && !result.sources.is_empty() {
            out.push_str("## Sources\n\n");
            for (i, source) in result.sources.iter().enumerate() {
                out.push_str(&format!("{}. **{}**\n", i + 1, source.title));
                if !source.url.is_empty() {
                    out.push_str(&format!("   <{}>\n", source.url));
                }
                if !source.snippet.is_empty() {
                    out.push_str(&format!("   > {}\n", source.snippet));
                }
                out.push_str(&format!(
                    "   relevance: {:.0}%\n",
                    source.relevance_score * 100.0
                ));
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "---\n*Generated by deepresearch (report template v{TEMPLATE_VERSION})*\n"
        ));
        out
    }

    /// Document title: the query, truncated at 80 characters.
    fn title(query: &str) -> String {
        if query.chars().count() > 80 {
            let truncated: String = query.chars().take(77).collect();
            format!("{truncated}...")
        } else {
            query.to_string()
        }
    }

    /// Names of the sections a render call will include, in document order.
    pub fn sections_included(result: &ResearchResult, options: RenderOptions) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if options.include_metadata {
            sections.push("metadata");
        }
        sections.push("findings");
        if options.include_sources && !result.sources.is_empty() {
            sections.push("sources");
        }
        sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Source, TaskStatus};
    use chrono::Utc;

    fn fixture() -> (ResearchTask, ResearchResult) {
        let mut task = ResearchTask::new("How does WAL mode work?", "deep-research-pro", true, 8);
        task.status = TaskStatus::Completed;
        task.progress = 100;
        task.tokens_in = 1200;
        task.tokens_out = 800;
        task.cost_usd = 0.0044;
        task.completed_at = Some(Utc::now());

        let mut result = ResearchResult::new(
            task.task_id,
            "WAL mode appends changes to a write-ahead log.",
            vec![Source {
                title: "SQLite WAL docs".into(),
                url: "https://sqlite.org/wal.html".into(),
                snippet: "Write-ahead logging".into(),
                relevance_score: 0.95,
            }],
        );
        result.metadata = serde_json::json!({
            "duration_minutes": 2.5,
            "mode": "sync",
        });
        (task, result)
    }

    #[test]
    fn test_render_is_deterministic() {
        let (task, result) = fixture();
        let options = RenderOptions::default();
        assert_eq!(
            ReportRenderer::render(&task, &result, options),
            ReportRenderer::render(&task, &result, options)
        );
    }

    #[test]
    fn test_full_render_contains_all_sections() {
        let (task, result) = fixture();
        let doc = ReportRenderer::render(&task, &result, RenderOptions::default());
        assert!(doc.starts_with("# How does WAL mode work?"));
        assert!(doc.contains("## Research Metadata"));
        assert!(doc.contains("- **Mode:** sync"));
        assert!(doc.contains("- **Duration:** 2.5 minutes"));
        assert!(doc.contains("## Findings"));
        assert!(doc.contains("write-ahead log"));
        assert!(doc.contains("## Sources"));
        assert!(doc.contains("<https://sqlite.org/wal.html>"));
        assert!(doc.contains("relevance: 95%"));
        assert!(doc.contains(&format!("template v{TEMPLATE_VERSION}")));
    }

    #[test]
    fn test_toggles_gate_sections() {
        let (task, result) = fixture();
        let doc = ReportRenderer::render(
            &task,
            &result,
            RenderOptions {
                include_metadata: false,
                include_sources: false,
            },
        );
        assert!(!doc.contains("## Research Metadata"));
        assert!(!doc.contains("## Sources"));
        assert!(doc.contains("## Findings"));
        // The footer is unconditional.
        assert!(doc.contains("template v"));
    }

    #[test]
    fn test_empty_report_placeholder() {
        let (task, mut result) = fixture();
        result.report = String::new();
        let doc = ReportRenderer::render(&task, &result, RenderOptions::default());
        assert!(doc.contains("*No report content was produced.*"));
    }

    #[test]
    fn test_long_query_title_truncated() {
        let long = "a".repeat(120);
        let mut task = ResearchTask::new(long, "m", false, 8);
        task.status = TaskStatus::Completed;
        let result = ResearchResult::new(task.task_id, "body", vec![]);
        let doc = ReportRenderer::render(&task, &result, RenderOptions::default());
        let first_line = doc.lines().next().unwrap();
        assert_eq!(first_line.len(), "# ".len() + 80);
        assert!(first_line.ends_with("..."));
    }

    #[test]
    fn test_sections_included() {
        let (_, result) = fixture();
        assert_eq!(
            ReportRenderer::sections_included(&result, RenderOptions::default()),
            vec!["metadata", "findings", "sources"]
        );
        let no_sources = ResearchResult::new(result.task_id, "x", vec![]);
        assert_eq!(
            ReportRenderer::sections_included(&no_sources, RenderOptions::default()),
            vec!["metadata", "findings"]
        );
        assert_eq!(
            ReportRenderer::sections_included(
                &result,
                RenderOptions {
                    include_metadata: false,
                    include_sources: true
                }
            ),
            vec!["findings", "sources"]
        );
    }
}
