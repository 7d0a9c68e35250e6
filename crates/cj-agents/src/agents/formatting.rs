use async_trait::async_trait;
use cj_core::types::{AgentCapability, AgentId, FixResult, Issue, IssueKind};

use crate::agent::{apply_transform, FixAgent, FixContext};

// ---------------------------------------------------------------------------
// FormatterAgent
// ---------------------------------------------------------------------------

/// Normalizes whitespace: trailing spaces, final newline, runaway blank
/// lines. Runs in the trailing wave so it cleans up after every other agent.
pub struct FormatterAgent;

/// Trim line-trailing whitespace, collapse 3+ blank lines to 2, end with
/// exactly one newline.
pub(crate) fn normalize_whitespace(content: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut blank_run = 0usize;
    for line in content.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 2 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(trimmed.to_string());
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    if out.is_empty() {
        return String::new();
    }
    out.join("\n") + "\n"
}

#[async_trait]
impl FixAgent for FormatterAgent {
    fn id(&self) -> AgentId {
        AgentId::Formatter
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::Formatter,
            kinds: vec![(IssueKind::Formatting, 0.9)],
            batch: true,
            collaborative: true,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_transform(self.id(), 0.9, ctx, issues, normalize_whitespace).await
    }
}

// ---------------------------------------------------------------------------
// ImportOrganizerAgent
// ---------------------------------------------------------------------------

/// Sorts and deduplicates the leading import block of a module.
pub struct ImportOrganizerAgent;

fn is_import_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("import ") || trimmed.starts_with("from ")
}

/// Sort the first contiguous run of import lines, deduplicating exact
/// repeats. Lines before the block (shebang, docstring, comments) and
/// everything after are untouched.
pub(crate) fn organize_imports(content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();

    let Some(start) = lines.iter().position(|l| is_import_line(l)) else {
        return content.to_string();
    };
    let mut end = start;
    while end < lines.len() && (is_import_line(lines[end]) || lines[end].trim().is_empty()) {
        end += 1;
    }
    // Trailing blanks belong to the code below, not the block.
    while end > start && lines[end - 1].trim().is_empty() {
        end -= 1;
    }

    let mut block: Vec<String> = lines[start..end]
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.trim_end().to_string())
        .collect();
    block.sort();
    block.dedup();

    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    out.extend(lines[..start].iter().map(|l| l.to_string()));
    out.extend(block);
    out.extend(lines[end..].iter().map(|l| l.to_string()));
    let mut joined = out.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[async_trait]
impl FixAgent for ImportOrganizerAgent {
    fn id(&self) -> AgentId {
        AgentId::ImportOrganizer
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::ImportOrganizer,
            kinds: vec![(IssueKind::ImportOrder, 0.8)],
            batch: true,
            collaborative: true,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_transform(self.id(), 0.8, ctx, issues, organize_imports).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_whitespace() {
        let out = normalize_whitespace("x = 1   \ny = 2\t\n");
        assert_eq!(out, "x = 1\ny = 2\n");
    }

    #[test]
    fn normalize_collapses_blank_runs() {
        let out = normalize_whitespace("a = 1\n\n\n\n\nb = 2\n");
        assert_eq!(out, "a = 1\n\n\nb = 2\n");
    }

    #[test]
    fn normalize_single_trailing_newline() {
        let out = normalize_whitespace("x = 1\n\n\n");
        assert_eq!(out, "x = 1\n");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize_whitespace("a = 1  \n\n\n\nb = 2");
        let twice = normalize_whitespace(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn organize_sorts_import_block() {
        let src = "import sys\nimport os\nfrom pathlib import Path\n\nx = 1\n";
        let out = organize_imports(src);
        assert_eq!(
            out,
            "from pathlib import Path\nimport os\nimport sys\n\nx = 1\n"
        );
    }

    #[test]
    fn organize_deduplicates() {
        let src = "import os\nimport os\n\nx = 1\n";
        let out = organize_imports(src);
        assert_eq!(out, "import os\n\nx = 1\n");
    }

    #[test]
    fn organize_preserves_preamble() {
        let src = "#!/usr/bin/env python\n\"\"\"Module doc.\"\"\"\nimport sys\nimport os\n\nx = 1\n";
        let out = organize_imports(src);
        assert!(out.starts_with("#!/usr/bin/env python\n\"\"\"Module doc.\"\"\"\n"));
        assert!(out.contains("import os\nimport sys"));
    }

    #[test]
    fn organize_no_imports_is_noop() {
        let src = "x = 1\ny = 2\n";
        assert_eq!(organize_imports(src), src);
    }

    #[test]
    fn organize_is_idempotent() {
        let src = "import sys\nimport os\n\nx = 1\n";
        let once = organize_imports(src);
        let twice = organize_imports(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn capabilities_declare_expected_kinds() {
        assert_eq!(
            FormatterAgent.capability().confidence_for(IssueKind::Formatting),
            Some(0.9)
        );
        assert_eq!(
            ImportOrganizerAgent
                .capability()
                .confidence_for(IssueKind::ImportOrder),
            Some(0.8)
        );
    }
}
