use async_trait::async_trait;
use cj_core::types::{AgentCapability, AgentId, FixResult, Issue, IssueKind};

use crate::agent::{apply_proposals, apply_transform, FixAgent, FixContext};

// ---------------------------------------------------------------------------
// DeadCodeRemoverAgent
// ---------------------------------------------------------------------------

/// Removes unused imports mechanically; anything more structural (unused
/// functions, unreachable branches) goes through the proposer.
pub struct DeadCodeRemoverAgent;

fn is_unused_import(issue: &Issue) -> bool {
    issue.line.is_some()
        && (issue.message.contains("imported but unused")
            || issue.message.contains("unused import"))
}

/// Drop the 1-based `lines` from `content` when they are import lines.
pub(crate) fn remove_import_lines(content: &str, lines: &[u32]) -> String {
    let mut out: Vec<&str> = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line_no = (index + 1) as u32;
        let trimmed = line.trim_start();
        let is_import = trimmed.starts_with("import ") || trimmed.starts_with("from ");
        if lines.contains(&line_no) && is_import {
            continue;
        }
        out.push(line);
    }
    let mut joined = out.join("\n");
    if content.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

#[async_trait]
impl FixAgent for DeadCodeRemoverAgent {
    fn id(&self) -> AgentId {
        AgentId::DeadCodeRemover
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::DeadCodeRemover,
            kinds: vec![(IssueKind::DeadCode, 0.72)],
            batch: true,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        // The mechanical path only when the whole batch is unused imports;
        // mixed batches go to the proposer so line edits cannot fight a
        // larger rewrite of the same file.
        if issues.iter().all(is_unused_import) {
            let lines: Vec<u32> = issues.iter().filter_map(|i| i.line).collect();
            return apply_transform(self.id(), 0.72, ctx, issues, move |content| {
                remove_import_lines(content, &lines)
            })
            .await;
        }
        apply_proposals(
            self.id(),
            0.72,
            ctx,
            issues,
            "Remove the dead code these findings point at. Delete unused \
             functions, variables, and branches; keep all referenced code \
             byte-identical.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// DuplicationRemoverAgent
// ---------------------------------------------------------------------------

/// Consolidates duplicated logic. Always proposer-backed: deciding which
/// copy is canonical needs semantic judgment.
pub struct DuplicationRemoverAgent;

#[async_trait]
impl FixAgent for DuplicationRemoverAgent {
    fn id(&self) -> AgentId {
        AgentId::DuplicationRemover
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::DuplicationRemover,
            kinds: vec![(IssueKind::Duplication, 0.7)],
            batch: false,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        apply_proposals(
            self.id(),
            0.7,
            ctx,
            issues,
            "Extract the duplicated logic these findings identify into a \
             single shared helper and call it from every former copy.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// DocumentationWriterAgent
// ---------------------------------------------------------------------------

/// Adds missing docstrings. A missing module docstring is handled
/// mechanically; function/class documentation needs the proposer.
pub struct DocumentationWriterAgent;

pub(crate) fn has_module_docstring(content: &str) -> bool {
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        return trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''");
    }
    false
}

pub(crate) fn add_module_docstring(content: &str, module_name: &str) -> String {
    if has_module_docstring(content) {
        return content.to_string();
    }
    let docstring = format!("\"\"\"{module_name} module.\"\"\"\n");
    // Keep a shebang line first when present.
    if let Some(rest) = content.strip_prefix("#!") {
        if let Some(newline) = rest.find('\n') {
            let (shebang, body) = content.split_at(2 + newline + 1);
            return format!("{shebang}{docstring}{body}");
        }
    }
    format!("{docstring}{content}")
}

#[async_trait]
impl FixAgent for DocumentationWriterAgent {
    fn id(&self) -> AgentId {
        AgentId::DocumentationWriter
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent: AgentId::DocumentationWriter,
            kinds: vec![(IssueKind::Documentation, 0.75)],
            batch: true,
            collaborative: false,
        }
    }

    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult {
        let module_issues: Vec<&Issue> = issues
            .iter()
            .filter(|i| i.message.to_lowercase().contains("missing docstring"))
            .collect();
        if module_issues.len() == issues.len() {
            return apply_transform(self.id(), 0.75, ctx, issues, |content| {
                add_module_docstring(content, "project")
            })
            .await;
        }
        apply_proposals(
            self.id(),
            0.75,
            ctx,
            issues,
            "Write concise documentation for the symbols these findings \
             flag. Do not change any executable code.",
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_flagged_import_lines() {
        let src = "import os\nimport sys\n\nprint(sys.path)\n";
        let out = remove_import_lines(src, &[1]);
        assert_eq!(out, "import sys\n\nprint(sys.path)\n");
    }

    #[test]
    fn refuses_to_remove_non_import_lines() {
        let src = "import os\nx = 1\n";
        let out = remove_import_lines(src, &[2]);
        assert_eq!(out, src);
    }

    #[test]
    fn removes_multiple_lines_in_one_pass() {
        let src = "import a\nimport b\nimport c\n\nuse(b)\n";
        let out = remove_import_lines(src, &[1, 3]);
        assert_eq!(out, "import b\n\nuse(b)\n");
    }

    #[test]
    fn unused_import_detection() {
        let yes = Issue::new(IssueKind::DeadCode, "ruff-check", "F401 `os` imported but unused")
            .with_line(3);
        let no_line = Issue::new(IssueKind::DeadCode, "ruff-check", "imported but unused");
        let other = Issue::new(IssueKind::DeadCode, "vulture", "unused function 'f'").with_line(9);
        assert!(is_unused_import(&yes));
        assert!(!is_unused_import(&no_line));
        assert!(!is_unused_import(&other));
    }

    #[test]
    fn module_docstring_detection() {
        assert!(has_module_docstring("\"\"\"Doc.\"\"\"\nx = 1\n"));
        assert!(has_module_docstring("# comment\n'''Doc.'''\n"));
        assert!(!has_module_docstring("x = 1\n"));
        assert!(!has_module_docstring(""));
    }

    #[test]
    fn adds_docstring_preserving_shebang() {
        let src = "#!/usr/bin/env python\nx = 1\n";
        let out = add_module_docstring(src, "tool");
        assert!(out.starts_with("#!/usr/bin/env python\n\"\"\"tool module.\"\"\"\n"));
        assert!(out.ends_with("x = 1\n"));
    }

    #[test]
    fn docstring_add_is_idempotent() {
        let once = add_module_docstring("x = 1\n", "tool");
        let twice = add_module_docstring(&once, "tool");
        assert_eq!(once, twice);
    }

    #[test]
    fn duplication_confidence_sits_at_threshold() {
        // Exactly 0.7: the boundary value the coordinator still dispatches.
        assert_eq!(
            DuplicationRemoverAgent
                .capability()
                .confidence_for(IssueKind::Duplication),
            Some(0.7)
        );
    }
}
