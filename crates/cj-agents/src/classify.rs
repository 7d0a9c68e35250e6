use cj_core::types::{HookResult, Issue, IssueKind, Severity, TestResult};
use cj_hooks::parse::explicit_severity;
use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// One classification rule. Rules are ordered most-specific first; the first
/// match wins, and message rules outrank tool-default rules.
struct Rule {
    /// Restrict to a tool id; `None` matches any tool.
    tool: Option<&'static str>,
    /// Pattern over the issue message; `None` matches any message.
    message: Option<&'static str>,
    kind: IssueKind,
}

/// Compiled rule table, most specific first. Rule order is the tie-break:
/// a tool+message rule beats a message rule beats a tool default.
fn rules() -> &'static [(Option<&'static str>, Option<Regex>, IssueKind)] {
    static RULES: OnceLock<Vec<(Option<&'static str>, Option<Regex>, IssueKind)>> =
        OnceLock::new();
    RULES.get_or_init(|| {
        let raw: Vec<Rule> = vec![
            // Tool + message (most specific).
            Rule {
                tool: Some("ruff-check"),
                message: Some(r"\bI\d{3}\b|import block|unsorted"),
                kind: IssueKind::ImportOrder,
            },
            Rule {
                tool: Some("ruff-check"),
                message: Some(r"imported but unused|\bF401\b|unused variable|\bF841\b"),
                kind: IssueKind::DeadCode,
            },
            Rule {
                tool: Some("ruff-check"),
                message: Some(r"\bC901\b|too complex"),
                kind: IssueKind::Complexity,
            },
            Rule {
                tool: Some("ruff-check"),
                message: Some(r"\bS\d{3}\b"),
                kind: IssueKind::Security,
            },
            // Message-only rules.
            Rule {
                tool: None,
                message: Some(r"(?i)tool `.+` not found|command not found|No module named"),
                kind: IssueKind::Dependency,
            },
            Rule {
                tool: None,
                message: Some(r"(?i)cognitive complexity|cyclomatic"),
                kind: IssueKind::Complexity,
            },
            Rule {
                tool: None,
                message: Some(r"(?i)missing docstring|undocumented"),
                kind: IssueKind::Documentation,
            },
            Rule {
                tool: None,
                message: Some(r"(?i)duplicate|duplicated code"),
                kind: IssueKind::Duplication,
            },
            // Tool defaults.
            Rule {
                tool: Some("pyright"),
                message: None,
                kind: IssueKind::TypeError,
            },
            Rule {
                tool: Some("bandit"),
                message: None,
                kind: IssueKind::Security,
            },
            Rule {
                tool: Some("vulture"),
                message: None,
                kind: IssueKind::DeadCode,
            },
            Rule {
                tool: Some("complexipy"),
                message: None,
                kind: IssueKind::Complexity,
            },
            Rule {
                tool: Some("refurb"),
                message: None,
                kind: IssueKind::Performance,
            },
            Rule {
                tool: Some("creosote"),
                message: None,
                kind: IssueKind::Dependency,
            },
            Rule {
                tool: Some("codespell"),
                message: None,
                kind: IssueKind::Documentation,
            },
            Rule {
                tool: Some("ruff-check"),
                message: None,
                kind: IssueKind::Formatting,
            },
            Rule {
                tool: Some("ruff-format"),
                message: None,
                kind: IssueKind::Formatting,
            },
            Rule {
                tool: Some("trailing-whitespace"),
                message: None,
                kind: IssueKind::Formatting,
            },
            Rule {
                tool: Some("end-of-file-fixer"),
                message: None,
                kind: IssueKind::Formatting,
            },
            Rule {
                tool: Some("mdformat"),
                message: None,
                kind: IssueKind::Formatting,
            },
            Rule {
                tool: Some("pytest"),
                message: None,
                kind: IssueKind::TestFailure,
            },
        ];
        raw.into_iter()
            .map(|rule| {
                let pattern = rule
                    .message
                    .map(|p| Regex::new(p).expect("static classifier pattern"));
                (rule.tool, pattern, rule.kind)
            })
            .collect()
    })
}

/// Default severity per kind; explicit markers in the tool output override.
pub fn default_severity(kind: IssueKind) -> Severity {
    match kind {
        IssueKind::Security => Severity::High,
        IssueKind::TypeError => Severity::High,
        IssueKind::TestFailure => Severity::High,
        IssueKind::CoverageRegression => Severity::Critical,
        IssueKind::Complexity => Severity::Medium,
        IssueKind::Performance => Severity::Medium,
        IssueKind::Duplication => Severity::Medium,
        IssueKind::Dependency => Severity::Medium,
        IssueKind::DeadCode => Severity::Low,
        IssueKind::Formatting => Severity::Low,
        IssueKind::ImportOrder => Severity::Low,
        IssueKind::Documentation => Severity::Low,
        IssueKind::Unknown => Severity::Low,
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Assign a kind to one raw issue. Pure; deterministic for identical input.
fn classify_issue(issue: &Issue) -> IssueKind {
    // Already-typed issues (e.g. engine-made dependency findings) pass
    // through untouched.
    if issue.kind != IssueKind::Unknown {
        return issue.kind;
    }
    for (tool, pattern, kind) in rules() {
        if let Some(tool) = tool {
            if issue.tool != *tool {
                continue;
            }
        }
        if let Some(pattern) = pattern {
            if !pattern.is_match(&issue.message) {
                continue;
            }
        }
        return *kind;
    }
    IssueKind::Unknown
}

/// Normalize one hook's raw issues into typed issues with severities.
pub fn classify_hook_result(result: &HookResult) -> Vec<Issue> {
    result
        .issues
        .iter()
        .map(|raw| {
            let kind = classify_issue(raw);
            let severity = raw
                .excerpt
                .as_deref()
                .and_then(explicit_severity)
                .unwrap_or_else(|| default_severity(kind));
            let mut issue = raw.clone();
            issue.kind = kind;
            issue.severity = severity;
            issue
        })
        .collect()
}

/// Turn a test run's failure records into typed issues.
pub fn classify_test_result(result: &TestResult) -> Vec<Issue> {
    result
        .failures
        .iter()
        .map(|failure| {
            let mut issue = Issue::new(
                IssueKind::TestFailure,
                "pytest",
                format!("{} failed: {}", failure.test_id, failure.message),
            )
            .with_severity(default_severity(IssueKind::TestFailure))
            .with_excerpt(truncate(&failure.traceback, 2000));
            // `tests/test_mod.py::test_case` — the file part locates the
            // failing test on disk.
            if let Some(file) = failure.test_id.split("::").next() {
                issue = issue.with_file(file);
            }
            issue
        })
        .collect()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
