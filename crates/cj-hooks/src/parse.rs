use cj_core::types::{Issue, IssueKind, Severity};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed json from tool: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected tool output: {0}")]
    Unexpected(String),
}

// ---------------------------------------------------------------------------
// ParserKind
// ---------------------------------------------------------------------------

/// Selects the output parser a hook definition carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    /// In-place fixers: issues are the files they rewrote.
    FixerSummary,
    Ruff,
    Codespell,
    PyrightJson,
    BanditJson,
    Vulture,
    Complexipy,
    Refurb,
    Creosote,
}

/// Parse one hook's captured output into issues.
///
/// Parsers are fail-soft at the call site: an `Err` here makes the engine
/// mark the hook failed with the raw output preserved and an *empty* issue
/// list — partial parses never leak phantom issues.
pub fn parse(
    kind: ParserKind,
    tool_id: &str,
    stdout: &str,
    stderr: &str,
) -> Result<Vec<Issue>, ParseError> {
    let stdout = strip_ansi(stdout);
    let stderr = strip_ansi(stderr);
    match kind {
        ParserKind::FixerSummary => Ok(parse_fixer(tool_id, &stdout, &stderr)),
        ParserKind::Ruff => Ok(parse_ruff(tool_id, &stdout)),
        ParserKind::Codespell => Ok(parse_codespell(tool_id, &stdout)),
        ParserKind::PyrightJson => parse_pyright(tool_id, &stdout),
        ParserKind::BanditJson => parse_bandit(tool_id, &stdout),
        ParserKind::Vulture => Ok(parse_vulture(tool_id, &stdout)),
        ParserKind::Complexipy => Ok(parse_complexipy(tool_id, &stdout)),
        ParserKind::Refurb => Ok(parse_refurb(tool_id, &stdout)),
        ParserKind::Creosote => Ok(parse_creosote(tool_id, &stdout, &stderr)),
    }
}

// ---------------------------------------------------------------------------
// ANSI / encoding hygiene
// ---------------------------------------------------------------------------

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi pattern"))
}

/// Remove terminal escape sequences; tool output is matched on plain text.
pub fn strip_ansi(text: &str) -> String {
    ansi_re().replace_all(text, "").into_owned()
}

// ---------------------------------------------------------------------------
// Line parsers
// ---------------------------------------------------------------------------

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<file>[^:\s][^:]*\.(?:py|md|pyi)):(?P<line>\d+)(?::(?P<col>\d+))?:?\s*(?P<rest>.*)$")
            .expect("location pattern")
    })
}

fn parse_fixer(tool: &str, stdout: &str, stderr: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        let line = line.trim();
        if let Some(path) = line.strip_prefix("Fixing ") {
            issues.push(
                Issue::new(IssueKind::Unknown, tool, "file rewritten by fixer")
                    .with_file(path.trim())
                    .with_excerpt(line),
            );
            continue;
        }
        // e.g. "2 files reformatted, 10 files left unchanged"
        if let Some(captures) = reformatted_re().captures(line) {
            let count: u32 = captures["count"].parse().unwrap_or(0);
            if count > 0 {
                issues.push(
                    Issue::new(
                        IssueKind::Unknown,
                        tool,
                        format!("{count} file(s) reformatted"),
                    )
                    .with_excerpt(line),
                );
            }
        }
    }
    issues
}

fn reformatted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<count>\d+) files? reformatted").expect("reformat pattern"))
}

/// Concise ruff lines: `path.py:10:5: E501 [*] line too long`.
fn parse_ruff(tool: &str, stdout: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let Some(captures) = location_re().captures(line.trim()) else {
            continue;
        };
        let rest = captures["rest"].trim();
        if rest.is_empty() {
            continue;
        }
        issues.push(
            Issue::new(IssueKind::Unknown, tool, rest)
                .with_file(&captures["file"])
                .with_line(captures["line"].parse().unwrap_or(0))
                .with_excerpt(line.trim()),
        );
    }
    issues
}

/// `path.py:3: recieve ==> receive`
fn parse_codespell(tool: &str, stdout: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.contains("==>") {
            continue;
        }
        if let Some(captures) = location_re().captures(line) {
            issues.push(
                Issue::new(IssueKind::Unknown, tool, captures["rest"].trim())
                    .with_file(&captures["file"])
                    .with_line(captures["line"].parse().unwrap_or(0))
                    .with_excerpt(line),
            );
        }
    }
    issues
}

#[derive(Deserialize)]
struct PyrightOutput {
    #[serde(rename = "generalDiagnostics", default)]
    diagnostics: Vec<PyrightDiagnostic>,
}

#[derive(Deserialize)]
struct PyrightDiagnostic {
    file: String,
    severity: String,
    message: String,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    range: Option<PyrightRange>,
}

#[derive(Deserialize)]
struct PyrightRange {
    start: PyrightPosition,
}

#[derive(Deserialize)]
struct PyrightPosition {
    line: u32,
}

fn parse_pyright(tool: &str, stdout: &str) -> Result<Vec<Issue>, ParseError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output: PyrightOutput = serde_json::from_str(stdout.trim())?;
    Ok(output
        .diagnostics
        .into_iter()
        .filter(|d| d.severity == "error" || d.severity == "warning")
        .map(|d| {
            let message = match &d.rule {
                Some(rule) => format!("{} [{}]", d.message, rule),
                None => d.message.clone(),
            };
            let mut issue = Issue::new(IssueKind::Unknown, tool, message)
                .with_file(&d.file)
                .with_excerpt(format!("{}: {}", d.severity, d.message));
            if let Some(range) = d.range {
                // Pyright reports zero-based lines.
                issue = issue.with_line(range.start.line + 1);
            }
            issue
        })
        .collect())
}

#[derive(Deserialize)]
struct BanditOutput {
    #[serde(default)]
    results: Vec<BanditResult>,
}

#[derive(Deserialize)]
struct BanditResult {
    filename: String,
    line_number: u32,
    issue_severity: String,
    issue_text: String,
    test_id: String,
}

fn parse_bandit(tool: &str, stdout: &str) -> Result<Vec<Issue>, ParseError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output: BanditOutput = serde_json::from_str(stdout.trim())?;
    Ok(output
        .results
        .into_iter()
        .map(|r| {
            Issue::new(
                IssueKind::Unknown,
                tool,
                format!("{} [{}]", r.issue_text, r.test_id),
            )
            .with_file(&r.filename)
            .with_line(r.line_number)
            .with_excerpt(format!("severity {}: {}", r.issue_severity, r.issue_text))
        })
        .collect())
}

/// `path.py:12: unused function 'legacy_handler' (60% confidence)`
fn parse_vulture(tool: &str, stdout: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.contains("unused") {
            continue;
        }
        if let Some(captures) = location_re().captures(line) {
            issues.push(
                Issue::new(IssueKind::Unknown, tool, captures["rest"].trim())
                    .with_file(&captures["file"])
                    .with_line(captures["line"].parse().unwrap_or(0))
                    .with_excerpt(line),
            );
        }
    }
    issues
}

fn complexipy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<file>[\w./\-]+\.py)\W+(?P<func>[A-Za-z_][\w]*)\W+(?P<score>\d+)\s*$")
            .expect("complexipy pattern")
    })
}

/// Table rows naming a file, a function, and its cognitive complexity.
fn parse_complexipy(tool: &str, stdout: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let Some(captures) = complexipy_re().captures(line) else {
            continue;
        };
        let score: u32 = captures["score"].parse().unwrap_or(0);
        issues.push(
            Issue::new(
                IssueKind::Unknown,
                tool,
                format!(
                    "function `{}` has cognitive complexity {score}",
                    &captures["func"]
                ),
            )
            .with_file(&captures["file"])
            .with_excerpt(line.trim()),
        );
    }
    issues
}

/// `path.py:22:5 [FURB109]: Replace `in [x, y]` with `in (x, y)``
fn parse_refurb(tool: &str, stdout: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.contains("[FURB") {
            continue;
        }
        if let Some(captures) = location_re().captures(line) {
            issues.push(
                Issue::new(IssueKind::Unknown, tool, captures["rest"].trim())
                    .with_file(&captures["file"])
                    .with_line(captures["line"].parse().unwrap_or(0))
                    .with_excerpt(line),
            );
        }
    }
    issues
}

/// Unused-dependency listing, one `- package` bullet per finding.
fn parse_creosote(tool: &str, stdout: &str, stderr: &str) -> Vec<Issue> {
    let mut issues = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        let line = line.trim();
        if let Some(package) = line.strip_prefix("- ") {
            let package = package.trim();
            if !package.is_empty() {
                issues.push(
                    Issue::new(
                        IssueKind::Unknown,
                        tool,
                        format!("dependency `{package}` appears unused"),
                    )
                    .with_excerpt(line),
                );
            }
        }
    }
    issues
}

// ---------------------------------------------------------------------------
// Severity markers
// ---------------------------------------------------------------------------

/// Explicit severity markers embedded in tool output override the per-kind
/// default during classification.
pub fn explicit_severity(excerpt: &str) -> Option<Severity> {
    let lower = excerpt.to_lowercase();
    if lower.contains("severity high") || lower.contains("critical") {
        Some(Severity::Critical)
    } else if lower.contains("severity medium") || lower.contains("error:") {
        Some(Severity::High)
    } else if lower.contains("severity low") {
        Some(Severity::Low)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
