use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cj_guard::subprocess::{CommandSpec, SubprocessError, SubprocessExecutor};
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
}

// ---------------------------------------------------------------------------
// File categories for commit message generation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeCategory {
    Source,
    Tests,
    Docs,
    Config,
    Dependencies,
    Other,
}

impl ChangeCategory {
    pub fn of(path: &Path) -> Self {
        let text = path.to_string_lossy();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name == "pyproject.toml" || name == "uv.lock" || name == "requirements.txt" {
            return ChangeCategory::Dependencies;
        }
        if text.contains("test") && text.ends_with(".py") {
            return ChangeCategory::Tests;
        }
        if text.ends_with(".py") {
            return ChangeCategory::Source;
        }
        if text.ends_with(".md") || text.ends_with(".rst") {
            return ChangeCategory::Docs;
        }
        if text.ends_with(".toml") || text.ends_with(".yaml") || text.ends_with(".yml") || text.ends_with(".cfg") || text.ends_with(".ini") {
            return ChangeCategory::Config;
        }
        ChangeCategory::Other
    }

    fn label(&self) -> &'static str {
        match self {
            ChangeCategory::Source => "source",
            ChangeCategory::Tests => "tests",
            ChangeCategory::Docs => "docs",
            ChangeCategory::Config => "config",
            ChangeCategory::Dependencies => "dependencies",
            ChangeCategory::Other => "misc",
        }
    }
}

/// Deterministic commit message from the set of changed file categories.
/// Identical change sets always produce identical strings.
pub fn commit_message(changed: &[PathBuf]) -> String {
    if changed.is_empty() {
        return "chore: no changes".into();
    }

    let mut counts: BTreeMap<ChangeCategory, usize> = BTreeMap::new();
    for path in changed {
        *counts.entry(ChangeCategory::of(path)).or_default() += 1;
    }

    let prefix = if counts.len() == 1 {
        match counts.keys().next().unwrap() {
            ChangeCategory::Source => "fix",
            ChangeCategory::Tests => "test",
            ChangeCategory::Docs => "docs",
            ChangeCategory::Config | ChangeCategory::Dependencies => "chore",
            ChangeCategory::Other => "chore",
        }
    } else {
        "chore"
    };

    let parts: Vec<String> = counts
        .iter()
        .map(|(category, count)| format!("{} {} file(s)", count, category.label()))
        .collect();
    format!("{prefix}: update {}", parts.join(", "))
}

// ---------------------------------------------------------------------------
// GitGateway
// ---------------------------------------------------------------------------

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read/write access to the project repository, shelling out to the git CLI
/// through the sanitized executor.
pub struct GitGateway {
    root: PathBuf,
    executor: SubprocessExecutor,
}

impl GitGateway {
    pub fn new(root: impl Into<PathBuf>, executor: SubprocessExecutor) -> Self {
        Self {
            root: root.into(),
            executor,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        let spec = CommandSpec::new("git", &self.root)
            .args(args.iter().map(|s| s.to_string()))
            .timeout(GIT_TIMEOUT);
        let output = self.executor.run(spec).await?;
        if !output.success() {
            return Err(GitError::CommandFailed(format!(
                "git {}: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Whether the project root is inside a git work tree.
    pub async fn is_repo(&self) -> bool {
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn head_commit(&self) -> Result<String, GitError> {
        let out = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Changed (unstaged + untracked) files relative to the work tree.
    pub async fn changed_files(&self) -> Result<Vec<PathBuf>, GitError> {
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&out, false))
    }

    /// Staged files only.
    pub async fn staged_files(&self) -> Result<Vec<PathBuf>, GitError> {
        let out = self.git(&["status", "--porcelain"]).await?;
        Ok(parse_porcelain(&out, true))
    }

    /// Commits on the current branch not yet pushed to its upstream.
    pub async fn unpushed_count(&self) -> Result<usize, GitError> {
        match self.git(&["rev-list", "--count", "@{u}..HEAD"]).await {
            Ok(out) => Ok(out.trim().parse().unwrap_or(0)),
            // No upstream configured: everything local, nothing comparable.
            Err(GitError::CommandFailed(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn add(&self, paths: &[PathBuf]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.display().to_string()));
        let spec = CommandSpec::new("git", &self.root)
            .args(args)
            .timeout(GIT_TIMEOUT);
        let output = self.executor.run(spec).await?;
        if !output.success() {
            return Err(GitError::CommandFailed(output.stderr.trim().to_string()));
        }
        Ok(())
    }

    pub async fn commit(&self, message: &str) -> Result<(), GitError> {
        debug!(message, "committing");
        self.git(&["commit", "-m", message]).await.map(|_| ())
    }

    pub async fn push(&self) -> Result<(), GitError> {
        self.git(&["push"]).await.map(|_| ())
    }
}

/// Parse `git status --porcelain` output. `staged_only` selects entries with
/// an index-side status letter.
fn parse_porcelain(out: &str, staged_only: bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for line in out.lines() {
        if line.len() < 4 {
            continue;
        }
        let (flags, path) = line.split_at(3);
        let mut chars = flags.chars();
        let index_flag = chars.next().unwrap_or(' ');
        let tree_flag = chars.next().unwrap_or(' ');

        let keep = if staged_only {
            index_flag != ' ' && index_flag != '?'
        } else {
            tree_flag != ' ' || index_flag == '?'
        };
        if keep {
            // Rename entries look like "old -> new"; the new path is live.
            let path = path
                .rsplit(" -> ")
                .next()
                .unwrap_or(path)
                .trim()
                .trim_matches('"');
            files.push(PathBuf::from(path));
        }
    }
    files.sort();
    files.dedup();
    files
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
