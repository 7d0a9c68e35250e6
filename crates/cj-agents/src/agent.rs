use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use cj_core::types::{AgentCapability, AgentId, FixResult, Issue};
use cj_guard::file_modifier::{ApplyOptions, SafeFileModifier};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Fix proposer (the external AI seam)
// ---------------------------------------------------------------------------

/// Everything a proposer needs to produce a replacement for one file.
#[derive(Debug, Clone)]
pub struct ProposalRequest {
    pub file: PathBuf,
    pub current_content: String,
    /// The issues the proposal should address, pre-grouped per file.
    pub issues: Vec<Issue>,
    /// Agent-specific guidance (what kind of transformation is wanted).
    pub instructions: String,
}

/// A proposed whole-file replacement.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub new_content: String,
    pub confidence: f64,
}

/// The abstract fix proposer. The transport (model, service, rule engine)
/// lives outside the core; agents only ever see this function shape, and
/// every proposal is validated before it reaches disk.
#[async_trait]
pub trait FixProposer: Send + Sync {
    async fn propose(&self, request: &ProposalRequest) -> Option<Proposal>;
}

/// Proposer that never proposes. The default when no adapter is wired in;
/// proposer-backed agents report failure instead of guessing.
pub struct NullProposer;

#[async_trait]
impl FixProposer for NullProposer {
    async fn propose(&self, _request: &ProposalRequest) -> Option<Proposal> {
        None
    }
}

// ---------------------------------------------------------------------------
// FixContext
// ---------------------------------------------------------------------------

/// Shared handles an agent works with. Agents read only the files named in
/// their issues and write exclusively through the safe modifier.
pub struct FixContext<'a> {
    pub root: &'a Path,
    pub modifier: &'a SafeFileModifier,
    pub proposer: &'a dyn FixProposer,
    pub dry_run: bool,
}

impl FixContext<'_> {
    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            dry_run: self.dry_run,
            backup: true,
        }
    }

    /// Read a file referenced by an issue. Relative paths resolve against
    /// the project root.
    pub async fn read(&self, path: &Path) -> std::io::Result<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        tokio::fs::read_to_string(absolute).await
    }
}

// ---------------------------------------------------------------------------
// FixAgent
// ---------------------------------------------------------------------------

/// The single behavioral surface every specialized fixer implements.
#[async_trait]
pub trait FixAgent: Send + Sync {
    fn id(&self) -> AgentId;
    fn capability(&self) -> AgentCapability;

    /// Attempt the batch. Implementations must leave no partial filesystem
    /// state on failure — the safe modifier's protocol guarantees that per
    /// file, and agents apply whole-file replacements only.
    async fn propose_and_apply(&self, ctx: &FixContext<'_>, issues: &[Issue]) -> FixResult;
}

// ---------------------------------------------------------------------------
// Shared agent plumbing
// ---------------------------------------------------------------------------

/// Group issues by the file they reference; issues without a file are
/// dropped from per-file work (the agent reports them unfixable).
pub fn group_by_file(issues: &[Issue]) -> BTreeMap<PathBuf, Vec<Issue>> {
    let mut groups: BTreeMap<PathBuf, Vec<Issue>> = BTreeMap::new();
    for issue in issues {
        if let Some(file) = &issue.file {
            groups.entry(file.clone()).or_default().push(issue.clone());
        }
    }
    groups
}

/// Run a per-file text transformation over every file an issue batch names,
/// applying results through the safe modifier. The workhorse for agents with
/// deterministic rewrites.
pub async fn apply_transform<F>(
    agent: AgentId,
    confidence: f64,
    ctx: &FixContext<'_>,
    issues: &[Issue],
    transform: F,
) -> FixResult
where
    F: Fn(&str) -> String,
{
    let started = Instant::now();
    let groups = group_by_file(issues);
    if groups.is_empty() {
        return FixResult::failure(agent, issues.to_vec(), "no file context on issues");
    }

    let mut files_touched = Vec::new();
    let mut backups = Vec::new();
    let mut already_clean = 0usize;

    for (file, _file_issues) in &groups {
        let content = match ctx.read(file).await {
            Ok(content) => content,
            Err(e) => {
                warn!(agent = %agent, file = %file.display(), error = %e, "read failed");
                return FixResult::failure(
                    agent,
                    issues.to_vec(),
                    format!("cannot read {}: {e}", file.display()),
                );
            }
        };

        let rewritten = transform(&content);
        if rewritten == content {
            // Nothing to change: the finding is already resolved on disk.
            already_clean += 1;
            continue;
        }

        match ctx
            .modifier
            .apply(file, rewritten.as_bytes(), ctx.apply_options())
            .await
        {
            Ok(outcome) if outcome.changed || (ctx.dry_run && outcome.would_change) => {
                files_touched.push(file.clone());
                if let Some(id) = outcome.backup_id {
                    backups.push(id);
                }
            }
            Ok(_) => already_clean += 1,
            Err(e) => {
                return FixResult::failure(agent, issues.to_vec(), e.to_string());
            }
        }
    }

    let success = !files_touched.is_empty() || already_clean == groups.len();
    debug!(
        agent = %agent,
        files = files_touched.len(),
        already_clean,
        success,
        "transform batch finished"
    );
    FixResult {
        agent,
        success,
        issues: issues.to_vec(),
        confidence,
        files_touched,
        backups,
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

/// Ask the external proposer for a replacement of every file in the batch
/// and apply the accepted ones. The workhorse for agents whose fixes need
/// semantic understanding.
pub async fn apply_proposals(
    agent: AgentId,
    base_confidence: f64,
    ctx: &FixContext<'_>,
    issues: &[Issue],
    instructions: &str,
) -> FixResult {
    let started = Instant::now();
    let groups = group_by_file(issues);
    if groups.is_empty() {
        return FixResult::failure(agent, issues.to_vec(), "no file context on issues");
    }

    let mut files_touched = Vec::new();
    let mut backups = Vec::new();
    let mut confidence: f64 = base_confidence;
    let mut proposed_any = false;

    for (file, file_issues) in &groups {
        let content = match ctx.read(file).await {
            Ok(content) => content,
            Err(e) => {
                return FixResult::failure(
                    agent,
                    issues.to_vec(),
                    format!("cannot read {}: {e}", file.display()),
                );
            }
        };

        let request = ProposalRequest {
            file: file.clone(),
            current_content: content.clone(),
            issues: file_issues.clone(),
            instructions: instructions.to_string(),
        };
        let Some(proposal) = ctx.proposer.propose(&request).await else {
            continue;
        };
        proposed_any = true;
        confidence = confidence.min(proposal.confidence);

        if proposal.new_content == content {
            continue;
        }
        match ctx
            .modifier
            .apply(file, proposal.new_content.as_bytes(), ctx.apply_options())
            .await
        {
            Ok(outcome) if outcome.changed || (ctx.dry_run && outcome.would_change) => {
                files_touched.push(file.clone());
                if let Some(id) = outcome.backup_id {
                    backups.push(id);
                }
            }
            Ok(_) => {}
            Err(e) => {
                // The modifier rolled back; nothing partial remains.
                return FixResult::failure(agent, issues.to_vec(), e.to_string());
            }
        }
    }

    if !proposed_any {
        return FixResult::failure(agent, issues.to_vec(), "proposer offered no fix");
    }

    FixResult {
        agent,
        success: !files_touched.is_empty(),
        issues: issues.to_vec(),
        confidence,
        files_touched,
        backups,
        duration_ms: started.elapsed().as_millis() as u64,
        error: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
