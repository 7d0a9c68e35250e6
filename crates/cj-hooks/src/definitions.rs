use crate::parse::ParserKind;

// ---------------------------------------------------------------------------
// HookCategory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookCategory {
    /// Syntactic/stylistic, cheap, usually mutating.
    Fast,
    /// Semantic, expensive, read-only.
    Comprehensive,
}

// ---------------------------------------------------------------------------
// HookDefinition
// ---------------------------------------------------------------------------

/// Static description of one external tool invocation.
#[derive(Debug, Clone)]
pub struct HookDefinition {
    pub id: &'static str,
    pub program: &'static str,
    /// Fixed arguments; relevant file paths are appended when
    /// `takes_files` is set.
    pub args: &'static [&'static str],
    pub takes_files: bool,
    pub category: HookCategory,
    /// File extensions this hook reads (and possibly rewrites).
    pub extensions: &'static [&'static str],
    /// Rewrites files in place (formatters, fixers).
    pub mutates: bool,
    /// Hook ids this hook must never run concurrently with, beyond what the
    /// mutation rules already imply.
    pub conflicts_with: &'static [&'static str],
    pub timeout_secs: u64,
    /// Worth persisting to the disk cache tier.
    pub expensive: bool,
    /// Argv for the version probe (cached per process).
    pub version_args: &'static [&'static str],
    /// Hook-specific cache-busting flag appended when retrying after a
    /// parse failure.
    pub no_cache_flag: Option<&'static str>,
    pub parser: ParserKind,
}

impl HookDefinition {
    /// Whether two hooks may run in the same parallel batch.
    pub fn conflicts(&self, other: &HookDefinition) -> bool {
        if self.conflicts_with.contains(&other.id) || other.conflicts_with.contains(&self.id) {
            return true;
        }
        // A mutating hook excludes anything sharing a file class.
        if (self.mutates || other.mutates) && self.shares_extensions(other) {
            return true;
        }
        false
    }

    fn shares_extensions(&self, other: &HookDefinition) -> bool {
        self.extensions
            .iter()
            .any(|ext| other.extensions.contains(ext))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const PY: &[&str] = &["py"];
const MD: &[&str] = &["md"];
const PY_AND_MD: &[&str] = &["py", "md"];

/// The static hook table. Order here is not execution order; the scheduler
/// derives deterministic batches from the declared conflicts.
pub static HOOKS: &[HookDefinition] = &[
    // -- fast -------------------------------------------------------------
    HookDefinition {
        id: "trailing-whitespace",
        program: "trailing-whitespace-fixer",
        args: &[],
        takes_files: true,
        category: HookCategory::Fast,
        extensions: PY_AND_MD,
        mutates: true,
        conflicts_with: &[],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::FixerSummary,
    },
    HookDefinition {
        id: "end-of-file-fixer",
        program: "end-of-file-fixer",
        args: &[],
        takes_files: true,
        category: HookCategory::Fast,
        extensions: PY_AND_MD,
        mutates: true,
        conflicts_with: &[],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::FixerSummary,
    },
    HookDefinition {
        id: "ruff-format",
        program: "ruff",
        args: &["format"],
        takes_files: false,
        category: HookCategory::Fast,
        extensions: PY,
        mutates: true,
        conflicts_with: &["ruff-check"],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::FixerSummary,
    },
    HookDefinition {
        id: "ruff-check",
        program: "ruff",
        args: &["check", "--output-format", "concise"],
        takes_files: false,
        category: HookCategory::Fast,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: Some("--no-cache"),
        parser: ParserKind::Ruff,
    },
    HookDefinition {
        id: "codespell",
        program: "codespell",
        args: &[],
        takes_files: true,
        category: HookCategory::Fast,
        extensions: PY_AND_MD,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::Codespell,
    },
    HookDefinition {
        id: "mdformat",
        program: "mdformat",
        args: &[],
        takes_files: true,
        category: HookCategory::Fast,
        extensions: MD,
        mutates: true,
        conflicts_with: &[],
        timeout_secs: 60,
        expensive: false,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::FixerSummary,
    },
    // -- comprehensive ----------------------------------------------------
    HookDefinition {
        id: "pyright",
        program: "pyright",
        args: &["--outputjson"],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::PyrightJson,
    },
    HookDefinition {
        id: "bandit",
        program: "bandit",
        args: &["-r", ".", "-f", "json", "-q"],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::BanditJson,
    },
    HookDefinition {
        id: "vulture",
        program: "vulture",
        args: &["."],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::Vulture,
    },
    HookDefinition {
        id: "complexipy",
        program: "complexipy",
        args: &[".", "--max-complexity-allowed", "15"],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::Complexipy,
    },
    HookDefinition {
        id: "refurb",
        program: "refurb",
        args: &["."],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: Some("--no-cache"),
        parser: ParserKind::Refurb,
    },
    HookDefinition {
        id: "creosote",
        program: "creosote",
        args: &[],
        takes_files: false,
        category: HookCategory::Comprehensive,
        extensions: PY,
        mutates: false,
        conflicts_with: &[],
        timeout_secs: 300,
        expensive: true,
        version_args: &["--version"],
        no_cache_flag: None,
        parser: ParserKind::Creosote,
    },
];

pub fn by_category(category: HookCategory) -> Vec<&'static HookDefinition> {
    HOOKS.iter().filter(|h| h.category == category).collect()
}

pub fn by_id(id: &str) -> Option<&'static HookDefinition> {
    HOOKS.iter().find(|h| h.id == id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<&str> = HOOKS.iter().map(|h| h.id).collect();
        ids.sort();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn categories_are_populated() {
        assert!(!by_category(HookCategory::Fast).is_empty());
        assert!(!by_category(HookCategory::Comprehensive).is_empty());
    }

    #[test]
    fn comprehensive_hooks_are_read_only_and_expensive() {
        for hook in by_category(HookCategory::Comprehensive) {
            assert!(!hook.mutates, "{} should not mutate", hook.id);
            assert!(hook.expensive, "{} should be disk-cache eligible", hook.id);
        }
    }

    #[test]
    fn formatter_conflicts_with_linter() {
        let format = by_id("ruff-format").unwrap();
        let check = by_id("ruff-check").unwrap();
        assert!(format.conflicts(check));
        assert!(check.conflicts(format));
    }

    #[test]
    fn mutating_hooks_sharing_extensions_conflict() {
        let ws = by_id("trailing-whitespace").unwrap();
        let eof = by_id("end-of-file-fixer").unwrap();
        assert!(ws.conflicts(eof));
    }

    #[test]
    fn readers_do_not_conflict() {
        let check = by_id("ruff-check").unwrap();
        let spell = by_id("codespell").unwrap();
        assert!(!check.conflicts(spell));
    }

    #[test]
    fn disjoint_extensions_do_not_conflict() {
        let md = by_id("mdformat").unwrap();
        let ruff = by_id("ruff-format").unwrap();
        assert!(!md.conflicts(ruff));
    }

    #[test]
    fn lookup_by_id() {
        assert!(by_id("pyright").is_some());
        assert!(by_id("nonexistent").is_none());
    }
}
