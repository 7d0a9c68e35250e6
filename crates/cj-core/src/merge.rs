use toml::Value;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("toml serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ---------------------------------------------------------------------------
// Smart TOML merge
// ---------------------------------------------------------------------------

/// Keys under `[project]` that belong to the user and are never overwritten
/// by a template.
const PROTECTED_PROJECT_KEYS: &[&str] = &["name", "version", "dependencies", "description", "authors"];

/// Keys whose numeric value is a threshold where higher is stricter; a
/// user's stricter setting wins over the template.
const THRESHOLD_KEYS: &[&str] = &["fail_under", "min_coverage", "max_complexity"];

/// Deep-merge a template manifest into the user's manifest.
///
/// - User scalars win everywhere the user set one; template scalars fill
///   gaps.
/// - Under `[project]`, identity keys are preserved verbatim no matter what
///   the template says.
/// - Threshold keys keep whichever side is stricter (numerically higher).
/// - Arrays become the union, user entries first, template entries appended
///   without duplicates.
pub fn smart_merge(user: &str, template: &str) -> Result<String, MergeError> {
    let user_value: Value = toml::from_str(user)?;
    let template_value: Value = toml::from_str(template)?;

    let merged = merge_values(user_value, template_value, &[]);
    Ok(toml::to_string_pretty(&merged)?)
}

fn merge_values(user: Value, template: Value, path: &[&str]) -> Value {
    match (user, template) {
        (Value::Table(user_table), Value::Table(template_table)) => {
            let mut out = user_table.clone();
            for (key, template_entry) in template_table {
                let child_path: Vec<&str> = path.iter().copied().chain([key.as_str()]).collect();
                match user_table.get(&key) {
                    None => {
                        out.insert(key, template_entry);
                    }
                    Some(user_entry) => {
                        if is_protected(&child_path) {
                            debug!(key = %key, "preserving user-set project identity");
                            continue;
                        }
                        let merged = merge_values(
                            user_entry.clone(),
                            template_entry,
                            &child_path,
                        );
                        out.insert(key, merged);
                    }
                }
            }
            Value::Table(out)
        }
        (Value::Array(user_items), Value::Array(template_items)) => {
            let mut out = user_items;
            for item in template_items {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            Value::Array(out)
        }
        // Threshold scalars: stricter (higher) side wins.
        (user_scalar, template_scalar)
            if path
                .last()
                .is_some_and(|k| THRESHOLD_KEYS.contains(k)) =>
        {
            let user_num = scalar_as_f64(&user_scalar);
            let template_num = scalar_as_f64(&template_scalar);
            match (user_num, template_num) {
                (Some(u), Some(t)) if t > u => template_scalar,
                _ => user_scalar,
            }
        }
        // Everything else: user value wins.
        (user_scalar, _) => user_scalar,
    }
}

fn is_protected(path: &[&str]) -> bool {
    path.len() == 2 && path[0] == "project" && PROTECTED_PROJECT_KEYS.contains(&path[1])
}

fn scalar_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Marker-delimited section replacement
// ---------------------------------------------------------------------------

pub const SECTION_START: &str = "<!-- crackerjack:start -->";
pub const SECTION_END: &str = "<!-- crackerjack:end -->";

/// Insert (or replace) the managed section of a documentation/rule file.
///
/// When the sentinel markers are absent the section is appended; when present
/// only the text between them is replaced. Applying the same section twice is
/// a no-op.
pub fn merge_marked_section(existing: &str, section: &str) -> String {
    let start = existing.find(SECTION_START);
    let end = existing.find(SECTION_END);

    match (start, end) {
        (Some(start), Some(end)) if start < end => {
            let before = &existing[..start];
            let after = &existing[end + SECTION_END.len()..];
            format!(
                "{before}{SECTION_START}\n{}\n{SECTION_END}{after}",
                section.trim_end()
            )
        }
        _ => {
            let mut out = existing.trim_end().to_string();
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(SECTION_START);
            out.push('\n');
            out.push_str(section.trim_end());
            out.push('\n');
            out.push_str(SECTION_END);
            out.push('\n');
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Gitignore merge
// ---------------------------------------------------------------------------

pub const GITIGNORE_START: &str = "# crackerjack:start";
pub const GITIGNORE_END: &str = "# crackerjack:end";

/// Merge managed ignore patterns into a `.gitignore`.
///
/// User patterns outside the managed block are preserved byte-for-byte; the
/// block between the crackerjack sentinels is replaced with the deduplicated
/// union of its previous contents and `patterns`. Idempotent.
pub fn merge_gitignore(existing: &str, patterns: &[&str]) -> String {
    let mut user_lines: Vec<&str> = Vec::new();
    let mut managed: Vec<String> = Vec::new();
    let mut in_block = false;

    for line in existing.lines() {
        if line.trim() == GITIGNORE_START {
            in_block = true;
            continue;
        }
        if line.trim() == GITIGNORE_END {
            in_block = false;
            continue;
        }
        if in_block {
            if !line.trim().is_empty() {
                managed.push(line.trim().to_string());
            }
        } else {
            user_lines.push(line);
        }
    }

    for pattern in patterns {
        let pattern = pattern.trim();
        if !pattern.is_empty() && !managed.iter().any(|p| p == pattern) {
            managed.push(pattern.to_string());
        }
    }

    let mut out = user_lines.join("\n").trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(GITIGNORE_START);
    out.push('\n');
    for pattern in &managed {
        out.push_str(pattern);
        out.push('\n');
    }
    out.push_str(GITIGNORE_END);
    out.push('\n');
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_merge_preserves_project_identity() {
        let user = "[project]\nname = \"mytool\"\nversion = \"2.3.4\"\ndependencies = [\"requests\"]\n";
        let template =
            "[project]\nname = \"template\"\nversion = \"0.0.1\"\ndependencies = [\"rich\"]\nrequires-python = \">=3.12\"\n";

        let merged = smart_merge(user, template).unwrap();
        let value: Value = toml::from_str(&merged).unwrap();
        let project = value.get("project").unwrap();
        assert_eq!(project.get("name").unwrap().as_str(), Some("mytool"));
        assert_eq!(project.get("version").unwrap().as_str(), Some("2.3.4"));
        // Identity arrays are untouched, not unioned.
        let deps = project.get("dependencies").unwrap().as_array().unwrap();
        assert_eq!(deps.len(), 1);
        // Template-only keys fill gaps.
        assert_eq!(
            project.get("requires-python").unwrap().as_str(),
            Some(">=3.12")
        );
    }

    #[test]
    fn smart_merge_keeps_stricter_threshold() {
        let user = "[tool.coverage.report]\nfail_under = 85\n";
        let template = "[tool.coverage.report]\nfail_under = 40\n";
        let merged = smart_merge(user, template).unwrap();
        let value: Value = toml::from_str(&merged).unwrap();
        let fail_under = value["tool"]["coverage"]["report"]["fail_under"]
            .as_integer()
            .unwrap();
        assert_eq!(fail_under, 85);
    }

    #[test]
    fn smart_merge_raises_lax_threshold() {
        let user = "[tool.coverage.report]\nfail_under = 40\n";
        let template = "[tool.coverage.report]\nfail_under = 60\n";
        let merged = smart_merge(user, template).unwrap();
        let value: Value = toml::from_str(&merged).unwrap();
        assert_eq!(
            value["tool"]["coverage"]["report"]["fail_under"]
                .as_integer()
                .unwrap(),
            60
        );
    }

    #[test]
    fn smart_merge_unions_marker_arrays() {
        let user = "[tool.pytest.ini_options]\nmarkers = [\"slow\"]\n";
        let template = "[tool.pytest.ini_options]\nmarkers = [\"slow\", \"benchmark\"]\n";
        let merged = smart_merge(user, template).unwrap();
        let value: Value = toml::from_str(&merged).unwrap();
        let markers = value["tool"]["pytest"]["ini_options"]["markers"]
            .as_array()
            .unwrap();
        let markers: Vec<&str> = markers.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(markers, vec!["slow", "benchmark"]);
    }

    #[test]
    fn smart_merge_user_scalar_wins() {
        let user = "[tool.ruff]\nline-length = 100\n";
        let template = "[tool.ruff]\nline-length = 88\ntarget-version = \"py312\"\n";
        let merged = smart_merge(user, template).unwrap();
        let value: Value = toml::from_str(&merged).unwrap();
        assert_eq!(value["tool"]["ruff"]["line-length"].as_integer(), Some(100));
        assert_eq!(
            value["tool"]["ruff"]["target-version"].as_str(),
            Some("py312")
        );
    }

    #[test]
    fn marked_section_appends_when_absent() {
        let out = merge_marked_section("# My Rules\n", "- run checks before commit");
        assert!(out.contains(SECTION_START));
        assert!(out.contains("- run checks before commit"));
        assert!(out.starts_with("# My Rules"));
    }

    #[test]
    fn marked_section_replaces_between_markers() {
        let existing = format!(
            "# Rules\n\n{SECTION_START}\nold content\n{SECTION_END}\n\n# Footer\n"
        );
        let out = merge_marked_section(&existing, "new content");
        assert!(out.contains("new content"));
        assert!(!out.contains("old content"));
        assert!(out.contains("# Footer"));
    }

    #[test]
    fn marked_section_is_idempotent() {
        let once = merge_marked_section("# Rules\n", "managed text");
        let twice = merge_marked_section(&once, "managed text");
        assert_eq!(once, twice);
    }

    #[test]
    fn gitignore_preserves_user_patterns() {
        let existing = "*.swp\n.idea/\n";
        let out = merge_gitignore(existing, &[".crackerjack/", "__pycache__/"]);
        assert!(out.starts_with("*.swp\n.idea/\n"));
        assert!(out.contains(".crackerjack/"));
        assert!(out.contains("__pycache__/"));
    }

    #[test]
    fn gitignore_replaces_managed_block() {
        let existing = format!(
            "*.swp\n\n{GITIGNORE_START}\n.old-pattern/\n{GITIGNORE_END}\n"
        );
        let out = merge_gitignore(&existing, &[".crackerjack/"]);
        // Old managed patterns are kept (union), user lines preserved.
        assert!(out.contains(".old-pattern/"));
        assert!(out.contains(".crackerjack/"));
        assert_eq!(out.matches(GITIGNORE_START).count(), 1);
    }

    #[test]
    fn gitignore_merge_is_idempotent() {
        let patterns = &[".crackerjack/", "*.pyc"];
        let once = merge_gitignore("node_modules/\n", patterns);
        let twice = merge_gitignore(&once, patterns);
        assert_eq!(once, twice);
    }

    #[test]
    fn gitignore_deduplicates_union() {
        let existing = format!("{GITIGNORE_START}\n*.pyc\n{GITIGNORE_END}\n");
        let out = merge_gitignore(&existing, &["*.pyc", "*.pyo"]);
        assert_eq!(out.matches("*.pyc").count(), 1);
        assert!(out.contains("*.pyo"));
    }

    #[test]
    fn gitignore_from_empty_file() {
        let out = merge_gitignore("", &[".crackerjack/"]);
        assert!(out.starts_with(GITIGNORE_START));
        assert!(out.ends_with(&format!("{GITIGNORE_END}\n")));
    }
}
