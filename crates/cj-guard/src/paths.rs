use std::path::{Component, Path, PathBuf};

use tracing::warn;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path escapes project root: {0}")]
    OutsideRoot(PathBuf),
    #[error("path is (or traverses) a symlink: {0}")]
    Symlink(PathBuf),
    #[error("path matches a forbidden pattern: {0}")]
    Forbidden(PathBuf),
    #[error("file exceeds size limit ({size} > {max} bytes): {path}")]
    TooLarge {
        path: PathBuf,
        size: u64,
        max: u64,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// PathPolicy
// ---------------------------------------------------------------------------

/// What the validator refuses to touch, beyond root confinement.
#[derive(Debug, Clone)]
pub struct PathPolicy {
    /// Path fragments that must never be written (credentials, VCS internals).
    pub forbidden_fragments: Vec<String>,
    /// File name patterns that must never be written.
    pub forbidden_names: Vec<String>,
    /// Maximum file size accepted for modification.
    pub max_file_bytes: u64,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            forbidden_fragments: vec![
                ".git/".into(),
                ".hg/".into(),
                ".ssh/".into(),
                ".aws/".into(),
                ".gnupg/".into(),
                "__pycache__/".into(),
            ],
            forbidden_names: vec![
                ".env".into(),
                ".netrc".into(),
                "id_rsa".into(),
                "id_ed25519".into(),
                "credentials".into(),
                "secrets.toml".into(),
                "secrets.yaml".into(),
            ],
            max_file_bytes: 10 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// PathValidator
// ---------------------------------------------------------------------------

/// Confines all write targets to the project root and refuses symlinks,
/// forbidden patterns, and oversized files.
#[derive(Debug, Clone)]
pub struct PathValidator {
    root: PathBuf,
    policy: PathPolicy,
}

impl PathValidator {
    /// Build a validator rooted at `root`. The root itself is canonicalized
    /// once so later checks compare against a stable prefix.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PathError> {
        Self::with_policy(root, PathPolicy::default())
    }

    pub fn with_policy(root: impl Into<PathBuf>, policy: PathPolicy) -> Result<Self, PathError> {
        let root = root.into();
        let root = root.canonicalize().map_err(|e| PathError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(Self { root, policy })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate a path for writing. Returns the normalized absolute path on
    /// success.
    ///
    /// The target itself may not exist yet, so normalization is lexical
    /// (`..` and `.` resolved against the root) while every existing ancestor
    /// is checked for symlinks on disk.
    pub fn validate_write(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let candidate = candidate.as_ref();
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let normalized = lexical_normalize(&absolute);
        if !normalized.starts_with(&self.root) {
            warn!(path = %normalized.display(), "write target escapes project root");
            return Err(PathError::OutsideRoot(normalized));
        }

        self.check_forbidden(&normalized)?;
        self.check_symlinks(&normalized)?;

        if let Ok(meta) = std::fs::symlink_metadata(&normalized) {
            if meta.file_type().is_symlink() {
                warn!(path = %normalized.display(), "write target is a symlink");
                return Err(PathError::Symlink(normalized));
            }
            if meta.len() > self.policy.max_file_bytes {
                return Err(PathError::TooLarge {
                    path: normalized,
                    size: meta.len(),
                    max: self.policy.max_file_bytes,
                });
            }
        }

        Ok(normalized)
    }

    /// Validate a directory used as a subprocess cwd. Must exist, be a real
    /// directory, and live inside the root (the root itself is allowed).
    pub fn validate_cwd(&self, candidate: impl AsRef<Path>) -> Result<PathBuf, PathError> {
        let candidate = candidate.as_ref();
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let resolved = absolute.canonicalize().map_err(|e| PathError::Io {
            path: absolute.clone(),
            source: e,
        })?;
        if !resolved.starts_with(&self.root) {
            return Err(PathError::OutsideRoot(resolved));
        }
        Ok(resolved)
    }

    fn check_forbidden(&self, path: &Path) -> Result<(), PathError> {
        let text = path.to_string_lossy();
        for fragment in &self.policy.forbidden_fragments {
            if text.contains(fragment.as_str()) {
                return Err(PathError::Forbidden(path.to_path_buf()));
            }
        }
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
            for forbidden in &self.policy.forbidden_names {
                if name == *forbidden {
                    return Err(PathError::Forbidden(path.to_path_buf()));
                }
            }
        }
        Ok(())
    }

    /// Walk every existing ancestor between the root and the target; any
    /// symlink on the way is a refusal.
    fn check_symlinks(&self, path: &Path) -> Result<(), PathError> {
        let mut current = self.root.clone();
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return Err(PathError::OutsideRoot(path.to_path_buf()));
        };
        for component in relative.components() {
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(PathError::Symlink(current));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_validator() -> (tempfile::TempDir, PathValidator) {
        let dir = tempfile::tempdir().unwrap();
        let validator = PathValidator::new(dir.path()).unwrap();
        (dir, validator)
    }

    #[test]
    fn accepts_relative_path_inside_root() {
        let (_dir, v) = make_validator();
        let ok = v.validate_write("src/module.py").unwrap();
        assert!(ok.starts_with(v.root()));
    }

    #[test]
    fn rejects_parent_escape() {
        let (_dir, v) = make_validator();
        let err = v.validate_write("../outside.py").unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot(_)));
    }

    #[test]
    fn rejects_absolute_path_outside_root() {
        let (_dir, v) = make_validator();
        let err = v.validate_write("/etc/passwd").unwrap_err();
        assert!(matches!(err, PathError::OutsideRoot(_)));
    }

    #[test]
    fn rejects_git_internals() {
        let (_dir, v) = make_validator();
        let err = v.validate_write(".git/config").unwrap_err();
        assert!(matches!(err, PathError::Forbidden(_)));
    }

    #[test]
    fn rejects_credential_file_names() {
        let (_dir, v) = make_validator();
        for name in [".env", "id_rsa", "secrets.toml"] {
            let err = v.validate_write(name).unwrap_err();
            assert!(matches!(err, PathError::Forbidden(_)), "{name}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_target() {
        let (dir, v) = make_validator();
        let real = dir.path().join("real.py");
        std::fs::write(&real, "x = 1\n").unwrap();
        let link = dir.path().join("link.py");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let err = v.validate_write("link.py").unwrap_err();
        assert!(matches!(err, PathError::Symlink(_)));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlinked_ancestor() {
        let (dir, v) = make_validator();
        let real_dir = dir.path().join("real");
        std::fs::create_dir(&real_dir).unwrap();
        let link_dir = dir.path().join("linked");
        std::os::unix::fs::symlink(&real_dir, &link_dir).unwrap();

        let err = v.validate_write("linked/mod.py").unwrap_err();
        assert!(matches!(err, PathError::Symlink(_)));
    }

    #[test]
    fn rejects_oversized_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy {
            max_file_bytes: 8,
            ..PathPolicy::default()
        };
        let v = PathValidator::with_policy(dir.path(), policy).unwrap();
        std::fs::write(dir.path().join("big.py"), "0123456789abcdef").unwrap();

        let err = v.validate_write("big.py").unwrap_err();
        assert!(matches!(err, PathError::TooLarge { .. }));
    }

    #[test]
    fn validate_cwd_accepts_root() {
        let (dir, v) = make_validator();
        let ok = v.validate_cwd(dir.path()).unwrap();
        assert_eq!(ok, v.root());
    }

    #[test]
    fn validate_cwd_rejects_outside() {
        let (_dir, v) = make_validator();
        let err = v.validate_cwd("/tmp").unwrap_err();
        assert!(matches!(
            err,
            PathError::OutsideRoot(_) | PathError::Io { .. }
        ));
    }

    #[test]
    fn lexical_normalize_resolves_dots() {
        let p = lexical_normalize(Path::new("/a/b/../c/./d"));
        assert_eq!(p, PathBuf::from("/a/c/d"));
    }
}
