use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use ring::digest;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::HookResult;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Identity of a memoized hook run: the hook, the tool binary's version, and
/// an aggregate hash of every relevant file's content. Any change to any of
/// the three is a miss.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hook_id: String,
    pub tool_version: String,
    pub file_hash: String,
}

impl CacheKey {
    pub fn new(
        hook_id: impl Into<String>,
        tool_version: impl Into<String>,
        file_hash: impl Into<String>,
    ) -> Self {
        Self {
            hook_id: hook_id.into(),
            tool_version: tool_version.into(),
            file_hash: file_hash.into(),
        }
    }

    /// Flattened form used as the memory-tier key and the disk file stem.
    pub fn fingerprint(&self) -> String {
        let joined = format!("{}\n{}\n{}", self.hook_id, self.tool_version, self.file_hash);
        sha256_hex(joined.as_bytes())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let d = digest::digest(&digest::SHA256, bytes);
    d.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Merkle-style aggregate over file contents: per-file digests of
/// (relative path, content) pairs, combined in sorted path order so the
/// result is independent of enumeration order.
pub fn hash_file_set(root: &Path, files: &[PathBuf]) -> String {
    let mut entries: Vec<(String, String)> = files
        .iter()
        .map(|path| {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(path)
                .display()
                .to_string();
            let content_hash = std::fs::read(path)
                .map(|bytes| sha256_hex(&bytes))
                .unwrap_or_else(|_| "unreadable".into());
            (rel, content_hash)
        })
        .collect();
    entries.sort();

    let mut combined = String::new();
    for (rel, hash) in entries {
        combined.push_str(&rel);
        combined.push('\0');
        combined.push_str(&hash);
        combined.push('\n');
    }
    sha256_hex(combined.as_bytes())
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: HookResult,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    fn expired(&self, ttl: Duration) -> bool {
        let age = Utc::now() - self.created_at;
        age.to_std().map(|age| age > ttl).unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Two-tier memoization for hook results.
///
/// The memory tier is a bounded LRU scoped to the process. The disk tier
/// survives runs and is only consulted for hooks declared expensive; writes
/// go through to both tiers. Expired entries are purged lazily on access and
/// eagerly by `sweep`.
pub struct HookCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    disk_dir: Option<PathBuf>,
    ttl: Duration,
}

impl HookCache {
    pub fn new(max_entries: usize, ttl: Duration, disk_dir: Option<PathBuf>) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("nonzero capacity");
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            disk_dir,
            ttl,
        }
    }

    /// In-memory only, default sizing. Used by tests and cheap hooks.
    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(1000, ttl, None)
    }

    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.disk_dir.as_ref().map(|dir| {
            dir.join("hooks")
                .join(&key.hook_id)
                .join(format!("{}.entry", key.fingerprint()))
        })
    }

    /// Look up a result. Disk is only consulted when `expensive` is set.
    /// Hits come back re-tagged `status=Cached`, payload byte-identical.
    pub fn get(&self, key: &CacheKey, expensive: bool) -> Option<HookResult> {
        let fingerprint = key.fingerprint();

        {
            let mut memory = self.memory.lock().expect("cache lock poisoned");
            if let Some(entry) = memory.get(&fingerprint) {
                if entry.expired(self.ttl) {
                    memory.pop(&fingerprint);
                } else {
                    debug!(hook = %key.hook_id, "hook cache hit (memory)");
                    return Some(entry.result.clone().as_cached());
                }
            }
        }

        if !expensive {
            return None;
        }
        let path = self.entry_path(key)?;
        let entry = read_entry(&path)?;
        if entry.key != *key || entry.expired(self.ttl) {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        debug!(hook = %key.hook_id, "hook cache hit (disk)");
        // Promote to the memory tier.
        self.memory
            .lock()
            .expect("cache lock poisoned")
            .put(fingerprint, entry.clone());
        Some(entry.result.as_cached())
    }

    /// Write-through to both tiers. Only passing results are worth
    /// memoizing; failures re-run every time.
    pub fn put(&self, key: CacheKey, result: HookResult) {
        let entry = CacheEntry {
            key: key.clone(),
            result,
            created_at: Utc::now(),
        };

        if let Some(path) = self.entry_path(&key) {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(&path, bytes) {
                        warn!(path = %path.display(), error = %e, "disk cache write failed");
                    }
                }
                Err(e) => warn!(error = %e, "cache entry serialization failed"),
            }
        }

        self.memory
            .lock()
            .expect("cache lock poisoned")
            .put(key.fingerprint(), entry);
    }

    /// Eagerly drop expired entries from both tiers. Returns how many were
    /// removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;

        {
            let mut memory = self.memory.lock().expect("cache lock poisoned");
            let expired: Vec<String> = memory
                .iter()
                .filter(|(_, entry)| entry.expired(self.ttl))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                memory.pop(&key);
                removed += 1;
            }
        }

        if let Some(dir) = &self.disk_dir {
            removed += sweep_disk(&dir.join("hooks"), self.ttl);
        }
        removed
    }

    pub fn memory_len(&self) -> usize {
        self.memory.lock().expect("cache lock poisoned").len()
    }
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache entry removed");
            let _ = std::fs::remove_file(path);
            None
        }
    }
}

fn sweep_disk(dir: &Path, ttl: Duration) -> usize {
    let mut removed = 0;
    let Ok(hooks) = std::fs::read_dir(dir) else {
        return 0;
    };
    for hook_dir in hooks.filter_map(|e| e.ok()) {
        let Ok(entries) = std::fs::read_dir(hook_dir.path()) else {
            continue;
        };
        for file in entries.filter_map(|e| e.ok()) {
            let path = file.path();
            match read_entry(&path) {
                Some(entry) if entry.expired(ttl) => {
                    let _ = std::fs::remove_file(&path);
                    removed += 1;
                }
                Some(_) => {}
                // read_entry already removed corrupt files.
                None => removed += 1,
            }
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
