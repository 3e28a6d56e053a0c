//! Pattern store
//!
//! Loads builtin patterns from an embedded resource, user patterns and
//! learned patterns from the project's `.actlens/patterns/` directory, and
//! keeps them indexed in memory behind a readers-writer lock. Writers bump a
//! version counter; readers take an immutable snapshot for the lifetime of
//! their request.
//!
//! # Error Handling
//!
//! A corrupt user or learned file is logged and skipped so the engine still
//! starts with builtins. Writes hit the disk first and only then mutate
//! in-memory state, so a failed write never leaves the index inconsistent.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::patterns::{Pattern, PatternCategory, PatternFile, PatternSource};

const PATTERNS_DIR: &str = ".actlens/patterns";
const USER_FILE: &str = "user_patterns.json";
const LEARNED_FILE: &str = "learned_patterns.json";
const STATS_FILE: &str = "stats.json";
const LOCK_FILE: &str = ".lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

const BUILTIN_PATTERNS: &str = include_str!("builtin.json");

/// Running statistics persisted separately so builtin patterns (which live
/// in the binary) keep their history across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatEntry {
    success_rate: f64,
    occurrence_count: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsFile {
    #[serde(default)]
    stats: HashMap<String, StatEntry>,
}

struct Inner {
    patterns: HashMap<String, Pattern>,
    version: u64,
}

/// Immutable view handed to readers. Patterns are sorted by id so iteration
/// order is deterministic.
#[derive(Clone)]
pub struct PatternSnapshot {
    patterns: Arc<Vec<Pattern>>,
    version: u64,
}

impl PatternSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn all_enabled(&self, category: Option<PatternCategory>) -> Vec<&Pattern> {
        self.patterns
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| category.map(|c| p.category == c).unwrap_or(true))
            .collect()
    }

    pub fn by_id(&self, id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

pub struct PatternStore {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

struct StoreLock {
    file: std::fs::File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl PatternStore {
    /// Load builtin + user + learned patterns for a project. Never fails on
    /// bad user data; the builtin set is the floor.
    pub fn open(project_root: &Path) -> Result<Self> {
        let dir = project_root.join(PATTERNS_DIR);
        let mut patterns: HashMap<String, Pattern> = HashMap::new();

        let mut insert = |pattern: Pattern| {
            if let Err(err) = pattern.validate() {
                tracing::warn!("skipping invalid pattern: {err}");
                return;
            }
            match patterns.get(&pattern.id) {
                Some(existing)
                    if existing.source.precedence() >= pattern.source.precedence() =>
                {
                    tracing::debug!(
                        "pattern id {} from {} shadowed by {}",
                        pattern.id,
                        pattern.source.as_str(),
                        existing.source.as_str()
                    );
                }
                _ => {
                    patterns.insert(pattern.id.clone(), pattern);
                }
            }
        };

        let builtin: PatternFile = serde_json::from_str(BUILTIN_PATTERNS)
            .map_err(|e| Error::config(format!("embedded pattern set is invalid: {e}")))?;
        for mut pattern in builtin.patterns {
            pattern.source = PatternSource::Builtin;
            insert(pattern);
        }

        for (file, source) in [
            (LEARNED_FILE, PatternSource::Learned),
            (USER_FILE, PatternSource::User),
        ] {
            let path = dir.join(file);
            if !path.exists() {
                continue;
            }
            match load_pattern_file(&path) {
                Ok(parsed) => {
                    for mut pattern in parsed.patterns {
                        pattern.source = source;
                        insert(pattern);
                    }
                }
                Err(err) => {
                    tracing::warn!("skipping corrupt pattern file {}: {err}", path.display());
                }
            }
        }

        // Apply persisted statistics over whatever won precedence.
        if let Ok(content) = fs::read_to_string(dir.join(STATS_FILE)) {
            if let Ok(stats) = serde_json::from_str::<StatsFile>(&content) {
                for (id, entry) in stats.stats {
                    if let Some(pattern) = patterns.get_mut(&id) {
                        pattern.success_rate = entry.success_rate.clamp(0.0, 1.0);
                        pattern.occurrence_count = entry.occurrence_count;
                        pattern.updated_at = entry.updated_at;
                    }
                }
            }
        }

        let version = initial_version(&patterns);
        tracing::info!("pattern store loaded: {} patterns", patterns.len());
        Ok(Self {
            dir,
            inner: RwLock::new(Inner { patterns, version }),
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("pattern store lock").version
    }

    /// Consistent view for the duration of one request.
    pub fn snapshot(&self) -> PatternSnapshot {
        let inner = self.inner.read().expect("pattern store lock");
        let mut patterns: Vec<Pattern> = inner.patterns.values().cloned().collect();
        patterns.sort_by(|a, b| a.id.cmp(&b.id));
        PatternSnapshot {
            patterns: Arc::new(patterns),
            version: inner.version,
        }
    }

    pub fn all_enabled(&self, category: Option<PatternCategory>) -> Vec<Pattern> {
        let inner = self.inner.read().expect("pattern store lock");
        let mut out: Vec<Pattern> = inner
            .patterns
            .values()
            .filter(|p| p.enabled)
            .filter(|p| category.map(|c| p.category == c).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn by_id(&self, id: &str) -> Option<Pattern> {
        self.inner
            .read()
            .expect("pattern store lock")
            .patterns
            .get(id)
            .cloned()
    }

    /// Add or replace a learned pattern. The learned file is rewritten on
    /// disk first; memory and version only change after the write lands.
    pub fn upsert_learned(&self, mut pattern: Pattern) -> Result<()> {
        pattern.source = PatternSource::Learned;
        pattern.validate()?;

        let _lock = self.file_lock()?;
        let path = self.dir.join(LEARNED_FILE);
        let mut file = if path.exists() {
            load_pattern_file(&path).unwrap_or_default()
        } else {
            PatternFile::default()
        };
        file.patterns.retain(|p| p.id != pattern.id);
        file.patterns.push(pattern.clone());
        file.patterns.sort_by(|a, b| a.id.cmp(&b.id));
        write_atomic(&path, &file.to_pretty_json()?)?;

        let mut inner = self.inner.write().expect("pattern store lock");
        // User patterns keep precedence even over a fresh learned upsert.
        let shadowed = inner
            .patterns
            .get(&pattern.id)
            .map(|existing| existing.source.precedence() > PatternSource::Learned.precedence())
            .unwrap_or(false);
        if !shadowed {
            inner.patterns.insert(pattern.id.clone(), pattern);
        }
        inner.version += 1;
        Ok(())
    }

    /// Fold one outcome into a pattern's statistics with decay `alpha`.
    /// Returns the new success rate.
    pub fn update_stats(&self, id: &str, success: bool, alpha: f64) -> Result<f64> {
        let (new_rate, new_count, updated_at) = {
            let inner = self.inner.read().expect("pattern store lock");
            let pattern = inner
                .patterns
                .get(id)
                .ok_or_else(|| Error::validation("pattern", format!("unknown id: {id}")))?;
            let observed = if success { 1.0 } else { 0.0 };
            let rate =
                ((1.0 - alpha) * pattern.success_rate + alpha * observed).clamp(0.1, 1.0);
            (rate, pattern.occurrence_count + 1, Utc::now())
        };

        // Persist first; in-memory state stays untouched on a failed write.
        let _lock = self.file_lock()?;
        let path = self.dir.join(STATS_FILE);
        let mut stats: StatsFile = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        stats.stats.insert(
            id.to_string(),
            StatEntry {
                success_rate: new_rate,
                occurrence_count: new_count,
                updated_at,
            },
        );
        let rendered = serde_json::to_string_pretty(&stats)
            .map_err(|e| Error::validation("stats file", format!("serialize failed: {e}")))?;
        write_atomic(&path, &rendered)?;

        let mut inner = self.inner.write().expect("pattern store lock");
        if let Some(pattern) = inner.patterns.get_mut(id) {
            pattern.success_rate = new_rate;
            pattern.occurrence_count = new_count;
            pattern.updated_at = updated_at;
        }
        inner.version += 1;
        Ok(new_rate)
    }

    /// Disable a pattern whose regexes stopped compiling at runtime.
    pub fn quarantine(&self, id: &str, reason: &str) {
        let mut inner = self.inner.write().expect("pattern store lock");
        if let Some(pattern) = inner.patterns.get_mut(id) {
            pattern.enabled = false;
            pattern.disabled_reason = Some(reason.to_string());
            inner.version += 1;
            tracing::warn!("pattern {id} quarantined: {reason}");
        }
    }

    fn file_lock(&self) -> Result<StoreLock> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::io("creating pattern directory", e))?;
        let lock_path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io("opening pattern store lock", e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(Error::io("locking pattern store", err));
                    }
                    if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                        return Err(Error::io(
                            "locking pattern store",
                            std::io::Error::new(
                                ErrorKind::TimedOut,
                                format!("lock not acquired within {LOCK_TIMEOUT_SECS}s"),
                            ),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }
        Ok(StoreLock { file })
    }
}

fn load_pattern_file(path: &Path) -> Result<PatternFile> {
    let content =
        fs::read_to_string(path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    serde_json::from_str(&content).map_err(|e| {
        Error::validation(
            path.display().to_string(),
            format!("pattern file does not parse: {e}"),
        )
    })
}

/// Seed the version from the loaded content so restarts with different
/// stores never alias each other's cache keys.
fn initial_version(patterns: &HashMap<String, Pattern>) -> u64 {
    let mut ids: Vec<&String> = patterns.keys().collect();
    ids.sort();
    let mut hasher = Sha256::new();
    for id in ids {
        let pattern = &patterns[id];
        hasher.update(id.as_bytes());
        hasher.update(pattern.updated_at.to_rfc3339().as_bytes());
        hasher.update([pattern.enabled as u8]);
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)
        .map_err(|e| Error::io(format!("writing {}", tmp_path.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::io(format!("renaming {} into place", path.display()), err));
    }
    Ok(())
}
