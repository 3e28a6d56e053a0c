//! Response cache
//!
//! Content-addressed cache for expensive analyses under
//! `.actlens/cache/`. Keys combine the run fingerprint with the pattern and
//! template store versions, so a store write silently invalidates every
//! dependent entry. Eviction is LRU bounded by total bytes; entries past
//! their TTL read as misses. A corrupt entry is a miss and is deleted.
//!
//! # Error Handling
//!
//! Cache operations are best-effort: a failed write is reported but callers
//! are expected to continue without the cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::hex_prefix;

const CACHE_DIR: &str = ".actlens/cache";

/// Cache identity: run fingerprint ⊕ store versions.
pub fn cache_key(fingerprint: &str, pattern_version: u64, template_version: u64) -> String {
    format!("{fingerprint}:{pattern_version:016x}:{template_version:016x}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    value: String,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct EntryMeta {
    file: PathBuf,
    size: u64,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

pub struct ResponseCache {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    index: Mutex<HashMap<String, EntryMeta>>,
}

impl ResponseCache {
    pub fn new(project_root: &Path, max_bytes: u64, ttl_hours: i64) -> Self {
        let dir = project_root.join(CACHE_DIR);
        let cache = Self {
            dir,
            max_bytes,
            ttl: Duration::hours(ttl_hours),
            index: Mutex::new(HashMap::new()),
        };
        cache.rebuild_index();
        cache
    }

    fn rebuild_index(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let mut index = self.index.lock().expect("cache index lock");
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<CacheEntry>(&content).ok())
            {
                Some(parsed) => {
                    index.insert(
                        parsed.key.clone(),
                        EntryMeta {
                            file: path,
                            size: parsed.value.len() as u64,
                            created_at: parsed.created_at,
                            last_accessed: parsed.last_accessed,
                        },
                    );
                }
                None => {
                    // Corrupt entry: treated as a miss and deleted.
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex_prefix(&digest, 32)))
    }

    /// Look up a key. TTL-expired and corrupt entries read as misses.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut index = self.index.lock().expect("cache index lock");
        let (file, created_at) = {
            let meta = index.get(key)?;
            (meta.file.clone(), meta.created_at)
        };

        let age = Utc::now().signed_duration_since(created_at);
        if age > self.ttl {
            index.remove(key);
            let _ = fs::remove_file(file);
            return None;
        }

        let parsed: Option<CacheEntry> = fs::read_to_string(&file)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        let Some(mut parsed) = parsed else {
            index.remove(key);
            let _ = fs::remove_file(file);
            return None;
        };

        let now = Utc::now();
        if let Some(meta) = index.get_mut(key) {
            meta.last_accessed = now;
        }
        parsed.last_accessed = now;
        // Best-effort LRU persistence; the in-memory index is authoritative.
        if let Ok(rendered) = serde_json::to_string(&parsed) {
            let _ = write_atomic(&file, &rendered);
        }
        Some(parsed.value)
    }

    /// Insert a value, evicting least-recently-used entries until the size
    /// bound holds.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io("creating cache directory", e))?;
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.to_string(),
            created_at: now,
            last_accessed: now,
        };
        let rendered = serde_json::to_string(&entry)
            .map_err(|e| Error::validation("cache entry", format!("serialize failed: {e}")))?;
        let file = self.entry_path(key);

        let mut index = self.index.lock().expect("cache index lock");
        write_atomic(&file, &rendered)?;
        index.insert(
            key.to_string(),
            EntryMeta {
                file,
                size: value.len() as u64,
                created_at: now,
                last_accessed: now,
            },
        );
        self.evict_locked(&mut index);
        Ok(())
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate(&self, prefix: &str) {
        let mut index = self.index.lock().expect("cache index lock");
        let doomed: Vec<String> = index
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(meta) = index.remove(&key) {
                let _ = fs::remove_file(meta.file);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("cache index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index
            .lock()
            .expect("cache index lock")
            .values()
            .map(|m| m.size)
            .sum()
    }

    fn evict_locked(&self, index: &mut HashMap<String, EntryMeta>) {
        let mut total: u64 = index.values().map(|m| m.size).sum();
        while total > self.max_bytes && !index.is_empty() {
            let oldest = index
                .iter()
                .min_by_key(|(_, m)| m.last_accessed)
                .map(|(k, _)| k.clone());
            let Some(key) = oldest else { break };
            if let Some(meta) = index.remove(&key) {
                total = total.saturating_sub(meta.size);
                let _ = fs::remove_file(meta.file);
            }
        }
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).map_err(|e| Error::io("writing cache entry", e))?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io("renaming cache entry", err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 1024 * 1024, 24);
        let key = cache_key("abc123", 1, 1);
        cache.put(&key, "analysis result").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("analysis result"));
    }

    #[test]
    fn version_bump_changes_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 1024 * 1024, 24);
        let original = cache_key("abc123", 1, 1);
        cache.put(&original, "result one").unwrap();

        // New store version: different key, fresh analysis required.
        let bumped = cache_key("abc123", 2, 1);
        assert!(cache.get(&bumped).is_none());
        // The old entry stays retrievable under its original key.
        assert_eq!(cache.get(&original).as_deref(), Some("result one"));
    }

    #[test]
    fn expired_entries_read_as_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 1024 * 1024, 0);
        let key = cache_key("abc123", 1, 1);
        cache.put(&key, "result").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn lru_eviction_bounds_total_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 100, 24);
        for i in 0..10 {
            let key = cache_key(&format!("finger{i}"), 1, 1);
            cache.put(&key, &"x".repeat(30)).unwrap();
        }
        assert!(cache.total_bytes() <= 100);
        assert!(cache.len() <= 4);
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 1024, 24);
        let key = cache_key("abc", 1, 1);
        cache.put(&key, "ok").unwrap();

        // Corrupt the file behind the entry.
        let digest = Sha256::digest(key.as_bytes());
        let file = dir
            .path()
            .join(CACHE_DIR)
            .join(format!("{}.json", hex_prefix(&digest, 32)));
        fs::write(&file, "{broken").unwrap();

        assert!(cache.get(&key).is_none());
        assert!(!file.exists());
    }

    #[test]
    fn invalidate_by_prefix_drops_matching_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::new(dir.path(), 1024 * 1024, 24);
        cache.put(&cache_key("aaa", 1, 1), "one").unwrap();
        cache.put(&cache_key("bbb", 1, 1), "two").unwrap();
        cache.invalidate("aaa");
        assert!(cache.get(&cache_key("aaa", 1, 1)).is_none());
        assert!(cache.get(&cache_key("bbb", 1, 1)).is_some());
    }

    #[test]
    fn index_rebuilds_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key = cache_key("persisted", 1, 1);
        {
            let cache = ResponseCache::new(dir.path(), 1024 * 1024, 24);
            cache.put(&key, "survives").unwrap();
        }
        let reopened = ResponseCache::new(dir.path(), 1024 * 1024, 24);
        assert_eq!(reopened.get(&key).as_deref(), Some("survives"));
    }
}
