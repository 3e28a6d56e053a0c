//! Filesystem snapshots for rollback
//!
//! Before an auto-fix mutates anything, the touched file set is recorded
//! under `.actlens/snapshots/<id>/`: a `manifest.json` plus the raw bytes of
//! each file in manifest order. Files that do not exist yet are recorded as
//! tombstones so a restore can delete files a fix created. Restoring a
//! snapshot recreates the exact original bytes and mode for every recorded
//! path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::model::hex_prefix;

const SNAPSHOTS_DIR: &str = ".actlens/snapshots";
const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Ids are strictly increasing within a process and time-prefixed across
/// processes, so lexicographic order is creation order.
static LAST_ID: AtomicU64 = AtomicU64::new(0);

fn next_snapshot_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let candidate = millis << 16;
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = candidate.max(last + 1);
        match LAST_ID.compare_exchange(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return format!("{next:016x}"),
            Err(observed) => last = observed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Path relative to the project root.
    pub original_path: PathBuf,
    /// Relative path of the stored bytes inside the snapshot directory,
    /// absent for tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub mode: u32,
    pub size: u64,
    /// The file did not exist at snapshot time.
    #[serde(default)]
    pub tombstone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub entries: Vec<SnapshotEntry>,
}

pub struct SnapshotManager {
    project_root: PathBuf,
    snapshots_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            snapshots_dir: project_root.join(SNAPSHOTS_DIR),
        }
    }

    pub fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(id)
    }

    /// Record the given project-relative paths; a directory in the set is
    /// expanded to the files beneath it. Directory is created 0700, stored
    /// files 0600.
    pub fn create(&self, paths: &[PathBuf], description: &str) -> Result<Snapshot> {
        let paths = self.expand_directories(paths);
        let id = next_snapshot_id();
        let dir = self.snapshot_dir(&id);
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)
            .map_err(|e| Error::io("creating snapshot directory", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        }

        let mut entries = Vec::with_capacity(paths.len());
        for (index, rel) in paths.iter().enumerate() {
            let absolute = self.project_root.join(rel);
            if !absolute.exists() {
                entries.push(SnapshotEntry {
                    original_path: rel.clone(),
                    stored: None,
                    sha256: None,
                    mode: 0,
                    size: 0,
                    tombstone: true,
                });
                continue;
            }

            let bytes = fs::read(&absolute)
                .map_err(|e| Error::io(format!("reading {}", absolute.display()), e))?;
            let metadata = fs::metadata(&absolute)
                .map_err(|e| Error::io(format!("stat {}", absolute.display()), e))?;
            let mode = file_mode(&metadata);
            let digest = Sha256::digest(&bytes);

            let stored_rel = format!("{FILES_DIR}/{index}");
            let stored_path = dir.join(&stored_rel);
            fs::write(&stored_path, &bytes)
                .map_err(|e| Error::io(format!("writing {}", stored_path.display()), e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(&stored_path, fs::Permissions::from_mode(0o600));
            }

            entries.push(SnapshotEntry {
                original_path: rel.clone(),
                stored: Some(stored_rel),
                sha256: Some(hex_prefix(&digest, 64)),
                mode,
                size: bytes.len() as u64,
                tombstone: false,
            });
        }

        let snapshot = Snapshot {
            id: id.clone(),
            created_at: Utc::now(),
            description: description.to_string(),
            entries,
        };
        let manifest = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::validation("snapshot manifest", format!("serialize failed: {e}")))?;
        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, manifest)
            .map_err(|e| Error::io("writing snapshot manifest", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&manifest_path, fs::Permissions::from_mode(0o600));
        }

        tracing::info!("snapshot {id} created ({} entries)", snapshot.entries.len());
        Ok(snapshot)
    }

    fn expand_directories(&self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut expanded: Vec<PathBuf> = Vec::new();
        for rel in paths {
            let absolute = self.project_root.join(rel);
            if absolute.is_dir() {
                for entry in walkdir::WalkDir::new(&absolute)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if !entry.path().is_file() {
                        continue;
                    }
                    if let Ok(stripped) = entry.path().strip_prefix(&self.project_root) {
                        expanded.push(stripped.to_path_buf());
                    }
                }
            } else if !expanded.contains(rel) {
                expanded.push(rel.clone());
            }
        }
        expanded
    }

    /// Check the stored bytes still hash to what the manifest recorded.
    pub fn verify(&self, snapshot: &Snapshot) -> bool {
        let dir = self.snapshot_dir(&snapshot.id);
        for entry in &snapshot.entries {
            if entry.tombstone {
                continue;
            }
            let (Some(stored), Some(expected)) = (&entry.stored, &entry.sha256) else {
                return false;
            };
            let Ok(bytes) = fs::read(dir.join(stored)) else {
                return false;
            };
            let digest = Sha256::digest(&bytes);
            if &hex_prefix(&digest, 64) != expected {
                return false;
            }
        }
        true
    }

    /// Put every recorded path back exactly: original bytes and mode for
    /// recorded files, deletion for tombstones.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.snapshot_dir(&snapshot.id);
        for entry in &snapshot.entries {
            let absolute = self.project_root.join(&entry.original_path);
            if entry.tombstone {
                if absolute.exists() {
                    fs::remove_file(&absolute).map_err(|e| {
                        Error::io(format!("removing {}", absolute.display()), e)
                    })?;
                }
                continue;
            }
            let stored = entry.stored.as_ref().ok_or_else(|| {
                Error::validation("snapshot", "entry has no stored bytes")
            })?;
            let bytes = fs::read(dir.join(stored))
                .map_err(|e| Error::io("reading snapshot bytes", e))?;
            if let Some(parent) = absolute.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io("recreating parent directory", e))?;
            }
            let tmp = absolute.with_extension("actlens-restore");
            fs::write(&tmp, &bytes).map_err(|e| Error::io("writing restored file", e))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, fs::Permissions::from_mode(entry.mode))
                    .map_err(|e| Error::io("restoring file mode", e))?;
            }
            fs::rename(&tmp, &absolute)
                .map_err(|e| Error::io("renaming restored file into place", e))?;
        }
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Snapshot> {
        let path = self.snapshot_dir(id).join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|e| {
            Error::validation("snapshot manifest", format!("manifest does not parse: {e}"))
        })
    }

    /// All snapshots, oldest first.
    pub fn list(&self) -> Vec<Snapshot> {
        let Ok(entries) = fs::read_dir(&self.snapshots_dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        ids.iter().filter_map(|id| self.load(id).ok()).collect()
    }

    /// Delete snapshots older than the retention window unless referenced.
    /// Returns the removed ids.
    pub fn gc(&self, retention_days: i64, referenced: &[String]) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut removed = Vec::new();
        for snapshot in self.list() {
            if snapshot.created_at >= cutoff || referenced.contains(&snapshot.id) {
                continue;
            }
            fs::remove_dir_all(self.snapshot_dir(&snapshot.id))
                .map_err(|e| Error::io(format!("removing snapshot {}", snapshot.id), e))?;
            removed.push(snapshot.id);
        }
        Ok(removed)
    }
}

fn file_mode(metadata: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        0o644
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let a = next_snapshot_id();
        let b = next_snapshot_id();
        let c = next_snapshot_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn create_and_restore_round_trips_bytes_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "x").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o640)).unwrap();
        }

        let manager = SnapshotManager::new(dir.path());
        let snapshot = manager
            .create(&[PathBuf::from("a.txt")], "before fix")
            .unwrap();
        assert!(manager.verify(&snapshot));

        fs::write(&target, "y").unwrap();
        manager.restore(&snapshot).unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "x");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
            assert_eq!(mode, 0o640);
        }
    }

    #[test]
    fn tombstones_delete_files_created_after_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path());
        let snapshot = manager
            .create(&[PathBuf::from("new_file.txt")], "before fix")
            .unwrap();
        assert!(snapshot.entries[0].tombstone);

        fs::write(dir.path().join("new_file.txt"), "created by fix").unwrap();
        manager.restore(&snapshot).unwrap();
        assert!(!dir.path().join("new_file.txt").exists());
    }

    #[test]
    fn verify_fails_on_corrupted_store() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "payload").unwrap();
        let manager = SnapshotManager::new(dir.path());
        let snapshot = manager.create(&[PathBuf::from("a.txt")], "d").unwrap();

        let stored = manager.snapshot_dir(&snapshot.id).join("files/0");
        fs::write(&stored, "tampered").unwrap();
        assert!(!manager.verify(&snapshot));
    }

    #[test]
    fn gc_removes_old_unreferenced_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        fs::write(&target, "data").unwrap();
        let manager = SnapshotManager::new(dir.path());
        let old = manager.create(&[PathBuf::from("a.txt")], "old").unwrap();
        let kept = manager.create(&[PathBuf::from("a.txt")], "kept").unwrap();

        // Age the first snapshot by rewriting its manifest.
        let mut aged = old.clone();
        aged.created_at = Utc::now() - Duration::days(30);
        let manifest = manager.snapshot_dir(&old.id).join(MANIFEST_FILE);
        fs::write(&manifest, serde_json::to_string_pretty(&aged).unwrap()).unwrap();
        let mut aged_kept = kept.clone();
        aged_kept.created_at = Utc::now() - Duration::days(30);
        let manifest = manager.snapshot_dir(&kept.id).join(MANIFEST_FILE);
        fs::write(&manifest, serde_json::to_string_pretty(&aged_kept).unwrap()).unwrap();

        let removed = manager.gc(14, &[kept.id.clone()]).unwrap();
        assert_eq!(removed, vec![old.id.clone()]);
        assert!(manager.load(&kept.id).is_ok());
        assert!(manager.load(&old.id).is_err());
    }

    #[test]
    fn directories_in_the_file_set_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cfg")).unwrap();
        fs::write(dir.path().join("cfg/a.toml"), "a").unwrap();
        fs::write(dir.path().join("cfg/b.toml"), "b").unwrap();
        let manager = SnapshotManager::new(dir.path());
        let snapshot = manager.create(&[PathBuf::from("cfg")], "dir set").unwrap();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot
            .entries
            .iter()
            .all(|e| e.original_path.starts_with("cfg")));
    }

    #[test]
    fn list_returns_snapshots_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let manager = SnapshotManager::new(dir.path());
        let first = manager.create(&[PathBuf::from("a.txt")], "one").unwrap();
        let second = manager.create(&[PathBuf::from("a.txt")], "two").unwrap();
        let listed = manager.list();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        let first_pos = ids.iter().position(|id| *id == first.id).unwrap();
        let second_pos = ids.iter().position(|id| *id == second.id).unwrap();
        assert!(first_pos < second_pos);
    }
}
