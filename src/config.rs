//! Configuration for the analysis engine
//!
//! One record with explicit named fields, stored per project in
//! `.actlens/config.json`. Optional behavior carries explicit defaults; there
//! is no dynamic field discovery anywhere.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fixes::RiskLevel;

const CONFIG_DIR: &str = ".actlens";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Context lines captured around each failure signal.
    pub context_lines: usize,
    /// Minimum confidence for a pattern match to be reported.
    pub confidence_threshold: f64,
    /// Minimum overall confidence for a suggestion to be auto-applicable.
    pub auto_fix_threshold: f64,
    /// Highest risk level a suggestion may carry and still auto-apply.
    pub risk_tolerance: RiskLevel,
    /// Token budget handed to the log compressor.
    pub token_budget: u32,
    /// Model family used for token estimation.
    pub model_family: String,
    /// Closed set of command names fix steps may execute.
    pub command_allow_list: Vec<String>,
    /// Per-command timeout inside an auto-fix.
    pub command_timeout_secs: u64,
    /// Wall-clock timeout for one analysis request.
    pub request_timeout_secs: u64,
    /// How long to retry for the per-project filesystem mutation lock.
    pub mutation_lock_wait_secs: u64,
    /// Response cache entry TTL.
    pub cache_ttl_hours: i64,
    /// Response cache size bound in bytes.
    pub cache_max_bytes: u64,
    /// Snapshots older than this are eligible for gc.
    pub snapshot_retention_days: i64,
    /// Feedback log fsync policy: whichever of these two trips first.
    pub feedback_fsync_every: usize,
    pub feedback_fsync_secs: u64,
    /// Minimum occurrences before an unknown-failure group becomes a
    /// candidate pattern.
    pub learning_min_occurrences: usize,
    /// Jaccard similarity threshold for grouping unknown failures.
    pub learning_similarity: f64,
    /// Decay for the success-rate moving average.
    pub ewma_alpha: f64,
    /// Extra credential regexes for the sanitizer. Malformed entries are
    /// rejected at load; the builtin set still applies.
    pub custom_sanitize_patterns: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            context_lines: 5,
            confidence_threshold: 0.6,
            auto_fix_threshold: 0.8,
            risk_tolerance: RiskLevel::Low,
            token_budget: 8_000,
            model_family: "generic".to_string(),
            command_allow_list: vec![
                "pip".to_string(),
                "pip3".to_string(),
                "uv".to_string(),
                "npm".to_string(),
                "yarn".to_string(),
                "pnpm".to_string(),
                "cargo".to_string(),
                "pytest".to_string(),
                "go".to_string(),
                "ruff".to_string(),
                "eslint".to_string(),
                "prettier".to_string(),
                "rustfmt".to_string(),
            ],
            command_timeout_secs: 60,
            request_timeout_secs: 300,
            mutation_lock_wait_secs: 30,
            cache_ttl_hours: 24,
            cache_max_bytes: 100 * 1024 * 1024,
            snapshot_retention_days: 14,
            feedback_fsync_every: 20,
            feedback_fsync_secs: 5,
            learning_min_occurrences: 3,
            learning_similarity: 0.7,
            ewma_alpha: 0.2,
            custom_sanitize_patterns: Vec::new(),
        }
    }
}

impl Config {
    pub fn config_dir(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_DIR)
    }

    pub fn config_path(project_root: &Path) -> PathBuf {
        Self::config_dir(project_root).join(CONFIG_FILE)
    }

    /// Global fallback shared across projects.
    fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("actlens").join(CONFIG_FILE))
    }

    /// Load the project config, falling back to the user-global file, then
    /// to defaults. A corrupt file is preserved with a `.corrupt` suffix.
    pub fn load(project_root: &Path) -> Self {
        if let Some(config) = Self::load_file(&Self::config_path(project_root)) {
            return config;
        }
        if let Some(config) = Self::global_config_path().and_then(|p| Self::load_file(&p)) {
            return config;
        }
        Self::default()
    }

    fn load_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Config>(&content) {
            Ok(config) => match config.validate() {
                Ok(()) => Some(config),
                Err(err) => {
                    tracing::warn!("config {} rejected ({err}); ignored", path.display());
                    None
                }
            },
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    "config {} was corrupted ({err}); a backup was saved",
                    path.display()
                );
                None
            }
        }
    }

    /// Save atomically with 0600 permissions.
    pub fn save(&self, project_root: &Path) -> Result<()> {
        self.validate()?;
        let dir = Self::config_dir(project_root);
        fs::create_dir_all(&dir).map_err(|e| Error::io("creating config directory", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        }

        let path = dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::config(format!("failed to serialize config: {e}")))?;
        write_config_atomic(&path, &content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::config_key(
                "confidence_threshold must be in [0, 1]",
                "confidence_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.auto_fix_threshold) {
            return Err(Error::config_key(
                "auto_fix_threshold must be in [0, 1]",
                "auto_fix_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.learning_similarity) {
            return Err(Error::config_key(
                "learning_similarity must be in [0, 1]",
                "learning_similarity",
            ));
        }
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err(Error::config_key(
                "ewma_alpha must be in [0, 1]",
                "ewma_alpha",
            ));
        }
        if self.token_budget == 0 {
            return Err(Error::config_key(
                "token_budget must be positive",
                "token_budget",
            ));
        }
        if self.command_allow_list.is_empty() {
            return Err(Error::config_key(
                "command_allow_list must not be empty",
                "command_allow_list",
            ));
        }
        Ok(())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::io("creating temp config file", e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
    }

    file.write_all(content.as_bytes())
        .map_err(|e| Error::io("writing config", e))?;
    file.sync_all().map_err(|e| Error::io("syncing config", e))?;
    drop(file);

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(Error::io("renaming config into place", err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.confidence_threshold = 0.7;
        config.command_allow_list = vec!["pip".to_string()];
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path());
        assert_eq!(loaded.confidence_threshold, 0.7);
        assert_eq!(loaded.command_allow_list, vec!["pip".to_string()]);
    }

    #[test]
    fn corrupt_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = Config::config_path(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let loaded = Config::load(dir.path());
        assert_eq!(loaded.context_lines, Config::default().context_lines);
        assert!(path.with_extension("json.corrupt").exists());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let mut config = Config::default();
        config.auto_fix_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
