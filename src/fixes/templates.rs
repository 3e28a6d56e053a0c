//! Fix template store
//!
//! Mirrors the pattern store: builtin templates from an embedded resource,
//! user templates from `.actlens/templates/`, indexed by the pattern ids they
//! apply to. Every template is shape-checked at load; a rejected template is
//! dropped with a diagnostic naming the offending step and loading
//! continues.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fixes::{CommandPolicy, FixTemplate, TemplateFile};

const TEMPLATES_DIR: &str = ".actlens/templates";
const USER_FILE: &str = "user_templates.json";

const BUILTIN_TEMPLATES: &str = include_str!("builtin.json");

struct Inner {
    templates: Vec<FixTemplate>,
    by_pattern: HashMap<String, Vec<usize>>,
    version: u64,
}

/// Immutable view for the duration of one request.
#[derive(Clone)]
pub struct TemplateSnapshot {
    templates: Arc<Vec<FixTemplate>>,
    by_pattern: Arc<HashMap<String, Vec<usize>>>,
    version: u64,
}

impl TemplateSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn for_pattern(&self, pattern_id: &str) -> Vec<&FixTemplate> {
        self.by_pattern
            .get(pattern_id)
            .map(|indices| indices.iter().map(|&i| &self.templates[i]).collect())
            .unwrap_or_default()
    }

    pub fn by_id(&self, id: &str) -> Option<&FixTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

pub struct TemplateStore {
    inner: RwLock<Inner>,
}

impl TemplateStore {
    /// Load builtin and user templates, validating each against the known
    /// pattern ids, the path policy, and the command allow-list.
    pub fn open(
        project_root: &Path,
        known_pattern_ids: &HashSet<String>,
        policy: &CommandPolicy,
    ) -> Result<Self> {
        let mut templates: Vec<FixTemplate> = Vec::new();

        let mut load_file = |content: &str, origin: &str| {
            let parsed: TemplateFile = match serde_json::from_str(content) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!("skipping corrupt template file {origin}: {err}");
                    return;
                }
            };
            for template in parsed.templates {
                if let Err(err) = template.validate(project_root, policy) {
                    tracing::warn!("rejected template from {origin}: {err}");
                    continue;
                }
                if let Some(missing) = template
                    .pattern_ids
                    .iter()
                    .find(|id| !known_pattern_ids.contains(*id))
                {
                    tracing::warn!(
                        "rejected template {} from {origin}: references unknown pattern id {missing}",
                        template.id
                    );
                    continue;
                }
                // Later sources replace earlier ids (user over builtin).
                templates.retain(|t| t.id != template.id);
                templates.push(template);
            }
        };

        load_file(BUILTIN_TEMPLATES, "builtin");
        let user_path = user_file_path(project_root);
        if user_path.exists() {
            match fs::read_to_string(&user_path) {
                Ok(content) => load_file(&content, &user_path.display().to_string()),
                Err(err) => {
                    tracing::warn!("cannot read {}: {err}", user_path.display());
                }
            }
        }

        if templates.is_empty() {
            tracing::warn!("template store is empty; fix generation will produce nothing");
        }

        templates.sort_by(|a, b| a.id.cmp(&b.id));
        let by_pattern = index_by_pattern(&templates);
        let version = initial_version(&templates);
        tracing::info!("template store loaded: {} templates", templates.len());
        Ok(Self {
            inner: RwLock::new(Inner {
                templates,
                by_pattern,
                version,
            }),
        })
    }

    pub fn version(&self) -> u64 {
        self.inner.read().expect("template store lock").version
    }

    pub fn snapshot(&self) -> TemplateSnapshot {
        let inner = self.inner.read().expect("template store lock");
        TemplateSnapshot {
            templates: Arc::new(inner.templates.clone()),
            by_pattern: Arc::new(inner.by_pattern.clone()),
            version: inner.version,
        }
    }

    pub fn by_id(&self, id: &str) -> Option<FixTemplate> {
        self.inner
            .read()
            .expect("template store lock")
            .templates
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    /// Record a template outcome, nudging its historical success rate.
    pub fn update_success(&self, id: &str, success: bool, alpha: f64) -> Result<f64> {
        let mut inner = self.inner.write().expect("template store lock");
        let template = inner
            .templates
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::validation("template", format!("unknown id: {id}")))?;
        let observed = if success { 1.0 } else { 0.0 };
        template.success_rate =
            ((1.0 - alpha) * template.success_rate + alpha * observed).clamp(0.0, 1.0);
        let rate = template.success_rate;
        inner.version += 1;
        Ok(rate)
    }
}

fn user_file_path(project_root: &Path) -> PathBuf {
    project_root.join(TEMPLATES_DIR).join(USER_FILE)
}

fn index_by_pattern(templates: &[FixTemplate]) -> HashMap<String, Vec<usize>> {
    let mut by_pattern: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, template) in templates.iter().enumerate() {
        for pattern_id in &template.pattern_ids {
            by_pattern.entry(pattern_id.clone()).or_default().push(i);
        }
    }
    by_pattern
}

fn initial_version(templates: &[FixTemplate]) -> u64 {
    let mut hasher = Sha256::new();
    for template in templates {
        hasher.update(template.id.as_bytes());
        hasher.update(template.success_rate.to_le_bytes());
    }
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::PatternStore;

    fn known_ids(project_root: &Path) -> HashSet<String> {
        PatternStore::open(project_root)
            .unwrap()
            .snapshot()
            .all_enabled(None)
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }

    fn policy() -> CommandPolicy {
        CommandPolicy::new(&crate::config::Config::default().command_allow_list)
    }

    #[test]
    fn builtin_templates_load_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path(), &known_ids(dir.path()), &policy()).unwrap();
        let snapshot = store.snapshot();
        assert!(!snapshot.is_empty());
        let docker = snapshot.for_pattern("docker_permission_denied");
        assert_eq!(docker.len(), 1);
        assert_eq!(docker[0].id, "docker_privileged_actrc");
    }

    #[test]
    fn template_with_unknown_pattern_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir.path().join(TEMPLATES_DIR);
        fs::create_dir_all(&templates_dir).unwrap();
        let user = r#"{
  "templates": [{
    "id": "ghost",
    "name": "ghost",
    "description": "",
    "pattern_ids": ["no_such_pattern"],
    "steps": [{"type": "command", "argv": ["pip", "list"], "timeout_secs": 30}],
    "risk": "low",
    "estimated_time": "1 minute",
    "success_rate": 0.5
  }]
}"#;
        fs::write(templates_dir.join(USER_FILE), user).unwrap();
        let store = TemplateStore::open(dir.path(), &known_ids(dir.path()), &policy()).unwrap();
        assert!(store.by_id("ghost").is_none());
    }

    #[test]
    fn template_with_denied_command_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let templates_dir = dir.path().join(TEMPLATES_DIR);
        fs::create_dir_all(&templates_dir).unwrap();
        let user = r#"{
  "templates": [{
    "id": "curler",
    "name": "curler",
    "description": "",
    "pattern_ids": ["network_timeout"],
    "steps": [{"type": "command", "argv": ["curl", "http://x"], "timeout_secs": 30}],
    "risk": "low",
    "estimated_time": "1 minute",
    "success_rate": 0.5
  }]
}"#;
        fs::write(templates_dir.join(USER_FILE), user).unwrap();
        let store = TemplateStore::open(dir.path(), &known_ids(dir.path()), &policy()).unwrap();
        assert!(store.by_id("curler").is_none());
    }

    #[test]
    fn update_success_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path(), &known_ids(dir.path()), &policy()).unwrap();
        let before = store.version();
        let rate_before = store.by_id("pip_install_missing_module").unwrap().success_rate;
        let rate_after = store
            .update_success("pip_install_missing_module", false, 0.2)
            .unwrap();
        assert!(rate_after < rate_before);
        assert_ne!(store.version(), before);
    }

    #[test]
    fn snapshot_is_isolated_from_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::open(dir.path(), &known_ids(dir.path()), &policy()).unwrap();
        let snapshot = store.snapshot();
        store
            .update_success("pip_install_missing_module", true, 0.5)
            .unwrap();
        assert_ne!(store.snapshot().version(), snapshot.version());
    }
}
