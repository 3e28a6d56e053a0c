//! Fix templates, steps, and suggestions
//!
//! A template is a recipe of file edits and allow-listed commands tied to
//! one or more pattern ids. Instantiating a template against a pattern match
//! substitutes `{capture}` placeholders and produces a concrete suggestion
//! the auto-fixer can apply.

pub mod generator;
pub mod templates;

pub use generator::FixGenerator;
pub use templates::TemplateStore;

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patterns::PatternMatch;
use crate::util::resolve_project_path;

/// Path components fix steps may never touch, wherever they appear.
const PROTECTED_COMPONENTS: &[&str] = &[".git", ".ssh"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    Append,
    Prepend,
    Replace,
    RegexSubstitute,
}

/// One unit of work inside a fix. File payloads and command argv may carry
/// `{name}` placeholders resolved from match captures at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FixStep {
    FileEdit {
        target: PathBuf,
        mode: EditMode,
        payload: String,
        /// For `regex_substitute`: the pattern to replace with `payload`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<String>,
    },
    FileCreate {
        target: PathBuf,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<String>,
    },
    FileDelete {
        target: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<String>,
    },
    Command {
        argv: Vec<String>,
        /// Absent means the configured per-command default applies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        validation: Option<String>,
    },
}

impl FixStep {
    pub fn target_path(&self) -> Option<&Path> {
        match self {
            FixStep::FileEdit { target, .. }
            | FixStep::FileCreate { target, .. }
            | FixStep::FileDelete { target, .. } => Some(target),
            FixStep::Command { .. } => None,
        }
    }

    pub fn validation(&self) -> Option<&str> {
        match self {
            FixStep::FileEdit { validation, .. }
            | FixStep::FileCreate { validation, .. }
            | FixStep::FileDelete { validation, .. }
            | FixStep::Command { validation, .. } => validation.as_deref(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FixStep::FileEdit { target, mode, .. } => {
                format!("edit {} ({:?})", target.display(), mode)
            }
            FixStep::FileCreate { target, .. } => format!("create {}", target.display()),
            FixStep::FileDelete { target, .. } => format!("delete {}", target.display()),
            FixStep::Command { argv, .. } => format!("run `{}`", argv.join(" ")),
        }
    }
}

/// The closed command allow-list plus path policy.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    allowed: BTreeSet<String>,
}

impl CommandPolicy {
    pub fn new(allow_list: &[String]) -> Self {
        Self {
            allowed: allow_list.iter().cloned().collect(),
        }
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        self.allowed.contains(command)
    }
}

/// Validate one step against the path and command policy. `project_root`
/// containment is checked without requiring the target to exist.
pub fn validate_step(step: &FixStep, project_root: &Path, policy: &CommandPolicy) -> Result<()> {
    if let Some(target) = step.target_path() {
        for component in target.components() {
            if let Component::Normal(part) = component {
                let part = part.to_string_lossy();
                if PROTECTED_COMPONENTS.iter().any(|p| *p == part) {
                    return Err(Error::policy(format!(
                        "target {} touches a protected path",
                        target.display()
                    )));
                }
            }
        }
        resolve_project_path(project_root, target)?;
    }
    if let FixStep::Command { argv, timeout_secs, .. } = step {
        let program = argv
            .first()
            .ok_or_else(|| Error::validation("command step", "argv must not be empty"))?;
        if !policy.is_allowed(program) {
            return Err(Error::policy(format!(
                "command `{program}` is not on the allow-list"
            )));
        }
        if timeout_secs == &Some(0) {
            return Err(Error::validation(
                "command step",
                "timeout must be positive",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pattern_ids: Vec<String>,
    pub steps: Vec<FixStep>,
    pub risk: RiskLevel,
    pub estimated_time: String,
    pub success_rate: f64,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub validation_steps: Vec<String>,
    /// Unknown keys from user files, preserved on write.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl FixTemplate {
    /// Shape check at load time. Reports the offending step index.
    pub fn validate(&self, project_root: &Path, policy: &CommandPolicy) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("template", "id must not be empty"));
        }
        if self.pattern_ids.is_empty() {
            return Err(Error::validation(
                format!("template {}", self.id),
                "at least one pattern id is required",
            ));
        }
        if self.steps.is_empty() {
            return Err(Error::validation(
                format!("template {}", self.id),
                "at least one step is required",
            ));
        }
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(Error::validation(
                format!("template {}", self.id),
                "success_rate must be in [0, 1]",
            ));
        }
        for (index, step) in self.steps.iter().enumerate() {
            validate_step(step, project_root, policy).map_err(|err| {
                Error::validation(
                    format!("template {} step {index}", self.id),
                    err.to_string(),
                )
            })?;
        }
        Ok(())
    }
}

/// On-disk template file: `{ "templates": [...] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateFile {
    #[serde(default)]
    pub templates: Vec<FixTemplate>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TemplateFile {
    pub fn to_pretty_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)
            .map_err(|e| Error::validation("template file", format!("serialize failed: {e}")))?;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }
}

/// A template instantiated against a specific pattern match, placeholders
/// resolved, ready for approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSuggestion {
    pub id: String,
    pub title: String,
    pub description: String,
    pub template_id: String,
    pub pattern_match: PatternMatch,
    pub steps: Vec<FixStep>,
    pub risk: RiskLevel,
    pub estimated_time: String,
    pub confidence: f64,
    /// Historical success rate of the source template, kept for ranking.
    pub template_success_rate: f64,
    pub auto_applicable: bool,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub validation_steps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_serde_uses_type_discriminator() {
        let raw = r#"{
            "type": "file_edit",
            "target": ".actrc",
            "mode": "append",
            "payload": "--privileged\n"
        }"#;
        let step: FixStep = serde_json::from_str(raw).unwrap();
        match &step {
            FixStep::FileEdit { target, mode, .. } => {
                assert_eq!(target, &PathBuf::from(".actrc"));
                assert_eq!(*mode, EditMode::Append);
            }
            other => panic!("unexpected step {other:?}"),
        }
        let rendered = serde_json::to_string(&step).unwrap();
        assert!(rendered.contains("\"type\":\"file_edit\""));
    }

    #[test]
    fn protected_paths_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CommandPolicy::new(&["pip".to_string()]);
        let step = FixStep::FileEdit {
            target: PathBuf::from(".git/config"),
            mode: EditMode::Append,
            payload: "x".to_string(),
            pattern: None,
            validation: None,
        };
        let err = validate_step(&step, dir.path(), &policy).unwrap_err();
        assert_eq!(err.kind(), "policy");
    }

    #[test]
    fn escaping_paths_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CommandPolicy::new(&["pip".to_string()]);
        let step = FixStep::FileDelete {
            target: PathBuf::from("../outside.txt"),
            validation: None,
        };
        assert!(validate_step(&step, dir.path(), &policy).is_err());
    }

    #[test]
    fn commands_off_the_allow_list_are_denied() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CommandPolicy::new(&["pip".to_string(), "pytest".to_string()]);
        let step = FixStep::Command {
            argv: vec!["curl".to_string(), "http://example.com".to_string()],
            timeout_secs: Some(60),
            validation: None,
        };
        let err = validate_step(&step, dir.path(), &policy).unwrap_err();
        assert_eq!(err.kind(), "policy");

        let ok = FixStep::Command {
            argv: vec!["pip".to_string(), "install".to_string(), "requests".to_string()],
            timeout_secs: Some(60),
            validation: None,
        };
        validate_step(&ok, dir.path(), &policy).unwrap();
    }

    #[test]
    fn risk_levels_order() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
    }

    #[test]
    fn template_validation_names_offending_step() {
        let dir = tempfile::tempdir().unwrap();
        let policy = CommandPolicy::new(&["pip".to_string()]);
        let template = FixTemplate {
            id: "t1".to_string(),
            name: "bad".to_string(),
            description: String::new(),
            pattern_ids: vec!["p1".to_string()],
            steps: vec![
                FixStep::Command {
                    argv: vec!["pip".to_string(), "install".to_string()],
                    timeout_secs: Some(60),
                    validation: None,
                },
                FixStep::Command {
                    argv: vec!["rm".to_string(), "-rf".to_string()],
                    timeout_secs: Some(60),
                    validation: None,
                },
            ],
            risk: RiskLevel::Low,
            estimated_time: "1 minute".to_string(),
            success_rate: 0.9,
            prerequisites: vec![],
            validation_steps: vec![],
            extra: serde_json::Map::new(),
        };
        let err = template.validate(dir.path(), &policy).unwrap_err();
        assert!(err.to_string().contains("step 1"));
    }
}
