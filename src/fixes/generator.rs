//! Fix generation
//!
//! Combines a pattern match with its applicable templates into concrete,
//! ranked suggestions. Placeholder substitution uses the match captures; a
//! template whose placeholders cannot all be filled is skipped, not failed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::fixes::templates::TemplateSnapshot;
use crate::fixes::{
    validate_step, CommandPolicy, FixStep, FixSuggestion, FixTemplate, RiskLevel,
};
use crate::patterns::PatternMatch;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("static regex"))
}

pub struct FixGenerator<'a> {
    project_root: &'a Path,
    policy: &'a CommandPolicy,
    risk_tolerance: RiskLevel,
    auto_fix_threshold: f64,
}

impl<'a> FixGenerator<'a> {
    pub fn new(
        project_root: &'a Path,
        policy: &'a CommandPolicy,
        risk_tolerance: RiskLevel,
        auto_fix_threshold: f64,
    ) -> Self {
        Self {
            project_root,
            policy,
            risk_tolerance,
            auto_fix_threshold,
        }
    }

    /// Produce ranked suggestions for one pattern match.
    pub fn generate(
        &self,
        pattern_match: &PatternMatch,
        templates: &TemplateSnapshot,
    ) -> Vec<FixSuggestion> {
        let mut suggestions = Vec::new();
        for template in templates.for_pattern(&pattern_match.pattern_id) {
            match self.instantiate(template, pattern_match) {
                Ok(suggestion) => suggestions.push(suggestion),
                Err(reason) => {
                    tracing::debug!(
                        "template {} skipped for {}: {reason}",
                        template.id,
                        pattern_match.pattern_id
                    );
                }
            }
        }
        rank_suggestions(&mut suggestions);
        suggestions
    }

    fn instantiate(
        &self,
        template: &FixTemplate,
        pattern_match: &PatternMatch,
    ) -> Result<FixSuggestion, String> {
        let captures = &pattern_match.captures;
        let steps: Vec<FixStep> = template
            .steps
            .iter()
            .map(|step| substitute_step(step, captures))
            .collect::<Result<_, _>>()?;

        let confidence = pattern_match.confidence * template.success_rate;
        let steps_validated = steps
            .iter()
            .all(|step| validate_step(step, self.project_root, self.policy).is_ok());
        let auto_applicable = template.risk <= self.risk_tolerance
            && confidence >= self.auto_fix_threshold
            && steps_validated;

        Ok(FixSuggestion {
            id: uuid::Uuid::new_v4().to_string(),
            title: template.name.clone(),
            description: template.description.clone(),
            template_id: template.id.clone(),
            pattern_match: pattern_match.clone(),
            steps,
            risk: template.risk,
            estimated_time: template.estimated_time.clone(),
            confidence,
            template_success_rate: template.success_rate,
            auto_applicable,
            prerequisites: template.prerequisites.clone(),
            validation_steps: template
                .validation_steps
                .iter()
                .map(|v| substitute(v, captures))
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Replace `{name}` placeholders from the capture map. An unfilled
/// placeholder is a recoverable instantiation error.
fn substitute(text: &str, captures: &BTreeMap<String, String>) -> Result<String, String> {
    let mut missing: Option<String> = None;
    let out = placeholder_re()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match captures.get(name) {
                Some(value) => value.clone(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        })
        .into_owned();
    match missing {
        Some(name) => Err(format!("missing capture for placeholder {{{name}}}")),
        None => Ok(out),
    }
}

fn substitute_path(path: &Path, captures: &BTreeMap<String, String>) -> Result<PathBuf, String> {
    let raw = path.to_string_lossy();
    substitute(&raw, captures).map(PathBuf::from)
}

fn substitute_step(step: &FixStep, captures: &BTreeMap<String, String>) -> Result<FixStep, String> {
    Ok(match step {
        FixStep::FileEdit {
            target,
            mode,
            payload,
            pattern,
            validation,
        } => FixStep::FileEdit {
            target: substitute_path(target, captures)?,
            mode: *mode,
            payload: substitute(payload, captures)?,
            pattern: pattern
                .as_ref()
                .map(|p| substitute(p, captures))
                .transpose()?,
            validation: validation
                .as_ref()
                .map(|v| substitute(v, captures))
                .transpose()?,
        },
        FixStep::FileCreate {
            target,
            payload,
            validation,
        } => FixStep::FileCreate {
            target: substitute_path(target, captures)?,
            payload: substitute(payload, captures)?,
            validation: validation
                .as_ref()
                .map(|v| substitute(v, captures))
                .transpose()?,
        },
        FixStep::FileDelete { target, validation } => FixStep::FileDelete {
            target: substitute_path(target, captures)?,
            validation: validation
                .as_ref()
                .map(|v| substitute(v, captures))
                .transpose()?,
        },
        FixStep::Command {
            argv,
            timeout_secs,
            validation,
        } => FixStep::Command {
            argv: argv
                .iter()
                .map(|arg| substitute(arg, captures))
                .collect::<Result<_, _>>()?,
            timeout_secs: *timeout_secs,
            validation: validation
                .as_ref()
                .map(|v| substitute(v, captures))
                .transpose()?,
        },
    })
}

/// Overall confidence desc, template success rate desc, risk asc, template
/// id asc.
pub(crate) fn rank_suggestions(suggestions: &mut [FixSuggestion]) {
    suggestions.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(b.template_success_rate.total_cmp(&a.template_success_rate))
            .then(a.risk.cmp(&b.risk))
            .then(a.template_id.cmp(&b.template_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fixes::TemplateStore;
    use crate::model::{Failure, FailureKind};
    use crate::patterns::{PatternMatcher, PatternStore};
    use std::collections::HashSet;

    fn setup(dir: &Path) -> (TemplateSnapshot, CommandPolicy) {
        let policy = CommandPolicy::new(&Config::default().command_allow_list);
        let ids: HashSet<String> = PatternStore::open(dir)
            .unwrap()
            .snapshot()
            .all_enabled(None)
            .iter()
            .map(|p| p.id.clone())
            .collect();
        let store = TemplateStore::open(dir, &ids, &policy).unwrap();
        (store.snapshot(), policy)
    }

    fn match_for(dir: &Path, message: &str) -> Vec<PatternMatch> {
        let store = PatternStore::open(dir).unwrap();
        let matcher = PatternMatcher::new();
        let failure = Failure::new(FailureKind::Dependency, message.to_string(), None, None);
        matcher
            .match_failures(&store.snapshot(), &[&failure], message, dir, None, 0.6)
            .matches
    }

    #[test]
    fn module_not_found_suggestion_installs_then_tests() {
        let dir = tempfile::tempdir().unwrap();
        let (templates, policy) = setup(dir.path());
        let matches = match_for(dir.path(), "ModuleNotFoundError: No module named 'requests'");
        let m = matches
            .iter()
            .find(|m| m.pattern_id == "python_module_not_found")
            .unwrap();

        let generator = FixGenerator::new(dir.path(), &policy, RiskLevel::Low, 0.8);
        let suggestions = generator.generate(m, &templates);
        assert_eq!(suggestions.len(), 1);
        let suggestion = &suggestions[0];
        match &suggestion.steps[0] {
            FixStep::Command { argv, .. } => {
                assert_eq!(argv, &["pip", "install", "requests"]);
            }
            other => panic!("unexpected first step {other:?}"),
        }
        match &suggestion.steps[1] {
            FixStep::Command { argv, .. } => assert_eq!(argv, &["pytest", "-q"]),
            other => panic!("unexpected second step {other:?}"),
        }
    }

    #[test]
    fn docker_suggestion_is_auto_applicable_under_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (templates, policy) = setup(dir.path());
        let matches = match_for(
            dir.path(),
            "permission denied while trying to connect to the Docker daemon socket",
        );
        let m = matches
            .iter()
            .find(|m| m.pattern_id == "docker_permission_denied")
            .unwrap();

        let generator = FixGenerator::new(dir.path(), &policy, RiskLevel::Low, 0.8);
        let suggestions = generator.generate(m, &templates);
        assert_eq!(suggestions.len(), 1);
        let suggestion = &suggestions[0];
        assert!(suggestion.auto_applicable, "confidence {}", suggestion.confidence);
        match &suggestion.steps[0] {
            FixStep::FileEdit {
                target, payload, ..
            } => {
                assert_eq!(target, &PathBuf::from(".actrc"));
                assert_eq!(payload, "--privileged\n");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn missing_capture_skips_the_template() {
        let dir = tempfile::tempdir().unwrap();
        let (templates, policy) = setup(dir.path());
        // Hand-build a match for the python pattern without captures.
        let matches = match_for(dir.path(), "ModuleNotFoundError: No module named 'x'");
        let mut m = matches
            .iter()
            .find(|m| m.pattern_id == "python_module_not_found")
            .unwrap()
            .clone();
        m.captures.clear();

        let generator = FixGenerator::new(dir.path(), &policy, RiskLevel::Low, 0.8);
        let suggestions = generator.generate(&m, &templates);
        assert!(suggestions.is_empty());
    }

    #[test]
    fn tied_confidence_ranks_by_template_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let (_, policy) = setup(dir.path());
        let matches = match_for(dir.path(), "ModuleNotFoundError: No module named 'x'");
        let m = matches
            .iter()
            .find(|m| m.pattern_id == "python_module_not_found")
            .unwrap();

        let generator = FixGenerator::new(dir.path(), &policy, RiskLevel::Low, 0.8);
        let base = FixTemplate {
            id: String::new(),
            name: "t".to_string(),
            description: String::new(),
            pattern_ids: vec![m.pattern_id.clone()],
            steps: vec![FixStep::Command {
                argv: vec!["pip".to_string(), "check".to_string()],
                timeout_secs: Some(30),
                validation: None,
            }],
            risk: RiskLevel::Low,
            estimated_time: "1 minute".to_string(),
            success_rate: 0.0,
            prerequisites: vec![],
            validation_steps: vec![],
            extra: serde_json::Map::new(),
        };
        // Suggestions from different matches can tie on overall confidence
        // while their templates' success rates differ.
        let mut weak_match = m.clone();
        weak_match.confidence = 0.45;
        let strong_template = FixTemplate {
            id: "z_strong".to_string(),
            success_rate: 0.9,
            ..base.clone()
        };
        let weak_template = FixTemplate {
            id: "a_weak".to_string(),
            success_rate: 0.5,
            ..base
        };
        let mut strong_match = m.clone();
        strong_match.confidence = 0.25;

        let mut suggestions = vec![
            generator.instantiate(&weak_template, &weak_match).unwrap(),
            generator.instantiate(&strong_template, &strong_match).unwrap(),
        ];
        assert!((suggestions[0].confidence - suggestions[1].confidence).abs() < 1e-12);
        rank_suggestions(&mut suggestions);
        // 0.25 × 0.9 == 0.45 × 0.5; the higher template success rate wins
        // even though its id sorts later.
        assert_eq!(suggestions[0].template_id, "z_strong");
        assert_eq!(suggestions[1].template_id, "a_weak");
    }

    #[test]
    fn substitution_fills_all_placeholders() {
        let mut captures = BTreeMap::new();
        captures.insert("module".to_string(), "requests".to_string());
        captures.insert("version".to_string(), "2.31".to_string());
        let out = substitute("pip install {module}=={version}", &captures).unwrap();
        assert_eq!(out, "pip install requests==2.31");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let captures = BTreeMap::new();
        let err = substitute("install {ghost}", &captures).unwrap_err();
        assert!(err.contains("ghost"));
    }
}
