//! Core data model for one CI run
//!
//! A raw log parses into an `ExecutionResult` tree: workflows own jobs, jobs
//! own steps and the failures found in them. Everything here is immutable
//! once produced by the extractor; the analysis request owns the whole tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Assertion,
    Error,
    Timeout,
    Syntax,
    Dependency,
    Permission,
    Network,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Assertion => "assertion",
            FailureKind::Error => "error",
            FailureKind::Timeout => "timeout",
            FailureKind::Syntax => "syntax",
            FailureKind::Dependency => "dependency",
            FailureKind::Permission => "permission",
            FailureKind::Network => "network",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One failure signal lifted out of a log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub file_path: Option<PathBuf>,
    pub line_number: Option<u32>,
    #[serde(default)]
    pub context_before: Vec<String>,
    #[serde(default)]
    pub context_after: Vec<String>,
    pub stack_trace: Option<String>,
    /// How many near-identical signals collapsed into this one.
    #[serde(default = "one")]
    pub occurrences: u32,
    pub fingerprint: String,
}

fn one() -> u32 {
    1
}

impl Failure {
    pub fn new(
        kind: FailureKind,
        message: String,
        file_path: Option<PathBuf>,
        line_number: Option<u32>,
    ) -> Self {
        let fingerprint = fingerprint(kind, &message, file_path.as_deref(), line_number);
        Self {
            kind,
            message,
            file_path,
            line_number,
            context_before: Vec::new(),
            context_after: Vec::new(),
            stack_trace: None,
            occurrences: 1,
            fingerprint,
        }
    }

    /// All the text a pattern may match against.
    pub fn combined_text(&self) -> String {
        let mut text = String::with_capacity(self.message.len() + 64);
        text.push_str(&self.message);
        for line in self.context_before.iter().chain(self.context_after.iter()) {
            text.push('\n');
            text.push_str(line);
        }
        if let Some(trace) = &self.stack_trace {
            text.push('\n');
            text.push_str(trace);
        }
        text
    }
}

/// Deterministic identity for a failure: normalized message + kind + the
/// tail of the file path + whether a line number was present. Digits,
/// absolute path prefixes, timestamps, and PIDs are scrubbed first so
/// reruns land on the same key.
pub fn fingerprint(
    kind: FailureKind,
    message: &str,
    file_path: Option<&Path>,
    line_number: Option<u32>,
) -> String {
    let normalized = normalize_message(message);
    let path_suffix = file_path
        .map(|p| {
            let parts: Vec<String> = p
                .components()
                .rev()
                .take(2)
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            parts.into_iter().rev().collect::<Vec<_>>().join("/")
        })
        .unwrap_or_default();
    let line_marker = if line_number.is_some() { "L#" } else { "" };

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(path_suffix.as_bytes());
    hasher.update(b"|");
    hasher.update(line_marker.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 32)
}

/// Lowercase hex of the first bytes of a digest.
pub(crate) fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Normalize a message for fingerprinting: lowercase, digit runs collapsed,
/// absolute paths reduced to their basename, ISO timestamps and pid markers
/// dropped, whitespace squeezed.
pub fn normalize_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut last_space = false;
    for token in message.split_whitespace() {
        let token = token.to_lowercase();
        // ISO-8601-ish timestamps carry no identity
        if token.len() >= 10
            && token.as_bytes().get(4) == Some(&b'-')
            && token.as_bytes().get(7) == Some(&b'-')
            && token[..4].bytes().all(|b| b.is_ascii_digit())
        {
            continue;
        }
        let token = if token.starts_with('/') {
            // absolute path: keep only the basename
            token.rsplit('/').next().unwrap_or("").to_string()
        } else {
            token
        };
        if token.starts_with("pid") && token[3..].trim_start_matches(['=', ':']).chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let mut squeezed = String::with_capacity(token.len());
        let mut in_digits = false;
        for c in token.chars() {
            if c.is_ascii_digit() {
                if !in_digits {
                    squeezed.push('#');
                    in_digits = true;
                }
            } else {
                squeezed.push(c);
                in_digits = false;
            }
        }
        if !squeezed.is_empty() {
            if last_space {
                out.push(' ');
            }
            out.push_str(&squeezed);
            last_space = true;
        }
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub success: bool,
    pub duration_secs: f64,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub failures: Vec<Failure>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub jobs: Vec<JobResult>,
    pub duration_secs: f64,
}

/// Where a log came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOrigin {
    pub workflow: Option<String>,
    pub job: Option<String>,
    pub step_index: Option<usize>,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub workflows: Vec<WorkflowResult>,
    pub total_duration_secs: f64,
    pub log_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// Success is the conjunction over workflows; the total duration is
    /// never allowed below 0.9 × the summed step durations (parsing slack).
    pub fn new(
        workflows: Vec<WorkflowResult>,
        total_duration_secs: f64,
        log_path: Option<PathBuf>,
    ) -> Self {
        let success = workflows.iter().all(|w| w.success);
        let step_total: f64 = workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .flat_map(|j| &j.steps)
            .map(|s| s.duration_secs)
            .sum();
        let floor = step_total * 0.9;
        let total_duration_secs = if total_duration_secs < floor {
            floor
        } else {
            total_duration_secs
        };
        Self {
            success,
            workflows,
            total_duration_secs,
            log_path,
            timestamp: Utc::now(),
        }
    }

    pub fn total_failures(&self) -> usize {
        self.workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .map(|j| j.failures.len())
            .sum()
    }

    pub fn failed_jobs(&self) -> Vec<&JobResult> {
        self.workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .filter(|j| !j.success)
            .collect()
    }

    pub fn all_failures(&self) -> Vec<&Failure> {
        self.workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .flat_map(|j| &j.failures)
            .collect()
    }

    /// Combined fingerprint for the whole run, used as the cache identity.
    pub fn combined_fingerprint(&self) -> String {
        let mut prints: Vec<&str> = self
            .all_failures()
            .into_iter()
            .map(|f| f.fingerprint.as_str())
            .collect();
        prints.sort_unstable();
        prints.dedup();
        let mut hasher = Sha256::new();
        for print in prints {
            hasher.update(print.as_bytes());
            hasher.update(b"\n");
        }
        hex_prefix(&hasher.finalize(), 32)
    }

    pub fn metrics(&self) -> AnalysisMetrics {
        AnalysisMetrics::from_execution(self)
    }
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    pub total_workflows: usize,
    pub total_jobs: usize,
    pub total_steps: usize,
    pub total_failures: usize,
    /// Job success rate in percent.
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub failure_kinds: BTreeMap<String, usize>,
}

impl AnalysisMetrics {
    pub fn from_execution(execution: &ExecutionResult) -> Self {
        let total_workflows = execution.workflows.len();
        let total_jobs = execution.workflows.iter().map(|w| w.jobs.len()).sum();
        let total_steps = execution
            .workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .map(|j| j.steps.len())
            .sum();
        let successful_jobs = execution
            .workflows
            .iter()
            .flat_map(|w| &w.jobs)
            .filter(|j| j.success)
            .count();
        let success_rate = if total_jobs > 0 {
            successful_jobs as f64 / total_jobs as f64 * 100.0
        } else {
            100.0
        };
        let mut failure_kinds = BTreeMap::new();
        for failure in execution.all_failures() {
            *failure_kinds
                .entry(failure.kind.as_str().to_string())
                .or_insert(0) += 1;
        }
        Self {
            total_workflows,
            total_jobs,
            total_steps,
            total_failures: execution.total_failures(),
            success_rate,
            average_duration_secs: if total_workflows > 0 {
                execution.total_duration_secs / total_workflows as f64
            } else {
                0.0
            },
            failure_kinds,
        }
    }
}

/// Diff of two runs keyed by failure fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogComparison {
    pub new_failures: Vec<Failure>,
    pub resolved_failures: Vec<Failure>,
    pub persistent_failures: Vec<Failure>,
    /// 0.0 (no progress) to 1.0 (all previous failures gone).
    pub improvement_score: f64,
}

impl LogComparison {
    pub fn between(previous: &ExecutionResult, current: &ExecutionResult) -> Self {
        let prev: BTreeMap<&str, &Failure> = previous
            .all_failures()
            .into_iter()
            .map(|f| (f.fingerprint.as_str(), f))
            .collect();
        let curr: BTreeMap<&str, &Failure> = current
            .all_failures()
            .into_iter()
            .map(|f| (f.fingerprint.as_str(), f))
            .collect();

        let new_failures = curr
            .iter()
            .filter(|(k, _)| !prev.contains_key(*k))
            .map(|(_, f)| (*f).clone())
            .collect();
        let resolved_failures: Vec<Failure> = prev
            .iter()
            .filter(|(k, _)| !curr.contains_key(*k))
            .map(|(_, f)| (*f).clone())
            .collect();
        let persistent_failures = curr
            .iter()
            .filter(|(k, _)| prev.contains_key(*k))
            .map(|(_, f)| (*f).clone())
            .collect();

        let improvement_score = if prev.is_empty() {
            if curr.is_empty() {
                1.0
            } else {
                0.0
            }
        } else {
            (resolved_failures.len() as f64 / prev.len() as f64).clamp(0.0, 1.0)
        };

        Self {
            new_failures,
            resolved_failures,
            persistent_failures,
            improvement_score,
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.new_failures.is_empty() || !self.resolved_failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind, message: &str) -> Failure {
        Failure::new(kind, message.to_string(), None, None)
    }

    #[test]
    fn fingerprint_ignores_digits_and_paths() {
        let a = fingerprint(
            FailureKind::Error,
            "worker 42 crashed at /home/ci/build/job.py",
            None,
            None,
        );
        let b = fingerprint(
            FailureKind::Error,
            "worker 7 crashed at /tmp/other/job.py",
            None,
            None,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_kinds() {
        let a = fingerprint(FailureKind::Error, "it broke", None, None);
        let b = fingerprint(FailureKind::Timeout, "it broke", None, None);
        assert_ne!(a, b);
    }

    #[test]
    fn execution_success_is_conjunction() {
        let workflows = vec![
            WorkflowResult {
                name: "ci".to_string(),
                success: true,
                jobs: vec![],
                duration_secs: 1.0,
            },
            WorkflowResult {
                name: "deploy".to_string(),
                success: false,
                jobs: vec![],
                duration_secs: 1.0,
            },
        ];
        let result = ExecutionResult::new(workflows, 2.0, None);
        assert!(!result.success);
    }

    #[test]
    fn duration_is_clamped_to_step_floor() {
        let workflows = vec![WorkflowResult {
            name: "ci".to_string(),
            success: true,
            jobs: vec![JobResult {
                name: "build".to_string(),
                success: true,
                steps: vec![StepResult {
                    name: "compile".to_string(),
                    success: true,
                    duration_secs: 100.0,
                    exit_code: Some(0),
                }],
                failures: vec![],
                duration_secs: 100.0,
            }],
            duration_secs: 100.0,
        }];
        let result = ExecutionResult::new(workflows, 10.0, None);
        assert!(result.total_duration_secs >= 90.0);
    }

    #[test]
    fn comparison_classifies_failures() {
        let make = |messages: &[&str]| {
            let failures: Vec<Failure> = messages
                .iter()
                .map(|m| failure(FailureKind::Error, m))
                .collect();
            ExecutionResult::new(
                vec![WorkflowResult {
                    name: "ci".to_string(),
                    success: failures.is_empty(),
                    jobs: vec![JobResult {
                        name: "test".to_string(),
                        success: failures.is_empty(),
                        steps: vec![],
                        failures,
                        duration_secs: 1.0,
                    }],
                    duration_secs: 1.0,
                }],
                1.0,
                None,
            )
        };

        let previous = make(&["alpha failed", "beta failed"]);
        let current = make(&["beta failed", "gamma failed"]);
        let diff = LogComparison::between(&previous, &current);

        assert_eq!(diff.new_failures.len(), 1);
        assert_eq!(diff.resolved_failures.len(), 1);
        assert_eq!(diff.persistent_failures.len(), 1);
        assert!(diff.has_changes());
        assert!((diff.improvement_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn combined_fingerprint_is_order_independent() {
        let mut a = vec![
            failure(FailureKind::Error, "one"),
            failure(FailureKind::Error, "two"),
        ];
        let exec_a = ExecutionResult::new(
            vec![WorkflowResult {
                name: "w".to_string(),
                success: false,
                jobs: vec![JobResult {
                    name: "j".to_string(),
                    success: false,
                    steps: vec![],
                    failures: a.clone(),
                    duration_secs: 0.0,
                }],
                duration_secs: 0.0,
            }],
            0.0,
            None,
        );
        a.reverse();
        let exec_b = ExecutionResult::new(
            vec![WorkflowResult {
                name: "w".to_string(),
                success: false,
                jobs: vec![JobResult {
                    name: "j".to_string(),
                    success: false,
                    steps: vec![],
                    failures: a,
                    duration_secs: 0.0,
                }],
                duration_secs: 0.0,
            }],
            0.0,
            None,
        );
        assert_eq!(exec_a.combined_fingerprint(), exec_b.combined_fingerprint());
    }
}
