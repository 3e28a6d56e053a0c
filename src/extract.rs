//! Failure extraction from runner logs
//!
//! Parses the step structure a GitHub-Actions-compatible local runner prints
//! (bracketed `[workflow/job]` prefixes, star/check/cross step markers, exit
//! code lines) and scans failed steps for language-specific failure signals.
//! Parsing is best-effort throughout: a section we cannot make sense of
//! becomes an `unknown` failure with the raw chunk as context, never an
//! error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;

use crate::model::{
    ExecutionResult, Failure, FailureKind, JobResult, LogOrigin, StepResult, WorkflowResult,
};

/// Lines of trailing context attached to a synthetic unknown failure.
const SYNTHETIC_CONTEXT_LINES: usize = 20;

fn signal_table() -> &'static Vec<(FailureKind, Regex)> {
    static TABLE: OnceLock<Vec<(FailureKind, Regex)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let compile = |p: &str| Regex::new(p).expect("builtin signal regex");
        // Specific kinds first; the generic error family claims what is left.
        vec![
            (FailureKind::Assertion, compile(r"(?i)^\s*AssertionError\b.*")),
            (FailureKind::Assertion, compile(r"^E\s{3,}\S.*")),
            (FailureKind::Assertion, compile(r"^\s*✕\s+.+")),
            (FailureKind::Assertion, compile(r"(?i)\bassert(?:ion)?\s+.*\bfailed\b.*")),
            (FailureKind::Assertion, compile(r"^FAILED\s+\S+.*")),
            (
                FailureKind::Timeout,
                compile(r"(?i).*\b(timed out|timeout exceeded|timeout expired|etimedout|deadline exceeded)\b.*"),
            ),
            (FailureKind::Syntax, compile(r"(?i)^\s*SyntaxError\b.*")),
            (FailureKind::Syntax, compile(r"(?i).*\bsyntax error\b.*")),
            (FailureKind::Syntax, compile(r"(?i)^\s*IndentationError\b.*")),
            (
                FailureKind::Dependency,
                compile(r"ModuleNotFoundError: No module named '(?P<module>[^']+)'.*"),
            ),
            (FailureKind::Dependency, compile(r"(?i)^ImportError\b.*")),
            (
                FailureKind::Dependency,
                compile(r"(?i).*Cannot find module '(?P<module>[^']+)'.*"),
            ),
            (FailureKind::Dependency, compile(r".*npm ERR! 404.*")),
            (FailureKind::Dependency, compile(r"(?i).*\bunresolved import\b.*")),
            (
                FailureKind::Dependency,
                compile(r"(?i).*Package\s+\S+\s+not found.*"),
            ),
            (FailureKind::Permission, compile(r"(?i).*permission denied.*")),
            (FailureKind::Permission, compile(r".*\bEACCES\b.*")),
            (FailureKind::Permission, compile(r"(?i).*access (?:is )?denied.*")),
            (
                FailureKind::Permission,
                compile(r"(?i).*operation not permitted.*"),
            ),
            (
                FailureKind::Network,
                compile(r"(?i).*connection (?:refused|reset|aborted|closed by remote).*"),
            ),
            (FailureKind::Network, compile(r"(?i).*could not resolve host.*")),
            (FailureKind::Network, compile(r".*getaddrinfo\s+\S+.*")),
            (
                FailureKind::Network,
                compile(r"(?i).*network (?:is )?unreachable.*"),
            ),
            (
                FailureKind::Network,
                compile(r"(?i).*\bssl(?:\s+error|error|\s+certificate problem)\b.*"),
            ),
            (FailureKind::Error, compile(r"^##\[error\].*")),
            (FailureKind::Error, compile(r"^::error\b.*")),
            (FailureKind::Error, compile(r"(?i)^Error:\s*.+")),
            (FailureKind::Error, compile(r"^[A-Z][A-Za-z]*Error:\s.*")),
            (FailureKind::Error, compile(r"^\[ERROR\]\s*.+")),
            (FailureKind::Error, compile(r"^error(?:\[E\d+\])?:\s*.+")),
            (FailureKind::Error, compile(r"^npm ERR!\s*.+")),
            (FailureKind::Error, compile(r".*: command not found$")),
            (FailureKind::Error, compile(r".*: No such file or directory$")),
        ]
    })
}

fn warning_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^##\[warning\]|^\s*warn(?:ing)?[:\[]|\bwarning:\s)").expect("static regex")
    })
}

fn exit_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Process completed with exit code (\d+)").expect("static regex")
    })
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // act-style worker prefix: [workflow/job] rest
    RE.get_or_init(|| Regex::new(r"^\[([^\]/|]+)/([^\]|]+)\]\s?(.*)$").expect("static regex"))
}

fn step_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:⭐\s+Run\s+|##\[group\]Run\s+)(?:Main\s+)?(.+?)\s*$").expect("static regex")
    })
}

fn step_end_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(✅|❌)\s+(?:Success|Failure)\s+-\s+(?:Main\s+)?(.+?)(?:\s+\[(\d+(?:\.\d+)?)s\])?\s*$")
            .expect("static regex")
    })
}

fn file_line_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        vec![
            Regex::new(r"::error file=([^,]+),line=(\d+)").expect("static regex"),
            Regex::new(r#"File "([^"]+)", line (\d+)"#).expect("static regex"),
            Regex::new(r"([A-Za-z0-9_./\\-]+\.[A-Za-z]{1,4}):(\d+)").expect("static regex"),
        ]
    })
}

/// True when a line carries a failure signal. The compressor relies on this
/// to keep error regions intact.
pub fn is_failure_signal(line: &str) -> bool {
    if exit_code_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str() != "0")
        .unwrap_or(false)
    {
        return true;
    }
    if line.contains('❌') {
        return true;
    }
    signal_table().iter().any(|(_, re)| re.is_match(line))
}

pub fn is_warning_line(line: &str) -> bool {
    warning_re().is_match(line)
}

#[derive(Debug)]
struct RawStep {
    name: String,
    lines: Vec<String>,
    success: Option<bool>,
    duration_secs: f64,
    exit_code: Option<i32>,
}

impl RawStep {
    fn new(name: String) -> Self {
        Self {
            name,
            lines: Vec::new(),
            success: None,
            duration_secs: 0.0,
            exit_code: None,
        }
    }

    fn failed(&self) -> bool {
        matches!(self.success, Some(false)) || self.exit_code.map(|c| c != 0).unwrap_or(false)
    }
}

pub struct Extractor {
    context_lines: usize,
}

impl Extractor {
    pub fn new(context_lines: usize) -> Self {
        Self { context_lines }
    }

    /// Parse a (sanitized, possibly compressed) log into an execution tree.
    pub fn extract(&self, log: &str, origin: &LogOrigin) -> ExecutionResult {
        let streams = demultiplex(log, origin);

        let mut workflows: Vec<WorkflowResult> = Vec::new();
        for ((workflow_name, job_name), lines) in streams {
            let job = self.extract_job(&job_name, &lines);
            match workflows.iter_mut().find(|w| w.name == workflow_name) {
                Some(workflow) => {
                    workflow.duration_secs += job.duration_secs;
                    workflow.success = workflow.success && job.success;
                    workflow.jobs.push(job);
                }
                None => workflows.push(WorkflowResult {
                    name: workflow_name,
                    success: job.success,
                    duration_secs: job.duration_secs,
                    jobs: vec![job],
                }),
            }
        }

        let total: f64 = workflows.iter().map(|w| w.duration_secs).sum();
        ExecutionResult::new(workflows, total, None)
    }

    fn extract_job(&self, job_name: &str, lines: &[String]) -> JobResult {
        let mut steps: Vec<RawStep> = Vec::new();
        let mut current: Option<RawStep> = None;
        let mut preamble: Vec<String> = Vec::new();

        for line in lines {
            if let Some(caps) = step_start_re().captures(line) {
                if let Some(step) = current.take() {
                    steps.push(step);
                }
                current = Some(RawStep::new(caps[1].to_string()));
                continue;
            }
            if let Some(caps) = step_end_re().captures(line) {
                let success = &caps[1] == "✅";
                let duration = caps
                    .get(3)
                    .and_then(|m| m.as_str().parse::<f64>().ok())
                    .unwrap_or(0.0);
                let name = caps[2].to_string();
                let mut step = current
                    .take()
                    .unwrap_or_else(|| RawStep::new(name.clone()));
                step.success = Some(success);
                step.duration_secs = duration;
                steps.push(step);
                continue;
            }
            if let Some(caps) = exit_code_re().captures(line) {
                let code = caps[1].parse::<i32>().unwrap_or(-1);
                if let Some(step) = current.as_mut() {
                    step.exit_code = Some(code);
                    if code != 0 {
                        step.success = Some(false);
                    }
                    step.lines.push(line.clone());
                } else {
                    preamble.push(line.clone());
                }
                continue;
            }
            match current.as_mut() {
                Some(step) => step.lines.push(line.clone()),
                None => preamble.push(line.clone()),
            }
        }
        if let Some(step) = current.take() {
            steps.push(step);
        }

        let mut failures: Vec<Failure> = Vec::new();
        if steps.is_empty() {
            // No step structure at all: treat the stream as one blob.
            failures.extend(self.scan_failures(&preamble));
            let nonzero_exit = preamble.iter().any(|l| {
                exit_code_re()
                    .captures(l)
                    .map(|c| &c[1] != "0")
                    .unwrap_or(false)
            });
            let success = failures.is_empty() && !nonzero_exit;
            if !success && failures.is_empty() {
                failures.push(self.synthetic_failure(job_name, None, &preamble));
            }
            return JobResult {
                name: job_name.to_string(),
                success,
                steps: Vec::new(),
                failures,
                duration_secs: 0.0,
            };
        }

        for step in &steps {
            if !step.failed() {
                continue;
            }
            let step_failures = self.scan_failures(&step.lines);
            if step_failures.is_empty() {
                failures.push(self.synthetic_failure(&step.name, step.exit_code, &step.lines));
            } else {
                failures.extend(step_failures);
            }
        }

        let step_results: Vec<StepResult> = steps
            .iter()
            .map(|s| StepResult {
                name: s.name.clone(),
                success: !s.failed(),
                duration_secs: s.duration_secs,
                exit_code: s.exit_code,
            })
            .collect();
        let success = step_results.iter().all(|s| s.success);
        let duration_secs = step_results.iter().map(|s| s.duration_secs).sum();

        JobResult {
            name: job_name.to_string(),
            success,
            steps: step_results,
            failures,
            duration_secs,
        }
    }

    /// Scan a block of lines for failure signals, attaching context windows,
    /// file locations, and stack traces. Near-identical signals collapse
    /// into one failure with an occurrence counter.
    fn scan_failures(&self, lines: &[String]) -> Vec<Failure> {
        let mut claimed: Vec<bool> = vec![false; lines.len()];
        let mut ordered: Vec<Failure> = Vec::new();
        let mut seen: HashMap<String, usize> = HashMap::new();

        for (kind, re) in signal_table() {
            for (i, line) in lines.iter().enumerate() {
                if claimed[i] || !re.is_match(line) {
                    continue;
                }
                claimed[i] = true;

                let message = line.trim().to_string();
                let (file_path, line_number) = extract_file_location(line);
                let mut failure =
                    Failure::new(*kind, message, file_path, line_number);
                failure.context_before = window(lines, i, self.context_lines, true);
                failure.context_after = window(lines, i, self.context_lines, false);
                failure.stack_trace = extract_stack_trace(lines, i);

                match seen.get(&failure.fingerprint) {
                    Some(&idx) => ordered[idx].occurrences += 1,
                    None => {
                        seen.insert(failure.fingerprint.clone(), ordered.len());
                        ordered.push(failure);
                    }
                }
            }
        }
        ordered
    }

    fn synthetic_failure(
        &self,
        step_name: &str,
        exit_code: Option<i32>,
        lines: &[String],
    ) -> Failure {
        let message = match exit_code {
            Some(code) => format!("step `{step_name}` failed with exit code {code}"),
            None => format!("step `{step_name}` failed without a recognized signal"),
        };
        let mut failure = Failure::new(FailureKind::Unknown, message, None, None);
        let tail_start = lines.len().saturating_sub(SYNTHETIC_CONTEXT_LINES);
        failure.context_before = lines[tail_start..].to_vec();
        failure
    }
}

fn window(lines: &[String], at: usize, k: usize, before: bool) -> Vec<String> {
    if before {
        let start = at.saturating_sub(k);
        lines[start..at].to_vec()
    } else {
        let end = (at + 1 + k).min(lines.len());
        lines[at + 1..end].to_vec()
    }
}

fn extract_file_location(line: &str) -> (Option<PathBuf>, Option<u32>) {
    for re in file_line_res() {
        if let Some(caps) = re.captures(line) {
            let path = caps.get(1).map(|m| PathBuf::from(m.as_str()));
            let number = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
            return (path, number);
        }
    }
    (None, None)
}

/// Capture a Python traceback or JS/Java-style frame block adjacent to the
/// signal line.
fn extract_stack_trace(lines: &[String], at: usize) -> Option<String> {
    static FRAME: OnceLock<Regex> = OnceLock::new();
    let frame = FRAME.get_or_init(|| Regex::new(r"^\s+at\s+\S+").expect("static regex"));

    // Python: the traceback header precedes the error line.
    for back in (at.saturating_sub(40)..at).rev() {
        if lines[back].starts_with("Traceback (most recent call last):") {
            let block: Vec<&str> = lines[back..=at].iter().map(|s| s.as_str()).collect();
            return Some(block.join("\n"));
        }
        if !lines[back].starts_with(' ') && !lines[back].is_empty() {
            break;
        }
    }

    // JS/Java: `at ...` frames follow the error line.
    let mut frames: Vec<&str> = Vec::new();
    for line in lines.iter().skip(at + 1) {
        if frame.is_match(line) {
            frames.push(line.as_str());
        } else {
            break;
        }
    }
    if frames.is_empty() {
        None
    } else {
        Some(frames.join("\n"))
    }
}

/// Split interleaved runner output into per-(workflow, job) streams using the
/// bracketed prefix markers. Without markers the whole log is one stream.
fn demultiplex(log: &str, origin: &LogOrigin) -> Vec<((String, String), Vec<String>)> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut streams: HashMap<(String, String), Vec<String>> = HashMap::new();

    let fallback_key = (
        origin
            .workflow
            .clone()
            .unwrap_or_else(|| "workflow".to_string()),
        origin.job.clone().unwrap_or_else(|| "job".to_string()),
    );

    let mut any_prefix = false;
    for line in log.lines() {
        let (key, rest) = match prefix_re().captures(line) {
            Some(caps) => {
                any_prefix = true;
                (
                    (caps[1].trim().to_string(), caps[2].trim().to_string()),
                    caps[3].to_string(),
                )
            }
            None => (fallback_key.clone(), line.to_string()),
        };
        if !streams.contains_key(&key) {
            order.push(key.clone());
        }
        streams.entry(key).or_default().push(rest);
    }

    if !any_prefix {
        let lines: Vec<String> = log.lines().map(|l| l.to_string()).collect();
        return vec![(fallback_key, lines)];
    }

    order
        .into_iter()
        .map(|key| {
            let lines = streams.remove(&key).unwrap_or_default();
            (key, lines)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> Extractor {
        Extractor::new(5)
    }

    #[test]
    fn docker_permission_line_yields_permission_failure() {
        let log = "\
[CI/build] ⭐ Run Main docker build\n\
[CI/build] permission denied while trying to connect to the Docker daemon socket\n\
[CI/build] Process completed with exit code 1\n\
[CI/build] ❌ Failure - Main docker build [2.1s]\n";
        let result = extractor().extract(log, &LogOrigin::default());
        assert!(!result.success);
        let failures = result.all_failures();
        assert!(failures
            .iter()
            .any(|f| f.kind == FailureKind::Permission
                && f.message.contains("permission denied")));
    }

    #[test]
    fn module_not_found_is_a_dependency_failure() {
        let log = "\
⭐ Run Main pytest\n\
ModuleNotFoundError: No module named 'requests'\n\
Process completed with exit code 1\n\
❌ Failure - Main pytest [3.0s]\n";
        let result = extractor().extract(log, &LogOrigin::default());
        let failures = result.all_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Dependency);
        assert!(failures[0].message.contains("requests"));
    }

    #[test]
    fn context_window_contains_the_signal_line() {
        let mut log = String::from("⭐ Run Main tests\n");
        for i in 0..10 {
            log.push_str(&format!("setup line {i}\n"));
        }
        log.push_str("Error: database exploded\n");
        for i in 0..10 {
            log.push_str(&format!("teardown line {i}\n"));
        }
        log.push_str("Process completed with exit code 1\n");
        let result = extractor().extract(&log, &LogOrigin::default());
        let failures = result.all_failures();
        let failure = failures
            .iter()
            .find(|f| f.message.contains("database exploded"))
            .expect("failure extracted");
        assert_eq!(failure.context_before.len(), 5);
        assert_eq!(failure.context_after.len(), 5);
        assert!(failure.context_before[4].contains("setup line 9"));
    }

    #[test]
    fn nonzero_exit_without_signal_becomes_synthetic_unknown() {
        let mut log = String::from("⭐ Run Main flaky step\n");
        for i in 0..30 {
            log.push_str(&format!("benign output {i}\n"));
        }
        log.push_str("Process completed with exit code 7\n");
        let result = extractor().extract(&log, &LogOrigin::default());
        let failures = result.all_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Unknown);
        assert!(failures[0].message.contains("exit code 7"));
        assert_eq!(failures[0].context_before.len(), 20);
    }

    #[test]
    fn repeated_signals_collapse_with_occurrences() {
        let mut log = String::from("⭐ Run Main tests\n");
        for _ in 0..4 {
            log.push_str("Error: flaky widget 12 timed out waiting\n");
        }
        log.push_str("Process completed with exit code 1\n");
        let result = extractor().extract(&log, &LogOrigin::default());
        let failures = result.all_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].occurrences, 4);
    }

    #[test]
    fn interleaved_workers_are_demultiplexed() {
        let log = "\
[CI/lint] ⭐ Run Main ruff\n\
[CI/test] ⭐ Run Main pytest\n\
[CI/lint] ✅ Success - Main ruff [1.0s]\n\
[CI/test] Error: assertion blew up\n\
[CI/test] Process completed with exit code 1\n\
[CI/test] ❌ Failure - Main pytest [4.0s]\n";
        let result = extractor().extract(log, &LogOrigin::default());
        assert_eq!(result.workflows.len(), 1);
        assert_eq!(result.workflows[0].jobs.len(), 2);
        let lint = &result.workflows[0].jobs[0];
        let test = &result.workflows[0].jobs[1];
        assert!(lint.success);
        assert!(!test.success);
        assert_eq!(test.failures.len(), 1);
    }

    #[test]
    fn python_traceback_is_captured() {
        let log = "\
⭐ Run Main pytest\n\
Traceback (most recent call last):\n\
  File \"app/main.py\", line 42, in handler\n\
    do_work()\n\
ValueError: bad input\n\
Error: job failed\n\
Process completed with exit code 1\n";
        let result = extractor().extract(log, &LogOrigin::default());
        let failures = result.all_failures();
        assert!(failures.iter().any(|f| f
            .stack_trace
            .as_deref()
            .map(|t| t.contains("Traceback"))
            .unwrap_or(false)));
    }

    #[test]
    fn file_and_line_are_extracted() {
        let log = "\
⭐ Run Main build\n\
::error file=src/lib.rs,line=88\n\
error: expected one of `,` found `;` src/lib.rs:88\n\
Process completed with exit code 1\n";
        let result = extractor().extract(log, &LogOrigin::default());
        let failures = result.all_failures();
        assert!(failures.iter().any(|f| {
            f.file_path.as_deref() == Some(std::path::Path::new("src/lib.rs"))
                && f.line_number == Some(88)
        }));
    }

    #[test]
    fn unstructured_log_is_a_single_stream() {
        let log = "just some text\nError: something broke\nmore text\n";
        let result = extractor().extract(log, &LogOrigin::default());
        assert_eq!(result.workflows.len(), 1);
        assert_eq!(result.workflows[0].jobs.len(), 1);
        assert_eq!(result.total_failures(), 1);
        assert!(!result.success);
    }

    #[test]
    fn clean_log_is_successful() {
        let log = "\
⭐ Run Main build\n\
compiling...\n\
✅ Success - Main build [5.0s]\n";
        let result = extractor().extract(log, &LogOrigin::default());
        assert!(result.success);
        assert_eq!(result.total_failures(), 0);
    }
}
