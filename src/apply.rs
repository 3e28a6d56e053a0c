//! Auto-fix application
//!
//! Applies an approved suggestion atomically: preflight re-validation,
//! snapshot, ordered step execution with atomic file writes and bounded
//! command timeouts, verification, and rollback on any failure. A
//! per-project lock file serializes filesystem mutation; read-only analyses
//! proceed unaffected.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::fixes::{validate_step, CommandPolicy, EditMode, FixStep, FixSuggestion};
use crate::model::hex_prefix;
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::util::resolve_project_path;

const APPLY_LOCK_FILE: &str = ".actlens/apply.lock";
const LOCK_RETRY_MS: u64 = 200;
const COMMAND_POLL_MS: u64 = 50;
const OUTPUT_TAIL_CHARS: usize = 1800;

/// Explicit caller permission for an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// The user said yes to this specific suggestion.
    Interactive,
    /// The auto-apply flag is set; only auto-applicable suggestions pass.
    AutoLowRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    pub success: bool,
    pub applied_steps: Vec<String>,
    pub snapshot_id: Option<String>,
    pub error: Option<String>,
    pub verification_passed: bool,
    pub rollback_available: bool,
}

pub struct AutoFixer<'a> {
    project_root: &'a Path,
    policy: &'a CommandPolicy,
    snapshots: SnapshotManager,
    command_timeout: Duration,
    lock_wait: Duration,
}

struct ApplyLock {
    file: std::fs::File,
}

impl Drop for ApplyLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl<'a> AutoFixer<'a> {
    pub fn new(
        project_root: &'a Path,
        policy: &'a CommandPolicy,
        command_timeout_secs: u64,
        mutation_lock_wait_secs: u64,
    ) -> Self {
        Self {
            project_root,
            policy,
            snapshots: SnapshotManager::new(project_root),
            command_timeout: Duration::from_secs(command_timeout_secs),
            lock_wait: Duration::from_secs(mutation_lock_wait_secs),
        }
    }

    /// Apply one suggestion. Policy violations and the approval gate fail
    /// before any side effect; once the snapshot exists, every failure path
    /// rolls back.
    pub fn apply(
        &self,
        suggestion: &FixSuggestion,
        approval: Approval,
        cancel: &CancellationToken,
    ) -> Result<FixResult> {
        if approval == Approval::AutoLowRisk && !suggestion.auto_applicable {
            return Err(Error::policy(format!(
                "suggestion {} is not auto-applicable and has no interactive approval",
                suggestion.id
            )));
        }

        // Preflight: re-validate against the filesystem as it is now.
        for (index, step) in suggestion.steps.iter().enumerate() {
            validate_step(step, self.project_root, self.policy).map_err(|err| {
                Error::policy(format!("preflight failed at step {index}: {err}"))
            })?;
            if let FixStep::FileCreate { target, .. } = step {
                if self.project_root.join(target).exists() {
                    return Err(Error::policy(format!(
                        "preflight failed at step {index}: {} already exists",
                        target.display()
                    )));
                }
            }
        }
        for prerequisite in &suggestion.prerequisites {
            if !self.check_predicate(prerequisite)? {
                return Err(Error::validation(
                    format!("suggestion {}", suggestion.id),
                    format!("prerequisite not satisfied: {prerequisite}"),
                ));
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _lock = self.mutation_lock()?;

        let targets = file_targets(&suggestion.steps);
        let snapshot = self
            .snapshots
            .create(&targets, &format!("before fix {}", suggestion.title))?;

        let mut applied_steps = Vec::new();
        for (index, step) in suggestion.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                self.rollback_or_fail(&snapshot)?;
                return Err(Error::Cancelled);
            }
            match self.run_step(step) {
                Ok(()) => applied_steps.push(step.describe()),
                Err(err) => {
                    tracing::warn!("step {index} failed, rolling back: {err}");
                    return self.fail_with_rollback(&snapshot, applied_steps, err.to_string());
                }
            }
        }

        // Verification: per-step predicates, then the template's global
        // validation sequence.
        for step in &suggestion.steps {
            if let Some(predicate) = step.validation() {
                if !self.check_predicate(predicate)? {
                    return self.fail_with_rollback(
                        &snapshot,
                        applied_steps,
                        format!("step validation failed: {predicate}"),
                    );
                }
            }
        }
        for predicate in &suggestion.validation_steps {
            if !self.check_predicate(predicate)? {
                return self.fail_with_rollback(
                    &snapshot,
                    applied_steps,
                    format!("validation failed: {predicate}"),
                );
            }
        }

        Ok(FixResult {
            success: true,
            applied_steps,
            snapshot_id: Some(snapshot.id.clone()),
            error: None,
            verification_passed: true,
            rollback_available: self.snapshots.verify(&snapshot),
        })
    }

    fn fail_with_rollback(
        &self,
        snapshot: &Snapshot,
        applied_steps: Vec<String>,
        error: String,
    ) -> Result<FixResult> {
        self.rollback_or_fail(snapshot)?;
        let rollback_available = self.verify_restored(snapshot);
        Ok(FixResult {
            success: false,
            applied_steps,
            snapshot_id: Some(snapshot.id.clone()),
            error: Some(error),
            verification_passed: false,
            rollback_available,
        })
    }

    /// A restore failure is fatal for the request and names the snapshot
    /// path so the user can restore by hand.
    fn rollback_or_fail(&self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.restore(snapshot).map_err(|err| Error::RollbackFailed {
            message: err.to_string(),
            snapshot_path: self.snapshots.snapshot_dir(&snapshot.id),
        })
    }

    /// After a restore, confirm the tree matches the snapshot bit for bit.
    fn verify_restored(&self, snapshot: &Snapshot) -> bool {
        for entry in &snapshot.entries {
            let absolute = self.project_root.join(&entry.original_path);
            if entry.tombstone {
                if absolute.exists() {
                    return false;
                }
                continue;
            }
            let Ok(bytes) = fs::read(&absolute) else {
                return false;
            };
            let digest = Sha256::digest(&bytes);
            if Some(hex_prefix(&digest, 64)) != entry.sha256 {
                return false;
            }
        }
        true
    }

    fn run_step(&self, step: &FixStep) -> Result<()> {
        match step {
            FixStep::FileEdit {
                target,
                mode,
                payload,
                pattern,
                ..
            } => self.edit_file(target, *mode, payload, pattern.as_deref()),
            FixStep::FileCreate {
                target, payload, ..
            } => {
                let resolved = resolve_project_path(self.project_root, target)?;
                if let Some(parent) = resolved.absolute.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| Error::io("creating parent directory", e))?;
                }
                write_file_atomic(&resolved.absolute, payload.as_bytes())
            }
            FixStep::FileDelete { target, .. } => {
                let resolved = resolve_project_path(self.project_root, target)?;
                if resolved.absolute.exists() {
                    fs::remove_file(&resolved.absolute)
                        .map_err(|e| Error::io(format!("deleting {}", target.display()), e))?;
                }
                Ok(())
            }
            FixStep::Command {
                argv, timeout_secs, ..
            } => {
                let timeout = timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.command_timeout);
                self.run_command(argv, timeout)
            }
        }
    }

    fn edit_file(
        &self,
        target: &Path,
        mode: EditMode,
        payload: &str,
        pattern: Option<&str>,
    ) -> Result<()> {
        let resolved = resolve_project_path(self.project_root, target)?;
        let existing = if resolved.absolute.exists() {
            fs::read_to_string(&resolved.absolute)
                .map_err(|e| Error::io(format!("reading {}", target.display()), e))?
        } else {
            String::new()
        };
        let updated = match mode {
            EditMode::Append => format!("{existing}{payload}"),
            EditMode::Prepend => format!("{payload}{existing}"),
            EditMode::Replace => payload.to_string(),
            EditMode::RegexSubstitute => {
                let raw = pattern.ok_or_else(|| {
                    Error::validation("file_edit", "regex_substitute requires a pattern")
                })?;
                let re = Regex::new(raw).map_err(|e| {
                    Error::validation("file_edit", format!("substitute pattern: {e}"))
                })?;
                re.replace_all(&existing, payload).into_owned()
            }
        };
        if let Some(parent) = resolved.absolute.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("creating parent directory", e))?;
        }
        write_file_atomic(&resolved.absolute, updated.as_bytes())
    }

    /// Run an allow-listed command with a sanitized environment, captured
    /// stdio, and a bounded timeout.
    fn run_command(&self, argv: &[String], timeout: Duration) -> Result<()> {
        let program = argv
            .first()
            .ok_or_else(|| Error::validation("command step", "argv must not be empty"))?;

        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .current_dir(self.project_root)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for key in ["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"] {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(format!("spawning `{program}`"), e))?;

        // Drain pipes on side threads so a chatty command cannot deadlock
        // against a full pipe buffer while we poll for exit.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = std::thread::spawn(move || drain_pipe(stdout));
        let stderr_reader = std::thread::spawn(move || drain_pipe(stderr));

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if started.elapsed() >= timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return Err(Error::Timeout {
                            seconds: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(COMMAND_POLL_MS));
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = stdout_reader.join();
                    let _ = stderr_reader.join();
                    return Err(Error::io("waiting for command", err));
                }
            }
        };

        let stdout_text = stdout_reader.join().unwrap_or_default();
        let stderr_text = stderr_reader.join().unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        let mut combined = stdout_text;
        if !stderr_text.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr_text);
        }
        Err(Error::External {
            component: format!("command `{}`", argv.join(" ")),
            message: format!(
                "exit status {}: {}",
                status.code().unwrap_or(-1),
                crate::util::truncate(combined.trim(), OUTPUT_TAIL_CHARS)
            ),
        })
    }

    /// Evaluate a validation predicate against the project tree.
    /// Supported forms: `file_exists:<rel>`, `file_absent:<rel>`,
    /// `file_contains:<rel>:<needle>`.
    fn check_predicate(&self, predicate: &str) -> Result<bool> {
        if let Some(rel) = predicate.strip_prefix("file_exists:") {
            return Ok(self.project_root.join(rel.trim()).exists());
        }
        if let Some(rel) = predicate.strip_prefix("file_absent:") {
            return Ok(!self.project_root.join(rel.trim()).exists());
        }
        if let Some(rest) = predicate.strip_prefix("file_contains:") {
            let (rel, needle) = rest.split_once(':').ok_or_else(|| {
                Error::validation("predicate", format!("malformed file_contains: {predicate}"))
            })?;
            let content = fs::read_to_string(self.project_root.join(rel.trim()))
                .unwrap_or_default();
            return Ok(content.contains(needle));
        }
        Err(Error::validation(
            "predicate",
            format!("unknown predicate form: {predicate}"),
        ))
    }

    /// Per-project filesystem mutation lock with a bounded retry window.
    fn mutation_lock(&self) -> Result<ApplyLock> {
        let lock_path = self.project_root.join(APPLY_LOCK_FILE);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("creating lock directory", e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| Error::io("opening apply lock", e))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(ApplyLock { file }),
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(Error::io("locking project for mutation", err));
                    }
                    if start.elapsed() >= self.lock_wait {
                        return Err(Error::Timeout {
                            seconds: self.lock_wait.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }
    }
}

fn drain_pipe<R: std::io::Read>(pipe: Option<R>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer);
    }
    buffer
}

/// Union of file paths the steps declare.
fn file_targets(steps: &[FixStep]) -> Vec<PathBuf> {
    let mut targets: Vec<PathBuf> = Vec::new();
    for step in steps {
        if let Some(target) = step.target_path() {
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_path_buf());
            }
        }
    }
    targets
}

/// Atomic write: sibling temp file in the same directory, fsync, rename.
fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::validation("file write", "target has no parent directory"))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());
    let tmp = parent.join(format!(".{file_name}.actlens-tmp"));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| Error::io("creating temp file", e))?;
    file.write_all(bytes)
        .map_err(|e| Error::io("writing temp file", e))?;
    file.sync_all().map_err(|e| Error::io("syncing temp file", e))?;
    drop(file);

    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::io(format!("renaming into {}", path.display()), err));
    }
    Ok(())
}
