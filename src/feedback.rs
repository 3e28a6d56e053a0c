//! User feedback log
//!
//! One JSON object per line, append-only, never rewritten in place. Appends
//! go through an `O_APPEND` handle; durability is an fsync every N entries
//! or T seconds, whichever trips first. Loss on disk failure is accepted
//! and surfaced, there is no retry queue.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::sanitize::Sanitizer;

const FEEDBACK_FILE: &str = ".actlens/feedback.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    pub id: Uuid,
    pub pattern_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_id: Option<String>,
    /// 1 (useless) to 5 (fixed it outright).
    pub rating: u8,
    pub success: bool,
    #[serde(default)]
    pub comment: String,
    pub timestamp: DateTime<Utc>,
}

impl UserFeedback {
    pub fn new(
        pattern_id: &str,
        suggestion_id: Option<String>,
        rating: u8,
        success: bool,
        comment: &str,
        sanitizer: &Sanitizer,
    ) -> Result<Self> {
        if !(1..=5).contains(&rating) {
            return Err(Error::validation("feedback", "rating must be 1..=5"));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            pattern_id: pattern_id.to_string(),
            suggestion_id,
            rating,
            success,
            comment: sanitizer.sanitize(comment),
            timestamp: Utc::now(),
        })
    }
}

struct WriterState {
    file: File,
    unsynced: usize,
    last_sync: Instant,
}

pub struct FeedbackRecorder {
    path: PathBuf,
    state: Mutex<Option<WriterState>>,
    fsync_every: usize,
    fsync_interval: Duration,
}

impl FeedbackRecorder {
    pub fn new(project_root: &Path, fsync_every: usize, fsync_secs: u64) -> Self {
        Self {
            path: project_root.join(FEEDBACK_FILE),
            state: Mutex::new(None),
            fsync_every: fsync_every.max(1),
            fsync_interval: Duration::from_secs(fsync_secs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one feedback entry. Concurrent appends are safe at the OS
    /// level via `O_APPEND`.
    pub fn record(&self, feedback: &UserFeedback) -> Result<()> {
        let mut guard = self.state.lock().expect("feedback writer lock");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io("creating feedback directory", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| Error::io("opening feedback log", e))?;
            *guard = Some(WriterState {
                file,
                unsynced: 0,
                last_sync: Instant::now(),
            });
        }
        let state = guard.as_mut().expect("writer state just initialized");

        let row = serde_json::to_string(feedback)
            .map_err(|e| Error::validation("feedback", format!("serialize failed: {e}")))?;
        writeln!(state.file, "{row}").map_err(|e| Error::io("appending feedback", e))?;

        state.unsynced += 1;
        if state.unsynced >= self.fsync_every || state.last_sync.elapsed() >= self.fsync_interval
        {
            state
                .file
                .sync_data()
                .map_err(|e| Error::io("syncing feedback log", e))?;
            state.unsynced = 0;
            state.last_sync = Instant::now();
        }
        Ok(())
    }

    /// Flush any buffered durability debt.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.state.lock().expect("feedback writer lock");
        if let Some(state) = guard.as_mut() {
            state
                .file
                .sync_data()
                .map_err(|e| Error::io("syncing feedback log", e))?;
            state.unsynced = 0;
            state.last_sync = Instant::now();
        }
        Ok(())
    }

    /// All recorded feedback, oldest first. Unparseable lines are skipped.
    pub fn load(&self) -> Result<Vec<UserFeedback>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| Error::io("reading feedback log", e))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<UserFeedback>(line).ok())
            .collect())
    }

    /// Read view grouped by pattern id.
    pub fn grouped_by_pattern(&self) -> Result<BTreeMap<String, Vec<UserFeedback>>> {
        let mut grouped: BTreeMap<String, Vec<UserFeedback>> = BTreeMap::new();
        for feedback in self.load()? {
            grouped
                .entry(feedback.pattern_id.clone())
                .or_default()
                .push(feedback);
        }
        Ok(grouped)
    }
}
