//! Learning engine
//!
//! Runs off the analysis hot path. Folds recorded feedback into pattern
//! statistics (exactly once per feedback entry), accumulates unknown
//! failures, and discovers candidate patterns from groups of similar
//! recurring failures. Candidates are never auto-promoted; they sit in a
//! pending list until an operator accepts them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feedback::FeedbackRecorder;
use crate::model::{normalize_message, Failure};
use crate::patterns::{Pattern, PatternCategory, PatternFile, PatternSource, PatternStore};

const UNKNOWN_LOG_FILE: &str = ".actlens/unknown_failures.jsonl";
const LEDGER_FILE: &str = ".actlens/learning/processed_feedback.json";
const PENDING_FILE: &str = ".actlens/patterns/pending_patterns.json";

/// How many top-frequency keywords a candidate pattern carries.
const CANDIDATE_KEYWORDS: usize = 6;
/// Messages are capped before the common-substring scan.
const LCS_MESSAGE_CAP: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownFailureRecord {
    pub fingerprint: String,
    pub message: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProcessedLedger {
    #[serde(default)]
    processed: HashSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsUpdateReport {
    pub applied: usize,
    pub skipped: usize,
}

pub struct LearningEngine<'a> {
    project_root: &'a Path,
    store: &'a PatternStore,
    ewma_alpha: f64,
}

impl<'a> LearningEngine<'a> {
    pub fn new(project_root: &'a Path, store: &'a PatternStore, ewma_alpha: f64) -> Self {
        Self {
            project_root,
            store,
            ewma_alpha,
        }
    }

    /// Append one unknown failure to the accumulation log.
    pub fn record_unknown(&self, failure: &Failure, run_id: &str) -> Result<()> {
        let path = self.project_root.join(UNKNOWN_LOG_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io("creating unknown-failure directory", e))?;
        }
        let record = UnknownFailureRecord {
            fingerprint: failure.fingerprint.clone(),
            message: failure.message.clone(),
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
        };
        let row = serde_json::to_string(&record)
            .map_err(|e| Error::validation("unknown failure", format!("serialize failed: {e}")))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io("opening unknown-failure log", e))?;
        writeln!(file, "{row}").map_err(|e| Error::io("appending unknown failure", e))?;
        Ok(())
    }

    /// Fold every unprocessed feedback entry into its pattern's statistics.
    /// Each entry is applied exactly once, keyed by timestamp + id.
    pub fn update_stats_from_feedback(
        &self,
        recorder: &FeedbackRecorder,
    ) -> Result<StatsUpdateReport> {
        let ledger_path = self.project_root.join(LEDGER_FILE);
        let mut ledger: ProcessedLedger = fs::read_to_string(&ledger_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        let mut report = StatsUpdateReport::default();
        for feedback in recorder.load()? {
            let key = format!("{}|{}", feedback.timestamp.to_rfc3339(), feedback.id);
            if ledger.processed.contains(&key) {
                report.skipped += 1;
                continue;
            }
            match self
                .store
                .update_stats(&feedback.pattern_id, feedback.success, self.ewma_alpha)
            {
                Ok(_) => {
                    ledger.processed.insert(key);
                    report.applied += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        "stat update for pattern {} skipped: {err}",
                        feedback.pattern_id
                    );
                    report.skipped += 1;
                }
            }
        }

        if let Some(parent) = ledger_path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io("creating learning directory", e))?;
        }
        let rendered = serde_json::to_string_pretty(&ledger)
            .map_err(|e| Error::validation("ledger", format!("serialize failed: {e}")))?;
        fs::write(&ledger_path, rendered).map_err(|e| Error::io("writing ledger", e))?;
        Ok(report)
    }

    /// Group the unknown-failure log by fingerprint and textual similarity;
    /// synthesize a candidate pattern for every group seen in at least
    /// `min_occurrences` distinct runs. Candidates land in the pending list.
    pub fn discover_candidates(
        &self,
        min_occurrences: usize,
        similarity: f64,
    ) -> Result<Vec<Pattern>> {
        let records = self.load_unknown()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // First pass: exact fingerprint groups.
        let mut by_fingerprint: BTreeMap<String, Vec<&UnknownFailureRecord>> = BTreeMap::new();
        for record in &records {
            by_fingerprint
                .entry(record.fingerprint.clone())
                .or_default()
                .push(record);
        }

        // Second pass: merge groups whose shingled token sets overlap.
        let keys: Vec<String> = by_fingerprint.keys().cloned().collect();
        let shingle_sets: Vec<HashSet<String>> = keys
            .iter()
            .map(|k| shingles(&normalize_message(&by_fingerprint[k][0].message)))
            .collect();
        let mut merged_into: Vec<usize> = (0..keys.len()).collect();
        for i in 0..keys.len() {
            for j in (i + 1)..keys.len() {
                if merged_into[j] != j {
                    continue;
                }
                if jaccard(&shingle_sets[i], &shingle_sets[j]) >= similarity {
                    merged_into[j] = merged_into[i];
                }
            }
        }
        let mut groups: BTreeMap<usize, Vec<&UnknownFailureRecord>> = BTreeMap::new();
        for (index, key) in keys.iter().enumerate() {
            let root = merged_into[index];
            groups
                .entry(root)
                .or_default()
                .extend(by_fingerprint[key].iter().copied());
        }

        let mut pending = self.load_pending()?;
        let mut candidates = Vec::new();
        for group in groups.values() {
            let distinct_runs: HashSet<&str> =
                group.iter().map(|r| r.run_id.as_str()).collect();
            if distinct_runs.len() < min_occurrences {
                continue;
            }

            let candidate = synthesize_candidate(group)?;
            let already_known = pending.patterns.iter().any(|p| p.id == candidate.id)
                || self.store.by_id(&candidate.id).is_some();
            if already_known {
                continue;
            }
            pending.patterns.push(candidate.clone());
            candidates.push(candidate);
        }

        if !candidates.is_empty() {
            pending.patterns.sort_by(|a, b| a.id.cmp(&b.id));
            self.save_pending(&pending)?;
        }
        Ok(candidates)
    }

    /// Candidates awaiting operator review.
    pub fn pending_candidates(&self) -> Result<Vec<Pattern>> {
        Ok(self.load_pending()?.patterns)
    }

    /// Move one candidate from pending into the enabled learned set.
    pub fn promote_candidate(&self, id: &str) -> Result<Pattern> {
        let mut pending = self.load_pending()?;
        let index = pending
            .patterns
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::validation("candidate", format!("unknown candidate id: {id}")))?;
        let mut pattern = pending.patterns.remove(index);
        pattern.enabled = true;
        pattern.disabled_reason = None;
        pattern.updated_at = Utc::now();
        self.store.upsert_learned(pattern.clone())?;
        self.save_pending(&pending)?;
        Ok(pattern)
    }

    fn load_unknown(&self) -> Result<Vec<UnknownFailureRecord>> {
        let path = self.project_root.join(UNKNOWN_LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::io("reading unknown-failure log", e))?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    fn pending_path(&self) -> PathBuf {
        self.project_root.join(PENDING_FILE)
    }

    fn load_pending(&self) -> Result<PatternFile> {
        let path = self.pending_path();
        if !path.exists() {
            return Ok(PatternFile::default());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| Error::io("reading pending patterns", e))?;
        serde_json::from_str(&content).map_err(|e| {
            Error::validation("pending patterns", format!("file does not parse: {e}"))
        })
    }

    fn save_pending(&self, pending: &PatternFile) -> Result<()> {
        let path = self.pending_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io("creating patterns directory", e))?;
        }
        fs::write(&path, pending.to_pretty_json()?)
            .map_err(|e| Error::io("writing pending patterns", e))
    }
}

fn synthesize_candidate(group: &[&UnknownFailureRecord]) -> Result<Pattern> {
    let frame = group
        .iter()
        .map(|r| cap_chars(&r.message, LCS_MESSAGE_CAP))
        .reduce(|acc, msg| longest_common_substring(&acc, &msg))
        .unwrap_or_default();
    let regex = if frame.trim().len() >= 8 {
        generalize_to_regex(frame.trim())
    } else {
        // Too little common text to frame a regex; fall back to the most
        // recent message verbatim.
        generalize_to_regex(cap_chars(&group[group.len() - 1].message, LCS_MESSAGE_CAP).trim())
    };

    let keywords = top_keywords(group, CANDIDATE_KEYWORDS);
    let id = format!(
        "learned_{}",
        &group[0].fingerprint[..group[0].fingerprint.len().min(12)]
    );
    let name = if keywords.is_empty() {
        id.clone()
    } else {
        format!("recurring failure: {}", keywords.join(" "))
    };

    let now = Utc::now();
    let pattern = Pattern {
        id,
        name,
        category: PatternCategory::Unknown,
        regex_patterns: vec![regex],
        keywords,
        context_requirements: vec![],
        base_confidence: 0.5,
        success_rate: 0.5,
        occurrence_count: group.len() as u64,
        source: PatternSource::Learned,
        created_at: now,
        updated_at: now,
        enabled: false,
        disabled_reason: Some("pending operator review".to_string()),
        extra: serde_json::Map::new(),
    };
    pattern.validate()?;
    Ok(pattern)
}

fn cap_chars(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}

/// Classic DP longest common substring over chars.
fn longest_common_substring(a: &str, b: &str) -> String {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() || b_chars.is_empty() {
        return String::new();
    }
    let mut best_len = 0usize;
    let mut best_end = 0usize;
    let mut previous = vec![0usize; b_chars.len() + 1];
    for (i, &ac) in a_chars.iter().enumerate() {
        let mut current = vec![0usize; b_chars.len() + 1];
        for (j, &bc) in b_chars.iter().enumerate() {
            if ac == bc {
                current[j + 1] = previous[j] + 1;
                if current[j + 1] > best_len {
                    best_len = current[j + 1];
                    best_end = i + 1;
                }
            }
        }
        previous = current;
    }
    a_chars[best_end - best_len..best_end].iter().collect()
}

/// Escape the frame for regex use, generalizing digit runs to `\d+`.
fn generalize_to_regex(frame: &str) -> String {
    let mut out = String::with_capacity(frame.len() + 8);
    let mut in_digits = false;
    for c in frame.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                out.push_str(r"\d+");
                in_digits = true;
            }
        } else {
            in_digits = false;
            if regex_syntax_special(c) {
                out.push('\\');
            }
            out.push(c);
        }
    }
    out
}

fn regex_syntax_special(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
    )
}

/// Token 3-shingles of a normalized message.
fn shingles(normalized: &str) -> HashSet<String> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    if tokens.len() < 3 {
        return tokens.iter().map(|t| t.to_string()).collect();
    }
    tokens.windows(3).map(|w| w.join(" ")).collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Top-K tokens by frequency across the group's messages.
fn top_keywords(group: &[&UnknownFailureRecord], k: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for record in group {
        for token in record
            .message
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 3 && !t.chars().all(|c| c.is_ascii_digit()))
        {
            *counts.entry(token.to_string()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(k).map(|(token, _)| token).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureKind;
    use crate::sanitize::Sanitizer;

    fn unknown_failure(message: &str) -> Failure {
        Failure::new(FailureKind::Unknown, message.to_string(), None, None)
    }

    #[test]
    fn recurring_unknown_failures_become_one_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path()).unwrap();
        let engine = LearningEngine::new(dir.path(), &store, 0.2);

        for run in 0..5 {
            let failure =
                unknown_failure("CustomLib[ERROR]: widget not found in registry-42");
            engine.record_unknown(&failure, &format!("run-{run}")).unwrap();
        }

        let candidates = engine.discover_candidates(3, 0.7).unwrap();
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.category, PatternCategory::Unknown);
        assert_eq!(candidate.source, PatternSource::Learned);
        assert_eq!(candidate.occurrence_count, 5);
        assert!(!candidate.enabled);
        assert!(
            candidate.regex_patterns[0].contains(r"CustomLib\[ERROR\]: widget not found in registry-\d+"),
            "regex was {}",
            candidate.regex_patterns[0]
        );

        // Before promotion the matcher never sees it.
        assert!(store.by_id(&candidate.id).is_none());
        let snapshot = store.snapshot();
        assert!(snapshot.by_id(&candidate.id).is_none());
    }

    #[test]
    fn too_few_runs_yield_no_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path()).unwrap();
        let engine = LearningEngine::new(dir.path(), &store, 0.2);
        for run in 0..2 {
            let failure = unknown_failure("CustomLib[ERROR]: widget not found in registry-7");
            engine.record_unknown(&failure, &format!("run-{run}")).unwrap();
        }
        assert!(engine.discover_candidates(3, 0.7).unwrap().is_empty());
    }

    #[test]
    fn promotion_moves_candidate_into_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path()).unwrap();
        let engine = LearningEngine::new(dir.path(), &store, 0.2);
        for run in 0..4 {
            let failure = unknown_failure("CacheDaemon fatal: segment 17 lost");
            engine.record_unknown(&failure, &format!("run-{run}")).unwrap();
        }
        let candidates = engine.discover_candidates(3, 0.7).unwrap();
        assert_eq!(candidates.len(), 1);
        let id = candidates[0].id.clone();

        let promoted = engine.promote_candidate(&id).unwrap();
        assert!(promoted.enabled);
        assert!(store.by_id(&id).is_some());
        assert!(engine.pending_candidates().unwrap().is_empty());

        // Rediscovery does not resurrect a promoted candidate.
        assert!(engine.discover_candidates(3, 0.7).unwrap().is_empty());
    }

    #[test]
    fn similar_messages_merge_into_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path()).unwrap();
        let engine = LearningEngine::new(dir.path(), &store, 0.2);
        // Same failure with drifting worker paths; fingerprints agree after
        // normalization, but add a variant spelling too.
        for run in 0..3 {
            let failure = unknown_failure("ProxyPool exhausted after 30 attempts at tier 2");
            engine.record_unknown(&failure, &format!("run-a{run}")).unwrap();
        }
        for run in 0..3 {
            let failure = unknown_failure("ProxyPool exhausted after 44 attempts at tier 9");
            engine.record_unknown(&failure, &format!("run-b{run}")).unwrap();
        }
        let candidates = engine.discover_candidates(3, 0.7).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].occurrence_count, 6);
    }

    #[test]
    fn feedback_is_applied_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path()).unwrap();
        let engine = LearningEngine::new(dir.path(), &store, 0.2);
        let recorder = FeedbackRecorder::new(dir.path(), 1, 60);
        let sanitizer = Sanitizer::new();

        let feedback = crate::feedback::UserFeedback::new(
            "network_timeout",
            None,
            4,
            true,
            "",
            &sanitizer,
        )
        .unwrap();
        recorder.record(&feedback).unwrap();

        let first = engine.update_stats_from_feedback(&recorder).unwrap();
        assert_eq!(first.applied, 1);
        let rate_after_first = store.by_id("network_timeout").unwrap().success_rate;

        let second = engine.update_stats_from_feedback(&recorder).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(second.skipped, 1);
        let rate_after_second = store.by_id("network_timeout").unwrap().success_rate;
        assert!((rate_after_first - rate_after_second).abs() < 1e-12);
    }

    #[test]
    fn regex_generalization_escapes_and_widens_digits() {
        let out = generalize_to_regex("CustomLib[ERROR]: lost 42 widgets (tier 3)");
        assert_eq!(
            out,
            r"CustomLib\[ERROR\]: lost \d+ widgets \(tier \d+\)"
        );
        assert!(regex::Regex::new(&out).is_ok());
    }
}
