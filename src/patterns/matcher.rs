//! Pattern matching against extracted failures
//!
//! For every enabled pattern and failure the matcher runs a context gate,
//! a regex phase, and a keyword phase, blends the results into a match
//! strength, and derives a confidence from the pattern's base confidence and
//! running success rate. Ranking is fully deterministic; ties cannot
//! survive the tie-break chain.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::model::Failure;
use crate::patterns::{Pattern, PatternCategory, PatternSnapshot};

/// Which regexes and keywords produced the match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchEvidence {
    pub regexes_matched: Vec<String>,
    pub keywords_matched: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub pattern_name: String,
    pub category: PatternCategory,
    pub failure_fingerprint: String,
    /// Byte spans within the failure's combined text.
    pub spans: Vec<(usize, usize)>,
    pub captures: BTreeMap<String, String>,
    pub snippet: String,
    pub match_strength: f64,
    pub confidence: f64,
    pub base_confidence: f64,
    pub success_rate: f64,
    pub occurrence_count: u64,
    pub evidence: MatchEvidence,
}

/// Lazily compiled regex sets, one slot per pattern id. A pattern whose
/// regexes stop compiling is reported for quarantine instead of failing the
/// request.
#[derive(Default)]
struct RegexCache {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<CompileOutcome>>>>>,
}

type CompileOutcome = std::result::Result<Arc<Vec<Regex>>, String>;

impl RegexCache {
    fn compiled(&self, pattern: &Pattern) -> CompileOutcome {
        let slot = {
            let mut slots = self.slots.lock().expect("regex cache lock");
            slots
                .entry(pattern.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };
        let mut guard = slot.lock().expect("regex slot lock");
        if let Some(outcome) = guard.as_ref() {
            return outcome.clone();
        }
        let mut compiled = Vec::with_capacity(pattern.regex_patterns.len());
        for raw in &pattern.regex_patterns {
            match Regex::new(raw) {
                Ok(re) => compiled.push(re),
                Err(err) => {
                    let outcome = Err(format!("regex {raw:?} does not compile: {err}"));
                    *guard = Some(outcome.clone());
                    return outcome;
                }
            }
        }
        let outcome = Ok(Arc::new(compiled));
        *guard = Some(outcome.clone());
        outcome
    }
}

pub struct PatternMatcher {
    cache: RegexCache,
}

#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub matches: Vec<PatternMatch>,
    /// Patterns whose regexes failed to compile, with the reason. The store
    /// owner is expected to quarantine these.
    pub quarantined: Vec<(String, String)>,
}

impl PatternMatcher {
    pub fn new() -> Self {
        Self {
            cache: RegexCache::default(),
        }
    }

    /// Match every failure against every enabled pattern in the snapshot.
    /// The result is ranked and deduplicated; an empty snapshot yields an
    /// empty result.
    pub fn match_failures(
        &self,
        snapshot: &PatternSnapshot,
        failures: &[&Failure],
        log_text: &str,
        project_root: &Path,
        category: Option<PatternCategory>,
        min_confidence: f64,
    ) -> MatchOutcome {
        self.match_failures_with_cancel(
            snapshot,
            failures,
            log_text,
            project_root,
            category,
            min_confidence,
            &CancellationToken::new(),
        )
    }

    /// As `match_failures`, aborting after the current pattern once the
    /// token is cancelled. The partial result keeps its deterministic order.
    #[allow(clippy::too_many_arguments)]
    pub fn match_failures_with_cancel(
        &self,
        snapshot: &PatternSnapshot,
        failures: &[&Failure],
        log_text: &str,
        project_root: &Path,
        category: Option<PatternCategory>,
        min_confidence: f64,
        cancel: &CancellationToken,
    ) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let patterns = snapshot.all_enabled(category);

        'outer: for failure in failures {
            for pattern in &patterns {
                if cancel.is_cancelled() {
                    break 'outer;
                }
                match self.match_one(pattern, failure, log_text, project_root) {
                    MatchAttempt::Matched(m) if m.confidence >= min_confidence => {
                        outcome.matches.push(m)
                    }
                    MatchAttempt::Matched(_) | MatchAttempt::NoMatch => {}
                    MatchAttempt::CompileFailed(reason) => {
                        if !outcome.quarantined.iter().any(|(id, _)| id == &pattern.id) {
                            outcome.quarantined.push((pattern.id.clone(), reason));
                        }
                    }
                }
            }
        }

        dedup_matches(&mut outcome.matches);
        rank_matches(&mut outcome.matches);
        outcome
    }

    fn match_one(
        &self,
        pattern: &Pattern,
        failure: &Failure,
        log_text: &str,
        project_root: &Path,
    ) -> MatchAttempt {
        if !context_gate(pattern, log_text, project_root) {
            return MatchAttempt::NoMatch;
        }

        let regexes = match self.cache.compiled(pattern) {
            Ok(regexes) => regexes,
            Err(reason) => return MatchAttempt::CompileFailed(reason),
        };

        // Regex phase runs over the message and stack trace only.
        let mut regex_text = failure.message.clone();
        if let Some(trace) = &failure.stack_trace {
            regex_text.push('\n');
            regex_text.push_str(trace);
        }

        let mut spans = Vec::new();
        let mut captures: BTreeMap<String, String> = BTreeMap::new();
        let mut regexes_matched = Vec::new();
        let mut total_named = 0usize;
        for (raw, re) in pattern.regex_patterns.iter().zip(regexes.iter()) {
            total_named += re.capture_names().flatten().count();
            if let Some(caps) = re.captures(&regex_text) {
                regexes_matched.push(raw.clone());
                if let Some(m) = caps.get(0) {
                    spans.push((m.start(), m.end()));
                }
                for name in re.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        captures.insert(name.to_string(), value.as_str().to_string());
                    }
                }
            }
        }
        if regexes_matched.is_empty() {
            return MatchAttempt::NoMatch;
        }

        // Keyword phase runs over all the failure's text.
        let combined_lower = failure.combined_text().to_lowercase();
        let keywords_matched: Vec<String> = pattern
            .keywords
            .iter()
            .filter(|k| combined_lower.contains(&k.to_lowercase()))
            .cloned()
            .collect();
        let required = pattern.keywords.len().div_ceil(2);
        if keywords_matched.len() < required {
            return MatchAttempt::NoMatch;
        }

        // Missing denominators contribute 1.0 rather than dividing by zero.
        let regex_ratio = regexes_matched.len() as f64 / pattern.regex_patterns.len() as f64;
        let keyword_ratio = if pattern.keywords.is_empty() {
            1.0
        } else {
            keywords_matched.len() as f64 / pattern.keywords.len() as f64
        };
        let capture_ratio = if total_named == 0 {
            1.0
        } else {
            captures.len() as f64 / total_named as f64
        };
        let strength = 0.6 * regex_ratio + 0.3 * keyword_ratio + 0.1 * capture_ratio;

        let confidence = (pattern.base_confidence
            * (0.5 + 0.5 * strength)
            * (0.5 + 0.5 * pattern.success_rate))
            .clamp(0.0, 1.0);

        let snippet = build_snippet(failure);

        MatchAttempt::Matched(PatternMatch {
            pattern_id: pattern.id.clone(),
            pattern_name: pattern.name.clone(),
            category: pattern.category,
            failure_fingerprint: failure.fingerprint.clone(),
            spans,
            captures,
            snippet,
            match_strength: strength,
            confidence,
            base_confidence: pattern.base_confidence,
            success_rate: pattern.success_rate,
            occurrence_count: pattern.occurrence_count,
            evidence: MatchEvidence {
                regexes_matched,
                keywords_matched,
            },
        })
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchOutcome {
    /// Deterministically merge per-worker outcomes: concatenate in worker
    /// order, then re-deduplicate and re-rank.
    pub fn merge(outcomes: Vec<MatchOutcome>) -> MatchOutcome {
        let mut merged = MatchOutcome::default();
        for outcome in outcomes {
            merged.matches.extend(outcome.matches);
            for (id, reason) in outcome.quarantined {
                if !merged.quarantined.iter().any(|(existing, _)| existing == &id) {
                    merged.quarantined.push((id, reason));
                }
            }
        }
        dedup_matches(&mut merged.matches);
        rank_matches(&mut merged.matches);
        merged
    }
}

enum MatchAttempt {
    Matched(PatternMatch),
    NoMatch,
    CompileFailed(String),
}

/// Every context requirement must hold. A bare token is shorthand for
/// `log_contains`. Containment checks are case-insensitive.
fn context_gate(pattern: &Pattern, log_text: &str, project_root: &Path) -> bool {
    let log_lower = log_text.to_lowercase();
    for requirement in &pattern.context_requirements {
        let ok = if let Some(rel) = requirement.strip_prefix("file_exists:") {
            project_root.join(rel.trim()).exists()
        } else if let Some(needle) = requirement.strip_prefix("log_contains:") {
            log_lower.contains(&needle.trim().to_lowercase())
        } else if let Some(needle) = requirement.strip_prefix("not_contains:") {
            !log_lower.contains(&needle.trim().to_lowercase())
        } else {
            log_lower.contains(&requirement.trim().to_lowercase())
        };
        if !ok {
            return false;
        }
    }
    true
}

fn build_snippet(failure: &Failure) -> String {
    let mut lines: Vec<&str> = Vec::new();
    if let Some(last) = failure.context_before.last() {
        lines.push(last.as_str());
    }
    lines.push(failure.message.as_str());
    if let Some(first) = failure.context_after.first() {
        lines.push(first.as_str());
    }
    lines.join("\n")
}

/// Keep the highest-confidence match per (failure, pattern) pair.
fn dedup_matches(matches: &mut Vec<PatternMatch>) {
    let mut best: HashMap<(String, String), usize> = HashMap::new();
    let mut keep = vec![false; matches.len()];
    for (i, m) in matches.iter().enumerate() {
        let key = (m.failure_fingerprint.clone(), m.pattern_id.clone());
        match best.get(&key) {
            Some(&j) if matches[j].confidence >= m.confidence => {}
            Some(&j) => {
                keep[j] = false;
                keep[i] = true;
                best.insert(key, i);
            }
            None => {
                keep[i] = true;
                best.insert(key, i);
            }
        }
    }
    let mut index = 0;
    matches.retain(|_| {
        let kept = keep[index];
        index += 1;
        kept
    });
}

/// Total order: confidence desc, success rate desc, occurrence count desc,
/// pattern id asc, then failure fingerprint asc as the final separator.
fn rank_matches(matches: &mut [PatternMatch]) {
    matches.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then(b.success_rate.total_cmp(&a.success_rate))
            .then(b.occurrence_count.cmp(&a.occurrence_count))
            .then(a.pattern_id.cmp(&b.pattern_id))
            .then(a.failure_fingerprint.cmp(&b.failure_fingerprint))
    });
}
