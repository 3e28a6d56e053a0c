//! Analysis request orchestration
//!
//! One request is the unit of work: sanitize → compress → extract → match →
//! generate fixes, with the response cache short-circuiting repeats of the
//! same failure fingerprint under the same store versions. Requests are
//! stateless with respect to each other; the pattern and template stores
//! are shared read-mostly and observed through snapshots.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{cache_key, ResponseCache};
use crate::cancel::{CancellationToken, Deadline};
use crate::compress::Compressor;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::fixes::generator::rank_suggestions;
use crate::fixes::{CommandPolicy, FixGenerator, FixSuggestion, TemplateStore};
use crate::learning::LearningEngine;
use crate::model::{
    AnalysisMetrics, ExecutionResult, Failure, FailureKind, LogOrigin,
};
use crate::patterns::{
    MatchOutcome, PatternCategory, PatternMatch, PatternMatcher, PatternStore,
};
use crate::sanitize::Sanitizer;
use crate::tokens::TokenCounter;

/// Cap on matching workers inside one request.
const MAX_MATCH_WORKERS: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub category: Option<PatternCategory>,
    pub generate_fixes: bool,
    pub use_cache: bool,
    /// Identifies the run in the unknown-failure log; generated if absent.
    pub run_id: Option<String>,
}

impl AnalysisOptions {
    pub fn with_fixes() -> Self {
        Self {
            generate_fixes: true,
            use_cache: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub summary: String,
    pub execution: ExecutionResult,
    pub metrics: AnalysisMetrics,
    pub matches: Vec<PatternMatch>,
    pub suggestions: Vec<FixSuggestion>,
    pub cache_hit: bool,
    pub truncated_log: bool,
    pub run_id: String,
}

pub struct AnalysisEngine {
    project_root: PathBuf,
    config: Config,
    sanitizer: Sanitizer,
    counter: TokenCounter,
    policy: CommandPolicy,
    patterns: Arc<PatternStore>,
    templates: Arc<TemplateStore>,
    matcher: PatternMatcher,
    cache: ResponseCache,
}

impl AnalysisEngine {
    /// Load stores and configuration for a project root.
    pub fn open(project_root: &Path) -> Result<Self> {
        let config = Config::load(project_root);
        let (sanitizer, rejected) = Sanitizer::with_custom(&config.custom_sanitize_patterns);
        for rejection in rejected {
            tracing::warn!("custom sanitize pattern rejected: {rejection}");
        }
        let policy = CommandPolicy::new(&config.command_allow_list);
        let patterns = Arc::new(PatternStore::open(project_root)?);
        let known_ids = patterns
            .snapshot()
            .all_enabled(None)
            .iter()
            .map(|p| p.id.clone())
            .collect();
        let templates = Arc::new(TemplateStore::open(project_root, &known_ids, &policy)?);
        let cache = ResponseCache::new(
            project_root,
            config.cache_max_bytes,
            config.cache_ttl_hours,
        );

        Ok(Self {
            project_root: project_root.to_path_buf(),
            counter: TokenCounter::with_defaults(),
            sanitizer,
            policy,
            patterns,
            templates,
            matcher: PatternMatcher::new(),
            cache,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn patterns(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn sanitizer(&self) -> &Sanitizer {
        &self.sanitizer
    }

    pub fn learning(&self) -> LearningEngine<'_> {
        LearningEngine::new(&self.project_root, &self.patterns, self.config.ewma_alpha)
    }

    /// Analyze one raw log. Cancellation is honored at stage boundaries and
    /// between patterns inside the matcher fan-out.
    pub fn analyze(
        &self,
        raw_log: &[u8],
        origin: &LogOrigin,
        options: &AnalysisOptions,
        cancel: &CancellationToken,
    ) -> Result<AnalysisReport> {
        let deadline = Deadline::after(Duration::from_secs(self.config.request_timeout_secs));
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let text = String::from_utf8_lossy(raw_log);
        let sanitized = self.sanitizer.sanitize(&text);
        checkpoint(cancel, &deadline)?;

        let compressor = Compressor::new(&self.counter);
        let compressed = compressor.compress(
            &sanitized,
            self.config.token_budget,
            &self.config.model_family,
        )?;
        checkpoint(cancel, &deadline)?;

        let extractor = Extractor::new(self.config.context_lines);
        let execution = extractor.extract(&compressed.text, origin);
        checkpoint(cancel, &deadline)?;

        let pattern_snapshot = self.patterns.snapshot();
        let template_snapshot = self.templates.snapshot();
        let key = cache_key(
            &execution.combined_fingerprint(),
            pattern_snapshot.version(),
            template_snapshot.version(),
        );
        if options.use_cache {
            if let Some(cached) = self.cache.get(&key) {
                if let Ok(mut report) = serde_json::from_str::<AnalysisReport>(&cached) {
                    tracing::debug!("analysis served from cache");
                    report.cache_hit = true;
                    return Ok(report);
                }
            }
        }

        let failures = execution.all_failures();
        let outcome = self.match_in_parallel(&pattern_snapshot, &failures, &sanitized, options, cancel);
        for (id, reason) in &outcome.quarantined {
            self.patterns.quarantine(id, reason);
        }
        checkpoint(cancel, &deadline)?;

        let mut suggestions = Vec::new();
        if options.generate_fixes {
            let generator = FixGenerator::new(
                &self.project_root,
                &self.policy,
                self.config.risk_tolerance,
                self.config.auto_fix_threshold,
            );
            for pattern_match in &outcome.matches {
                suggestions.extend(generator.generate(pattern_match, &template_snapshot));
            }
            rank_suggestions(&mut suggestions);
        }

        // Feed unmatched unknown failures into the learning log.
        let learning = self.learning();
        for failure in &failures {
            let matched = outcome
                .matches
                .iter()
                .any(|m| m.failure_fingerprint == failure.fingerprint);
            if failure.kind == FailureKind::Unknown || !matched {
                if let Err(err) = learning.record_unknown(failure, &run_id) {
                    tracing::warn!("unknown-failure log append failed: {err}");
                }
            }
        }

        let metrics = execution.metrics();
        let report = AnalysisReport {
            summary: summarize(&execution, &outcome.matches, &suggestions),
            metrics,
            matches: outcome.matches,
            suggestions,
            cache_hit: false,
            truncated_log: compressed.truncated,
            run_id,
            execution,
        };

        // A cancelled request discards its cache write rather than landing a
        // partial entry.
        if options.use_cache && !cancel.is_cancelled() {
            match serde_json::to_string(&report) {
                Ok(serialized) => {
                    if let Err(err) = self.cache.put(&key, &serialized) {
                        tracing::warn!("cache write failed: {err}");
                    }
                }
                Err(err) => tracing::warn!("report serialization for cache failed: {err}"),
            }
        }
        Ok(report)
    }

    /// Fan failures out over a small worker pool; the merge is sequential
    /// and deterministic regardless of worker finish order.
    fn match_in_parallel(
        &self,
        snapshot: &crate::patterns::PatternSnapshot,
        failures: &[&Failure],
        log_text: &str,
        options: &AnalysisOptions,
        cancel: &CancellationToken,
    ) -> MatchOutcome {
        if failures.is_empty() {
            return MatchOutcome::default();
        }
        let workers = MAX_MATCH_WORKERS.min(failures.len());
        if workers <= 1 {
            return self.matcher.match_failures_with_cancel(
                snapshot,
                failures,
                log_text,
                &self.project_root,
                options.category,
                self.config.confidence_threshold,
                cancel,
            );
        }

        let chunk_size = failures.len().div_ceil(workers);
        let mut ordered: Vec<Option<MatchOutcome>> = Vec::new();
        for _ in 0..workers {
            ordered.push(None);
        }

        std::thread::scope(|scope| {
            let (sender, receiver) = mpsc::channel::<(usize, MatchOutcome)>();
            for (index, chunk) in failures.chunks(chunk_size).enumerate() {
                let sender = sender.clone();
                let matcher = &self.matcher;
                let project_root = &self.project_root;
                let category = options.category;
                let threshold = self.config.confidence_threshold;
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let outcome = matcher.match_failures_with_cancel(
                        snapshot,
                        chunk,
                        log_text,
                        project_root,
                        category,
                        threshold,
                        &cancel,
                    );
                    let _ = sender.send((index, outcome));
                });
            }
            drop(sender);
            for (index, outcome) in receiver {
                if index < ordered.len() {
                    ordered[index] = Some(outcome);
                }
            }
        });

        MatchOutcome::merge(ordered.into_iter().flatten().collect())
    }
}

fn checkpoint(cancel: &CancellationToken, deadline: &Deadline) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if deadline.expired() {
        return Err(Error::Timeout {
            seconds: deadline.budget_secs(),
        });
    }
    Ok(())
}

fn summarize(
    execution: &ExecutionResult,
    matches: &[PatternMatch],
    suggestions: &[FixSuggestion],
) -> String {
    if execution.success {
        return "run succeeded; nothing to analyze".to_string();
    }
    let failures = execution.total_failures();
    let mut summary = format!(
        "{failures} failure{} across {} workflow{}",
        if failures == 1 { "" } else { "s" },
        execution.workflows.len(),
        if execution.workflows.len() == 1 { "" } else { "s" },
    );
    if let Some(best) = matches.first() {
        summary.push_str(&format!(
            "; best match {} ({:.0}%)",
            best.pattern_id,
            best.confidence * 100.0
        ));
    }
    let auto = suggestions.iter().filter(|s| s.auto_applicable).count();
    if auto > 0 {
        summary.push_str(&format!("; {auto} auto-applicable fix{}", if auto == 1 { "" } else { "es" }));
    }
    summary
}
