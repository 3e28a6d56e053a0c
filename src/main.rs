//! actlens CLI
//!
//! Thin dispatch over the library: analyze a log, inspect patterns, apply an
//! approved fix, manage feedback, learning, snapshots, and the cache.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use actlens::analyze::{AnalysisEngine, AnalysisOptions};
use actlens::apply::{Approval, AutoFixer};
use actlens::cancel::CancellationToken;
use actlens::config::Config;
use actlens::error::Error;
use actlens::feedback::{FeedbackRecorder, UserFeedback};
use actlens::model::{LogComparison, LogOrigin};
use actlens::patterns::PatternCategory;
use actlens::snapshot::SnapshotManager;

#[derive(Parser)]
#[command(name = "actlens", version, about = "Local CI failure analysis and auto-fix")]
struct Cli {
    /// Project root to operate on.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a runner log and print matches and suggestions.
    Analyze {
        /// Path to the raw log file.
        log: PathBuf,
        /// Generate fix suggestions for matched patterns.
        #[arg(long)]
        fixes: bool,
        /// Apply the best auto-applicable suggestion.
        #[arg(long)]
        apply: bool,
        /// Restrict matching to one category.
        #[arg(long)]
        category: Option<String>,
        /// Bypass the response cache.
        #[arg(long)]
        no_cache: bool,
        /// Emit the full report as JSON.
        #[arg(long)]
        json: bool,
        /// Diff against a previous run's log (new/resolved/persistent).
        #[arg(long)]
        compare: Option<PathBuf>,
    },
    /// List loaded patterns.
    Patterns {
        #[arg(long)]
        category: Option<String>,
    },
    /// Record user feedback for a pattern.
    Feedback {
        pattern_id: String,
        /// 1 (useless) to 5 (fixed it).
        #[arg(long)]
        rating: u8,
        #[arg(long)]
        success: bool,
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Learning maintenance: fold feedback and discover candidates.
    Learn {
        /// Promote a pending candidate by id instead of discovering.
        #[arg(long)]
        promote: Option<String>,
    },
    /// Snapshot maintenance.
    Snapshots {
        /// Garbage-collect snapshots past the retention window.
        #[arg(long)]
        gc: bool,
        /// Restore a snapshot by id.
        #[arg(long)]
        restore: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error[{}]: {err}", err.kind());
            if let Some(hint) = err.remediation() {
                eprintln!("  hint: {hint}");
            }
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Error> {
    match cli.command {
        Commands::Analyze {
            log,
            fixes,
            apply,
            category,
            no_cache,
            json,
            compare,
        } => {
            let engine = AnalysisEngine::open(&cli.project)?;
            let raw = fs::read(&log)
                .map_err(|e| Error::io(format!("reading {}", log.display()), e))?;
            let options = AnalysisOptions {
                category: parse_category(category.as_deref())?,
                generate_fixes: fixes || apply,
                use_cache: !no_cache,
                run_id: None,
            };
            let cancel = CancellationToken::new();
            let report = engine.analyze(&raw, &LogOrigin::default(), &options, &cancel)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report)
                        .map_err(|e| Error::validation("report", e.to_string()))?
                );
            } else {
                print_report(&report);
            }

            if let Some(previous_log) = compare {
                let previous_raw = fs::read(&previous_log).map_err(|e| {
                    Error::io(format!("reading {}", previous_log.display()), e)
                })?;
                let previous = engine.analyze(
                    &previous_raw,
                    &LogOrigin::default(),
                    &options,
                    &cancel,
                )?;
                let diff = LogComparison::between(&previous.execution, &report.execution);
                println!(
                    "vs previous run: {} new, {} resolved, {} persistent (improvement {:.0}%)",
                    diff.new_failures.len(),
                    diff.resolved_failures.len(),
                    diff.persistent_failures.len(),
                    diff.improvement_score * 100.0
                );
            }

            if apply {
                let Some(suggestion) =
                    report.suggestions.iter().find(|s| s.auto_applicable)
                else {
                    eprintln!("no auto-applicable suggestion; nothing applied");
                    return Ok(ExitCode::SUCCESS);
                };
                let config = engine.config();
                let fixer = AutoFixer::new(
                    &cli.project,
                    engine.policy(),
                    config.command_timeout_secs,
                    config.mutation_lock_wait_secs,
                );
                let result = fixer.apply(suggestion, Approval::AutoLowRisk, &cancel)?;
                if result.success {
                    println!(
                        "applied: {} (snapshot {})",
                        suggestion.title,
                        result.snapshot_id.as_deref().unwrap_or("-")
                    );
                } else {
                    eprintln!(
                        "fix failed and was rolled back: {}",
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                    return Ok(ExitCode::from(if result.rollback_available {
                        4
                    } else {
                        5
                    }));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Patterns { category } => {
            let engine = AnalysisEngine::open(&cli.project)?;
            let category = parse_category(category.as_deref())?;
            for pattern in engine.patterns().all_enabled(category) {
                println!(
                    "{:<32} {:<13} {:<8} conf={:.2} rate={:.2} uses={}",
                    pattern.id,
                    pattern.category.as_str(),
                    pattern.source.as_str(),
                    pattern.base_confidence,
                    pattern.success_rate,
                    pattern.occurrence_count,
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Feedback {
            pattern_id,
            rating,
            success,
            comment,
        } => {
            let engine = AnalysisEngine::open(&cli.project)?;
            let config = engine.config();
            let recorder = FeedbackRecorder::new(
                &cli.project,
                config.feedback_fsync_every,
                config.feedback_fsync_secs,
            );
            let feedback = UserFeedback::new(
                &pattern_id,
                None,
                rating,
                success,
                &comment,
                engine.sanitizer(),
            )?;
            recorder.record(&feedback)?;
            recorder.flush()?;
            println!("feedback recorded for {pattern_id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Learn { promote } => {
            let engine = AnalysisEngine::open(&cli.project)?;
            let config = engine.config().clone();
            let learning = engine.learning();
            if let Some(id) = promote {
                let pattern = learning.promote_candidate(&id)?;
                println!("promoted {} ({})", pattern.id, pattern.name);
                return Ok(ExitCode::SUCCESS);
            }

            let recorder = FeedbackRecorder::new(
                &cli.project,
                config.feedback_fsync_every,
                config.feedback_fsync_secs,
            );
            let report = learning.update_stats_from_feedback(&recorder)?;
            println!(
                "stats updated: {} applied, {} already processed",
                report.applied, report.skipped
            );
            let candidates = learning
                .discover_candidates(config.learning_min_occurrences, config.learning_similarity)?;
            for candidate in &candidates {
                println!(
                    "candidate {} ({} occurrences): {}",
                    candidate.id, candidate.occurrence_count, candidate.name
                );
            }
            if candidates.is_empty() {
                println!("no new candidates");
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Snapshots { gc, restore } => {
            let config = Config::load(&cli.project);
            let manager = SnapshotManager::new(&cli.project);
            if let Some(id) = restore {
                let snapshot = manager.load(&id)?;
                manager.restore(&snapshot)?;
                println!("restored snapshot {id}");
                return Ok(ExitCode::SUCCESS);
            }
            if gc {
                let removed = manager.gc(config.snapshot_retention_days, &[])?;
                println!("removed {} snapshot(s)", removed.len());
                return Ok(ExitCode::SUCCESS);
            }
            for snapshot in manager.list() {
                println!(
                    "{}  {}  {} file(s)  {}",
                    snapshot.id,
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.entries.len(),
                    snapshot.description,
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn parse_category(raw: Option<&str>) -> Result<Option<PatternCategory>, Error> {
    let Some(raw) = raw else { return Ok(None) };
    PatternCategory::all()
        .iter()
        .find(|c| c.as_str() == raw)
        .copied()
        .map(Some)
        .ok_or_else(|| Error::config_key(format!("unknown category: {raw}"), "category"))
}

fn print_report(report: &actlens::analyze::AnalysisReport) {
    println!("{}", report.summary);
    if report.cache_hit {
        println!("(cached result)");
    }
    if report.truncated_log {
        println!("(log truncated to fit the token budget)");
    }
    for m in &report.matches {
        println!(
            "  match {:<32} confidence {:.2}  [{}]",
            m.pattern_id,
            m.confidence,
            m.category.as_str()
        );
    }
    for s in &report.suggestions {
        println!(
            "  fix   {:<32} confidence {:.2}  risk {}  auto={}",
            s.template_id,
            s.confidence,
            s.risk,
            if s.auto_applicable { "yes" } else { "no" }
        );
        for step in &s.steps {
            println!("        - {}", step.describe());
        }
    }
}
