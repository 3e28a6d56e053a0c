//! Failure patterns
//!
//! A pattern is a named recognizer: regexes, required keywords, and context
//! requirements, plus running success statistics. Patterns come from three
//! sources (builtin, user, learned) and are matched against extracted
//! failures by the matcher.

pub mod matcher;
pub mod store;

pub use matcher::{MatchEvidence, MatchOutcome, PatternMatch, PatternMatcher};
pub use store::{PatternSnapshot, PatternStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Permission,
    Dependency,
    Network,
    Configuration,
    Build,
    Test,
    Syntax,
    Timeout,
    Unknown,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Permission => "permission",
            PatternCategory::Dependency => "dependency",
            PatternCategory::Network => "network",
            PatternCategory::Configuration => "configuration",
            PatternCategory::Build => "build",
            PatternCategory::Test => "test",
            PatternCategory::Syntax => "syntax",
            PatternCategory::Timeout => "timeout",
            PatternCategory::Unknown => "unknown",
        }
    }

    pub fn all() -> &'static [PatternCategory] {
        &[
            PatternCategory::Permission,
            PatternCategory::Dependency,
            PatternCategory::Network,
            PatternCategory::Configuration,
            PatternCategory::Build,
            PatternCategory::Test,
            PatternCategory::Syntax,
            PatternCategory::Timeout,
            PatternCategory::Unknown,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSource {
    Builtin,
    User,
    Learned,
}

impl PatternSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternSource::Builtin => "builtin",
            PatternSource::User => "user",
            PatternSource::Learned => "learned",
        }
    }

    /// Precedence on id collision: user > learned > builtin.
    pub fn precedence(&self) -> u8 {
        match self {
            PatternSource::User => 2,
            PatternSource::Learned => 1,
            PatternSource::Builtin => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub category: PatternCategory,
    pub regex_patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// `file_exists:<rel>`, `log_contains:<s>`, `not_contains:<s>`. A bare
    /// token is shorthand for `log_contains`.
    #[serde(default)]
    pub context_requirements: Vec<String>,
    pub base_confidence: f64,
    pub success_rate: f64,
    #[serde(default)]
    pub occurrence_count: u64,
    pub source: PatternSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    /// Unknown keys from user files, preserved on write.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl Pattern {
    /// Shape check done at load time. Regex compilation is verified here but
    /// the compiled form is cached separately by the matcher.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("pattern", "id must not be empty"));
        }
        if self.regex_patterns.is_empty() {
            return Err(Error::validation(
                format!("pattern {}", self.id),
                "at least one regex is required",
            ));
        }
        for (i, raw) in self.regex_patterns.iter().enumerate() {
            if let Err(err) = regex::Regex::new(raw) {
                return Err(Error::validation(
                    format!("pattern {}", self.id),
                    format!("regex {i} does not compile: {err}"),
                ));
            }
        }
        if !(0.0..=1.0).contains(&self.base_confidence) {
            return Err(Error::validation(
                format!("pattern {}", self.id),
                "base_confidence must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(Error::validation(
                format!("pattern {}", self.id),
                "success_rate must be in [0, 1]",
            ));
        }
        if self.source == PatternSource::Learned && self.occurrence_count == 0 {
            return Err(Error::validation(
                format!("pattern {}", self.id),
                "learned patterns must carry a nonzero occurrence count",
            ));
        }
        Ok(())
    }
}

/// On-disk pattern file: `{ "patterns": [...] }`, UTF-8, LF, two-space
/// indent. Unknown top-level keys round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternFile {
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PatternFile {
    pub fn to_pretty_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)
            .map_err(|e| Error::validation("pattern file", format!("serialize failed: {e}")))?;
        if !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pattern(id: &str) -> Pattern {
        Pattern {
            id: id.to_string(),
            name: id.to_string(),
            category: PatternCategory::Test,
            regex_patterns: vec!["failed".to_string()],
            keywords: vec!["failed".to_string()],
            context_requirements: vec![],
            base_confidence: 0.8,
            success_rate: 0.9,
            occurrence_count: 1,
            source: PatternSource::Builtin,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            enabled: true,
            disabled_reason: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn validate_rejects_bad_regex() {
        let mut pattern = sample_pattern("p1");
        pattern.regex_patterns = vec!["([unclosed".to_string()];
        let err = pattern.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn validate_rejects_learned_without_occurrences() {
        let mut pattern = sample_pattern("p2");
        pattern.source = PatternSource::Learned;
        pattern.occurrence_count = 0;
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn unknown_keys_round_trip() {
        let raw = r#"{
  "patterns": [
    {
      "id": "x",
      "name": "x",
      "category": "test",
      "regex_patterns": ["boom"],
      "keywords": [],
      "base_confidence": 0.5,
      "success_rate": 0.5,
      "occurrence_count": 0,
      "source": "user",
      "created_at": "2025-01-01T00:00:00Z",
      "updated_at": "2025-01-01T00:00:00Z",
      "enabled": true,
      "future_field": {"nested": 1}
    }
  ],
  "schema_note": "keep me"
}"#;
        let file: PatternFile = serde_json::from_str(raw).unwrap();
        assert_eq!(file.patterns.len(), 1);
        let rendered = file.to_pretty_json().unwrap();
        assert!(rendered.contains("future_field"));
        assert!(rendered.contains("schema_note"));
        let reparsed: PatternFile = serde_json::from_str(&rendered).unwrap();
        let rerendered = reparsed.to_pretty_json().unwrap();
        assert_eq!(rendered, rerendered);
    }

    #[test]
    fn source_precedence_orders_user_first() {
        assert!(PatternSource::User.precedence() > PatternSource::Learned.precedence());
        assert!(PatternSource::Learned.precedence() > PatternSource::Builtin.precedence());
    }
}
