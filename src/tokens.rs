//! Token estimation for model budgets
//!
//! The compressor and external LLM callers need a cheap, deterministic
//! estimate of how many tokens a blob costs for a given model family. Each
//! family plugs in a tokenizer; families are registered explicitly at
//! startup, never via import side effects.

use std::collections::HashMap;

use crate::error::{Error, Result};

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> u32;
}

/// Character-ratio estimator. Good enough for budgeting; exact tokenizers can
/// be registered per family when precision matters.
pub struct HeuristicTokenizer {
    chars_per_token: f64,
}

impl HeuristicTokenizer {
    pub fn new(chars_per_token: f64) -> Self {
        debug_assert!(chars_per_token > 0.0);
        Self { chars_per_token }
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as u32
    }
}

pub struct TokenCounter {
    families: HashMap<String, Box<dyn Tokenizer>>,
}

impl TokenCounter {
    /// Empty counter; families must be registered before use.
    pub fn new() -> Self {
        Self {
            families: HashMap::new(),
        }
    }

    /// Counter with the default family set registered.
    pub fn with_defaults() -> Self {
        let mut counter = Self::new();
        counter.register("generic", Box::new(HeuristicTokenizer::new(4.0)));
        counter.register("gpt", Box::new(HeuristicTokenizer::new(4.0)));
        counter.register("claude", Box::new(HeuristicTokenizer::new(3.6)));
        counter.register("local", Box::new(HeuristicTokenizer::new(3.0)));
        counter
    }

    pub fn register(&mut self, family: &str, tokenizer: Box<dyn Tokenizer>) {
        self.families.insert(family.to_string(), tokenizer);
    }

    /// Deterministic and monotonic in text length for a fixed family. An
    /// unknown family is a configuration error.
    pub fn count(&self, text: &str, model_family: &str) -> Result<u32> {
        let tokenizer = self.families.get(model_family).ok_or_else(|| {
            Error::config_key(
                format!("unknown model family: {model_family}"),
                "model_family",
            )
        })?;
        Ok(tokenizer.count(text))
    }

    pub fn knows(&self, model_family: &str) -> bool {
        self.families.contains_key(model_family)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_family_is_a_config_error() {
        let counter = TokenCounter::with_defaults();
        let err = counter.count("hello", "made-up-model").unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn count_is_monotonic_in_length() {
        let counter = TokenCounter::with_defaults();
        let mut text = String::new();
        let mut last = 0;
        for _ in 0..64 {
            text.push_str("failure ");
            let n = counter.count(&text, "generic").unwrap();
            assert!(n >= last);
            last = n;
        }
        assert!(last > 0);
    }

    #[test]
    fn count_is_deterministic() {
        let counter = TokenCounter::with_defaults();
        let text = "ERROR: build failed at step 3";
        assert_eq!(
            counter.count(text, "claude").unwrap(),
            counter.count(text, "claude").unwrap()
        );
    }

    #[test]
    fn empty_text_counts_zero() {
        let counter = TokenCounter::with_defaults();
        assert_eq!(counter.count("", "generic").unwrap(), 0);
    }
}
