//! Error types for the analysis engine
//!
//! Every error carries a stable, machine-readable kind tag (`kind()`) plus a
//! human message. Where we can say something useful, `remediation()` points
//! the user at a file, command, or configuration key.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad store file, bad tolerance, unknown model family, etc.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        key: Option<String>,
    },

    /// Read/write/rename/lock failures. Store writes that hit this leave
    /// in-memory state unchanged.
    #[error("i/o error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Unparseable log section. Always recovered locally by the extractor
    /// into an `unknown` failure; callers outside the extractor should
    /// never see this propagate.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A pattern or template rejected at load or pre-apply.
    #[error("validation failed for {item}: {message}")]
    Validation { item: String, message: String },

    /// Path or command denied by the allow-list / protected-path policy.
    #[error("denied by policy: {message}")]
    Policy { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A rollback could not be completed. The snapshot directory is kept so
    /// the user can restore by hand.
    #[error("rollback failed: {message} (snapshot preserved at {snapshot_path})")]
    RollbackFailed {
        message: String,
        snapshot_path: PathBuf,
    },

    /// Failure in an external collaborator (runner, LLM provider).
    #[error("external failure in {component}: {message}")]
    External { component: String, message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }

    pub fn config_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn validation(item: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            item: item.into(),
            message: message.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Error::Policy {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Io { .. } => "io",
            Error::Parse { .. } => "parse",
            Error::Validation { .. } => "validation",
            Error::Policy { .. } => "policy",
            Error::Cancelled => "cancelled",
            Error::Timeout { .. } => "timeout",
            Error::RollbackFailed { .. } => "rollback_failed",
            Error::External { .. } => "external",
        }
    }

    /// Process exit code when this error ends a request.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config { .. } => 2,
            Error::Cancelled => 3,
            Error::RollbackFailed { .. } => 5,
            _ => 1,
        }
    }

    /// Suggested remediation, when one exists.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::Config { key: Some(key), .. } => Some(format!(
                "check `{key}` in .actlens/config.json (or delete the file to restore defaults)"
            )),
            Error::RollbackFailed { snapshot_path, .. } => Some(format!(
                "restore manually from {} (files/<n> in manifest order)",
                snapshot_path.display()
            )),
            Error::Timeout { .. } => {
                Some("raise the relevant timeout in .actlens/config.json".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(Error::config("x").kind(), "config");
        assert_eq!(Error::policy("x").kind(), "policy");
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(Error::Timeout { seconds: 5 }.kind(), "timeout");
    }

    #[test]
    fn config_key_remediation_names_the_key() {
        let err = Error::config_key("bad tolerance", "risk_tolerance");
        assert!(err.remediation().unwrap().contains("risk_tolerance"));
    }
}
