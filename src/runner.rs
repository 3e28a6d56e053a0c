//! Workflow runner boundary
//!
//! Executing the external workflow engine is out of scope; the engine only
//! consumes this trait. Implementations wrap whatever runner binary the user
//! has and hand back the exit code, the raw log bytes, and whatever step
//! boundary metadata the runner exposes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSelector {
    /// Workflow file or name; absent means the runner's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepBoundary {
    pub job: String,
    pub step: String,
    pub line_start: usize,
    pub line_end: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub step_boundaries: Vec<StepBoundary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit_code: i32,
    pub log: Vec<u8>,
    pub metadata: RunMetadata,
}

pub trait WorkflowRunner: Send + Sync {
    fn run(&self, selector: &WorkflowSelector) -> Result<RunOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixtureRunner {
        log: &'static str,
        exit_code: i32,
    }

    impl WorkflowRunner for FixtureRunner {
        fn run(&self, _selector: &WorkflowSelector) -> Result<RunOutput> {
            Ok(RunOutput {
                exit_code: self.exit_code,
                log: self.log.as_bytes().to_vec(),
                metadata: RunMetadata::default(),
            })
        }
    }

    #[test]
    fn fixture_runner_round_trips_log_bytes() {
        let runner = FixtureRunner {
            log: "Error: boom\n",
            exit_code: 1,
        };
        let output = runner.run(&WorkflowSelector::default()).unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(String::from_utf8(output.log).unwrap(), "Error: boom\n");
    }
}
