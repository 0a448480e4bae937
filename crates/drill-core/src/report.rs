//! Test report and step outcomes.
//!
//! A [`Report`] aggregates the outcome of every step and test of a command.
//! Tests run concurrently, so the report is shared through a
//! [`SharedReport`], which serializes every mutation behind one lock. A
//! [`Test`] is owned by the single task running its flow and is folded into
//! the report once, when the flow completes.

use crate::config::TestConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Errors writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of a step, a test, or a whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Passed => write!(f, "passed"),
            Status::Failed => write!(f, "failed"),
            Status::Skipped => write!(f, "skipped"),
        }
    }
}

/// Name of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Setup,
    Deploy,
    Protect,
    Failover,
    Relocate,
    Unprotect,
    Undeploy,
    Cleanup,
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepName::Setup => "setup",
            StepName::Deploy => "deploy",
            StepName::Protect => "protect",
            StepName::Failover => "failover",
            StepName::Relocate => "relocate",
            StepName::Unprotect => "unprotect",
            StepName::Undeploy => "undeploy",
            StepName::Cleanup => "cleanup",
        };
        write!(f, "{name}")
    }
}

/// Recorded outcome of one operation. Fixed once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: StepName,
    pub status: Status,
    /// Time spent in the operation.
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Why the step did not pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Step {
    pub fn passed(name: StepName, duration: Duration) -> Self {
        Self {
            name,
            status: Status::Passed,
            duration,
            message: None,
        }
    }

    pub fn failed(name: StepName, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            name,
            status: Status::Failed,
            duration,
            message: Some(message.into()),
        }
    }

    pub fn skipped(name: StepName, message: impl Into<String>) -> Self {
        Self {
            name,
            status: Status::Skipped,
            duration: Duration::ZERO,
            message: Some(message.into()),
        }
    }
}

/// Outcome of one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub name: String,
    pub config: TestConfig,
    pub steps: Vec<Step>,
    pub status: Status,
}

impl Test {
    /// Creates a test with no recorded steps.
    pub fn new(config: TestConfig) -> Self {
        Self {
            name: config.name(),
            config,
            steps: Vec::new(),
            status: Status::Skipped,
        }
    }

    /// Records a step and updates the test status.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
        self.status = self.derive_status();
    }

    /// Records every stage in `stages` that has no step yet as skipped.
    pub fn skip_remaining(&mut self, stages: &[StepName], reason: &str) {
        for stage in stages {
            if !self.steps.iter().any(|s| s.name == *stage) {
                self.steps.push(Step::skipped(*stage, reason));
            }
        }
        self.status = self.derive_status();
    }

    /// Failed if any step failed, skipped if any step was skipped or
    /// nothing ran, passed otherwise.
    pub fn derive_status(&self) -> Status {
        if self.steps.iter().any(|s| s.status == Status::Failed) {
            Status::Failed
        } else if self.steps.is_empty() || self.steps.iter().any(|s| s.status == Status::Skipped)
        {
            Status::Skipped
        } else {
            Status::Passed
        }
    }
}

/// Counts of tests by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl Summary {
    /// Adds a test status to the summary.
    pub fn add(&mut self, status: Status) {
        match status {
            Status::Passed => self.passed += 1,
            Status::Failed => self.failed += 1,
            Status::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.skipped
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.passed, self.failed, self.skipped
        )
    }
}

/// Report of a command run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Environment level steps (setup, cleanup).
    pub steps: Vec<Step>,
    pub tests: Vec<Test>,
    pub summary: Summary,
    pub status: Status,
}

impl Report {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Utc::now(),
            duration: Duration::ZERO,
            steps: Vec::new(),
            tests: Vec::new(),
            summary: Summary::default(),
            status: Status::Passed,
        }
    }

    /// Adds an environment level step.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
        self.update_status();
    }

    /// Adds a completed test.
    pub fn add_test(&mut self, test: Test) {
        self.summary.add(test.status);
        self.tests.push(test);
        self.update_status();
    }

    fn update_status(&mut self) {
        let step_failed = self.steps.iter().any(|s| s.status == Status::Failed);
        self.status = if self.summary.failed > 0 || step_failed {
            Status::Failed
        } else {
            Status::Passed
        };
    }

    /// Writes the report as `<dir>/<name>.json`, returning the path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let path = dir.join(format!("{}.json", self.name));
        fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// A report shared by concurrent tasks.
///
/// Cloning shares the same report. Every mutation holds the lock only for the
/// duration of the update.
#[derive(Debug, Clone)]
pub struct SharedReport {
    inner: Arc<Mutex<Report>>,
}

impl SharedReport {
    pub fn new(report: Report) -> Self {
        Self {
            inner: Arc::new(Mutex::new(report)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Report> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_step(&self, step: Step) {
        self.lock().add_step(step);
    }

    pub fn add_test(&self, test: Test) {
        self.lock().add_test(test);
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    pub fn summary(&self) -> Summary {
        self.lock().summary
    }

    pub fn set_duration(&self, duration: Duration) {
        self.lock().duration = duration;
    }

    /// Returns a copy of the current report.
    pub fn snapshot(&self) -> Report {
        self.lock().clone()
    }
}

/// Serde helper for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
