//! Command orchestration.
//!
//! A [`Command`] owns one invocation: it validates the environment, prepares
//! it, runs or cleans every configured test concurrently, and writes the
//! final report. Each test runs in its own task and is folded into the
//! shared report exactly once; the command waits for all tests before
//! looking at the aggregate status.

use crate::cluster::Env;
use crate::config::{Config, TestConfig};
use crate::console;
use crate::flow::{DrError, DrOperations, Flow, TestRun};
use crate::gather::{GatherOptions, collect_results};
use crate::report::{Report, SharedReport, Status, Step, StepName, Summary, Test};
use crate::validate::ValidationSummary;
use crate::validation::{Validation, ValidationError};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{Instrument, error, info, info_span, warn};

/// Errors ending a command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Some tests or environment steps failed.
    #[error("{name} failed ({summary})")]
    Failed { name: String, summary: Summary },

    /// The environment is not usable.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Validation found stale or problematic items.
    #[error("{name} found issues ({summary})")]
    Issues {
        name: String,
        summary: ValidationSummary,
    },
}

/// One invocation of a drill command.
pub struct Command {
    name: String,
    config: Config,
    env: Env,
    validation: Arc<dyn Validation>,
    ops: Arc<dyn DrOperations>,
    report: SharedReport,
    output_dir: PathBuf,
    start: Instant,
}

impl Command {
    /// Creates a command named `name`, e.g. "test-run". The name is used for
    /// the report file in `output_dir`.
    pub fn new(
        name: impl Into<String>,
        config: Config,
        validation: Arc<dyn Validation>,
        ops: Arc<dyn DrOperations>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        let env = Env::new(&config);
        Self {
            report: SharedReport::new(Report::new(name.clone())),
            name,
            config,
            env,
            validation,
            ops,
            output_dir: output_dir.into(),
            start: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn validation(&self) -> &dyn Validation {
        self.validation.as_ref()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn report(&self) -> &SharedReport {
        &self.report
    }

    /// Time since the command was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Validates the environment. Failures are logged, not reported.
    pub async fn validate(&self) -> bool {
        console::step("Validate config");
        if let Err(err) = self.validation.validate(&self.env).await {
            error!("Failed to validate config: {}", err);
            console::error(format!("Failed to validate config: {err}"));
            return false;
        }
        console::pass("Config validated");
        true
    }

    /// Creates the shared GitOps channel.
    pub async fn setup(&self) -> bool {
        console::step("Setup environment");
        self.environment_step(StepName::Setup, self.ops.ensure_channel())
            .await
    }

    /// Deletes the shared GitOps channel.
    pub async fn cleanup(&self) -> bool {
        console::step("Clean environment");
        self.environment_step(StepName::Cleanup, self.ops.ensure_channel_deleted())
            .await
    }

    async fn environment_step(
        &self,
        name: StepName,
        operation: impl Future<Output = Result<(), DrError>>,
    ) -> bool {
        let start = Instant::now();
        let result = operation.await;
        let duration = start.elapsed();

        let step = match result {
            Ok(()) => {
                info!("{} completed in {:.2} seconds", name, duration.as_secs_f64());
                console::pass(format!("Environment {name} completed"));
                Step::passed(name, duration)
            }
            Err(err) => {
                error!("{} failed: {}", name, err);
                console::error(format!("Failed to {name} environment: {err}"));
                Step::failed(name, duration, err.to_string())
            }
        };

        let passed = step.status == Status::Passed;
        self.report.add_step(step);
        passed
    }

    /// Runs the full DR flow for every test. Returns true if the report
    /// passed.
    pub async fn run_tests(&self) -> bool {
        console::step("Run tests");
        self.run_flow(Flow::Run).await
    }

    /// Removes artifacts of every test. Returns true if the report passed.
    pub async fn clean_tests(&self) -> bool {
        console::step("Clean tests");
        self.run_flow(Flow::Clean).await
    }

    async fn run_flow(&self, flow: Flow) -> bool {
        let tests = self.config.tests.clone();
        info!("Running {:?} flow for {} tests", flow, tests.len());

        let handles: Vec<_> = tests
            .iter()
            .map(|config| {
                let ops = Arc::clone(&self.ops);
                let report = self.report.clone();
                let config = config.clone();
                let span = info_span!("test", name = %config.name());
                tokio::spawn(
                    async move {
                        let test = TestRun::new(config, ops.as_ref()).run(flow).await;
                        info!("Test {} {}", test.name, test.status);
                        report.add_test(test);
                    }
                    .instrument(span),
                )
            })
            .collect();

        for (config, result) in tests.into_iter().zip(join_all(handles).await) {
            if let Err(err) = result {
                self.report.add_test(aborted_test(config, flow, &err.to_string()));
            }
        }

        self.report.status() == Status::Passed
    }

    /// Gathers the namespaces of failed tests from all clusters into
    /// `<output_dir>/<name>.gather`. Failures are logged only.
    pub async fn gather_failed(&self) {
        let namespaces: BTreeSet<String> = self
            .report
            .snapshot()
            .tests
            .iter()
            .filter(|t| t.status == Status::Failed)
            .map(|t| t.config.namespace())
            .collect();
        if namespaces.is_empty() {
            return;
        }

        console::step("Gather data");
        let start = Instant::now();
        let options = GatherOptions {
            namespaces: namespaces.into_iter().collect(),
            output_dir: self.output_dir.join(format!("{}.gather", self.name)),
        };
        let results = collect_results(self.validation.gather(&self.env.clusters(), &options)).await;

        for result in &results {
            match &result.err {
                None => console::pass(format!("Gathered data from cluster {:?}", result.name)),
                Some(err) => {
                    warn!(cluster = %result.name, "Failed to gather data: {}", err);
                    console::error(format!("Failed to gather data from cluster {:?}", result.name));
                }
            }
        }
        info!(
            "Gathered data in {:?} in {:.2} seconds",
            options.output_dir,
            start.elapsed().as_secs_f64()
        );
    }

    /// Writes the report and returns the error describing the failure.
    pub fn failed(&self) -> CommandError {
        self.write_report();
        let summary = self.report.summary();
        console::error(format!("{} failed ({summary})", self.name));
        CommandError::Failed {
            name: self.name.clone(),
            summary,
        }
    }

    /// Writes the report and prints the summary.
    pub fn passed(&self) {
        self.write_report();
        console::completed(format!("{} completed ({})", self.name, self.report.summary()));
    }

    fn write_report(&self) {
        self.report.set_duration(self.elapsed());
        match self.report.snapshot().write(&self.output_dir) {
            Ok(path) => info!("Report written to {:?}", path),
            Err(err) => {
                error!("Failed to write report: {}", err);
                console::error(format!("Failed to write report: {err}"));
            }
        }
    }
}

/// A test whose task did not complete, recorded as failed at its first
/// stage.
fn aborted_test(config: TestConfig, flow: Flow, reason: &str) -> Test {
    let stages = flow.stages();
    let mut test = Test::new(config);
    error!(test = %test.name, "Test task failed: {}", reason);
    test.add_step(Step::failed(stages[0], Duration::ZERO, reason));
    test.skip_remaining(stages, "test task failed");
    test
}
