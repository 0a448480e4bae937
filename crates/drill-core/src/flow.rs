//! Test flows: fixed sequences of DR operations applied to one test.
//!
//! ```text
//! run:   deploy → protect → failover → relocate → unprotect → undeploy
//! clean: unprotect → undeploy
//! ```
//!
//! Each stage records a [`Step`] before the next stage starts. The first
//! stage that does not pass stops the flow; the stages after it are recorded
//! as skipped. No stage is retried.

use crate::config::TestConfig;
use crate::connection::ConnectionError;
use crate::console;
use crate::report::{Step, StepName, Test};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors from a DR operation.
#[derive(Debug, Error)]
pub enum DrError {
    /// The operation does not apply to this test. Recorded as skipped.
    #[error("{0}")]
    Unsupported(String),

    /// The cluster did not reach the expected state in time.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { timeout: Duration, what: String },

    /// Request to the cluster failed.
    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),

    /// The cluster could not be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The operation failed for another reason.
    #[error("{0}")]
    Failed(String),
}

/// DR operations applied to test workloads.
///
/// Implementations talk to the clusters; the flow only observes whether each
/// operation succeeded.
#[async_trait]
pub trait DrOperations: Send + Sync {
    /// Creates the GitOps channel shared by all tests. Idempotent.
    async fn ensure_channel(&self) -> Result<(), DrError>;

    /// Deletes the GitOps channel. Idempotent.
    async fn ensure_channel_deleted(&self) -> Result<(), DrError>;

    async fn deploy(&self, test: &TestConfig) -> Result<(), DrError>;
    async fn protect(&self, test: &TestConfig) -> Result<(), DrError>;
    async fn failover(&self, test: &TestConfig) -> Result<(), DrError>;
    async fn relocate(&self, test: &TestConfig) -> Result<(), DrError>;
    async fn unprotect(&self, test: &TestConfig) -> Result<(), DrError>;
    async fn undeploy(&self, test: &TestConfig) -> Result<(), DrError>;
}

/// Which sequence of stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Full DR lifecycle.
    Run,
    /// Remove test artifacts left by a previous run.
    Clean,
}

impl Flow {
    /// Stages of the flow, in order.
    pub fn stages(self) -> &'static [StepName] {
        match self {
            Flow::Run => &[
                StepName::Deploy,
                StepName::Protect,
                StepName::Failover,
                StepName::Relocate,
                StepName::Unprotect,
                StepName::Undeploy,
            ],
            Flow::Clean => &[StepName::Unprotect, StepName::Undeploy],
        }
    }
}

/// A test bound to the DR operations that drive it.
///
/// Owned by the task running the test; nothing else writes to it.
pub struct TestRun<'a> {
    test: Test,
    ops: &'a dyn DrOperations,
}

impl<'a> TestRun<'a> {
    pub fn new(config: TestConfig, ops: &'a dyn DrOperations) -> Self {
        Self {
            test: Test::new(config),
            ops,
        }
    }

    /// Runs every stage of `flow`, stopping at the first one that does not
    /// pass, and returns the completed test.
    pub async fn run(mut self, flow: Flow) -> Test {
        let stages = flow.stages();
        for &stage in stages {
            if !self.stage(stage).await {
                self.test
                    .skip_remaining(stages, &format!("{stage} did not pass"));
                break;
            }
        }
        self.test
    }

    /// Runs one stage and records its step. Returns true if it passed.
    pub async fn stage(&mut self, stage: StepName) -> bool {
        let config = &self.test.config;
        let name = self.test.name.clone();
        let start = Instant::now();

        let result = match stage {
            StepName::Deploy => self.ops.deploy(config).await,
            StepName::Protect => self.ops.protect(config).await,
            StepName::Failover => self.ops.failover(config).await,
            StepName::Relocate => self.ops.relocate(config).await,
            StepName::Unprotect => self.ops.unprotect(config).await,
            StepName::Undeploy => self.ops.undeploy(config).await,
            StepName::Setup | StepName::Cleanup => Err(DrError::Failed(format!(
                "{stage} is not a test stage"
            ))),
        };
        let duration = start.elapsed();

        let step = match result {
            Ok(()) => {
                info!(test = %name, "{} completed in {:.2} seconds", stage, duration.as_secs_f64());
                console::pass(format!("Application {:?} {}", name, past_tense(stage)));
                Step::passed(stage, duration)
            }
            Err(DrError::Unsupported(reason)) => {
                warn!(test = %name, "{} skipped: {}", stage, reason);
                console::skip(format!("Skipped {stage} of application {name:?}: {reason}"));
                Step::skipped(stage, reason)
            }
            Err(err) => {
                error!(test = %name, "{} failed: {}", stage, err);
                console::error(format!("Failed to {stage} application {name:?}"));
                Step::failed(stage, duration, err.to_string())
            }
        };

        let passed = step.status == crate::report::Status::Passed;
        self.test.add_step(step);
        passed
    }

    pub fn test(&self) -> &Test {
        &self.test
    }
}

fn past_tense(stage: StepName) -> &'static str {
    match stage {
        StepName::Setup => "set up",
        StepName::Deploy => "deployed",
        StepName::Protect => "protected",
        StepName::Failover => "failed over",
        StepName::Relocate => "relocated",
        StepName::Unprotect => "unprotected",
        StepName::Undeploy => "undeployed",
        StepName::Cleanup => "cleaned up",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Deployer, Workload};
    use crate::report::Status;
    use std::sync::Mutex;

    /// Operations failing at a chosen stage and recording what was called.
    struct ScriptedOps {
        fail_at: Option<StepName>,
        unsupported_at: Option<StepName>,
        calls: Mutex<Vec<StepName>>,
    }

    impl ScriptedOps {
        fn new(fail_at: Option<StepName>) -> Self {
            Self {
                fail_at,
                unsupported_at: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call(&self, stage: StepName) -> Result<(), DrError> {
            self.calls.lock().unwrap().push(stage);
            if self.unsupported_at == Some(stage) {
                return Err(DrError::Unsupported("not for this deployer".to_string()));
            }
            if self.fail_at == Some(stage) {
                return Err(DrError::Failed(format!("{stage} exploded")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DrOperations for ScriptedOps {
        async fn ensure_channel(&self) -> Result<(), DrError> {
            Ok(())
        }
        async fn ensure_channel_deleted(&self) -> Result<(), DrError> {
            Ok(())
        }
        async fn deploy(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Deploy)
        }
        async fn protect(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Protect)
        }
        async fn failover(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Failover)
        }
        async fn relocate(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Relocate)
        }
        async fn unprotect(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Unprotect)
        }
        async fn undeploy(&self, _test: &TestConfig) -> Result<(), DrError> {
            self.call(StepName::Undeploy)
        }
    }

    fn config() -> TestConfig {
        TestConfig {
            workload: Workload::Deploy,
            deployer: Deployer::Subscr,
            pvcspec: "rbd".to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_flow_all_pass() {
        let ops = ScriptedOps::new(None);
        let test = TestRun::new(config(), &ops).run(Flow::Run).await;

        assert_eq!(test.status, Status::Passed);
        let names: Vec<_> = test.steps.iter().map(|s| s.name).collect();
        assert_eq!(names, Flow::Run.stages());
        assert_eq!(*ops.calls.lock().unwrap(), Flow::Run.stages());
    }

    #[tokio::test]
    async fn test_failed_stage_short_circuits() {
        let stages = Flow::Run.stages();
        for (k, &failing) in stages.iter().enumerate() {
            let ops = ScriptedOps::new(Some(failing));
            let test = TestRun::new(config(), &ops).run(Flow::Run).await;

            assert_eq!(test.status, Status::Failed);
            assert_eq!(ops.calls.lock().unwrap().len(), k + 1, "failing at {failing}");
            assert_eq!(test.steps[k].status, Status::Failed);
            assert!(test.steps[..k].iter().all(|s| s.status == Status::Passed));
            assert!(test.steps[k + 1..].iter().all(|s| s.status == Status::Skipped));
            assert_eq!(test.steps.len(), stages.len());
        }
    }

    #[tokio::test]
    async fn test_clean_flow_stages() {
        let ops = ScriptedOps::new(Some(StepName::Unprotect));
        let test = TestRun::new(config(), &ops).run(Flow::Clean).await;

        assert_eq!(*ops.calls.lock().unwrap(), vec![StepName::Unprotect]);
        assert_eq!(test.steps.len(), 2);
        assert_eq!(test.steps[1].name, StepName::Undeploy);
        assert_eq!(test.steps[1].status, Status::Skipped);
        assert_eq!(
            test.steps[1].message.as_deref(),
            Some("unprotect did not pass")
        );
    }

    #[tokio::test]
    async fn test_unsupported_stage_is_skipped() {
        let mut ops = ScriptedOps::new(None);
        ops.unsupported_at = Some(StepName::Deploy);
        let test = TestRun::new(config(), &ops).run(Flow::Run).await;

        assert_eq!(test.status, Status::Skipped);
        assert_eq!(ops.calls.lock().unwrap().len(), 1);
        assert!(test.steps.iter().all(|s| s.status == Status::Skipped));
    }

    #[tokio::test]
    async fn test_stage_records_error_message() {
        let ops = ScriptedOps::new(Some(StepName::Deploy));
        let mut run = TestRun::new(config(), &ops);

        assert!(!run.stage(StepName::Deploy).await);
        let step = &run.test().steps[0];
        assert_eq!(step.message.as_deref(), Some("deploy exploded"));
    }
}
