//! The validate command.
//!
//! `validate clusters` checks the environment and the S3 stores used by the
//! DR operator. `validate application` also inspects a protected
//! application and gathers its namespaces from every cluster.
//!
//! Every checked item is reported as ok, stale or problem. A problem is a
//! misconfiguration that breaks DR. Stale marks diagnostic data that could
//! not be refreshed, such as a cluster that could not be gathered.

use crate::command::{Command, CommandError};
use crate::console;
use crate::gather::{GatherOptions, collect_results};
use crate::report::{ReportError, Status};
use crate::s3::Profile;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info, warn};

/// State of a validated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationState {
    Ok,
    Stale,
    Problem,
}

/// Counts of validated items by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub ok: u32,
    pub stale: u32,
    pub problem: u32,
}

impl ValidationSummary {
    pub fn add(&mut self, state: ValidationState) {
        match state {
            ValidationState::Ok => self.ok += 1,
            ValidationState::Stale => self.stale += 1,
            ValidationState::Problem => self.problem += 1,
        }
    }

    pub fn has_issues(&self) -> bool {
        self.stale > 0 || self.problem > 0
    }
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} stale, {} problem",
            self.ok, self.stale, self.problem
        )
    }
}

/// One validated item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validated {
    /// What was validated, e.g. "cluster" or "s3profile".
    pub kind: String,
    pub name: String,
    pub state: ValidationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The validated application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    pub name: String,
    pub namespace: String,
    pub namespaces: Vec<String>,
}

/// Result of a validate command.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub name: String,
    pub created: DateTime<Utc>,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<Application>,
    pub items: Vec<Validated>,
    pub summary: ValidationSummary,
    pub status: Status,
}

impl ValidationReport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created: Utc::now(),
            duration: 0.0,
            application: None,
            items: Vec::new(),
            summary: ValidationSummary::default(),
            status: Status::Passed,
        }
    }

    /// Records a validated item.
    pub fn add(
        &mut self,
        kind: &str,
        name: &str,
        state: ValidationState,
        description: Option<String>,
    ) {
        match state {
            ValidationState::Ok => console::pass(format!("{kind} {name:?} ok")),
            ValidationState::Stale => console::skip(format!(
                "{kind} {name:?} stale: {}",
                description.as_deref().unwrap_or_default()
            )),
            ValidationState::Problem => console::error(format!(
                "{kind} {name:?} problem: {}",
                description.as_deref().unwrap_or_default()
            )),
        }
        self.summary.add(state);
        self.status = if self.summary.has_issues() {
            Status::Failed
        } else {
            Status::Passed
        };
        self.items.push(Validated {
            kind: kind.to_string(),
            name: name.to_string(),
            state,
            description,
        });
    }

    /// Writes the report as `<dir>/<name>.json`.
    fn write(&self, dir: &Path) -> Result<PathBuf, ReportError> {
        let path = dir.join(format!("{}.json", self.name));
        std::fs::create_dir_all(dir).map_err(|source| ReportError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Validates the environment and the S3 profiles.
pub async fn clusters(cmd: &Command) -> Result<(), CommandError> {
    let start = Instant::now();
    let mut report = ValidationReport::new(cmd.name());

    validate_env(cmd).await?;
    check_s3_profiles(cmd, &mut report).await;

    finish(cmd, report, start)
}

/// Validates a protected application identified by its DRPC.
pub async fn application(
    cmd: &Command,
    drpc_name: &str,
    drpc_namespace: &str,
) -> Result<(), CommandError> {
    let start = Instant::now();
    let mut report = ValidationReport::new(cmd.name());

    validate_env(cmd).await?;

    console::step("Inspect application");
    let namespaces = cmd
        .validation()
        .application_namespaces(cmd.env(), drpc_name, drpc_namespace)
        .await
        .inspect_err(|err| {
            error!("Failed to inspect application {:?}: {}", drpc_name, err);
            console::error(format!("Failed to inspect application {drpc_name:?}: {err}"));
        })?;
    console::pass(format!("Application namespaces {namespaces:?}"));
    report.application = Some(Application {
        name: drpc_name.to_string(),
        namespace: drpc_namespace.to_string(),
        namespaces: namespaces.clone(),
    });

    gather_application(cmd, &mut report, drpc_name, namespaces).await;
    check_s3_profiles(cmd, &mut report).await;

    finish(cmd, report, start)
}

async fn validate_env(cmd: &Command) -> Result<(), CommandError> {
    console::step("Validate config");
    cmd.validation().validate(cmd.env()).await.inspect_err(|err| {
        error!("Failed to validate config: {}", err);
        console::error(format!("Failed to validate config: {err}"));
    })?;
    console::pass("Config validated");
    Ok(())
}

async fn gather_application(
    cmd: &Command,
    report: &mut ValidationReport,
    name: &str,
    namespaces: Vec<String>,
) {
    console::step("Gather application data");
    let options = GatherOptions {
        namespaces,
        output_dir: cmd.output_dir().join(format!("{name}.data")),
    };
    let rx = cmd.validation().gather(&cmd.env().clusters(), &options);
    let mut results = collect_results(rx).await;
    results.sort_by(|a, b| a.name.cmp(&b.name));

    for result in results {
        match result.err {
            None => report.add("cluster", &result.name, ValidationState::Ok, None),
            Some(err) => {
                warn!(cluster = %result.name, "Failed to gather data: {}", err);
                report.add(
                    "cluster",
                    &result.name,
                    ValidationState::Stale,
                    Some(format!("failed to gather data: {err}")),
                );
            }
        }
    }
}

/// Resolves every configured S3 profile through its secret on the hub and
/// checks the resolved profiles concurrently.
async fn check_s3_profiles(cmd: &Command, report: &mut ValidationReport) {
    let configs = &cmd.config().s3profiles;
    if configs.is_empty() {
        info!("No s3 profiles configured");
        return;
    }

    console::step("Check s3 profiles");
    let hub = &cmd.env().hub;
    let mut profiles = Vec::new();
    for config in configs {
        let secret = match cmd
            .validation()
            .get_secret(hub, &config.secretref.name, &config.secretref.namespace)
            .await
        {
            Ok(secret) => secret,
            Err(err) => {
                report.add(
                    "s3profile",
                    &config.name,
                    ValidationState::Problem,
                    Some(format!("failed to get secret: {err}")),
                );
                continue;
            }
        };
        match Profile::from_secret(config, &secret) {
            Ok(profile) => profiles.push(profile),
            Err(err) => report.add(
                "s3profile",
                &config.name,
                ValidationState::Problem,
                Some(err.to_string()),
            ),
        }
    }

    let mut results = collect_results(cmd.validation().check_s3(&profiles)).await;
    results.sort_by(|a, b| a.profile_name.cmp(&b.profile_name));
    for result in results {
        match result.err {
            None => report.add("s3profile", &result.profile_name, ValidationState::Ok, None),
            Some(err) => report.add(
                "s3profile",
                &result.profile_name,
                ValidationState::Problem,
                Some(err.to_string()),
            ),
        }
    }
}

fn finish(cmd: &Command, mut report: ValidationReport, start: Instant) -> Result<(), CommandError> {
    report.duration = start.elapsed().as_secs_f64();
    match report.write(cmd.output_dir()) {
        Ok(path) => info!("Wrote report {}", path.display()),
        Err(err) => {
            error!("Failed to write report: {}", err);
            console::error(format!("Failed to write report: {err}"));
        }
    }

    if report.summary.has_issues() {
        console::error(format!("Validation found issues ({})", report.summary));
        return Err(CommandError::Issues {
            name: cmd.name().to_string(),
            summary: report.summary,
        });
    }

    console::completed(format!("Validation completed ({})", report.summary));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TestConfig};
    use crate::flow::{DrError, DrOperations};
    use crate::gather::GatherError;
    use crate::s3::S3Error;
    use crate::validation::{Mock, ValidationError};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoOps;

    #[async_trait]
    impl DrOperations for NoOps {
        async fn ensure_channel(&self) -> Result<(), DrError> {
            Ok(())
        }
        async fn ensure_channel_deleted(&self) -> Result<(), DrError> {
            Ok(())
        }
        async fn deploy(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
        async fn protect(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
        async fn failover(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
        async fn relocate(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
        async fn unprotect(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
        async fn undeploy(&self, _: &TestConfig) -> Result<(), DrError> {
            Ok(())
        }
    }

    const CONFIG: &str = r"
clusters:
  hub: {name: hub, kubeconfigpath: hub/config}
  c1: {name: dr1, kubeconfigpath: dr1/config}
  c2: {name: dr2, kubeconfigpath: dr2/config}
repo: {url: https://github.com/RamenDR/ocm-ramen-samples.git}
drpolicy: dr-policy
clusterset: default
pvcspecs:
- {name: rbd, storageclassname: rook-ceph-block, accessmodes: ReadWriteOnce}
tests:
- {workload: deploy, deployer: appset, pvcspec: rbd}
s3profiles:
- name: minio-on-dr1
  bucket: bucket
  endpoint: http://dr1:30000
  secretref: {name: ramen-s3-secret, namespace: ramen-system}
- name: minio-on-dr2
  bucket: bucket
  endpoint: http://dr2:30000
  secretref: {name: ramen-s3-secret, namespace: ramen-system}
";

    fn command(name: &str, mock: Mock, output: &Path) -> Command {
        Command::new(
            name,
            Config::parse(CONFIG).unwrap(),
            Arc::new(mock),
            Arc::new(NoOps),
            output,
        )
    }

    #[test]
    fn test_validation_summary() {
        let mut summary = ValidationSummary::default();
        assert!(!summary.has_issues());

        summary.add(ValidationState::Ok);
        summary.add(ValidationState::Ok);
        assert!(!summary.has_issues());

        summary.add(ValidationState::Stale);
        assert!(summary.has_issues());
        assert_eq!(summary.to_string(), "2 ok, 1 stale, 0 problem");

        let mut summary = ValidationSummary::default();
        summary.add(ValidationState::Problem);
        assert!(summary.has_issues());
    }

    #[test]
    fn test_validation_report_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = ValidationReport::new("validate-clusters");
        report.add("s3profile", "minio-on-dr1", ValidationState::Ok, None);

        let path = report.write(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("validate-clusters.json"));
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["summary"]["ok"], 1);

        let blocked = dir.path().join("file");
        std::fs::write(&blocked, "").unwrap();
        let err = report.write(&blocked.join("out")).unwrap_err();
        assert!(matches!(err, ReportError::Io { ref path, .. } if path == &blocked.join("out")));
    }

    #[tokio::test]
    async fn test_validate_clusters_ok() {
        let output = tempfile::tempdir().unwrap();
        let cmd = command("validate-clusters", Mock::new(), output.path());

        clusters(&cmd).await.unwrap();

        let json = std::fs::read_to_string(output.path().join("validate-clusters.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["ok"], 2);
        assert_eq!(value["status"], "passed");
    }

    #[tokio::test]
    async fn test_validate_clusters_invalid_credentials() {
        let output = tempfile::tempdir().unwrap();
        let mock = Mock {
            check_s3_fn: Some(Box::new(|profile| {
                if profile.name == "minio-on-dr2" {
                    Err(S3Error::InvalidCredentials)
                } else {
                    Ok(())
                }
            })),
            ..Mock::default()
        };
        let cmd = command("validate-clusters", mock, output.path());

        let err = clusters(&cmd).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "validate-clusters found issues (1 ok, 0 stale, 1 problem)"
        );
    }

    #[tokio::test]
    async fn test_validate_clusters_invalid_env() {
        let output = tempfile::tempdir().unwrap();
        let mock = Mock {
            validate_fn: Some(Box::new(|_| {
                Err(ValidationError::InconsistentDistribution(
                    "hub=ocp, dr1=k8s, dr2=k8s".to_string(),
                ))
            })),
            ..Mock::default()
        };
        let cmd = command("validate-clusters", mock, output.path());

        let err = clusters(&cmd).await.unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
        assert!(!output.path().join("validate-clusters.json").exists());
    }

    #[tokio::test]
    async fn test_validate_application() {
        let output = tempfile::tempdir().unwrap();
        let mock = Mock {
            application_namespaces_fn: Some(Box::new(|_, _, namespace| {
                Ok(vec![namespace.to_string()])
            })),
            gather_fn: Some(Box::new(|cluster, options| {
                assert_eq!(options.namespaces, vec!["app".to_string()]);
                if cluster.name == "dr2" {
                    Err(GatherError::Io(std::io::Error::other("connection reset")))
                } else {
                    Ok(())
                }
            })),
            ..Mock::default()
        };
        let cmd = command("validate-application", mock, output.path());

        let err = application(&cmd, "app-drpc", "app").await.unwrap_err();
        let CommandError::Issues { summary, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(summary.ok, 4);
        assert_eq!(summary.stale, 1);
        assert_eq!(summary.problem, 0);

        let json =
            std::fs::read_to_string(output.path().join("validate-application.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["application"]["namespaces"], serde_json::json!(["app"]));
    }

    #[tokio::test]
    async fn test_validate_application_missing_secret() {
        let output = tempfile::tempdir().unwrap();
        let mock = Mock {
            get_secret_fn: Some(Box::new(|_, name, _| {
                Err(ValidationError::NotFound {
                    kind: "Secret".to_string(),
                    name: name.to_string(),
                })
            })),
            ..Mock::default()
        };
        let cmd = command("validate-application", mock, output.path());

        let err = application(&cmd, "app-drpc", "app").await.unwrap_err();
        let CommandError::Issues { summary, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(summary.ok, 3);
        assert_eq!(summary.problem, 2);
    }
}
